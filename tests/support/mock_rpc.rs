use std::{convert::Infallible, str::FromStr, time::Duration};

use alloy_primitives::{Address, Bytes, B256};
use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use oraclenode::{BlockHeader, LogEvent, LogFilter, TxReceipt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::mock_chain::MockChain;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Ethereum JSON-RPC endpoint over HTTP backed by a [`MockChain`].
pub struct MockRpcServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockRpcServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock RPC listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let chain = chain.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(chain.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock RPC server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        // Graceful shutdown waits on open keep-alive connections; give up on
        // them rather than hang the test.
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

async fn serve_request(chain: MockChain, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = match payload {
        Value::Array(calls) => Value::Array(
            calls
                .into_iter()
                .map(|call| handle_call(&chain, call))
                .collect(),
        ),
        call => handle_call(&chain, call),
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn handle_call(chain: &MockChain, call: Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let first = params.first().cloned().unwrap_or(Value::Null);

    match method.as_str() {
        "eth_blockNumber" => success(id, json!(quantity(chain.tip()))),
        "eth_getBlockByNumber" => match first.as_str().and_then(parse_quantity) {
            Some(number) => success(id, chain.header(number).map_or(Value::Null, |h| header_json(&h))),
            None => error(id, -32602, "invalid block number"),
        },
        "eth_getLogs" => match parse_filter(&first) {
            Some(filter) => {
                let logs: Vec<Value> = chain.query_logs(&filter).iter().map(log_json).collect();
                success(id, Value::Array(logs))
            }
            None => error(id, -32602, "invalid log filter"),
        },
        "eth_sendRawTransaction" => {
            let raw = first
                .as_str()
                .and_then(|raw| raw.strip_prefix("0x"))
                .and_then(|digits| hex::decode(digits).ok());
            match raw {
                Some(raw) => success(id, json!(chain.accept_raw(&Bytes::from(raw)))),
                None => error(id, -32602, "invalid raw transaction"),
            }
        }
        "eth_getTransactionReceipt" => {
            match first.as_str().and_then(|hash| B256::from_str(hash).ok()) {
                Some(hash) => success(id, chain.receipt(hash).map_or(Value::Null, |r| receipt_json(&r))),
                None => error(id, -32602, "invalid transaction hash"),
            }
        }
        "eth_getTransactionCount" => {
            match first.as_str().and_then(|address| Address::from_str(address).ok()) {
                Some(address) => success(id, json!(quantity(chain.pending_nonce_of(address)))),
                None => error(id, -32602, "invalid address"),
            }
        }
        _ => error(id, -32601, format!("unknown method {method}")),
    }
}

fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

fn parse_quantity(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.strip_prefix("0x")?, 16).ok()
}

fn parse_filter(value: &Value) -> Option<LogFilter> {
    let from_block = value.get("fromBlock")?.as_str().and_then(parse_quantity)?;
    let to_block = value.get("toBlock")?.as_str().and_then(parse_quantity)?;
    let addresses = match value.get("address") {
        Some(addresses) => serde_json::from_value(addresses.clone()).ok()?,
        None => Vec::new(),
    };
    Some(LogFilter {
        from_block,
        to_block,
        addresses,
    })
}

fn header_json(header: &BlockHeader) -> Value {
    json!({
        "hash": header.hash,
        "parentHash": header.parent_hash,
        "number": quantity(header.number),
    })
}

fn log_json(log: &LogEvent) -> Value {
    json!({
        "address": log.address,
        "topics": log.topics,
        "data": log.data,
        "blockNumber": quantity(log.block_number),
        "blockHash": log.block_hash,
        "transactionHash": log.transaction_hash,
        "logIndex": quantity(log.log_index),
        "removed": false,
    })
}

fn receipt_json(receipt: &TxReceipt) -> Value {
    json!({
        "transactionHash": receipt.hash,
        "blockNumber": quantity(receipt.block_number),
        "blockHash": receipt.block_hash,
        "status": if receipt.success { "0x1" } else { "0x0" },
    })
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
