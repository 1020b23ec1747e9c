//! JSON-RPC client for Ethereum nodes. Houses `AsyncRpcClient`, its error type
//! and the `ChainClient` implementation the transaction manager broadcasts
//! through.

use crate::models::{BlockHeader, LogEvent, LogFilter, TxReceipt};
use crate::rpc::auth::build_auth_headers;
use crate::rpc::circuit_breaker::RpcCircuitBreaker;
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::retry::{
    RetryContext, BLOCK_NUMBER_RETRY, HEADER_RETRY, LOGS_RETRY, NONCE_RETRY, RECEIPT_RETRY,
    SEND_RAW_RETRY,
};
use crate::rpc::wire::{log_filter_params, quantity, RpcHeader, RpcLog, RpcReceipt};
use crate::runtime::config::NodeConfig;
use crate::txm::ChainClient;
use alloy_primitives::{Address, Bytes, B256, U64};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    http_helpers::HttpError,
    params::{ArrayParams, BatchRequestBuilder},
};
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use std::{fmt, future::Future, sync::Arc};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc method {method} timed out")]
    Timeout { method: &'static str },
    #[error("rpc circuit breaker is open")]
    CircuitOpen,
    #[error("requested block {height} is above the current tip")]
    HeightOutOfRange { height: u64 },
    #[error("rpc {method} response exceeded HTTP size limits")]
    ResponseTooLarge { method: &'static str },
    /// The node answered with a JSON-RPC error object.
    #[error("rpc {method} rejected (code={code}): {message}")]
    Rejected {
        method: &'static str,
        code: i32,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct AsyncRpcClient {
    rpc_url: Arc<String>,
    credentials: Option<Arc<(String, String)>>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
    breaker: Arc<RpcCircuitBreaker>,
}

impl ChainClient for AsyncRpcClient {
    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>> {
        Box::pin(self.send_raw_transaction(raw))
    }

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>>> {
        Box::pin(self.transaction_receipt(hash))
    }

    fn pending_nonce(&self, address: Address) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.pending_nonce(address))
    }
}

impl AsyncRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options_and_breaker(
            url,
            None,
            RpcClientOptions::default(),
            Arc::new(RpcCircuitBreaker::default()),
        )
    }

    pub fn with_options_and_breaker(
        url: impl Into<String>,
        credentials: Option<(String, String)>,
        options: RpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let headers = build_auth_headers(
            credentials
                .as_ref()
                .map(|(user, password)| (user.as_str(), password.as_str())),
        )?;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            credentials: credentials.map(Arc::new),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            breaker,
        })
    }

    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        let credentials = match (config.rpc_user(), config.rpc_password()) {
            (Some(user), Some(password)) => Some((user.to_owned(), password.to_owned())),
            _ => None,
        };
        Self::with_options_and_breaker(
            config.rpc_url().to_owned(),
            credentials,
            config.rpc_client_options(),
            Arc::new(RpcCircuitBreaker::default()),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn options(&self) -> &RpcClientOptions {
        &self.options
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot(self.breaker.snapshot().state)
    }

    pub async fn block_number(&self) -> Result<u64> {
        const METHOD: &str = "eth_blockNumber";

        self.retry_with_breaker(
            RetryContext::new(&BLOCK_NUMBER_RETRY),
            || async {
                let tip: U64 = self.call(METHOD, rpc_params![]).await?;
                Ok(tip.to::<u64>())
            },
            |attempt, tip: &u64| {
                tracing::trace!(attempt, tip = *tip, "refreshed chain tip");
            },
        )
        .await
    }

    /// Header at `number`; `RpcError::HeightOutOfRange` when the node has no
    /// such block yet.
    pub async fn header_by_number(&self, number: u64) -> Result<BlockHeader> {
        const METHOD: &str = "eth_getBlockByNumber";

        let heights = [number];
        self.retry_with_breaker(
            RetryContext::with_blocks(&HEADER_RETRY, &heights),
            || async {
                let header: Option<RpcHeader> =
                    self.call(METHOD, rpc_params![quantity(number), false]).await?;
                header
                    .map(BlockHeader::from)
                    .ok_or_else(|| anyhow::Error::from(RpcError::HeightOutOfRange { height: number }))
            },
            |attempt, header: &BlockHeader| {
                tracing::debug!(attempt, number = header.number, hash = %header.hash, "fetched block header");
            },
        )
        .await
    }

    /// Fetches `numbers` in as few JSON-RPC batches as `max_batch_size`
    /// allows, returning headers in request order.
    pub async fn headers_by_number(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>> {
        let mut headers = Vec::with_capacity(numbers.len());
        for chunk in numbers.chunks(self.options.max_batch_size) {
            let fetched = self
                .retry_with_breaker(
                    RetryContext::with_blocks(&HEADER_RETRY, chunk),
                    || async { self.fetch_headers_once(chunk).await },
                    |attempt, headers: &Vec<BlockHeader>| {
                        tracing::debug!(
                            attempt,
                            count = headers.len(),
                            "header batch completed successfully"
                        );
                    },
                )
                .await?;
            headers.extend(fetched);
        }
        Ok(headers)
    }

    pub async fn logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>> {
        const METHOD: &str = "eth_getLogs";

        if filter.from_block > filter.to_block {
            return Ok(Vec::new());
        }

        let span = [filter.from_block, filter.to_block];
        self.retry_with_breaker(
            RetryContext::with_blocks(&LOGS_RETRY, &span),
            || async {
                let logs: Vec<RpcLog> =
                    self.call(METHOD, rpc_params![log_filter_params(filter)]).await?;
                Ok(logs.into_iter().filter_map(RpcLog::into_event).collect())
            },
            |attempt, logs: &Vec<LogEvent>| {
                tracing::debug!(attempt, count = logs.len(), "log query completed");
            },
        )
        .await
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        const METHOD: &str = "eth_sendRawTransaction";

        self.retry_with_breaker(
            RetryContext::new(&SEND_RAW_RETRY),
            || async { self.call(METHOD, rpc_params![raw]).await },
            |attempt, hash: &B256| {
                tracing::debug!(attempt, hash = %hash, "transaction broadcast");
            },
        )
        .await
    }

    /// `None` while the transaction is unknown or not yet mined.
    pub async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>> {
        const METHOD: &str = "eth_getTransactionReceipt";

        self.retry_with_breaker(
            RetryContext::new(&RECEIPT_RETRY),
            || async {
                let receipt: Option<RpcReceipt> = self.call(METHOD, rpc_params![hash]).await?;
                Ok(receipt.and_then(RpcReceipt::into_receipt))
            },
            |_, _| {},
        )
        .await
    }

    pub async fn pending_nonce(&self, address: Address) -> Result<u64> {
        const METHOD: &str = "eth_getTransactionCount";

        self.retry_with_breaker(
            RetryContext::new(&NONCE_RETRY),
            || async {
                let nonce: U64 = self.call(METHOD, rpc_params![address, "pending"]).await?;
                Ok(nonce.to::<u64>())
            },
            |attempt, nonce: &u64| {
                tracing::debug!(attempt, address = %address, nonce = *nonce, "fetched pending nonce");
            },
        )
        .await
    }

    /// Shared retry/backoff loop that wraps RPC operations with breaker gating, metrics,
    /// exponential backoff, and consistent logging.
    async fn retry_with_breaker<T, F, Fut, S>(
        &self,
        context: RetryContext<'_>,
        mut operation: F,
        mut on_success: S,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        S: FnMut(usize, &T),
    {
        let mut attempt = 0;

        loop {
            match self.breaker.before_request() {
                Ok(state) => context.log_permit(state),
                Err(_) => {
                    context.log_circuit_open();
                    return Err(RpcError::CircuitOpen.into());
                }
            }

            attempt += 1;
            let start = Instant::now();

            let err = match operation().await {
                Ok(value) => {
                    self.metrics.record_success(start.elapsed());
                    self.breaker.record_success();
                    on_success(attempt, &value);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let elapsed = start.elapsed();
            let mut timed_out = false;
            match err.downcast_ref::<RpcError>() {
                Some(RpcError::HeightOutOfRange { height }) => {
                    self.metrics.record_success(elapsed);
                    self.breaker.record_success();
                    context.log_missing(attempt, *height);
                    return Err(err);
                }
                Some(RpcError::Rejected { code, message, .. }) => {
                    self.metrics.record_rejection(elapsed);
                    self.breaker.record_success();
                    context.log_rejected(*code, message);
                    return Err(err);
                }
                Some(RpcError::ResponseTooLarge { .. }) => {
                    self.metrics.record_failure(elapsed);
                    self.breaker.record_failure();
                    context.log_exhausted(attempt, &err);
                    return Err(err);
                }
                Some(RpcError::Timeout { .. }) => {
                    self.metrics.record_timeout(elapsed);
                    self.breaker.record_failure();
                    timed_out = true;
                }
                _ => {
                    self.metrics.record_failure(elapsed);
                    self.breaker.record_failure();
                }
            }

            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = self.options.backoff_delay(attempt);
            context.log_retry(attempt, backoff, &err, timed_out);
            sleep(backoff).await;
        }
    }

    async fn call<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(
            self.options.request_timeout,
            self.client.request(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| map_rpc_error(method, err))
    }

    async fn fetch_headers_once(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>> {
        let mut batch = BatchRequestBuilder::new();

        for number in numbers {
            batch
                .insert("eth_getBlockByNumber", rpc_params![quantity(*number), false])
                .context("failed to serialize eth_getBlockByNumber params")?;
        }

        let headers: Vec<Option<RpcHeader>> =
            self.execute_batch(batch, "eth_getBlockByNumber").await?;

        if headers.len() != numbers.len() {
            bail!(
                "RPC returned mismatched header count (expected {}, got {})",
                numbers.len(),
                headers.len()
            );
        }

        numbers
            .iter()
            .zip(headers)
            .map(|(number, header)| {
                let header = header
                    .map(BlockHeader::from)
                    .ok_or(RpcError::HeightOutOfRange { height: *number })?;
                if header.number != *number {
                    bail!(
                        "RPC returned block {} for requested height {}",
                        header.number,
                        number
                    );
                }
                Ok(header)
            })
            .collect()
    }

    async fn execute_batch<'a, R>(
        &self,
        batch: BatchRequestBuilder<'a>,
        method: &'static str,
    ) -> Result<Vec<R>>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        let response = timeout(
            self.options.request_timeout,
            self.client.batch_request(batch),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| map_rpc_error(method, err))?;

        let mut values = Vec::with_capacity(response.len());
        for entry in response.into_iter() {
            match entry {
                Ok(value) => values.push(value),
                Err(err) => {
                    return Err(RpcError::Rejected {
                        method,
                        code: err.code(),
                        message: err.message().to_owned(),
                    }
                    .into());
                }
            }
        }

        tracing::debug!(method, count = values.len(), "batch RPC call completed");

        Ok(values)
    }
}

fn map_rpc_error(method: &'static str, err: JsonRpcError) -> anyhow::Error {
    if response_too_large(&err) {
        return RpcError::ResponseTooLarge { method }.into();
    }
    match err {
        JsonRpcError::Call(object) => RpcError::Rejected {
            method,
            code: object.code(),
            message: object.message().to_owned(),
        }
        .into(),
        JsonRpcError::RequestTimeout => RpcError::Timeout { method }.into(),
        other => anyhow!("rpc {method} call failed: {other}"),
    }
}

fn response_too_large(err: &JsonRpcError) -> bool {
    match err {
        JsonRpcError::Transport(inner) => match inner.downcast_ref::<HttpTransportError>() {
            Some(HttpTransportError::Http(http_err)) => matches!(http_err, HttpError::TooLarge),
            Some(HttpTransportError::RequestTooLarge) => true,
            _ => false,
        },
        _ => false,
    }
}
