//! Built-in task executors.

use super::executor::{ExecutorRegistry, TaskContext, TaskExecutor, TaskOutcome};
use crate::models::NewTx;
use crate::txm::TxManager;
use alloy_primitives::{Address, Bytes, U256};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Number, Value};
use std::sync::Arc;

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

/// Sending account and defaults for the `ethtx` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTxConfig {
    pub from: Address,
    pub gas_price: U256,
    pub gas_limit: u64,
}

impl ExecutorRegistry {
    /// Registry with `noop`, `jsonparse`, `multiply` and `ethtx`.
    pub fn with_builtins(txm: Arc<TxManager>, eth_tx: EthTxConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register("noop", Arc::new(Noop))
            .register("jsonparse", Arc::new(JsonParse))
            .register("multiply", Arc::new(Multiply))
            .register("ethtx", Arc::new(EthTx::new(txm, eth_tx)));
        registry
    }
}

/// Passes its input through.
pub struct Noop;

impl TaskExecutor for Noop {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move { Ok(TaskOutcome::Completed(ctx.input.clone())) })
    }
}

/// Walks `params.path` into the input document. The input may be a JSON value
/// or a string holding JSON.
pub struct JsonParse;

impl TaskExecutor for JsonParse {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            let Some(path) = json_path(&ctx.params) else {
                return Ok(TaskOutcome::Failed("jsonparse requires a path".into()));
            };

            let document = match &ctx.input {
                Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        return Ok(TaskOutcome::Failed(format!("input is not JSON: {err}")))
                    }
                },
                other => other.clone(),
            };

            let mut current = &document;
            for segment in &path {
                let next = match current {
                    Value::Object(map) => map.get(segment.as_str()),
                    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                match next {
                    Some(value) => current = value,
                    None => {
                        return Ok(TaskOutcome::Failed(format!(
                            "no value at path {}",
                            path.join(".")
                        )))
                    }
                }
            }
            Ok(TaskOutcome::Completed(current.clone()))
        })
    }
}

fn json_path(params: &Value) -> Option<Vec<String>> {
    let segments: Vec<String> = match params.get("path")? {
        Value::String(dotted) => dotted.split('.').map(str::to_owned).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(key) => Some(key.clone()),
                Value::Number(index) => Some(index.to_string()),
                _ => None,
            })
            .collect::<Option<_>>()?,
        _ => return None,
    };
    if segments.is_empty() || segments.iter().any(String::is_empty) {
        return None;
    }
    Some(segments)
}

/// Multiplies a numeric input by `params.times`.
pub struct Multiply;

impl TaskExecutor for Multiply {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            let Some(times) = ctx.params.get("times").and_then(as_number) else {
                return Ok(TaskOutcome::Failed("multiply requires a numeric times".into()));
            };
            let Some(value) = as_number(&ctx.input) else {
                return Ok(TaskOutcome::Failed(format!("input {} is not numeric", ctx.input)));
            };

            let product = value * times;
            let output = if product.fract() == 0.0 && product.abs() < MAX_EXACT_FLOAT_INT {
                Value::from(product as i64)
            } else {
                match Number::from_f64(product) {
                    Some(number) => Value::Number(number),
                    None => return Ok(TaskOutcome::Failed("product is not finite".into())),
                }
            };
            Ok(TaskOutcome::Completed(output))
        })
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EthTxParams {
    address: Address,
    #[serde(default)]
    function_selector: Option<Bytes>,
    #[serde(default)]
    data_prefix: Option<Bytes>,
    #[serde(default)]
    gas_limit: Option<u64>,
}

/// Writes the input on-chain as `selector ++ prefix ++ word(input)` and
/// leaves the step waiting for confirmations.
pub struct EthTx {
    txm: Arc<TxManager>,
    config: EthTxConfig,
}

impl EthTx {
    pub fn new(txm: Arc<TxManager>, config: EthTxConfig) -> Self {
        Self { txm, config }
    }
}

impl TaskExecutor for EthTx {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            let params: EthTxParams = match serde_json::from_value(ctx.params.clone()) {
                Ok(params) => params,
                Err(err) => return Ok(TaskOutcome::Failed(format!("invalid ethtx params: {err}"))),
            };
            let encoded = match encode_input(&ctx.input) {
                Ok(encoded) => encoded,
                Err(message) => return Ok(TaskOutcome::Failed(message)),
            };

            // Both are retried on a later head; nothing is created until they clear.
            let head = ctx
                .head
                .ok_or_else(|| anyhow!("no head observed yet; cannot stamp the attempt"))?;
            if self.txm.is_halted(self.config.from) {
                return Err(anyhow!(
                    "account {} is halted; transaction deferred",
                    self.config.from
                ));
            }

            let mut data = Vec::new();
            for part in [&params.function_selector, &params.data_prefix] {
                data.extend_from_slice(part.as_ref().map_or(&[][..], |bytes| &bytes[..]));
            }
            data.extend_from_slice(&encoded);

            let new = NewTx {
                from: self.config.from,
                to: params.address,
                data: Bytes::from(data),
                value: U256::ZERO,
                gas_limit: params.gas_limit.unwrap_or(self.config.gas_limit),
            };
            let (tx, attempt) = self.txm.submit(new, self.config.gas_price, head).await?;

            Ok(TaskOutcome::PendingTx {
                tx_id: tx.id,
                output: json!({
                    "txId": tx.id.0,
                    "hash": attempt.hash.to_string(),
                    "sentAt": attempt.sent_at,
                }),
            })
        })
    }
}

/// Numbers and decimal strings become one 32-byte word, hex strings up to 32
/// bytes are left-padded to a word and longer ones are appended as-is.
fn encode_input(input: &Value) -> Result<Vec<u8>, String> {
    let word = |value: U256| value.to_be_bytes::<32>().to_vec();
    match input {
        Value::Null => Ok(Vec::new()),
        Value::Bool(flag) => Ok(word(U256::from(u8::from(*flag)))),
        Value::Number(number) => number
            .as_u64()
            .map(|value| word(U256::from(value)))
            .ok_or_else(|| format!("{number} is not an unsigned integer")),
        Value::String(raw) => {
            let raw = raw.trim();
            if let Some(hex_digits) = raw.strip_prefix("0x") {
                let bytes = hex::decode(hex_digits).map_err(|err| format!("bad hex input: {err}"))?;
                if bytes.len() > 32 {
                    return Ok(bytes);
                }
                let mut padded = vec![0u8; 32 - bytes.len()];
                padded.extend_from_slice(&bytes);
                Ok(padded)
            } else {
                raw.parse::<U256>()
                    .map(word)
                    .map_err(|err| format!("{raw:?} is not a number: {err}"))
            }
        }
        other => Err(format!("cannot encode {other} as transaction data")),
    }
}
