//! Log templates and context for `AsyncRpcClient::retry_with_breaker`, so each
//! RPC operation reports breaker state, retries and exhaustion the same way.

use crate::rpc::circuit_breaker::CircuitState;
use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(blocks) = $ctx.blocks {
            tracing::$level!(
                method = $ctx.messages.method,
                from_block = blocks.from,
                to_block = blocks.to,
                $($rest)*
            );
        } else {
            tracing::$level!(method = $ctx.messages.method, $($rest)*);
        }
    }};
}

#[derive(Clone, Copy)]
struct BlockSpan {
    from: u64,
    to: u64,
}

/// Messages one RPC operation logs while it retries.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) method: &'static str,
    pub(crate) circuit_open: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
    /// Logged when the node reports the requested block does not exist yet.
    pub(crate) missing: Option<&'static str>,
}

#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    blocks: Option<BlockSpan>,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(messages: &'a RetryMessages) -> Self {
        Self {
            blocks: None,
            messages,
        }
    }

    pub(crate) fn with_blocks(messages: &'a RetryMessages, numbers: &[u64]) -> Self {
        let blocks = match (numbers.iter().min(), numbers.iter().max()) {
            (Some(from), Some(to)) => Some(BlockSpan {
                from: *from,
                to: *to,
            }),
            _ => None,
        };
        Self { blocks, messages }
    }

    pub(crate) fn log_permit(&self, state: CircuitState) {
        log_with_retry_ctx!(trace, self, breaker_state = ?state, "circuit breaker permit acquired");
    }

    pub(crate) fn log_circuit_open(&self) {
        log_with_retry_ctx!(warn, self, "{}", self.messages.circuit_open);
    }

    pub(crate) fn log_missing(&self, attempt: usize, number: u64) {
        if let Some(message) = self.messages.missing {
            log_with_retry_ctx!(debug, self, attempt, missing_block = number, "{}", message);
        }
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error, timeout: bool) {
        let backoff_ms = backoff.as_millis().min(u128::from(u64::MAX)) as u64;
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms,
            timeout,
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }

    pub(crate) fn log_rejected(&self, code: i32, message: &str) {
        log_with_retry_ctx!(debug, self, code, rejection = message, "node rejected rpc call");
    }
}

pub(crate) const BLOCK_NUMBER_RETRY: RetryMessages = RetryMessages {
    method: "eth_blockNumber",
    circuit_open: "RPC circuit breaker open; rejecting eth_blockNumber",
    retry: "eth_blockNumber failed; retrying",
    exhausted: "eth_blockNumber exhausted retries",
    missing: None,
};

pub(crate) const HEADER_RETRY: RetryMessages = RetryMessages {
    method: "eth_getBlockByNumber",
    circuit_open: "RPC circuit breaker open; rejecting header lookup",
    retry: "header lookup failed; retrying",
    exhausted: "header lookup exhausted retries",
    missing: Some("header lookup reached chain tip"),
};

pub(crate) const LOGS_RETRY: RetryMessages = RetryMessages {
    method: "eth_getLogs",
    circuit_open: "RPC circuit breaker open; rejecting log query",
    retry: "log query failed; retrying",
    exhausted: "log query exhausted retries",
    missing: None,
};

pub(crate) const SEND_RAW_RETRY: RetryMessages = RetryMessages {
    method: "eth_sendRawTransaction",
    circuit_open: "RPC circuit breaker open; transaction not broadcast",
    retry: "broadcast failed; retrying",
    exhausted: "broadcast exhausted retries",
    missing: None,
};

pub(crate) const RECEIPT_RETRY: RetryMessages = RetryMessages {
    method: "eth_getTransactionReceipt",
    circuit_open: "RPC circuit breaker open; rejecting receipt lookup",
    retry: "receipt lookup failed; retrying",
    exhausted: "receipt lookup exhausted retries",
    missing: None,
};

pub(crate) const NONCE_RETRY: RetryMessages = RetryMessages {
    method: "eth_getTransactionCount",
    circuit_open: "RPC circuit breaker open; rejecting nonce lookup",
    retry: "nonce lookup failed; retrying",
    exhausted: "nonce lookup exhausted retries",
    missing: None,
};
