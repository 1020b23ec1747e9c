//! Ethereum JSON-RPC plumbing: authentication, circuit breaker, batching,
//! metrics, retry policy, wire shapes and the polling block feed.

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod feed;
pub mod metrics;
pub mod options;
pub mod retry;
pub(crate) mod wire;

pub use circuit_breaker::{
    CircuitBreakerSnapshot, CircuitOpenError, CircuitState, RpcCircuitBreaker,
};
pub use client::{AsyncRpcClient, RpcError};
pub use feed::RpcBlockFeed;
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
