pub mod head;
pub mod models;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod txm;

pub use head::{BlockFeed, HeadTracker, HeadTrackerConfig, HeadTrackerError};
pub use models::{
    BlockHeader, Head, Initiator, InitiatorKind, JobError, JobId, JobRun, JobSpec, LogEvent,
    LogFilter, RunId, RunResult, RunStatus, TaskRun, TaskSpec, TaskType, TriggerEvent, Tx,
    TxAttempt, TxId, TxReceipt,
};
pub use rpc::circuit_breaker::{CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker};
pub use rpc::{AsyncRpcClient, RpcBlockFeed, RpcError};
pub use runtime::config::{NodeConfig, NodeConfigBuilder, NodeConfigParams};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::node::{NodeComponents, OracleNode};
pub use runtime::protocol::{HeadSubscriber, SubscriberError, SubscriberFuture, SubscriberStage};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use scheduler::{
    EthTxConfig, ExecutorRegistry, RunScheduler, SchedulerConfig, SchedulerError, TaskContext,
    TaskExecutor, TaskOutcome,
};
pub use store::{BulkDeleteRequest, MemoryStore, Store};
pub use txm::{
    ChainClient, ConfirmationState, GasBumpPolicy, TxManager, TxManagerConfig, TxSigner, TxmError,
};
