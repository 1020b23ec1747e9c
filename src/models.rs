//! Records shared by head tracking, transaction management and run
//! scheduling. Records point at each other by id so each can be persisted and
//! queried on its own.

pub mod head;
pub mod job;
pub mod run;
pub mod tx;

pub use head::{BlockHeader, Head, LogEvent, LogFilter};
pub use job::{
    Initiator, InitiatorId, InitiatorKind, JobError, JobId, JobSpec, TaskSpec, TaskType,
};
pub use run::{JobRun, RunId, RunResult, RunStatus, TaskRun, TriggerEvent};
pub use tx::{NewTx, SignedTx, Tx, TxAttempt, TxId, TxReceipt, UnsignedTx};
