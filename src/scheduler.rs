//! Job runs: triggers, the per-run state machine and the task executors that
//! do the work of each step.

pub mod adapters;
pub mod executor;
pub mod run_scheduler;
pub mod triggers;

pub use adapters::EthTxConfig;
pub use executor::{ExecutorRegistry, TaskContext, TaskExecutor, TaskOutcome};
pub use run_scheduler::{RunScheduler, SchedulerConfig, SchedulerError};
