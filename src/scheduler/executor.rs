use crate::models::{JobId, RunId, TaskType, TxId};
use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Everything a task sees of the run it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub run_id: RunId,
    pub job_id: JobId,
    pub task_index: usize,
    pub params: Value,
    /// Output of the previous step, or the run input for the first step.
    pub input: Value,
    /// Latest head delivered to the scheduler, if any.
    pub head: Option<u64>,
}

/// What a task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    /// An on-chain write was issued; the step completes once `tx_id` reaches
    /// the step's confirmation depth.
    PendingTx { tx_id: TxId, output: Value },
    /// The input or parameters are unusable. The run errors and is not
    /// retried.
    Failed(String),
}

/// Executes one task type.
///
/// Returning `Err` marks a transient failure: the step stays in progress and
/// is dispatched again on a later head. Permanent failures are reported as
/// [`TaskOutcome::Failed`].
pub trait TaskExecutor: Send + Sync {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>>;
}

/// Lookup table from task type to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.executors.keys().map(TaskType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry").field("types", &types).finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `task_type`, replacing any previous one.
    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        executor: Arc<dyn TaskExecutor>,
    ) -> &mut Self {
        self.executors.insert(task_type.into(), executor);
        self
    }

    /// Adds every executor of `other`, which wins on conflicting types.
    pub fn merge(&mut self, other: ExecutorRegistry) -> &mut Self {
        self.executors.extend(other.executors);
        self
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.executors.contains_key(task_type)
    }
}
