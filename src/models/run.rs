use super::job::{InitiatorId, JobId, JobSpec, TaskSpec};
use super::tx::TxId;
use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Status shared by job runs and task runs. The serialized names are part of
/// the public contract consumed by presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Unstarted,
    InProgress,
    PendingConfirmations,
    Completed,
    Errored,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Unstarted => "unstarted",
            RunStatus::InProgress => "in_progress",
            RunStatus::PendingConfirmations => "pending_confirmations",
            RunStatus::Completed => "completed",
            RunStatus::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Errored)
    }

    /// Forward-only state machine. `PendingConfirmations` may return to
    /// `InProgress` when the next step starts, never to `Unstarted`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Completed | Errored, _) => false,
            (current, next) if *current == next => true,
            (Unstarted, InProgress | PendingConfirmations | Completed | Errored) => true,
            (InProgress, PendingConfirmations | Completed | Errored) => true,
            (PendingConfirmations, InProgress | Completed | Errored) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal run status transition {from} -> {to}")]
pub struct StatusTransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Outcome of a task or a whole run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResult {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// The event that caused a run; `(initiator, trigger)` identifies a run so the
/// same event never produces two runs, even across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    Web { request_id: Uuid },
    Cron { scheduled_at: DateTime<Utc> },
    RunAt { at: DateTime<Utc> },
    /// Keyed by transaction and log index only, so the same request seen
    /// again in a replacement block after a reorg is not run twice.
    Log { transaction_hash: B256, log_index: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: Uuid,
    pub job_run_id: RunId,
    pub index: usize,
    pub task: TaskSpec,
    pub status: RunStatus,
    #[serde(default)]
    pub result: Option<RunResult>,
    /// Append-only record of every result the step produced.
    #[serde(default)]
    pub history: Vec<RunResult>,
    pub minimum_confirmations: u64,
    pub confirmations: u64,
    #[serde(default)]
    pub tx_id: Option<TxId>,
}

impl TaskRun {
    fn new(job_run_id: RunId, index: usize, task: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_run_id,
            index,
            minimum_confirmations: task.confirmations,
            task,
            status: RunStatus::Unstarted,
            result: None,
            history: Vec::new(),
            confirmations: 0,
            tx_id: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn record_result(&mut self, result: RunResult) {
        self.history.push(result.clone());
        self.result = Some(result);
    }

    /// Confirmations only ever grow, even if a later observation is lower.
    pub fn observe_confirmations(&mut self, observed: u64) {
        self.confirmations = self.confirmations.max(observed);
    }
}

/// One execution of a job spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: RunId,
    pub job_id: JobId,
    pub initiator_id: InitiatorId,
    pub trigger: TriggerEvent,
    pub status: RunStatus,
    pub task_runs: Vec<TaskRun>,
    #[serde(default)]
    pub result: Option<RunResult>,
    /// Input handed to the first task (web request body or log payload).
    #[serde(default)]
    pub input: Value,
    /// Block height the run is anchored to for confirmation counting.
    #[serde(default)]
    pub creation_height: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(
        job: &JobSpec,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
        input: Value,
        creation_height: Option<u64>,
    ) -> Self {
        let id = RunId::new();
        let now = Utc::now();
        let task_runs = job
            .tasks
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, task)| TaskRun::new(id, index, task))
            .collect();

        Self {
            id,
            job_id: job.id,
            initiator_id,
            trigger,
            status: RunStatus::Unstarted,
            task_runs,
            result: None,
            input,
            creation_height,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), StatusTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusTransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Index of the first step that has not completed yet.
    pub fn next_task_index(&self) -> Option<usize> {
        self.task_runs
            .iter()
            .position(|task_run| task_run.status != RunStatus::Completed)
    }

    /// Result of the last completed step, fed to the next step as its input.
    pub fn prior_result(&self, index: usize) -> Option<&RunResult> {
        index
            .checked_sub(1)
            .and_then(|previous| self.task_runs.get(previous))
            .and_then(|task_run| task_run.result.as_ref())
    }

    pub fn complete(&mut self) -> Result<(), StatusTransitionError> {
        self.transition(RunStatus::Completed)?;
        self.result = self
            .task_runs
            .last()
            .and_then(|task_run| task_run.result.clone())
            .or_else(|| Some(RunResult::success(Value::Null)));
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StatusTransitionError> {
        self.transition(RunStatus::Errored)?;
        self.result = Some(RunResult::failure(message));
        Ok(())
    }
}
