use super::head::LogEvent;
use alloy_primitives::{keccak256, Address, B256};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Event signature emitted by oracle contracts when a run is requested.
pub const RUN_LOG_EVENT_SIGNATURE: &str = "RunRequest(bytes32,address,uint256,uint256,uint256,bytes)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The job id as it appears in the second topic of a run-log: the 32 hex
    /// characters of the uuid taken as raw bytes.
    pub fn as_topic(&self) -> B256 {
        let simple = self.0.simple().to_string();
        B256::from_slice(simple.as_bytes())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitiatorId(pub Uuid);

impl InitiatorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InitiatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InitiatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Name of a task type; always stored lowercase so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One step of a job pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub confirmations: u64,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<TaskType>, params: Value) -> Self {
        Self {
            task_type: task_type.into(),
            params,
            confirmations: 0,
        }
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
pub enum InitiatorKind {
    Web,
    Cron {
        schedule: String,
    },
    #[serde(alias = "run-at")]
    RunAt {
        time: DateTime<Utc>,
    },
    #[serde(alias = "eth-log")]
    EthLog {
        #[serde(default)]
        address: Option<Address>,
    },
    #[serde(alias = "run-log")]
    RunLog {
        #[serde(default)]
        address: Option<Address>,
    },
}

impl InitiatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            InitiatorKind::Web => "web",
            InitiatorKind::Cron { .. } => "cron",
            InitiatorKind::RunAt { .. } => "runat",
            InitiatorKind::EthLog { .. } => "ethlog",
            InitiatorKind::RunLog { .. } => "runlog",
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, InitiatorKind::EthLog { .. } | InitiatorKind::RunLog { .. })
    }

    pub fn watched_address(&self) -> Option<Address> {
        match self {
            InitiatorKind::EthLog { address } | InitiatorKind::RunLog { address } => *address,
            _ => None,
        }
    }
}

/// Trigger rule attached to a job spec. `ran` only ever flips for `runat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub id: InitiatorId,
    #[serde(flatten)]
    pub kind: InitiatorKind,
    #[serde(default)]
    pub ran: bool,
}

impl Initiator {
    pub fn new(kind: InitiatorKind) -> Self {
        Self {
            id: InitiatorId::new(),
            kind,
            ran: false,
        }
    }

    /// Whether `log` should start a run of `job_id` through this initiator.
    pub fn matches_log(&self, job_id: &JobId, log: &LogEvent) -> bool {
        if let Some(address) = self.kind.watched_address() {
            if address != log.address {
                return false;
            }
        }

        match self.kind {
            InitiatorKind::EthLog { .. } => true,
            InitiatorKind::RunLog { .. } => {
                log.topics.first() == Some(&run_log_topic())
                    && log.topics.get(1) == Some(&job_id.as_topic())
            }
            _ => false,
        }
    }
}

pub fn run_log_topic() -> B256 {
    keccak256(RUN_LOG_EVENT_SIGNATURE.as_bytes())
}

/// Parses a cron expression. Five-field expressions are minute precision and
/// get a leading seconds field of `0`.
pub fn parse_schedule(expression: &str) -> Result<Schedule, JobError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    };

    Schedule::from_str(&normalized).map_err(|err| JobError::InvalidSchedule {
        schedule: expression.to_owned(),
        reason: err.to_string(),
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job must define at least one task")]
    NoTasks,
    #[error("job must define at least one initiator")]
    NoInitiators,
    #[error("invalid cron schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
    #[error("job end time {end_at} is not after start time {start_at}")]
    InvalidWindow {
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    },
    #[error("task {0} has an empty type")]
    EmptyTaskType(usize),
    #[error("unsupported task type {0}")]
    UnsupportedTaskType(TaskType),
}

/// A standing definition of what to run and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub id: JobId,
    pub initiators: Vec<Initiator>,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// Builds and validates a job; malformed specs never reach the scheduler.
    pub fn new(initiators: Vec<InitiatorKind>, tasks: Vec<TaskSpec>) -> Result<Self, JobError> {
        let job = Self {
            id: JobId::new(),
            initiators: initiators.into_iter().map(Initiator::new).collect(),
            tasks,
            start_at: None,
            end_at: None,
            created_at: Utc::now(),
        };
        job.validate()?;
        Ok(job)
    }

    pub fn with_window(
        mut self,
        start_at: Option<DateTime<Utc>>,
        end_at: Option<DateTime<Utc>>,
    ) -> Result<Self, JobError> {
        self.start_at = start_at;
        self.end_at = end_at;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.tasks.is_empty() {
            return Err(JobError::NoTasks);
        }
        if self.initiators.is_empty() {
            return Err(JobError::NoInitiators);
        }

        for (index, task) in self.tasks.iter().enumerate() {
            if task.task_type.as_str().is_empty() {
                return Err(JobError::EmptyTaskType(index));
            }
        }

        for initiator in &self.initiators {
            if let InitiatorKind::Cron { schedule } = &initiator.kind {
                parse_schedule(schedule)?;
            }
        }

        if let (Some(start_at), Some(end_at)) = (self.start_at, self.end_at) {
            if end_at <= start_at {
                return Err(JobError::InvalidWindow { start_at, end_at });
            }
        }

        Ok(())
    }

    pub fn initiator(&self, id: InitiatorId) -> Option<&Initiator> {
        self.initiators.iter().find(|initiator| initiator.id == id)
    }

    pub fn initiators_of<'a>(
        &'a self,
        predicate: impl Fn(&InitiatorKind) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Initiator> + 'a {
        self.initiators
            .iter()
            .filter(move |initiator| predicate(&initiator.kind))
    }

    /// Whether `now` falls inside the job's optional validity window.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if matches!(self.start_at, Some(start_at) if now < start_at) {
            return false;
        }
        if matches!(self.end_at, Some(end_at) if now > end_at) {
            return false;
        }
        true
    }

    /// Jobs whose only triggers are spent run-at initiators never fire again.
    pub fn has_active_initiators(&self) -> bool {
        self.initiators.iter().any(|initiator| {
            !matches!(initiator.kind, InitiatorKind::RunAt { .. }) || !initiator.ran
        })
    }
}
