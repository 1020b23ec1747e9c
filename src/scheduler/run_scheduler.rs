//! The run state machine and the triggers that feed it.
//!
//! Runs never block on confirmations: a step that has to wait is persisted as
//! `pending_confirmations` and picked up again after the next head delivered
//! to [`RunScheduler`] through its [`HeadSubscriber`] implementation.
//!
//! Head delivery only records the head, scans logs and queues the runs worth
//! advancing. Executors run on the scheduler's own worker, so a slow task
//! never holds up the head stream.

use super::executor::{ExecutorRegistry, TaskContext, TaskOutcome};
use super::triggers;
use crate::head::BlockFeed;
use crate::models::{
    Head, InitiatorId, InitiatorKind, JobError, JobId, JobRun, JobSpec, RunId, RunResult,
    RunStatus, TriggerEvent,
};
use crate::runtime::protocol::{HeadSubscriber, SubscriberError, SubscriberFuture, SubscriberStage};
use crate::runtime::telemetry::Telemetry;
use crate::store::{BulkDeleteRequest, Store};
use crate::txm::{ConfirmationState, TxManager};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DEFAULT_MIN_CONFIRMATIONS: u64 = 12;
const DEFAULT_MAX_LOG_SCAN_BLOCKS: u64 = 1_000;
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
const NO_HEAD: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Depth a transaction written by a step must reach when the step itself
    /// does not ask for one.
    pub min_confirmations: u64,
    /// Widest block range a single log scan covers.
    pub max_log_scan_blocks: u64,
    /// Runs advanced in parallel.
    pub max_concurrent_runs: usize,
    /// How long disconnecting waits for executing runs before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            max_log_scan_blocks: DEFAULT_MAX_LOG_SCAN_BLOCKS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job {0} not found")]
    UnknownJob(JobId),
    #[error("job {0} has no web initiator")]
    NoWebInitiator(JobId),
    #[error("job {0} is outside its active window")]
    JobInactive(JobId),
    #[error(transparent)]
    InvalidJob(#[from] JobError),
}

enum Step {
    Continue,
    Suspend,
}

/// Exclusive right to advance one run. A request to advance the run while it
/// is held is remembered and honoured by the holder before letting go.
struct RunClaim<'a> {
    in_flight: &'a StdMutex<HashMap<RunId, bool>>,
    run_id: RunId,
    held: bool,
}

impl RunClaim<'_> {
    /// Releases the claim unless another advance was requested meanwhile, in
    /// which case the claim is kept and `true` returned.
    fn release_or_rerun(&mut self) -> bool {
        let mut in_flight = lock_std(self.in_flight);
        if let Some(rerun) = in_flight.get_mut(&self.run_id) {
            if *rerun {
                *rerun = false;
                return true;
            }
        }
        in_flight.remove(&self.run_id);
        self.held = false;
        false
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if self.held {
            lock_std(self.in_flight).remove(&self.run_id);
        }
    }
}

/// Background task advancing queued runs, alive between `connect` and
/// `disconnect`.
struct RunWorker {
    queue: mpsc::UnboundedSender<RunId>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RunScheduler {
    core: Arc<SchedulerCore>,
    worker: StdMutex<Option<RunWorker>>,
}

struct SchedulerCore {
    store: Arc<dyn Store>,
    txm: Arc<TxManager>,
    feed: Arc<dyn BlockFeed>,
    executors: ExecutorRegistry,
    config: SchedulerConfig,
    telemetry: Arc<Telemetry>,
    jobs: StdMutex<BTreeMap<JobId, JobSpec>>,
    cron_cursors: StdMutex<HashMap<InitiatorId, DateTime<Utc>>>,
    /// Next block the log scan starts at.
    log_cursor: StdMutex<Option<u64>>,
    latest_head: AtomicU64,
    /// Runs being advanced, each with its pending rerun request.
    in_flight: StdMutex<HashMap<RunId, bool>>,
}

impl RunScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        txm: Arc<TxManager>,
        feed: Arc<dyn BlockFeed>,
        executors: ExecutorRegistry,
        config: SchedulerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                store,
                txm,
                feed,
                executors,
                config,
                telemetry,
                jobs: StdMutex::new(BTreeMap::new()),
                cron_cursors: StdMutex::new(HashMap::new()),
                log_cursor: StdMutex::new(None),
                latest_head: AtomicU64::new(NO_HEAD),
                in_flight: StdMutex::new(HashMap::new()),
            }),
            worker: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub fn latest_head(&self) -> Option<u64> {
        self.core.latest_head()
    }

    /// Validates and persists `job`, then starts triggering it. Log initiators
    /// watch from `current_head` onwards.
    pub async fn add_job(&self, job: JobSpec, current_head: Option<u64>) -> Result<()> {
        self.core.add_job(job, current_head).await
    }

    /// Jobs that can still produce runs.
    pub fn jobs(&self) -> Vec<JobSpec> {
        lock_std(&self.core.jobs)
            .values()
            .filter(|job| job.has_active_initiators())
            .cloned()
            .collect()
    }

    pub async fn find_run(&self, run_id: RunId) -> Result<Option<JobRun>> {
        self.core.store.find_run(run_id).await
    }

    /// Starts a run of `job_id` for an external request and executes it as
    /// far as it goes without waiting on the chain.
    pub async fn create_web_run(&self, job_id: JobId, input: Value) -> Result<JobRun> {
        self.core.create_web_run(job_id, input).await
    }

    /// Fires due cron and run-at initiators as of `now` and executes the new
    /// runs. Returns the ids of the runs created.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        self.core.tick(now).await
    }

    /// Runs every step of `run_id` that can run now, stopping at the first one
    /// that waits on confirmations, fails, or fails transiently. Returns the
    /// persisted state afterwards.
    pub async fn execute_run(&self, run_id: RunId) -> Result<JobRun> {
        self.core.execute_run(run_id).await
    }

    /// Deletes finished runs matching `request`.
    pub async fn delete_runs(&self, request: &BulkDeleteRequest) -> Result<usize> {
        let deleted = self.core.store.delete_runs(request).await?;
        tracing::info!(deleted, "runs deleted");
        Ok(deleted)
    }

    /// Whether the background worker is running.
    pub fn is_working(&self) -> bool {
        lock_std(&self.worker).is_some()
    }

    /// Hands `run_ids` to the worker, starting it if it is not running.
    fn enqueue(&self, run_ids: Vec<RunId>) {
        if run_ids.is_empty() {
            return;
        }
        let mut worker = lock_std(&self.worker);
        let worker = worker.get_or_insert_with(|| self.core.clone().spawn_worker());
        for run_id in run_ids {
            if worker.queue.send(run_id).is_err() {
                tracing::warn!(run_id = %run_id, "run worker is gone; run stays queued in the store");
                break;
            }
        }
    }

    fn start_worker(&self) {
        let mut worker = lock_std(&self.worker);
        if worker.is_none() {
            *worker = Some(self.core.clone().spawn_worker());
        }
    }

    async fn stop_worker(&self) {
        let worker = lock_std(&self.worker).take();
        let Some(worker) = worker else {
            return;
        };
        worker.shutdown.cancel();
        drop(worker.queue);
        if let Err(err) = worker.handle.await {
            tracing::warn!(error = %err, "run worker panicked");
        }
    }
}

impl SchedulerCore {
    fn latest_head(&self) -> Option<u64> {
        match self.latest_head.load(Ordering::SeqCst) {
            NO_HEAD => None,
            number => Some(number),
        }
    }

    async fn add_job(&self, job: JobSpec, current_head: Option<u64>) -> Result<()> {
        job.validate().map_err(SchedulerError::from)?;
        if let Some(task) = job
            .tasks
            .iter()
            .find(|task| !self.executors.supports(&task.task_type))
        {
            return Err(SchedulerError::from(JobError::UnsupportedTaskType(task.task_type.clone())).into());
        }

        self.store.save_job(&job).await?;

        if job.initiators.iter().any(|initiator| initiator.kind.is_log()) {
            let mut cursor = lock_std(&self.log_cursor);
            if cursor.is_none() {
                *cursor = current_head.or_else(|| self.latest_head());
            }
        }

        tracing::info!(
            job_id = %job.id,
            initiators = job.initiators.len(),
            tasks = job.tasks.len(),
            "job added"
        );
        lock_std(&self.jobs).insert(job.id, job);
        Ok(())
    }

    async fn create_web_run(&self, job_id: JobId, input: Value) -> Result<JobRun> {
        let job = lock_std(&self.jobs)
            .get(&job_id)
            .cloned()
            .ok_or(SchedulerError::UnknownJob(job_id))?;
        if !job.is_active_at(Utc::now()) {
            return Err(SchedulerError::JobInactive(job_id).into());
        }
        let initiator = job
            .initiators_of(|kind| matches!(kind, InitiatorKind::Web))
            .next()
            .ok_or(SchedulerError::NoWebInitiator(job_id))?;

        let trigger = TriggerEvent::Web {
            request_id: Uuid::new_v4(),
        };
        let run = self
            .create_run(&job, initiator.id, trigger, input, None)
            .await?
            .ok_or_else(|| anyhow!("web request for job {job_id} was already recorded"))?;
        self.execute_run(run.id).await
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let jobs: Vec<JobSpec> = lock_std(&self.jobs).values().cloned().collect();
        let mut created = Vec::new();

        for job in jobs.iter().filter(|job| job.is_active_at(now)) {
            for initiator in &job.initiators {
                match &initiator.kind {
                    InitiatorKind::Cron { schedule } => {
                        let after = lock_std(&self.cron_cursors)
                            .get(&initiator.id)
                            .copied()
                            .unwrap_or(job.created_at);
                        let Some(scheduled_at) = triggers::due_cron_occurrence(schedule, after, now)
                        else {
                            continue;
                        };
                        lock_std(&self.cron_cursors).insert(initiator.id, scheduled_at);
                        let trigger = TriggerEvent::Cron { scheduled_at };
                        if let Some(run) =
                            self.create_run(job, initiator.id, trigger, Value::Null, None).await?
                        {
                            created.push(run.id);
                        }
                    }
                    InitiatorKind::RunAt { .. } => {
                        let Some(at) = triggers::run_at_due(initiator, now) else {
                            continue;
                        };
                        let trigger = TriggerEvent::RunAt { at };
                        if let Some(run) =
                            self.create_run(job, initiator.id, trigger, Value::Null, None).await?
                        {
                            created.push(run.id);
                        }
                        self.store.mark_initiator_ran(job.id, initiator.id).await?;
                        self.mark_ran(job.id, initiator.id);
                        tracing::info!(job_id = %job.id, initiator_id = %initiator.id, at = %at, "run-at initiator fired");
                    }
                    _ => {}
                }
            }
        }

        self.dispatch(created.clone()).await;
        Ok(created)
    }

    async fn execute_run(&self, run_id: RunId) -> Result<JobRun> {
        let Some(mut claim) = self.claim(run_id) else {
            tracing::debug!(run_id = %run_id, "run is already executing; it will be advanced again");
            return self.load_run(run_id).await;
        };
        loop {
            let run = self.load_run(run_id).await?;
            let run = self.advance(run).await?;
            if !claim.release_or_rerun() {
                return Ok(run);
            }
        }
    }

    /// Records `head` and returns the runs worth advancing at it. Nothing
    /// here runs an executor.
    async fn handle_head(&self, head: &Head) -> Result<Vec<RunId>> {
        self.latest_head.store(head.number, Ordering::SeqCst);
        if let Some(ancestor) = head.reorg_ancestor {
            self.rewind_log_cursor(ancestor);
        }

        if let Err(err) = self.scan_logs(head.number).await {
            tracing::warn!(number = head.number, error = %err, "log scan failed; retrying on the next head");
        }

        let resumable = self
            .store
            .runs_with_status(&[
                RunStatus::PendingConfirmations,
                RunStatus::InProgress,
                RunStatus::Unstarted,
            ])
            .await?;
        Ok(resumable.into_iter().map(|run| run.id).collect())
    }

    /// Loads jobs and returns the runs a crash left unstarted or in progress.
    async fn restore(&self, head: Option<&Head>) -> Result<Vec<RunId>> {
        let jobs = self.store.jobs().await?;
        let job_count = jobs.len();
        *lock_std(&self.jobs) = jobs.into_iter().map(|job| (job.id, job)).collect();

        if let Some(head) = head {
            self.latest_head.store(head.number, Ordering::SeqCst);
            let mut cursor = lock_std(&self.log_cursor);
            if cursor.is_none() {
                *cursor = Some(head.number);
            }
        }

        let stranded: Vec<RunId> = self
            .store
            .runs_with_status(&[RunStatus::Unstarted, RunStatus::InProgress])
            .await?
            .into_iter()
            .map(|run| run.id)
            .collect();

        tracing::info!(
            jobs = job_count,
            stranded = stranded.len(),
            head = head.map(|head| head.number),
            "run scheduler connected"
        );
        Ok(stranded)
    }

    /// Blocks above `ancestor` may now hold different logs; scan them again.
    fn rewind_log_cursor(&self, ancestor: u64) {
        let mut cursor = lock_std(&self.log_cursor);
        let rewound = ancestor.saturating_add(1);
        if let Some(next) = cursor.as_mut() {
            if *next > rewound {
                tracing::info!(from = *next, to = rewound, "rewinding log scan after reorg");
                *next = rewound;
            }
        }
    }

    /// Creates runs for logs in blocks between the cursor and `head`.
    async fn scan_logs(&self, head: u64) -> Result<()> {
        let jobs: Vec<JobSpec> = lock_std(&self.jobs)
            .values()
            .filter(|job| job.initiators.iter().any(|initiator| initiator.kind.is_log()))
            .cloned()
            .collect();
        if jobs.is_empty() {
            return Ok(());
        }

        let cursor = *lock_std(&self.log_cursor).get_or_insert(head);
        let Some((from, to)) = triggers::scan_range(cursor, head, self.config.max_log_scan_blocks)
        else {
            return Ok(());
        };
        let Some(filter) = triggers::log_filter(&jobs, from, to) else {
            return Ok(());
        };

        let logs = self.feed.logs(&filter).await?;
        let now = Utc::now();
        let mut created = 0usize;
        for log in &logs {
            for job in jobs.iter().filter(|job| job.is_active_at(now)) {
                for initiator in job.initiators_of(InitiatorKind::is_log) {
                    if !initiator.matches_log(&job.id, log) {
                        continue;
                    }
                    let trigger = TriggerEvent::Log {
                        transaction_hash: log.transaction_hash,
                        log_index: log.log_index,
                    };
                    let input = serde_json::to_value(log)?;
                    if self
                        .create_run(job, initiator.id, trigger, input, Some(log.block_number))
                        .await?
                        .is_some()
                    {
                        created += 1;
                    }
                }
            }
        }

        *lock_std(&self.log_cursor) = Some(to.saturating_add(1));
        tracing::debug!(from, to, logs = logs.len(), created, "logs scanned");
        Ok(())
    }

    /// Persists a new run unless `(initiator, trigger)` already produced one.
    async fn create_run(
        &self,
        job: &JobSpec,
        initiator_id: InitiatorId,
        trigger: TriggerEvent,
        input: Value,
        creation_height: Option<u64>,
    ) -> Result<Option<JobRun>> {
        if let Some(existing) = self.store.run_for_trigger(initiator_id, &trigger).await? {
            tracing::debug!(run_id = %existing, job_id = %job.id, "trigger already has a run");
            return Ok(None);
        }

        let run = JobRun::new(job, initiator_id, trigger, input, creation_height);
        self.store.save_run(&run).await?;
        self.telemetry.record_run_created();
        tracing::info!(
            run_id = %run.id,
            job_id = %job.id,
            initiator = job.initiator(initiator_id).map(|initiator| initiator.kind.name()),
            creation_height,
            "run created"
        );
        Ok(Some(run))
    }

    /// Advances independent runs concurrently; failures stay with their run.
    async fn dispatch(&self, run_ids: Vec<RunId>) {
        if run_ids.is_empty() {
            return;
        }
        stream::iter(run_ids)
            .for_each_concurrent(self.config.max_concurrent_runs.max(1), |run_id| async move {
                if let Err(err) = self.execute_run(run_id).await {
                    tracing::warn!(run_id = %run_id, error = %err, "failed to advance run");
                }
            })
            .await;
    }

    async fn advance(&self, mut run: JobRun) -> Result<JobRun> {
        let head = self.latest_head();

        loop {
            if run.status.is_terminal() {
                return Ok(run);
            }

            let Some(index) = run.next_task_index() else {
                run.complete()?;
                self.store.save_run(&run).await?;
                self.telemetry.record_run_completed();
                tracing::info!(run_id = %run.id, job_id = %run.job_id, "run completed");
                return Ok(run);
            };

            let waiting_on_tx = run.task_runs[index].status == RunStatus::PendingConfirmations
                && run.task_runs[index].tx_id.is_some();
            if waiting_on_tx {
                match self.check_tx(&mut run, index, head).await? {
                    Step::Continue => continue,
                    Step::Suspend => return Ok(run),
                }
            }

            if !self.incoming_confirmed(&mut run, index, head) {
                run.task_runs[index].transition(RunStatus::PendingConfirmations)?;
                run.transition(RunStatus::PendingConfirmations)?;
                self.store.save_run(&run).await?;
                return Ok(run);
            }

            run.transition(RunStatus::InProgress)?;
            run.task_runs[index].transition(RunStatus::InProgress)?;
            self.store.save_run(&run).await?;

            let task = run.task_runs[index].task.clone();
            let Some(executor) = self.executors.get(&task.task_type) else {
                let message = format!("no executor for task type {}", task.task_type);
                self.fail_run(&mut run, index, message).await?;
                return Ok(run);
            };

            let ctx = TaskContext {
                run_id: run.id,
                job_id: run.job_id,
                task_index: index,
                params: task.params.clone(),
                input: run
                    .prior_result(index)
                    .map(|result| result.output.clone())
                    .unwrap_or_else(|| run.input.clone()),
                head,
            };

            match executor.run(&ctx).await {
                Err(err) => {
                    tracing::warn!(
                        run_id = %run.id,
                        task = index,
                        task_type = %task.task_type,
                        error = %err,
                        "task failed transiently; retrying on a later head"
                    );
                    return Ok(run);
                }
                Ok(TaskOutcome::Failed(message)) => {
                    self.fail_run(&mut run, index, message).await?;
                    return Ok(run);
                }
                Ok(TaskOutcome::Completed(output)) => {
                    let task_run = &mut run.task_runs[index];
                    task_run.record_result(RunResult::success(output));
                    task_run.transition(RunStatus::Completed)?;
                    self.store.save_run(&run).await?;
                    tracing::debug!(run_id = %run.id, task = index, "task completed");
                }
                Ok(TaskOutcome::PendingTx { tx_id, output }) => {
                    let required = if task.confirmations > 0 {
                        task.confirmations
                    } else {
                        self.config.min_confirmations
                    };
                    let task_run = &mut run.task_runs[index];
                    task_run.record_result(RunResult::success(output));
                    task_run.tx_id = Some(tx_id);
                    task_run.minimum_confirmations = required;
                    task_run.transition(RunStatus::PendingConfirmations)?;
                    run.transition(RunStatus::PendingConfirmations)?;
                    self.store.save_run(&run).await?;
                    tracing::info!(
                        run_id = %run.id,
                        task = index,
                        tx_id = %tx_id,
                        required,
                        "task waiting for transaction confirmations"
                    );
                    return Ok(run);
                }
            }
        }
    }

    /// Log-triggered runs wait until the log's block is `minimum_confirmations`
    /// deep before a step runs. Other runs have no anchor and never wait here.
    fn incoming_confirmed(&self, run: &mut JobRun, index: usize, head: Option<u64>) -> bool {
        let required = run.task_runs[index].minimum_confirmations;
        if required == 0 {
            return true;
        }
        let Some(anchor) = run.creation_height else {
            return true;
        };
        let Some(head) = head else {
            return false;
        };
        let observed = head.saturating_sub(anchor);
        run.task_runs[index].observe_confirmations(observed);
        observed >= required
    }

    async fn check_tx(&self, run: &mut JobRun, index: usize, head: Option<u64>) -> Result<Step> {
        let Some(head) = head else {
            return Ok(Step::Suspend);
        };
        let task_run = &run.task_runs[index];
        let Some(tx_id) = task_run.tx_id else {
            return Ok(Step::Suspend);
        };
        let required = task_run.minimum_confirmations;

        let state = match self.txm.check_confirmation(tx_id, head, required).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(run_id = %run.id, tx_id = %tx_id, error = %err, "confirmation check failed");
                return Ok(Step::Suspend);
            }
        };

        match state {
            ConfirmationState::Pending { confirmations } => {
                let before = run.task_runs[index].confirmations;
                run.task_runs[index].observe_confirmations(confirmations);
                if run.task_runs[index].confirmations != before {
                    self.store.save_run(run).await?;
                }
                Ok(Step::Suspend)
            }
            ConfirmationState::NeedsBump => {
                if let Err(err) = self.txm.bump_gas(tx_id, head).await {
                    tracing::warn!(run_id = %run.id, tx_id = %tx_id, error = %err, "gas bump failed");
                }
                Ok(Step::Suspend)
            }
            ConfirmationState::Confirmed {
                receipt,
                confirmations,
            } => {
                run.task_runs[index].observe_confirmations(confirmations);
                if !receipt.success {
                    let message = format!(
                        "transaction {} reverted in block {}",
                        receipt.hash, receipt.block_number
                    );
                    self.fail_run(run, index, message).await?;
                    return Ok(Step::Suspend);
                }
                run.task_runs[index].transition(RunStatus::Completed)?;
                run.transition(RunStatus::InProgress)?;
                self.store.save_run(run).await?;
                tracing::info!(
                    run_id = %run.id,
                    task = index,
                    tx_id = %tx_id,
                    confirmations,
                    head,
                    "task confirmed"
                );
                Ok(Step::Continue)
            }
        }
    }

    async fn fail_run(&self, run: &mut JobRun, index: usize, message: String) -> Result<()> {
        let task_run = &mut run.task_runs[index];
        task_run.record_result(RunResult::failure(message.clone()));
        task_run.transition(RunStatus::Errored)?;
        run.fail(message.clone())?;
        self.store.save_run(run).await?;
        self.telemetry.record_run_errored();
        tracing::warn!(run_id = %run.id, job_id = %run.job_id, task = index, error = %message, "run errored");
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<JobRun> {
        self.store
            .find_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run {run_id} not found"))
    }

    /// Takes the run, or asks the current holder to advance it once more.
    fn claim(&self, run_id: RunId) -> Option<RunClaim<'_>> {
        let mut in_flight = lock_std(&self.in_flight);
        if let Some(rerun) = in_flight.get_mut(&run_id) {
            *rerun = true;
            return None;
        }
        in_flight.insert(run_id, false);
        Some(RunClaim {
            in_flight: &self.in_flight,
            run_id,
            held: true,
        })
    }

    fn mark_ran(&self, job_id: JobId, initiator_id: InitiatorId) {
        let mut jobs = lock_std(&self.jobs);
        let initiator = jobs
            .get_mut(&job_id)
            .and_then(|job| job.initiators.iter_mut().find(|initiator| initiator.id == initiator_id));
        if let Some(initiator) = initiator {
            initiator.ran = true;
        }
    }
}

impl SchedulerCore {
    fn spawn_worker(self: Arc<Self>) -> RunWorker {
        let (queue, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.work(receiver, shutdown.clone()));
        RunWorker {
            queue,
            shutdown,
            handle,
        }
    }

    /// Advances queued runs until shut down, then gives executing runs the
    /// grace period before aborting them.
    async fn work(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<RunId>,
        shutdown: CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1)));
        let mut running = JoinSet::new();
        tracing::debug!("run worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!(error = %err, "run task panicked");
                    }
                }
                received = queue.recv() => {
                    let Some(run_id) = received else {
                        break;
                    };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let core = self.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        if let Err(err) = core.execute_run(run_id).await {
                            tracing::warn!(run_id = %run_id, error = %err, "failed to advance run");
                        }
                    });
                }
            }
        }

        let grace = self.config.shutdown_grace;
        let drained = timeout(grace, async {
            while running.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                executing = running.len(),
                grace_ms = grace.as_millis() as u64,
                "aborting runs still executing at shutdown"
            );
            running.shutdown().await;
        }
        tracing::debug!("run worker stopped");
    }
}

impl HeadSubscriber for RunScheduler {
    fn name(&self) -> &'static str {
        "run scheduler"
    }

    /// Reloads jobs from the store, starts the worker and queues the runs a
    /// crash left unstarted or in progress.
    fn connect<'a>(&'a self, head: Option<&'a Head>) -> SubscriberFuture<'a> {
        Box::pin(async move {
            let stranded = self
                .core
                .restore(head)
                .await
                .map_err(|err| SubscriberError::new(SubscriberStage::Connect, self.name(), err))?;
            self.start_worker();
            self.enqueue(stranded);
            Ok(())
        })
    }

    fn on_new_head<'a>(&'a self, head: &'a Head) -> SubscriberFuture<'a> {
        Box::pin(async move {
            let resumable = self
                .core
                .handle_head(head)
                .await
                .map_err(|err| SubscriberError::new(SubscriberStage::NewHead, self.name(), err))?;
            self.enqueue(resumable);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self) -> SubscriberFuture<'a> {
        Box::pin(async move {
            let in_flight = lock_std(&self.core.in_flight).len();
            self.stop_worker().await;
            tracing::info!(in_flight, "run scheduler disconnected");
            Ok(())
        })
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
