//! Durable record of heads, jobs, runs and transactions.
//!
//! The core never trusts in-memory state across restarts: every fact it acts on
//! twice is written through a [`Store`] first. [`MemoryStore`] backs tests and
//! single-process deployments; database backends implement the same trait.

pub mod memory;

pub use memory::MemoryStore;

use crate::models::{
    Head, InitiatorId, JobId, JobRun, JobSpec, NewTx, RunId, RunStatus, TriggerEvent, Tx,
    TxAttempt, TxId,
};
use alloy_primitives::Address;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T>>;

pub trait Store: Send + Sync {
    fn save_head<'a>(&'a self, head: &'a Head) -> StoreFuture<'a, ()>;

    fn last_head(&self) -> StoreFuture<'_, Option<Head>>;

    /// Most recent heads in ascending block order.
    fn recent_heads(&self, limit: usize) -> StoreFuture<'_, Vec<Head>>;

    fn save_job<'a>(&'a self, job: &'a JobSpec) -> StoreFuture<'a, ()>;

    fn find_job(&self, id: JobId) -> StoreFuture<'_, Option<JobSpec>>;

    fn jobs(&self) -> StoreFuture<'_, Vec<JobSpec>>;

    fn mark_initiator_ran(&self, job_id: JobId, initiator_id: InitiatorId)
        -> StoreFuture<'_, ()>;

    fn save_run<'a>(&'a self, run: &'a JobRun) -> StoreFuture<'a, ()>;

    fn find_run(&self, id: RunId) -> StoreFuture<'_, Option<JobRun>>;

    fn runs_with_status<'a>(&'a self, statuses: &'a [RunStatus]) -> StoreFuture<'a, Vec<JobRun>>;

    fn runs_for_job(&self, job_id: JobId) -> StoreFuture<'_, Vec<JobRun>>;

    fn run_for_trigger<'a>(
        &'a self,
        initiator_id: InitiatorId,
        trigger: &'a TriggerEvent,
    ) -> StoreFuture<'a, Option<RunId>>;

    /// Deletes finished runs matching the request, returning how many went.
    fn delete_runs<'a>(&'a self, request: &'a BulkDeleteRequest) -> StoreFuture<'a, usize>;

    fn create_tx(&self, tx: NewTx) -> StoreFuture<'_, Tx>;

    fn save_tx<'a>(&'a self, tx: &'a Tx) -> StoreFuture<'a, ()>;

    fn find_tx(&self, id: TxId) -> StoreFuture<'_, Option<Tx>>;

    fn save_attempt<'a>(&'a self, attempt: &'a TxAttempt) -> StoreFuture<'a, ()>;

    /// Attempts of a transaction in the order they were created.
    fn attempts_for(&self, id: TxId) -> StoreFuture<'_, Vec<TxAttempt>>;

    fn last_nonce(&self, address: Address) -> StoreFuture<'_, Option<u64>>;

    fn tx_with_nonce(&self, address: Address, nonce: u64) -> StoreFuture<'_, Option<TxId>>;
}

/// Retention query for finished runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDeleteRequest {
    statuses: Vec<RunStatus>,
    updated_before: DateTime<Utc>,
}

impl BulkDeleteRequest {
    /// Only completed and errored runs may be deleted.
    pub fn new(statuses: Vec<RunStatus>, updated_before: DateTime<Utc>) -> Result<Self> {
        if statuses.is_empty() {
            bail!("bulk delete requires at least one status");
        }
        if let Some(status) = statuses.iter().find(|status| !status.is_terminal()) {
            bail!("cannot delete runs with status {status}");
        }
        Ok(Self {
            statuses,
            updated_before,
        })
    }

    pub fn matches(&self, run: &JobRun) -> bool {
        self.statuses.contains(&run.status) && run.updated_at < self.updated_before
    }
}
