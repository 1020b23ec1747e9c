use super::{BulkDeleteRequest, Store, StoreFuture};
use crate::models::{
    Head, InitiatorId, JobId, JobRun, JobSpec, NewTx, RunId, RunStatus, TriggerEvent, Tx,
    TxAttempt, TxId,
};
use alloy_primitives::Address;
use anyhow::anyhow;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

const DEFAULT_HEAD_RETENTION: usize = 1_024;

#[derive(Default)]
struct MemoryState {
    heads: BTreeMap<u64, Head>,
    jobs: BTreeMap<JobId, JobSpec>,
    runs: HashMap<RunId, JobRun>,
    txs: BTreeMap<TxId, Tx>,
    attempts: HashMap<TxId, Vec<TxAttempt>>,
    next_tx_id: u64,
}

/// In-process [`Store`]. Records are cloned in and out so callers never hold
/// references into shared state.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    head_retention: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_head_retention(DEFAULT_HEAD_RETENTION)
    }

    pub fn with_head_retention(head_retention: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_tx_id: 1,
                ..MemoryState::default()
            }),
            head_retention: head_retention.max(1),
        }
    }
}

impl Store for MemoryStore {
    fn save_head<'a>(&'a self, head: &'a Head) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            // A replacement head orphans everything above it.
            let orphaned: Vec<u64> = state.heads.range(head.number..).map(|(n, _)| *n).collect();
            for number in orphaned {
                state.heads.remove(&number);
            }
            state.heads.insert(head.number, head.clone());
            while state.heads.len() > self.head_retention {
                state.heads.pop_first();
            }
            Ok(())
        })
    }

    fn last_head(&self) -> StoreFuture<'_, Option<Head>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.heads.values().next_back().cloned())
        })
    }

    fn recent_heads(&self, limit: usize) -> StoreFuture<'_, Vec<Head>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut heads: Vec<Head> = state.heads.values().rev().take(limit).cloned().collect();
            heads.reverse();
            Ok(heads)
        })
    }

    fn save_job<'a>(&'a self, job: &'a JobSpec) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.write().await.jobs.insert(job.id, job.clone());
            Ok(())
        })
    }

    fn find_job(&self, id: JobId) -> StoreFuture<'_, Option<JobSpec>> {
        Box::pin(async move { Ok(self.state.read().await.jobs.get(&id).cloned()) })
    }

    fn jobs(&self) -> StoreFuture<'_, Vec<JobSpec>> {
        Box::pin(async move { Ok(self.state.read().await.jobs.values().cloned().collect()) })
    }

    fn mark_initiator_ran(
        &self,
        job_id: JobId,
        initiator_id: InitiatorId,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| anyhow!("job {job_id} not found"))?;
            let initiator = job
                .initiators
                .iter_mut()
                .find(|initiator| initiator.id == initiator_id)
                .ok_or_else(|| anyhow!("initiator {initiator_id} not found on job {job_id}"))?;
            initiator.ran = true;
            Ok(())
        })
    }

    fn save_run<'a>(&'a self, run: &'a JobRun) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.write().await.runs.insert(run.id, run.clone());
            Ok(())
        })
    }

    fn find_run(&self, id: RunId) -> StoreFuture<'_, Option<JobRun>> {
        Box::pin(async move { Ok(self.state.read().await.runs.get(&id).cloned()) })
    }

    fn runs_with_status<'a>(&'a self, statuses: &'a [RunStatus]) -> StoreFuture<'a, Vec<JobRun>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut runs: Vec<JobRun> = state
                .runs
                .values()
                .filter(|run| statuses.contains(&run.status))
                .cloned()
                .collect();
            runs.sort_by_key(|run| run.created_at);
            Ok(runs)
        })
    }

    fn runs_for_job(&self, job_id: JobId) -> StoreFuture<'_, Vec<JobRun>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut runs: Vec<JobRun> = state
                .runs
                .values()
                .filter(|run| run.job_id == job_id)
                .cloned()
                .collect();
            runs.sort_by_key(|run| run.created_at);
            Ok(runs)
        })
    }

    fn run_for_trigger<'a>(
        &'a self,
        initiator_id: InitiatorId,
        trigger: &'a TriggerEvent,
    ) -> StoreFuture<'a, Option<RunId>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .runs
                .values()
                .find(|run| run.initiator_id == initiator_id && &run.trigger == trigger)
                .map(|run| run.id))
        })
    }

    fn delete_runs<'a>(&'a self, request: &'a BulkDeleteRequest) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let before = state.runs.len();
            state.runs.retain(|_, run| !request.matches(run));
            Ok(before - state.runs.len())
        })
    }

    fn create_tx(&self, tx: NewTx) -> StoreFuture<'_, Tx> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let id = TxId(state.next_tx_id);
            state.next_tx_id += 1;
            let tx = Tx::from_new(id, tx);
            state.txs.insert(id, tx.clone());
            Ok(tx)
        })
    }

    fn save_tx<'a>(&'a self, tx: &'a Tx) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if !state.txs.contains_key(&tx.id) {
                return Err(anyhow!("transaction {} was never created", tx.id));
            }
            state.txs.insert(tx.id, tx.clone());
            Ok(())
        })
    }

    fn find_tx(&self, id: TxId) -> StoreFuture<'_, Option<Tx>> {
        Box::pin(async move { Ok(self.state.read().await.txs.get(&id).cloned()) })
    }

    fn save_attempt<'a>(&'a self, attempt: &'a TxAttempt) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let attempts = state.attempts.entry(attempt.tx_id).or_default();
            match attempts
                .iter_mut()
                .find(|existing| existing.hash == attempt.hash)
            {
                Some(existing) => *existing = attempt.clone(),
                None => attempts.push(attempt.clone()),
            }
            Ok(())
        })
    }

    fn attempts_for(&self, id: TxId) -> StoreFuture<'_, Vec<TxAttempt>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.attempts.get(&id).cloned().unwrap_or_default())
        })
    }

    fn last_nonce(&self, address: Address) -> StoreFuture<'_, Option<u64>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .txs
                .values()
                .filter(|tx| tx.from == address)
                .filter_map(|tx| tx.nonce)
                .max())
        })
    }

    fn tx_with_nonce(&self, address: Address, nonce: u64) -> StoreFuture<'_, Option<TxId>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .txs
                .values()
                .find(|tx| tx.from == address && tx.nonce == Some(nonce))
                .map(|tx| tx.id))
        })
    }
}
