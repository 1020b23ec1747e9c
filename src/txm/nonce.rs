//! Per-account nonce sequencing. Holding a [`NonceLease`] is the only way to
//! read or advance an account's counter, so allocations for one account are
//! strictly serialized while different accounts proceed independently.

use alloy_primitives::Address;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct AccountNonce {
    next: Option<u64>,
}

pub(crate) struct NonceLease {
    address: Address,
    guard: OwnedMutexGuard<AccountNonce>,
}

impl NonceLease {
    pub(crate) fn address(&self) -> Address {
        self.address
    }

    /// Next nonce to hand out, `None` until bootstrapped from history.
    pub(crate) fn next(&self) -> Option<u64> {
        self.guard.next
    }

    pub(crate) fn advance_past(&mut self, used: u64) {
        self.guard.next = Some(used.saturating_add(1));
    }
}

#[derive(Debug, Default)]
pub struct NonceSequencer {
    accounts: StdMutex<HashMap<Address, Arc<Mutex<AccountNonce>>>>,
    halted: StdMutex<BTreeSet<Address>>,
}

impl NonceSequencer {
    pub(crate) async fn lock(&self, address: Address) -> NonceLease {
        let slot = {
            let mut accounts = lock_std(&self.accounts);
            accounts.entry(address).or_default().clone()
        };
        NonceLease {
            address,
            guard: slot.lock_owned().await,
        }
    }

    /// Forgets every cached counter so the next allocation re-reads history.
    /// Waits for in-flight allocations to finish first.
    pub(crate) async fn reset(&self) {
        let slots: Vec<_> = lock_std(&self.accounts).values().cloned().collect();
        for slot in slots {
            slot.lock().await.next = None;
        }
    }

    pub(crate) fn halt(&self, address: Address) {
        lock_std(&self.halted).insert(address);
    }

    pub fn is_halted(&self, address: Address) -> bool {
        lock_std(&self.halted).contains(&address)
    }

    pub fn halted_accounts(&self) -> Vec<Address> {
        lock_std(&self.halted).iter().copied().collect()
    }

    /// Lifts a halt. The cached counter is dropped too, so issuance resumes
    /// from reconciled history.
    pub(crate) async fn resume(&self, address: Address) {
        let mut lease = self.lock(address).await;
        lease.guard.next = None;
        lock_std(&self.halted).remove(&address);
    }
}

fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
