//! Transaction lifecycle: intents become signed attempts under exclusive
//! per-account nonce sequencing, attempts are re-priced when they stall, and
//! confirmation is recomputed from the canonical chain on every check so a
//! reorg that orphans a receipt sends the transaction back to pending.

use super::chain::{ChainClient, TxSigner};
use super::gas::GasBumpPolicy;
use super::nonce::{NonceLease, NonceSequencer};
use crate::models::{Head, NewTx, SignedTx, Tx, TxAttempt, TxId, TxReceipt, UnsignedTx};
use crate::runtime::protocol::{HeadSubscriber, SubscriberFuture};
use crate::runtime::telemetry::Telemetry;
use crate::store::Store;
use alloy_primitives::{Address, U256};
use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NO_HEAD: u64 = u64::MAX;

#[derive(Debug, Clone, Default)]
pub struct TxManagerConfig {
    pub gas_bump: GasBumpPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxmError {
    #[error("invalid transaction parameters: {0}")]
    InvalidParameters(String),
    #[error("unknown transaction {0}")]
    UnknownTx(TxId),
    #[error("account {0} is halted after a nonce collision")]
    AccountHalted(Address),
    #[error("nonce {nonce} of {address} is already taken by transaction {existing}")]
    NonceCollision {
        address: Address,
        nonce: u64,
        existing: TxId,
    },
    #[error("transaction {0} is already confirmed")]
    AlreadyConfirmed(TxId),
    #[error("transaction {0} has no attempts")]
    NoAttempts(TxId),
}

/// Where a transaction stands against the current head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationState {
    /// Not deep enough yet. `confirmations` is zero while no receipt exists.
    Pending { confirmations: u64 },
    Confirmed {
        receipt: TxReceipt,
        confirmations: u64,
    },
    /// No receipt after the bump threshold; resubmit at a higher price.
    NeedsBump,
}

pub struct TxManager {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    signer: Arc<dyn TxSigner>,
    config: TxManagerConfig,
    telemetry: Arc<Telemetry>,
    nonces: NonceSequencer,
    latest_head: AtomicU64,
}

impl TxManager {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        signer: Arc<dyn TxSigner>,
        config: TxManagerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            chain,
            signer,
            config,
            telemetry,
            nonces: NonceSequencer::default(),
            latest_head: AtomicU64::new(NO_HEAD),
        }
    }

    pub fn config(&self) -> &TxManagerConfig {
        &self.config
    }

    /// Last head delivered by the tracker.
    pub fn latest_head(&self) -> Option<u64> {
        match self.latest_head.load(Ordering::SeqCst) {
            NO_HEAD => None,
            number => Some(number),
        }
    }

    pub async fn create_tx(&self, new: NewTx) -> Result<Tx> {
        validate_new(&new)?;
        let tx = self.store.create_tx(new).await?;
        tracing::debug!(tx_id = %tx.id, from = %tx.from, to = %tx.to, "transaction created");
        Ok(tx)
    }

    pub async fn find_tx(&self, tx_id: TxId) -> Result<Tx> {
        Ok(self
            .store
            .find_tx(tx_id)
            .await?
            .ok_or(TxmError::UnknownTx(tx_id))?)
    }

    /// Signs, persists and broadcasts a new attempt for `tx_id`, making it the
    /// active one.
    ///
    /// The first attempt takes the account's next nonce while holding its
    /// lease; later attempts reuse that nonce. A broadcast failure is recorded
    /// on the attempt and does not fail the call.
    pub async fn add_attempt(
        &self,
        tx_id: TxId,
        gas_price: U256,
        sent_at: u64,
    ) -> Result<TxAttempt> {
        if gas_price.is_zero() {
            return Err(TxmError::InvalidParameters("gas price must be greater than 0".into()).into());
        }

        let mut tx = self.find_tx(tx_id).await?;
        if tx.confirmed {
            return Err(TxmError::AlreadyConfirmed(tx_id).into());
        }
        if self.nonces.is_halted(tx.from) {
            return Err(TxmError::AccountHalted(tx.from).into());
        }

        let attempt = match tx.nonce {
            Some(nonce) => self.record_attempt(&mut tx, nonce, gas_price, sent_at).await?,
            None => {
                let mut lease = self.nonces.lock(tx.from).await;
                let nonce = self.allocate_nonce(&lease, Some(tx.id)).await?;
                let attempt = self.record_attempt(&mut tx, nonce, gas_price, sent_at).await?;
                lease.advance_past(nonce);
                attempt
            }
        };

        Ok(self.broadcast(attempt).await)
    }

    /// Creates a transaction together with its first attempt.
    ///
    /// The nonce is taken and the attempt signed before anything is written,
    /// so a signer, bootstrap or collision failure leaves no transaction
    /// behind and the caller can simply try again.
    pub async fn submit(
        &self,
        new: NewTx,
        gas_price: U256,
        sent_at: u64,
    ) -> Result<(Tx, TxAttempt)> {
        validate_new(&new)?;
        if gas_price.is_zero() {
            return Err(TxmError::InvalidParameters("gas price must be greater than 0".into()).into());
        }
        if self.nonces.is_halted(new.from) {
            return Err(TxmError::AccountHalted(new.from).into());
        }

        let mut lease = self.nonces.lock(new.from).await;
        let nonce = self.allocate_nonce(&lease, None).await?;
        let signed = self
            .signer
            .sign(&UnsignedTx {
                from: new.from,
                to: new.to,
                nonce,
                gas_price,
                gas_limit: new.gas_limit,
                value: new.value,
                data: new.data.clone(),
            })
            .await?;

        let mut tx = self.store.create_tx(new).await?;
        let attempt = self
            .persist_attempt(&mut tx, nonce, gas_price, sent_at, signed)
            .await?;
        lease.advance_past(nonce);
        drop(lease);

        tracing::debug!(tx_id = %tx.id, from = %tx.from, to = %tx.to, nonce, "transaction submitted");
        let attempt = self.broadcast(attempt).await;
        Ok((tx, attempt))
    }

    /// Reports whether `tx_id` has `required` confirmations at `head`.
    ///
    /// Receipts are looked up newest attempt first on every call; nothing is
    /// cached, so a receipt orphaned by a reorg turns a confirmed transaction
    /// back into a pending one.
    pub async fn check_confirmation(
        &self,
        tx_id: TxId,
        head: u64,
        required: u64,
    ) -> Result<ConfirmationState> {
        let mut tx = self.find_tx(tx_id).await?;
        let attempts = self.store.attempts_for(tx_id).await?;
        if attempts.is_empty() {
            return Err(TxmError::NoAttempts(tx_id).into());
        }

        let mut mined: Option<(usize, TxReceipt)> = None;
        for (index, attempt) in attempts.iter().enumerate().rev() {
            if let Some(receipt) = self.chain.transaction_receipt(attempt.hash).await? {
                mined = Some((index, receipt));
                break;
            }
        }

        let Some((index, receipt)) = mined else {
            if tx.confirmed || attempts.iter().any(|attempt| attempt.confirmed) {
                tracing::warn!(tx_id = %tx_id, head, "confirmed transaction lost its receipt; back to pending");
                self.set_confirmed(&mut tx, &attempts, None).await?;
            }
            let active = self.active_attempt(&tx, &attempts);
            if self.config.gas_bump.is_due(active.sent_at, head) {
                return Ok(ConfirmationState::NeedsBump);
            }
            return Ok(ConfirmationState::Pending { confirmations: 0 });
        };

        let confirmations = head.saturating_sub(attempts[index].sent_at);
        if confirmations >= required {
            if !tx.confirmed || !attempts[index].confirmed {
                tracing::info!(
                    tx_id = %tx_id,
                    hash = %receipt.hash,
                    block = receipt.block_number,
                    confirmations,
                    "transaction confirmed"
                );
            }
            self.set_confirmed(&mut tx, &attempts, Some(index)).await?;
            Ok(ConfirmationState::Confirmed {
                receipt,
                confirmations,
            })
        } else {
            if tx.confirmed {
                self.set_confirmed(&mut tx, &attempts, None).await?;
            }
            Ok(ConfirmationState::Pending { confirmations })
        }
    }

    /// Replaces the active attempt with one at the next price for the same
    /// nonce.
    pub async fn bump_gas(&self, tx_id: TxId, head: u64) -> Result<TxAttempt> {
        let tx = self.find_tx(tx_id).await?;
        if tx.confirmed {
            return Err(TxmError::AlreadyConfirmed(tx_id).into());
        }
        let attempts = self.store.attempts_for(tx_id).await?;
        if attempts.is_empty() {
            return Err(TxmError::NoAttempts(tx_id).into());
        }
        let previous = self.active_attempt(&tx, &attempts).gas_price;
        let gas_price = self.config.gas_bump.next_price(previous);

        let attempt = self.add_attempt(tx_id, gas_price, head).await?;
        self.telemetry.record_gas_bump();
        tracing::info!(
            tx_id = %tx_id,
            nonce = ?tx.nonce,
            previous_price = %previous,
            gas_price = %gas_price,
            hash = %attempt.hash,
            "gas price bumped"
        );
        Ok(attempt)
    }

    /// Highest nonce recorded for `address`, used to reconcile counters with
    /// persisted history after a restart.
    pub async fn get_last_nonce(&self, address: Address) -> Result<Option<u64>> {
        self.store.last_nonce(address).await
    }

    pub fn is_halted(&self, address: Address) -> bool {
        self.nonces.is_halted(address)
    }

    pub fn halted_accounts(&self) -> Vec<Address> {
        self.nonces.halted_accounts()
    }

    /// Lets a halted account issue transactions again once an operator has
    /// reconciled its history.
    pub async fn resume_account(&self, address: Address) {
        self.nonces.resume(address).await;
        tracing::info!(address = %address, "account resumed");
    }

    /// Next nonce for the leased account. `tx_id` is the transaction the
    /// nonce is for, if it already exists; any other holder is a collision.
    async fn allocate_nonce(&self, lease: &NonceLease, tx_id: Option<TxId>) -> Result<u64> {
        let address = lease.address();
        if self.nonces.is_halted(address) {
            return Err(TxmError::AccountHalted(address).into());
        }

        let nonce = match lease.next() {
            Some(next) => next,
            None => self.bootstrap_nonce(address).await?,
        };

        if let Some(existing) = self.store.tx_with_nonce(address, nonce).await? {
            if tx_id != Some(existing) {
                self.nonces.halt(address);
                tracing::error!(
                    address = %address,
                    nonce,
                    existing = %existing,
                    tx_id = ?tx_id,
                    "nonce collision; halting transaction issuance for account"
                );
                return Err(TxmError::NonceCollision {
                    address,
                    nonce,
                    existing,
                }
                .into());
            }
        }

        Ok(nonce)
    }

    async fn bootstrap_nonce(&self, address: Address) -> Result<u64> {
        let persisted = self
            .store
            .last_nonce(address)
            .await?
            .map_or(0, |nonce| nonce.saturating_add(1));
        let pending = self.chain.pending_nonce(address).await?;
        let next = persisted.max(pending);
        tracing::info!(address = %address, persisted, pending, next, "nonce counter bootstrapped");
        Ok(next)
    }

    /// Signs and persists an attempt; the attempt is written before the
    /// transaction starts pointing at it.
    async fn record_attempt(
        &self,
        tx: &mut Tx,
        nonce: u64,
        gas_price: U256,
        sent_at: u64,
    ) -> Result<TxAttempt> {
        let unsigned = UnsignedTx {
            from: tx.from,
            to: tx.to,
            nonce,
            gas_price,
            gas_limit: tx.gas_limit,
            value: tx.value,
            data: tx.data.clone(),
        };
        let signed = self.signer.sign(&unsigned).await?;
        self.persist_attempt(tx, nonce, gas_price, sent_at, signed).await
    }

    async fn persist_attempt(
        &self,
        tx: &mut Tx,
        nonce: u64,
        gas_price: U256,
        sent_at: u64,
        signed: SignedTx,
    ) -> Result<TxAttempt> {
        let attempt = TxAttempt {
            tx_id: tx.id,
            hash: signed.hash,
            gas_price,
            signed_raw: signed.raw,
            sent_at,
            confirmed: false,
            broadcast_error: None,
            created_at: Utc::now(),
        };
        self.store.save_attempt(&attempt).await?;

        tx.nonce = Some(nonce);
        tx.active_attempt = Some(attempt.hash);
        self.store.save_tx(tx).await?;
        Ok(attempt)
    }

    async fn broadcast(&self, mut attempt: TxAttempt) -> TxAttempt {
        self.telemetry.record_tx_attempt();
        match self.chain.send_raw_transaction(&attempt.signed_raw).await {
            Ok(hash) => {
                if hash != attempt.hash {
                    tracing::warn!(expected = %attempt.hash, reported = %hash, "node reported unexpected transaction hash");
                }
                tracing::info!(
                    tx_id = %attempt.tx_id,
                    hash = %attempt.hash,
                    gas_price = %attempt.gas_price,
                    sent_at = attempt.sent_at,
                    "transaction attempt broadcast"
                );
            }
            Err(err) => {
                tracing::warn!(tx_id = %attempt.tx_id, hash = %attempt.hash, error = %err, "broadcast failed; attempt kept for retry");
                attempt.broadcast_error = Some(err.to_string());
                if let Err(err) = self.store.save_attempt(&attempt).await {
                    tracing::warn!(tx_id = %attempt.tx_id, error = %err, "failed to record broadcast error");
                }
            }
        }
        attempt
    }

    fn active_attempt<'a>(&self, tx: &Tx, attempts: &'a [TxAttempt]) -> &'a TxAttempt {
        let newest = &attempts[attempts.len() - 1];
        tx.active_attempt
            .and_then(|hash| attempts.iter().find(|attempt| attempt.hash == hash))
            .unwrap_or(newest)
    }

    /// Marks the attempt at `index` as the confirmed one (or none), persisting
    /// only records whose flag changes.
    async fn set_confirmed(
        &self,
        tx: &mut Tx,
        attempts: &[TxAttempt],
        index: Option<usize>,
    ) -> Result<()> {
        for (position, attempt) in attempts.iter().enumerate() {
            let confirmed = Some(position) == index;
            if attempt.confirmed != confirmed {
                let mut updated = attempt.clone();
                updated.confirmed = confirmed;
                self.store.save_attempt(&updated).await?;
            }
        }
        let confirmed = index.is_some();
        if tx.confirmed != confirmed {
            tx.confirmed = confirmed;
            self.store.save_tx(tx).await?;
        }
        Ok(())
    }
}

fn validate_new(new: &NewTx) -> Result<()> {
    if new.gas_limit == 0 {
        return Err(TxmError::InvalidParameters("gas limit must be greater than 0".into()).into());
    }
    if new.from == Address::ZERO {
        return Err(TxmError::InvalidParameters("sender must not be the zero address".into()).into());
    }
    Ok(())
}

impl HeadSubscriber for TxManager {
    fn name(&self) -> &'static str {
        "tx manager"
    }

    fn connect<'a>(&'a self, head: Option<&'a Head>) -> SubscriberFuture<'a> {
        Box::pin(async move {
            self.nonces.reset().await;
            if let Some(head) = head {
                self.latest_head.store(head.number, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn on_new_head<'a>(&'a self, head: &'a Head) -> SubscriberFuture<'a> {
        Box::pin(async move {
            self.latest_head.store(head.number, Ordering::SeqCst);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self) -> SubscriberFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}
