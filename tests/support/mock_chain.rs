use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use alloy_primitives::{keccak256, Address, Bytes, B256};
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use oraclenode::{BlockFeed, BlockHeader, ChainClient, LogEvent, LogFilter, TxReceipt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SUBSCRIPTION_CAPACITY: usize = 64;

/// In-process chain: canonical headers, mined transactions, logs and pending
/// nonces, with helpers to extend and reorganize the chain.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<RwLock<MockChainInner>>,
    epoch: Arc<AtomicU64>,
}

#[derive(Clone, Copy)]
struct Inclusion {
    number: u64,
    block_hash: B256,
    success: bool,
}

struct MockChainInner {
    canonical: HashMap<u64, BlockHeader>,
    tip: u64,
    sent: Vec<B256>,
    mined: HashMap<B256, Inclusion>,
    logs: Vec<LogEvent>,
    pending_nonces: HashMap<Address, u64>,
    subscribers: Vec<mpsc::Sender<BlockHeader>>,
}

impl MockChain {
    /// Canonical chain of blocks `0..=tip`.
    pub fn new(tip: u64) -> Self {
        let mut canonical = HashMap::new();
        let mut parent = B256::ZERO;
        for number in 0..=tip {
            let header = BlockHeader::new(number, block_hash(number, 0), parent);
            parent = header.hash;
            canonical.insert(number, header);
        }

        Self {
            inner: Arc::new(RwLock::new(MockChainInner {
                canonical,
                tip,
                sent: Vec::new(),
                mined: HashMap::new(),
                logs: Vec::new(),
                pending_nonces: HashMap::new(),
                subscribers: Vec::new(),
            })),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn tip(&self) -> u64 {
        self.inner.read().expect("mock chain poisoned").tip
    }

    pub fn header(&self, number: u64) -> Option<BlockHeader> {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .canonical
            .get(&number)
            .cloned()
    }

    pub fn tip_header(&self) -> BlockHeader {
        let tip = self.tip();
        self.header(tip).expect("tip header exists")
    }

    /// Appends `count` blocks on top of the current tip.
    pub fn extend(&self, count: u64) -> Vec<BlockHeader> {
        let salt = self.epoch.load(Ordering::SeqCst);
        let mut inner = self.inner.write().expect("mock chain poisoned");
        let mut added = Vec::new();
        for _ in 0..count {
            let parent = inner.canonical[&inner.tip].hash;
            let number = inner.tip + 1;
            let header = BlockHeader::new(number, block_hash(number, salt), parent);
            inner.canonical.insert(number, header.clone());
            inner.tip = number;
            added.push(header);
        }
        added
    }

    /// Replaces every block above `fork_height` with `new_suffix_len` fresh
    /// blocks. Transactions and logs in the replaced blocks drop out of the
    /// canonical chain.
    pub fn force_reorg(&self, fork_height: u64, new_suffix_len: u64) -> Result<Vec<BlockHeader>> {
        if new_suffix_len == 0 {
            bail!("new_suffix_len must be greater than zero");
        }

        let salt = self.epoch.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let mut inner = self.inner.write().expect("mock chain poisoned");
        let mut parent = inner
            .canonical
            .get(&fork_height)
            .map(|header| header.hash)
            .ok_or_else(|| anyhow!("cannot reorg: missing fork height {fork_height}"))?;

        let stale = inner.tip;
        for number in fork_height.saturating_add(1)..=stale {
            inner.canonical.remove(&number);
        }

        let mut added = Vec::new();
        for offset in 1..=new_suffix_len {
            let number = fork_height + offset;
            let header = BlockHeader::new(number, block_hash(number, salt), parent);
            parent = header.hash;
            inner.canonical.insert(number, header.clone());
            added.push(header);
        }
        inner.tip = fork_height + new_suffix_len;
        Ok(added)
    }

    /// Pushes `header` to every live subscription.
    pub async fn emit(&self, header: BlockHeader) {
        let subscribers = {
            let mut inner = self.inner.write().expect("mock chain poisoned");
            inner.subscribers.retain(|sender| !sender.is_closed());
            inner.subscribers.clone()
        };
        for sender in subscribers {
            let _ = sender.send(header.clone()).await;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .subscribers
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    pub fn set_pending_nonce(&self, address: Address, nonce: u64) {
        self.inner
            .write()
            .expect("mock chain poisoned")
            .pending_nonces
            .insert(address, nonce);
    }

    pub fn pending_nonce_of(&self, address: Address) -> u64 {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .pending_nonces
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Accepts a raw transaction and returns its hash.
    pub fn accept_raw(&self, raw: &Bytes) -> B256 {
        let hash = keccak256(raw);
        self.inner
            .write()
            .expect("mock chain poisoned")
            .sent
            .push(hash);
        hash
    }

    /// Hashes of every broadcast transaction, in arrival order.
    pub fn sent(&self) -> Vec<B256> {
        self.inner.read().expect("mock chain poisoned").sent.clone()
    }

    /// Includes `hash` in canonical block `number`.
    pub fn mine(&self, hash: B256, number: u64, success: bool) -> Result<()> {
        let mut inner = self.inner.write().expect("mock chain poisoned");
        let block_hash = inner
            .canonical
            .get(&number)
            .map(|header| header.hash)
            .ok_or_else(|| anyhow!("cannot mine into unknown block {number}"))?;
        inner.mined.insert(
            hash,
            Inclusion {
                number,
                block_hash,
                success,
            },
        );
        Ok(())
    }

    /// Includes every broadcast transaction that is not mined yet in block
    /// `number`, returning their hashes.
    pub fn mine_sent(&self, number: u64) -> Result<Vec<B256>> {
        let pending: Vec<B256> = {
            let inner = self.inner.read().expect("mock chain poisoned");
            inner
                .sent
                .iter()
                .filter(|hash| !inner.mined.contains_key(*hash))
                .copied()
                .collect()
        };
        for hash in &pending {
            self.mine(*hash, number, true)?;
        }
        Ok(pending)
    }

    /// Receipt of `hash`, only while its block is still canonical.
    pub fn receipt(&self, hash: B256) -> Option<TxReceipt> {
        let inner = self.inner.read().expect("mock chain poisoned");
        let inclusion = inner.mined.get(&hash)?;
        let canonical = inner.canonical.get(&inclusion.number)?;
        if canonical.hash != inclusion.block_hash {
            return None;
        }
        Some(TxReceipt {
            hash,
            block_number: inclusion.number,
            block_hash: inclusion.block_hash,
            success: inclusion.success,
        })
    }

    /// Emits a log from `address` in canonical block `number`.
    pub fn add_log(&self, address: Address, topics: Vec<B256>, number: u64) -> Result<LogEvent> {
        let mut inner = self.inner.write().expect("mock chain poisoned");
        let block_hash = inner
            .canonical
            .get(&number)
            .map(|header| header.hash)
            .ok_or_else(|| anyhow!("cannot log into unknown block {number}"))?;
        let log_index = inner.logs.len() as u64;
        let log = LogEvent {
            address,
            topics,
            data: Bytes::new(),
            block_number: number,
            block_hash,
            transaction_hash: keccak256(log_index.to_be_bytes()),
            log_index,
        };
        inner.logs.push(log.clone());
        Ok(log)
    }

    /// Includes the transaction that emitted `log` again, in canonical block
    /// `number`, as happens when a reorg moves it to a replacement block.
    pub fn remine_log(&self, log: &LogEvent, number: u64) -> Result<LogEvent> {
        let mut inner = self.inner.write().expect("mock chain poisoned");
        let block_hash = inner
            .canonical
            .get(&number)
            .map(|header| header.hash)
            .ok_or_else(|| anyhow!("cannot log into unknown block {number}"))?;
        let remined = LogEvent {
            block_number: number,
            block_hash,
            ..log.clone()
        };
        inner.logs.push(remined.clone());
        Ok(remined)
    }

    pub fn query_logs(&self, filter: &LogFilter) -> Vec<LogEvent> {
        let inner = self.inner.read().expect("mock chain poisoned");
        inner
            .logs
            .iter()
            .filter(|log| (filter.from_block..=filter.to_block).contains(&log.block_number))
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .filter(|log| {
                inner
                    .canonical
                    .get(&log.block_number)
                    .is_some_and(|header| header.hash == log.block_hash)
            })
            .cloned()
            .collect()
    }
}

impl BlockFeed for MockChain {
    fn subscribe(
        &self,
        _shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<BlockHeader>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
            self.inner
                .write()
                .expect("mock chain poisoned")
                .subscribers
                .push(tx);
            Ok(rx)
        })
    }

    fn header_by_number(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>> {
        Box::pin(async move {
            self.header(number)
                .ok_or_else(|| anyhow!("block {number} not found"))
        })
    }

    fn logs<'a>(&'a self, filter: &'a LogFilter) -> BoxFuture<'a, Result<Vec<LogEvent>>> {
        Box::pin(async move { Ok(self.query_logs(filter)) })
    }
}

impl ChainClient for MockChain {
    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>> {
        Box::pin(async move { Ok(self.accept_raw(raw)) })
    }

    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>>> {
        Box::pin(async move { Ok(self.receipt(hash)) })
    }

    fn pending_nonce(&self, address: Address) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.pending_nonce_of(address)) })
    }
}

fn block_hash(number: u64, salt: u64) -> B256 {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&number.to_be_bytes());
    seed[8..].copy_from_slice(&salt.to_be_bytes());
    keccak256(seed)
}
