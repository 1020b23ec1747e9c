//! Ethereum JSON-RPC payload shapes and their conversion into crate models.
//! Quantities travel as `0x`-prefixed hex strings.

use crate::models::{BlockHeader, LogEvent, LogFilter, TxReceipt};
use alloy_primitives::{Address, Bytes, B256, U64};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcHeader {
    hash: B256,
    parent_hash: B256,
    number: U64,
}

impl From<RpcHeader> for BlockHeader {
    fn from(header: RpcHeader) -> Self {
        BlockHeader::new(header.number.to::<u64>(), header.hash, header.parent_hash)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    address: Address,
    #[serde(default)]
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    block_number: Option<U64>,
    block_hash: Option<B256>,
    transaction_hash: Option<B256>,
    log_index: Option<U64>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    /// Pending and removed logs are dropped; only mined logs can start runs.
    pub(crate) fn into_event(self) -> Option<LogEvent> {
        if self.removed {
            return None;
        }
        Some(LogEvent {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number?.to::<u64>(),
            block_hash: self.block_hash?,
            transaction_hash: self.transaction_hash?,
            log_index: self.log_index?.to::<u64>(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    block_hash: Option<B256>,
    #[serde(default)]
    status: Option<U64>,
}

impl RpcReceipt {
    pub(crate) fn into_receipt(self) -> Option<TxReceipt> {
        Some(TxReceipt {
            hash: self.transaction_hash,
            block_number: self.block_number?.to::<u64>(),
            block_hash: self.block_hash?,
            // Pre-byzantium receipts carry no status; treat them as successful.
            success: self.status.map_or(true, |status| status == U64::from(1)),
        })
    }
}

pub(crate) fn quantity(value: u64) -> String {
    format!("{value:#x}")
}

pub(crate) fn log_filter_params(filter: &LogFilter) -> Value {
    let mut params = json!({
        "fromBlock": quantity(filter.from_block),
        "toBlock": quantity(filter.to_block),
    });
    if !filter.addresses.is_empty() {
        params["address"] = json!(filter.addresses);
    }
    params
}
