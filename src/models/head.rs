use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};
use std::fmt;

const SORTABLE_DIGITS: usize = 20;

/// One block as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
}

impl BlockHeader {
    pub fn new(number: u64, hash: B256, parent_hash: B256) -> Self {
        Self {
            hash,
            parent_hash,
            number,
        }
    }

    pub fn is_child_of(&self, other: &BlockHeader) -> bool {
        self.parent_hash == other.hash && self.number == other.number.saturating_add(1)
    }
}

/// The tracker's notion of the latest canonical block.
///
/// `digits` is the block number left-padded to a fixed width so string
/// ordering in a store matches numeric ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub digits: String,
    /// Set on the first head delivered after a reorg: the deepest common
    /// ancestor since the previous delivery. Blocks above it may have been
    /// replaced and are worth looking at again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reorg_ancestor: Option<u64>,
}

impl Head {
    pub fn new(number: u64, hash: B256, parent_hash: B256) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            digits: sortable_digits(number),
            reorg_ancestor: None,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader::new(self.number, self.hash, self.parent_hash)
    }

    pub fn greater_than(&self, other: &Head) -> bool {
        self.number > other.number
    }
}

impl From<&BlockHeader> for Head {
    fn from(header: &BlockHeader) -> Self {
        Head::new(header.number, header.hash, header.parent_hash)
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

pub fn sortable_digits(number: u64) -> String {
    format!("{number:0width$}", width = SORTABLE_DIGITS)
}

/// A contract log observed on chain, as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub log_index: u64,
}

/// Block range and addresses to query logs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
}
