use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters of a transaction intent before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTx {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
}

/// One logical on-chain write. The nonce is fixed by the first attempt and
/// shared by every later attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub id: TxId,
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub nonce: Option<u64>,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub confirmed: bool,
    /// Hash of the currently active attempt.
    #[serde(default)]
    pub active_attempt: Option<B256>,
    pub created_at: DateTime<Utc>,
}

impl Tx {
    pub fn from_new(id: TxId, new: NewTx) -> Self {
        Self {
            id,
            from: new.from,
            to: new.to,
            nonce: None,
            data: new.data,
            value: new.value,
            gas_limit: new.gas_limit,
            confirmed: false,
            active_attempt: None,
            created_at: Utc::now(),
        }
    }
}

/// One signed broadcast of a transaction at a specific gas price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxAttempt {
    pub tx_id: TxId,
    pub hash: B256,
    pub gas_price: U256,
    pub signed_raw: Bytes,
    pub sent_at: u64,
    pub confirmed: bool,
    #[serde(default)]
    pub broadcast_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Transaction fields handed to a signer once the nonce and price are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub value: U256,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: B256,
    pub raw: Bytes,
}

/// Receipt data the manager needs from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub success: bool,
}
