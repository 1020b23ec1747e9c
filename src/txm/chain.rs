use crate::models::{SignedTx, TxReceipt, UnsignedTx};
use alloy_primitives::{Address, Bytes, B256};
use anyhow::Result;
use futures::future::BoxFuture;

/// The node operations the transaction manager needs.
pub trait ChainClient: Send + Sync {
    /// Broadcasts a signed transaction and returns the hash the node reports.
    fn send_raw_transaction<'a>(&'a self, raw: &'a Bytes) -> BoxFuture<'a, Result<B256>>;

    /// Receipt of a mined transaction on the node's canonical chain, `None`
    /// while it is unknown, pending or orphaned.
    fn transaction_receipt(&self, hash: B256) -> BoxFuture<'_, Result<Option<TxReceipt>>>;

    /// Transaction count of `address` including the node's pending pool.
    fn pending_nonce(&self, address: Address) -> BoxFuture<'_, Result<u64>>;
}

/// Key custody lives outside the node; the manager only asks for signatures.
pub trait TxSigner: Send + Sync {
    fn sign<'a>(&'a self, tx: &'a UnsignedTx) -> BoxFuture<'a, Result<SignedTx>>;
}
