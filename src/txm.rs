//! Transaction management: nonce sequencing, attempt signing and broadcast,
//! gas bumping and reorg-aware confirmation checks.

pub mod chain;
pub mod gas;
pub mod manager;
mod nonce;

pub use chain::{ChainClient, TxSigner};
pub use gas::GasBumpPolicy;
pub use manager::{ConfirmationState, TxManager, TxManagerConfig, TxmError};
