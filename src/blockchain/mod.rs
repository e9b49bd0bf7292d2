// Blockchain module
//
// This module contains the ledger implementation including:
// - Hash preimage encoding
// - Addresses and P-256 signatures
// - Transactions, inputs and outputs
// - Proof-of-work blocks and the background miner
// - The UTXO set and the mempool
// - The ledger state machine

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod hash;
pub mod mempool;
pub mod miner;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Re-export main components for easier access
pub use block::{Block, BlockError};
pub use chain::{Blockchain, BlockchainError};
pub use config::{ConfigError, LedgerConfig};
pub use crypto::Address;
pub use miner::{mine_in_background, CancelToken, Miner};
pub use transaction::{Transaction, TransactionError, TxInput, TxOutput};
pub use utxo::{OutPoint, UtxoSet};
pub use wallet::{Wallet, WalletError};
