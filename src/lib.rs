//! A minimal UTXO ledger: proof-of-work blocks, P-256 signed transactions,
//! a mempool and the state machine that keeps them consistent.

pub mod blockchain;

pub use blockchain::{
    Address, Block, BlockError, Blockchain, BlockchainError, LedgerConfig, Miner, OutPoint,
    Transaction, TransactionError, TxInput, TxOutput, UtxoSet, Wallet, WalletError,
};
