use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::{now_millis, Preimage};
use super::miner::CancelToken;
use super::transaction::Transaction;

/// Errors that can occur while sealing or checking a block's proof of work
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid difficulty {difficulty}: must be at least 1")]
    InvalidDifficulty { difficulty: u32 },

    #[error("Invalid hash: stored {expected}, computed {actual}")]
    InvalidHash { expected: String, actual: String },

    #[error("Hash {hash} does not start with {difficulty} zeros")]
    InvalidHashPrefix { hash: String, difficulty: u32 },

    #[error("Mining cancelled at nonce {nonce}")]
    MiningCancelled { nonce: u64 },
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Transactions included in this block, coinbase first
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, `"0"` for genesis
    pub previous_hash: String,

    /// Hash of the current block (calculated)
    pub hash: String,

    /// Proof of work
    pub nonce: u64,

    /// Number of leading `'0'` hex digits the hash must carry
    pub difficulty: u32,
}

/// The string a hash must start with at `difficulty`
pub fn prefix(difficulty: u32) -> String {
    "0".repeat(difficulty as usize)
}

impl Block {
    /// Creates an unsealed block
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `transactions` - The list of transactions to include in the block
    /// * `previous_hash` - The hash of the previous block
    /// * `difficulty` - Required leading zeros
    ///
    /// # Returns
    ///
    /// A Block with nonce 0 and its hash computed, not yet mined
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        difficulty: u32,
    ) -> Self {
        let block = Block {
            index,
            timestamp: now_millis(),
            transactions,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            difficulty,
        };

        let hash = block.calculate_hash();

        Block { hash, ..block }
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hash over index, timestamp, transaction ids, previous
    /// hash, nonce and difficulty, as lowercase hex
    pub fn calculate_hash(&self) -> String {
        Preimage::new()
            .u64(self.index)
            .i64(self.timestamp)
            .list(&self.transactions, |p, tx| p.str(&tx.id))
            .str(&self.previous_hash)
            .u64(self.nonce)
            .u64(u64::from(self.difficulty))
            .digest()
    }

    fn meets_difficulty(&self) -> bool {
        self.hash.starts_with(&prefix(self.difficulty))
    }

    /// Searches nonces upward from the current one until the hash carries
    /// `difficulty` leading zeros. No upper bound on running time.
    pub fn mine(&mut self) {
        let never = CancelToken::new();
        // An untriggered token never stops the search
        let _ = self.mine_with_cancel(&never);
    }

    /// Like [`Block::mine`], but checks `cancel` before every attempt.
    pub fn mine_with_cancel(&mut self, cancel: &CancelToken) -> Result<(), BlockError> {
        let target = prefix(self.difficulty);

        loop {
            if cancel.is_cancelled() {
                debug!("Mining of block {} cancelled at nonce {}", self.index, self.nonce);
                return Err(BlockError::MiningCancelled { nonce: self.nonce });
            }

            self.hash = self.calculate_hash();
            if self.hash.starts_with(&target) {
                debug!(
                    "Mined block {} at nonce {}: {}",
                    self.index, self.nonce, self.hash
                );
                return Ok(());
            }

            self.nonce += 1;
        }
    }

    /// Checks the block's proof of work
    pub fn verify(&self) -> Result<(), BlockError> {
        if self.difficulty < 1 {
            return Err(BlockError::InvalidDifficulty {
                difficulty: self.difficulty,
            });
        }

        let actual = self.calculate_hash();
        if actual != self.hash {
            return Err(BlockError::InvalidHash {
                expected: self.hash.clone(),
                actual,
            });
        }

        if !self.meets_difficulty() {
            return Err(BlockError::InvalidHashPrefix {
                hash: self.hash.clone(),
                difficulty: self.difficulty,
            });
        }

        Ok(())
    }
}
