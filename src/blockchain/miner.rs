//! Proof-of-work off the ledger's critical path.
//!
//! The nonce search runs on tokio's blocking pool so admission and queries
//! stay responsive while a candidate is being sealed. A [`CancelToken`] is
//! checked before every hash attempt, and [`Miner`] trips it as soon as some
//! other block moves the tip.

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::block::{Block, BlockError};
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;

/// Shared flag that stops an in-progress nonce search
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Mines `block` on the blocking thread pool
pub fn mine_in_background(
    mut block: Block,
    cancel: CancelToken,
) -> JoinHandle<Result<Block, BlockError>> {
    tokio::task::spawn_blocking(move || {
        block.mine_with_cancel(&cancel)?;
        Ok(block)
    })
}

/// Block producer: assembles candidates from the mempool, seals them and
/// submits them to the ledger.
#[derive(Debug, Clone)]
pub struct Miner {
    chain: Arc<Blockchain>,
    reward_address: Address,
    difficulty: Option<u32>,
}

impl Miner {
    pub fn new(chain: Arc<Blockchain>, reward_address: Address) -> Self {
        Miner {
            chain,
            reward_address,
            difficulty: None,
        }
    }

    /// Seals candidates at `difficulty` instead of the ledger's configured
    /// one. Blocks below the ledger's minimum are still rejected.
    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    /// Builds a candidate on the tip `tip` currently reports and marks that
    /// tip seen, so only blocks accepted afterwards cancel the candidate
    fn candidate_on_tip(
        &self,
        tip: &mut watch::Receiver<String>,
    ) -> Result<Block, BlockchainError> {
        loop {
            let mut candidate = self.chain.candidate_block(&self.reward_address)?;
            if *tip.borrow_and_update() == candidate.previous_hash {
                if let Some(difficulty) = self.difficulty {
                    candidate.difficulty = difficulty;
                }
                return Ok(candidate);
            }
            debug!("Tip moved while assembling block {}, rebuilding", candidate.index);
        }
    }

    /// Mines one block on top of the current tip and submits it
    ///
    /// # Returns
    ///
    /// The accepted block, or `MiningCancelled` if the tip moved before the
    /// search finished. Retrying is up to the caller.
    pub async fn mine_next(&self) -> Result<Block, BlockchainError> {
        let mut tip = self.chain.subscribe_tip();
        let candidate = self.candidate_on_tip(&mut tip)?;
        let index = candidate.index;
        let cancel = CancelToken::new();
        let mut handle = mine_in_background(candidate, cancel.clone());

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = tip.changed() => {
                warn!("Tip moved while mining block {}, abandoning candidate", index);
                cancel.cancel();
                handle.await
            }
        };

        let block = joined.map_err(|err| BlockchainError::MiningWorker(err.to_string()))??;
        self.chain.add_block(block.clone())?;
        info!("Mined block {} with nonce {}", block.index, block.nonce);

        Ok(block)
    }
}
