use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::block::{Block, BlockError};
use super::config::LedgerConfig;
use super::crypto::Address;
use super::mempool::Mempool;
use super::transaction::{Transaction, TransactionError};
use super::utxo::{outputs_for, OutPoint, UtxoOverlay, UtxoSet};

/// `previous_hash` carried by the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Invalid block index: expected {expected}, got {actual}")]
    InvalidBlockIndex { expected: u64, actual: u64 },

    #[error("Invalid previous hash: expected {expected}, got {actual}")]
    InvalidPreviousHash { expected: String, actual: String },

    #[error("Block contains no transactions")]
    EmptyBlock,

    #[error("First transaction of the block is not a coinbase")]
    MissingCoinbase,

    #[error("Unexpected coinbase transaction at position {position}")]
    MultipleCoinbase { position: usize },

    #[error("Coinbase mints {actual}, at most {allowed} allowed")]
    InvalidCoinbaseAmount { allowed: i64, actual: i64 },

    #[error("Block difficulty {actual} is below the minimum {minimum}")]
    DifficultyBelowMinimum { minimum: u32, actual: u32 },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Unknown UTXO reference: {outpoint}")]
    UnknownUTXOReference { outpoint: OutPoint },

    #[error("Output {outpoint} is already being spent")]
    DuplicateSpend { outpoint: OutPoint },

    #[error("Transaction {txid} would recreate existing outputs")]
    DuplicateTransaction { txid: String },

    #[error("Mempool is full (capacity: {capacity})")]
    MempoolFull { capacity: usize },

    #[error("Blockchain has no genesis block")]
    NotInitialized,

    #[error("Genesis block already exists")]
    GenesisAlreadyExists,

    #[error("Mining worker failed: {0}")]
    MiningWorker(String),

    #[error("Invalid ledger config: {0}")]
    InvalidConfig(String),
}

/// Everything guarded by the ledger lock
#[derive(Debug, Default)]
struct LedgerState {
    blocks: Vec<Block>,
    utxos: UtxoSet,
    mempool: Mempool,
}

/// The ledger: chain of accepted blocks, the UTXO set they produce and the
/// pool of admitted transactions.
///
/// All three live behind one lock. Admission and block application take it
/// for writing, so every check runs against a consistent snapshot and a
/// rejected call leaves the state untouched. Queries take it for reading.
#[derive(Debug)]
pub struct Blockchain {
    config: LedgerConfig,
    state: RwLock<LedgerState>,
    tip: watch::Sender<String>,
}

impl Blockchain {
    /// Creates an empty ledger. Nothing can be added until
    /// [`Blockchain::create_genesis`] has run.
    pub fn new(config: LedgerConfig) -> Result<Self, BlockchainError> {
        config
            .validate()
            .map_err(|err| BlockchainError::InvalidConfig(err.to_string()))?;

        let (tip, _) = watch::channel(String::new());
        Ok(Blockchain {
            config,
            state: RwLock::new(LedgerState::default()),
            tip,
        })
    }

    /// Creates a ledger whose genesis block pays the configured reward to
    /// `address`
    pub fn with_genesis(config: LedgerConfig, address: &Address) -> Result<Self, BlockchainError> {
        let blockchain = Blockchain::new(config)?;
        let coinbase = Transaction::new_coinbase(address, blockchain.config.block_reward, 0);
        blockchain.create_genesis(coinbase)?;
        Ok(blockchain)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().expect("ledger state lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().expect("ledger state lock poisoned")
    }

    /// Creates the genesis block around `coinbase` and applies its outputs
    ///
    /// # Arguments
    ///
    /// * `coinbase` - The initial issuance, must be a coinbase transaction
    ///
    /// # Returns
    ///
    /// The mined genesis block
    pub fn create_genesis(&self, coinbase: Transaction) -> Result<Block, BlockchainError> {
        if !coinbase.is_coinbase() {
            return Err(BlockchainError::MissingCoinbase);
        }
        coinbase.verify_signature()?;
        self.check_coinbase_amount(&coinbase)?;

        if !self.read().blocks.is_empty() {
            return Err(BlockchainError::GenesisAlreadyExists);
        }

        // Mine outside the lock, then re-check: another caller may have won
        let mut genesis = Block::new(
            0,
            vec![coinbase],
            GENESIS_PREVIOUS_HASH.to_string(),
            self.config.difficulty,
        );
        genesis.mine();

        let mut state = self.write();
        if !state.blocks.is_empty() {
            return Err(BlockchainError::GenesisAlreadyExists);
        }

        for transaction in &genesis.transactions {
            for (vout, output) in transaction.outputs.iter().enumerate() {
                state
                    .utxos
                    .insert(OutPoint::new(transaction.id.clone(), vout as i64), output.clone());
            }
        }
        state.blocks.push(genesis.clone());
        drop(state);

        info!("Created genesis block {}", genesis.hash);
        self.tip.send_replace(genesis.hash.clone());

        Ok(genesis)
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> Result<Block, BlockchainError> {
        self.read()
            .blocks
            .last()
            .cloned()
            .ok_or(BlockchainError::NotInitialized)
    }

    /// Number of accepted blocks, genesis included
    pub fn len(&self) -> usize {
        self.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the whole chain
    pub fn blocks(&self) -> Vec<Block> {
        self.read().blocks.clone()
    }

    /// Snapshot of the mempool in admission order
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.read().mempool.iter().cloned().collect()
    }

    /// Snapshot of the UTXO set
    pub fn utxo_set(&self) -> UtxoSet {
        self.read().utxos.clone()
    }

    /// Unspent outputs locked to `address`
    pub fn find_utxo(&self, address: &Address) -> UtxoSet {
        outputs_for(&self.read().utxos, address)
    }

    /// Sum of the unspent outputs locked to `address`
    pub fn balance_of(&self, address: &Address) -> i64 {
        self.find_utxo(address).values().map(|output| output.amount).sum()
    }

    /// Receives the hash of the newest block whenever the tip moves
    pub fn subscribe_tip(&self) -> watch::Receiver<String> {
        self.tip.subscribe()
    }

    /// Admits a transaction to the mempool
    ///
    /// # Arguments
    ///
    /// * `transaction` - A signed transaction spending outputs in the UTXO set
    ///
    /// # Returns
    ///
    /// `Ok(())` once the transaction is pending. The UTXO set is not touched
    /// until a block containing it is applied.
    pub fn add_transaction(&self, transaction: Transaction) -> Result<(), BlockchainError> {
        let result = self.admit(transaction);
        if let Err(err) = &result {
            warn!("Rejected transaction: {}", err);
        }
        result
    }

    fn admit(&self, transaction: Transaction) -> Result<(), BlockchainError> {
        transaction.verify_signature()?;

        let mut state = self.write();
        if state.blocks.is_empty() {
            return Err(BlockchainError::NotInitialized);
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(transaction.inputs.len());
        for input in &transaction.inputs {
            let outpoint = input.outpoint();
            let output = state
                .utxos
                .get(&outpoint)
                .ok_or_else(|| BlockchainError::UnknownUTXOReference {
                    outpoint: outpoint.clone(),
                })?;
            resolved.push(output.amount);
            if !seen.insert(outpoint.clone()) {
                return Err(BlockchainError::DuplicateSpend { outpoint });
            }
        }
        check_funds(&transaction, checked_total(resolved))?;

        if let Some(outpoint) = state.mempool.conflicting_input(&transaction) {
            return Err(BlockchainError::DuplicateSpend { outpoint });
        }

        let capacity = self.config.max_mempool_transactions;
        if state.mempool.len() >= capacity {
            return Err(BlockchainError::MempoolFull { capacity });
        }

        debug!("Admitted transaction {} to the mempool", transaction.id);
        state.mempool.push(transaction);
        Ok(())
    }

    /// Assembles an unmined block on top of the current tip: a fresh
    /// coinbase paying `reward_address`, then the mempool in FIFO order
    pub fn candidate_block(&self, reward_address: &Address) -> Result<Block, BlockchainError> {
        let state = self.read();
        let last = state.blocks.last().ok_or(BlockchainError::NotInitialized)?;
        let index = last.index + 1;

        let coinbase = Transaction::new_coinbase(reward_address, self.config.block_reward, index);
        let transactions = std::iter::once(coinbase)
            .chain(state.mempool.iter().cloned())
            .collect();

        Ok(Block::new(
            index,
            transactions,
            last.hash.clone(),
            self.config.difficulty,
        ))
    }

    /// Validates a block and, only if every check passes, applies it:
    /// spent outputs leave the UTXO set, new outputs enter it, included
    /// transactions leave the mempool and the block joins the chain.
    pub fn add_block(&self, block: Block) -> Result<(), BlockchainError> {
        let mut state = self.write();

        let (deletions, additions) = match self.validate_block(&state, &block) {
            Ok(changes) => changes,
            Err(err) => {
                warn!("Rejected block {}: {}", block.index, err);
                return Err(err);
            }
        };

        let state = &mut *state;
        for outpoint in &deletions {
            assert!(
                state.utxos.remove(outpoint).is_some(),
                "validated spend of {} missing from the UTXO set",
                outpoint
            );
        }
        for (outpoint, output) in additions {
            let key = outpoint.to_string();
            assert!(
                state.utxos.insert(outpoint, output).is_none(),
                "UTXO key collision on {}",
                key
            );
        }

        for transaction in &block.transactions {
            state.mempool.remove(&transaction.id);
        }
        let evicted = state.mempool.evict_spent(&state.utxos);
        if !evicted.is_empty() {
            debug!("Evicted {} conflicting pending transactions", evicted.len());
        }

        info!(
            "Accepted block {} ({} transactions): {}",
            block.index,
            block.transactions.len(),
            block.hash
        );
        let hash = block.hash.clone();
        state.blocks.push(block);
        self.tip.send_replace(hash);

        Ok(())
    }

    /// Runs every block check against `state` without mutating it and
    /// returns the staged UTXO changes
    fn validate_block(
        &self,
        state: &LedgerState,
        block: &Block,
    ) -> Result<(HashSet<OutPoint>, UtxoSet), BlockchainError> {
        let last = state.blocks.last().ok_or(BlockchainError::NotInitialized)?;

        if block.index != last.index + 1 {
            return Err(BlockchainError::InvalidBlockIndex {
                expected: last.index + 1,
                actual: block.index,
            });
        }

        if block.previous_hash != last.hash {
            return Err(BlockchainError::InvalidPreviousHash {
                expected: last.hash.clone(),
                actual: block.previous_hash.clone(),
            });
        }

        let coinbase = block.transactions.first().ok_or(BlockchainError::EmptyBlock)?;
        if !coinbase.is_coinbase() {
            return Err(BlockchainError::MissingCoinbase);
        }

        if let Some(position) = block
            .transactions
            .iter()
            .skip(1)
            .position(Transaction::is_coinbase)
        {
            return Err(BlockchainError::MultipleCoinbase {
                position: position + 1,
            });
        }

        block.verify()?;

        if block.difficulty < self.config.min_difficulty {
            return Err(BlockchainError::DifficultyBelowMinimum {
                minimum: self.config.min_difficulty,
                actual: block.difficulty,
            });
        }

        let mut overlay = UtxoOverlay::new(&state.utxos);
        let mut spent_in_block = HashSet::new();

        for transaction in &block.transactions {
            transaction.verify_signature()?;

            if transaction.is_coinbase() {
                self.check_coinbase_amount(transaction)?;
            } else {
                let mut resolved = Vec::with_capacity(transaction.inputs.len());
                for input in &transaction.inputs {
                    let outpoint = input.outpoint();
                    if !spent_in_block.insert(outpoint.clone()) {
                        return Err(BlockchainError::DuplicateSpend { outpoint });
                    }
                    let output = overlay
                        .spend(&outpoint)
                        .ok_or(BlockchainError::UnknownUTXOReference { outpoint })?;
                    resolved.push(output.amount);
                }
                check_funds(transaction, checked_total(resolved))?;
            }

            for (vout, output) in transaction.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(transaction.id.clone(), vout as i64);
                if !overlay.add(outpoint, output.clone()) {
                    return Err(BlockchainError::DuplicateTransaction {
                        txid: transaction.id.clone(),
                    });
                }
            }
        }

        Ok(overlay.into_changes())
    }

    /// A coinbase may mint at most the block reward, and none of its outputs
    /// may be negative
    fn check_coinbase_amount(&self, coinbase: &Transaction) -> Result<(), BlockchainError> {
        let minted = checked_total(coinbase.outputs.iter().map(|o| o.amount));
        let allowed = self.config.block_reward;
        let negative = coinbase.outputs.iter().any(|o| o.amount < 0);
        if negative || minted.map_or(true, |minted| minted > allowed) {
            return Err(BlockchainError::InvalidCoinbaseAmount {
                allowed,
                actual: minted.unwrap_or(i64::MAX),
            });
        }
        Ok(())
    }

    /// Re-verifies the stored chain: proof of work and linkage of every block
    ///
    /// # Returns
    ///
    /// true if the blockchain is valid, false otherwise
    pub fn is_valid(&self) -> bool {
        let state = self.read();

        for (position, block) in state.blocks.iter().enumerate() {
            if block.verify().is_err() || block.index != position as u64 {
                return false;
            }

            let expected_previous = match position {
                0 => GENESIS_PREVIOUS_HASH,
                _ => state.blocks[position - 1].hash.as_str(),
            };
            if block.previous_hash != expected_previous {
                return false;
            }
        }

        true
    }
}

/// Sums amounts, `None` on overflow
fn checked_total(amounts: impl IntoIterator<Item = i64>) -> Option<i64> {
    amounts
        .into_iter()
        .try_fold(0i64, |total, amount| total.checked_add(amount))
}

/// Inputs must cover the outputs, and no output may be negative: a negative
/// change output is what an under-funded wallet produces.
fn check_funds(transaction: &Transaction, available: Option<i64>) -> Result<(), BlockchainError> {
    let required = checked_total(transaction.outputs.iter().map(|o| o.amount.max(0)));
    let negative = transaction.outputs.iter().any(|o| o.amount < 0);

    match (required, available) {
        (Some(required), Some(available)) if !negative && available >= required => Ok(()),
        (required, available) => Err(BlockchainError::InsufficientFunds {
            required: required.unwrap_or(i64::MAX),
            available: available.unwrap_or(i64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{TxInput, TxOutput};
    use crate::blockchain::wallet::Wallet;

    use std::sync::Arc;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            ..LedgerConfig::default()
        }
    }

    fn setup() -> (Blockchain, Wallet, Address) {
        let wallet = Wallet::generate();
        let address = wallet.address().unwrap();
        let blockchain = Blockchain::with_genesis(test_config(), &address).unwrap();
        (blockchain, wallet, address)
    }

    fn mine_candidate(blockchain: &Blockchain, reward: &Address) -> Block {
        let mut block = blockchain.candidate_block(reward).unwrap();
        block.mine();
        block
    }

    fn block_with(blockchain: &Blockchain, transactions: Vec<Transaction>) -> Block {
        let last = blockchain.last_block().unwrap();
        let mut block = Block::new(last.index + 1, transactions, last.hash, 1);
        block.mine();
        block
    }

    #[test]
    fn test_new_blockchain_is_uninitialized() {
        let blockchain = Blockchain::new(test_config()).unwrap();

        assert!(blockchain.is_empty());
        assert_eq!(blockchain.last_block(), Err(BlockchainError::NotInitialized));
        assert_eq!(
            blockchain.candidate_block(&Address::from("miner")).unwrap_err(),
            BlockchainError::NotInitialized
        );
    }

    #[test]
    fn test_genesis_block() {
        let (blockchain, _, address) = setup();
        let chain = blockchain.blocks();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].index, 0);
        assert_eq!(chain[0].previous_hash, "0");
        assert_eq!(chain[0].transactions.len(), 1);
        assert!(chain[0].transactions[0].is_coinbase());
        chain[0].verify().unwrap();

        // Scenario A: the genesis coinbase is the wallet's single output
        let utxos = blockchain.find_utxo(&address);
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos.values().next().unwrap().amount, 50);
    }

    #[test]
    fn test_genesis_twice_is_rejected() {
        let (blockchain, _, address) = setup();
        let coinbase = Transaction::new_coinbase(&address, 50, 0);

        assert_eq!(
            blockchain.create_genesis(coinbase).unwrap_err(),
            BlockchainError::GenesisAlreadyExists
        );
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_genesis_requires_coinbase() {
        let blockchain = Blockchain::new(test_config()).unwrap();
        let tx = Transaction::new(
            vec![TxInput::new(&OutPoint::new("x", 0), Address::from("a"))],
            vec![TxOutput::new(1, &Address::from("a"))],
            "",
        );

        assert_eq!(blockchain.create_genesis(tx), Err(BlockchainError::MissingCoinbase));
        assert!(blockchain.is_empty());
    }

    #[test]
    fn test_genesis_coinbase_amount_is_checked() {
        let blockchain = Blockchain::new(test_config()).unwrap();
        let address = Address::from("w");

        assert_eq!(
            blockchain.create_genesis(Transaction::new_coinbase(&address, -7, 0)),
            Err(BlockchainError::InvalidCoinbaseAmount {
                allowed: 50,
                actual: -7
            })
        );
        assert_eq!(
            blockchain.create_genesis(Transaction::new_coinbase(&address, 51, 0)),
            Err(BlockchainError::InvalidCoinbaseAmount {
                allowed: 50,
                actual: 51
            })
        );
        assert!(blockchain.is_empty());
        assert_eq!(blockchain.balance_of(&address), 0);

        blockchain
            .create_genesis(Transaction::new_coinbase(&address, 50, 0))
            .unwrap();
        assert_eq!(blockchain.balance_of(&address), 50);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let address = Address::from("w");
        let zero = LedgerConfig {
            difficulty: 0,
            min_difficulty: 0,
            ..LedgerConfig::default()
        };
        assert!(matches!(
            Blockchain::with_genesis(zero, &address),
            Err(BlockchainError::InvalidConfig(_))
        ));

        let unreachable = LedgerConfig {
            difficulty: 65,
            ..LedgerConfig::default()
        };
        assert!(matches!(
            Blockchain::new(unreachable),
            Err(BlockchainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_transfers_across_blocks() {
        let (blockchain, tom, tom_address) = setup();
        let alice = Wallet::generate();
        let alice_address = alice.address().unwrap();
        let anna_address = Wallet::generate().address().unwrap();

        let tx = tom
            .new_transaction(&blockchain.find_utxo(&tom_address), &alice_address, 20, "test data")
            .unwrap();
        blockchain.add_transaction(tx.clone()).unwrap();
        assert_eq!(blockchain.pending_transactions(), vec![tx]);

        // Admission does not touch the UTXO set
        assert_eq!(blockchain.balance_of(&tom_address), 50);

        let mut block = blockchain.candidate_block(&tom_address).unwrap();
        block.difficulty = 2;
        block.mine();
        assert!(block.hash.starts_with("00"));
        blockchain.add_block(block).unwrap();

        assert!(blockchain.pending_transactions().is_empty());
        assert_eq!(blockchain.balance_of(&alice_address), 20);
        // 30 change + 50 new coinbase
        assert_eq!(blockchain.balance_of(&tom_address), 80);

        let tx = alice
            .new_transaction(&blockchain.find_utxo(&alice_address), &anna_address, 3, "test data")
            .unwrap();
        blockchain.add_transaction(tx).unwrap();
        blockchain.add_block(mine_candidate(&blockchain, &tom_address)).unwrap();

        assert_eq!(tom.balance(&blockchain.utxo_set()), 130);
        assert_eq!(alice.balance(&blockchain.utxo_set()), 17);
        assert_eq!(blockchain.balance_of(&anna_address), 3);
        assert_eq!(blockchain.len(), 3);
        assert!(blockchain.is_valid());
    }

    #[test]
    fn test_spent_reference_is_unknown() {
        let (blockchain, tom, tom_address) = setup();
        let stale = blockchain.find_utxo(&tom_address);
        let alice_address = Wallet::generate().address().unwrap();

        let tx = tom.new_transaction(&stale, &alice_address, 20, "").unwrap();
        blockchain.add_transaction(tx).unwrap();
        blockchain.add_block(mine_candidate(&blockchain, &tom_address)).unwrap();

        // Re-spend the genesis output, already consumed by block 1
        let replay = tom.new_transaction(&stale, &alice_address, 10, "again").unwrap();
        let spent = replay.inputs[0].outpoint();
        assert_eq!(
            blockchain.add_transaction(replay),
            Err(BlockchainError::UnknownUTXOReference { outpoint: spent })
        );
    }

    #[test]
    fn test_nonexistent_reference_is_unknown() {
        let (blockchain, tom, tom_address) = setup();
        let mut fake = UtxoSet::new();
        fake.insert(OutPoint::new("f".repeat(64), 7), TxOutput::new(100, &tom_address));

        let tx = tom.new_transaction(&fake, &Address::from("bob"), 10, "").unwrap();
        assert_eq!(
            blockchain.add_transaction(tx),
            Err(BlockchainError::UnknownUTXOReference {
                outpoint: OutPoint::new("f".repeat(64), 7)
            })
        );
        assert!(blockchain.pending_transactions().is_empty());
    }

    #[test]
    fn test_insufficient_funds() {
        let (blockchain, tom, tom_address) = setup();

        let tx = tom
            .new_transaction(&blockchain.find_utxo(&tom_address), &Address::from("bob"), 80, "")
            .unwrap();
        assert_eq!(
            blockchain.add_transaction(tx),
            Err(BlockchainError::InsufficientFunds {
                required: 80,
                available: 50
            })
        );
    }

    #[test]
    fn test_mempool_double_spend() {
        let (blockchain, tom, tom_address) = setup();
        let utxos = blockchain.find_utxo(&tom_address);

        let first = tom.new_transaction(&utxos, &Address::from("bob"), 10, "first").unwrap();
        let second = tom.new_transaction(&utxos, &Address::from("carol"), 10, "second").unwrap();
        let outpoint = second.inputs[0].outpoint();

        blockchain.add_transaction(first).unwrap();
        assert_eq!(
            blockchain.add_transaction(second),
            Err(BlockchainError::DuplicateSpend { outpoint })
        );
        assert_eq!(blockchain.pending_transactions().len(), 1);
    }

    #[test]
    fn test_tampered_transaction_is_rejected() {
        let (blockchain, tom, tom_address) = setup();
        let mut tx = tom
            .new_transaction(&blockchain.find_utxo(&tom_address), &Address::from("bob"), 10, "")
            .unwrap();
        tx.outputs[0].amount = 40;

        assert!(matches!(
            blockchain.add_transaction(tx),
            Err(BlockchainError::Transaction(TransactionError::InvalidTransactionHash { .. }))
        ));
    }

    #[test]
    fn test_mempool_capacity() {
        let wallet = Wallet::generate();
        let address = wallet.address().unwrap();
        let config = LedgerConfig {
            max_mempool_transactions: 1,
            ..test_config()
        };
        let blockchain = Blockchain::with_genesis(config, &address).unwrap();
        blockchain.add_block(mine_candidate(&blockchain, &address)).unwrap();

        let mut owned = blockchain.find_utxo(&address).into_iter();
        let first: UtxoSet = owned.next().into_iter().collect();
        let second: UtxoSet = owned.collect();
        assert_eq!(second.len(), 1);

        let tx = wallet.new_transaction(&first, &Address::from("bob"), 5, "").unwrap();
        blockchain.add_transaction(tx).unwrap();
        let tx = wallet.new_transaction(&second, &Address::from("bob"), 5, "").unwrap();
        assert_eq!(
            blockchain.add_transaction(tx),
            Err(BlockchainError::MempoolFull { capacity: 1 })
        );
    }

    #[test]
    fn test_invalid_index_and_previous_hash() {
        let (blockchain, _, address) = setup();

        let mut block = blockchain.candidate_block(&address).unwrap();
        block.index = 5;
        block.mine();
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::InvalidBlockIndex {
                expected: 1,
                actual: 5
            })
        );

        let mut block = blockchain.candidate_block(&address).unwrap();
        block.previous_hash = "bogus".to_string();
        block.mine();
        assert!(matches!(
            blockchain.add_block(block),
            Err(BlockchainError::InvalidPreviousHash { .. })
        ));
    }

    #[test]
    fn test_empty_block_and_missing_coinbase() {
        let (blockchain, tom, tom_address) = setup();

        let block = block_with(&blockchain, Vec::new());
        assert_eq!(blockchain.add_block(block), Err(BlockchainError::EmptyBlock));

        let tx = tom
            .new_transaction(&blockchain.find_utxo(&tom_address), &Address::from("bob"), 10, "")
            .unwrap();
        let block = block_with(&blockchain, vec![tx]);
        assert_eq!(blockchain.add_block(block), Err(BlockchainError::MissingCoinbase));
    }

    #[test]
    fn test_second_coinbase_is_rejected() {
        let (blockchain, _, address) = setup();
        let transactions = vec![
            Transaction::new_coinbase(&address, 50, 1),
            Transaction::new_coinbase(&Address::from("someone"), 50, 1),
        ];

        let block = block_with(&blockchain, transactions);
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::MultipleCoinbase { position: 1 })
        );
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_unmined_block_is_rejected() {
        let (blockchain, _, address) = setup();
        let mut block = blockchain.candidate_block(&address).unwrap();
        while block.hash.starts_with('0') {
            block.nonce += 1;
            block.hash = block.calculate_hash();
        }

        assert!(matches!(
            blockchain.add_block(block),
            Err(BlockchainError::Block(BlockError::InvalidHashPrefix { .. }))
        ));
    }

    #[test]
    fn test_tampered_nonce_after_acceptance() {
        let (blockchain, _, address) = setup();
        blockchain.add_block(mine_candidate(&blockchain, &address)).unwrap();

        let mut block = blockchain.last_block().unwrap();
        block.verify().unwrap();
        block.nonce += 1;

        assert!(matches!(block.verify(), Err(BlockError::InvalidHash { .. })));
    }

    #[test]
    fn test_difficulty_below_minimum() {
        let wallet = Wallet::generate();
        let address = wallet.address().unwrap();
        let config = LedgerConfig {
            difficulty: 2,
            min_difficulty: 2,
            ..LedgerConfig::default()
        };
        let blockchain = Blockchain::with_genesis(config, &address).unwrap();

        let mut block = blockchain.candidate_block(&address).unwrap();
        block.difficulty = 1;
        block.mine();
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::DifficultyBelowMinimum {
                minimum: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_excessive_coinbase_is_rejected() {
        let (blockchain, _, address) = setup();
        let block = block_with(&blockchain, vec![Transaction::new_coinbase(&address, 51, 1)]);

        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::InvalidCoinbaseAmount {
                allowed: 50,
                actual: 51
            })
        );
    }

    #[test]
    fn test_rejected_block_leaves_state_unchanged() {
        let (blockchain, tom, tom_address) = setup();
        let utxos = blockchain.find_utxo(&tom_address);
        let first = tom.new_transaction(&utxos, &Address::from("bob"), 10, "a").unwrap();
        let second = tom.new_transaction(&utxos, &Address::from("carol"), 10, "b").unwrap();
        blockchain.add_transaction(first.clone()).unwrap();

        let before_utxos = blockchain.utxo_set();
        let before_pending = blockchain.pending_transactions();

        let block = block_with(
            &blockchain,
            vec![Transaction::new_coinbase(&tom_address, 50, 1), first, second.clone()],
        );
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::DuplicateSpend {
                outpoint: second.inputs[0].outpoint()
            })
        );

        assert_eq!(blockchain.utxo_set(), before_utxos);
        assert_eq!(blockchain.pending_transactions(), before_pending);
        assert_eq!(blockchain.len(), 1);
    }

    #[test]
    fn test_block_spending_unknown_output_is_rejected() {
        let (blockchain, tom, tom_address) = setup();
        let mut fake = UtxoSet::new();
        fake.insert(OutPoint::new("ab", 0), TxOutput::new(10, &tom_address));
        let tx = tom.new_transaction(&fake, &Address::from("bob"), 10, "").unwrap();

        let block = block_with(
            &blockchain,
            vec![Transaction::new_coinbase(&tom_address, 50, 1), tx],
        );
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::UnknownUTXOReference {
                outpoint: OutPoint::new("ab", 0)
            })
        );
    }

    #[test]
    fn test_replayed_coinbase_is_rejected() {
        let (blockchain, _, _) = setup();
        let genesis_coinbase = blockchain.blocks()[0].transactions[0].clone();
        let txid = genesis_coinbase.id.clone();

        let block = block_with(&blockchain, vec![genesis_coinbase]);
        assert_eq!(
            blockchain.add_block(block),
            Err(BlockchainError::DuplicateTransaction { txid })
        );
    }

    #[test]
    fn test_block_from_other_producer_evicts_conflicts() {
        let (blockchain, tom, tom_address) = setup();
        let utxos = blockchain.find_utxo(&tom_address);
        let pending = tom.new_transaction(&utxos, &Address::from("bob"), 10, "a").unwrap();
        let competing = tom.new_transaction(&utxos, &Address::from("carol"), 10, "b").unwrap();
        blockchain.add_transaction(pending).unwrap();

        let block = block_with(
            &blockchain,
            vec![Transaction::new_coinbase(&tom_address, 50, 1), competing],
        );
        blockchain.add_block(block).unwrap();

        assert!(blockchain.pending_transactions().is_empty());
        assert_eq!(blockchain.balance_of(&Address::from("carol")), 10);
        assert_eq!(blockchain.balance_of(&Address::from("bob")), 0);
    }

    #[test]
    fn test_accepted_blocks_hold_invariants() {
        let (blockchain, tom, tom_address) = setup();
        for round in 0..3 {
            let tx = tom
                .new_transaction(
                    &blockchain.find_utxo(&tom_address),
                    &Address::from("bob"),
                    5,
                    &format!("round {}", round),
                )
                .unwrap();
            blockchain.add_transaction(tx).unwrap();
            blockchain.add_block(mine_candidate(&blockchain, &tom_address)).unwrap();
        }

        let mut consumed = HashSet::new();
        for (position, block) in blockchain.blocks().iter().enumerate() {
            assert_eq!(block.calculate_hash(), block.hash);
            assert!(block.hash.starts_with(&"0".repeat(block.difficulty as usize)));
            assert!(block.transactions[0].is_coinbase());
            assert_eq!(
                block.transactions.iter().filter(|tx| tx.is_coinbase()).count(),
                1
            );
            for tx in block.transactions.iter().skip(1) {
                tx.verify_signature().unwrap();
                for input in &tx.inputs {
                    assert!(consumed.insert(input.outpoint()), "block {} double spends", position);
                }
            }
        }

        assert_eq!(blockchain.balance_of(&Address::from("bob")), 15);
        // 50 genesis + 3 * 50 rewards - 15 paid out
        assert_eq!(blockchain.balance_of(&tom_address), 185);
        assert!(blockchain.is_valid());
    }

    #[test]
    fn test_concurrent_double_spend_admits_one() {
        let (blockchain, tom, tom_address) = setup();
        let blockchain = Arc::new(blockchain);
        let utxos = blockchain.find_utxo(&tom_address);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tx = tom
                    .new_transaction(&utxos, &Address::from("bob"), 10 + i, "race")
                    .unwrap();
                let blockchain = Arc::clone(&blockchain);
                std::thread::spawn(move || blockchain.add_transaction(tx))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| matches!(err, BlockchainError::DuplicateSpend { .. })));
    }
}
