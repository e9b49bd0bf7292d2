//! Pending transactions waiting to be included in a block.
//!
//! Transactions are kept in admission order. The mempool also tracks every
//! outpoint claimed by a pending transaction, so a second spend of the same
//! output is caught before either reaches a block.

use std::collections::{HashSet, VecDeque};

use super::transaction::Transaction;
use super::utxo::{OutPoint, UtxoSet};

/// FIFO pool of admitted transactions.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: VecDeque<Transaction>,
    claimed: HashSet<OutPoint>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Pending transactions in admission order
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.transactions.iter().any(|tx| tx.id == txid)
    }

    /// The first input of `tx` already claimed by a pending transaction
    pub fn conflicting_input(&self, tx: &Transaction) -> Option<OutPoint> {
        tx.inputs
            .iter()
            .map(|input| input.outpoint())
            .find(|outpoint| self.claimed.contains(outpoint))
    }

    /// Appends a transaction. Callers check for conflicts first.
    pub fn push(&mut self, tx: Transaction) {
        self.claimed
            .extend(tx.inputs.iter().map(|input| input.outpoint()));
        self.transactions.push_back(tx);
    }

    /// Removes the transaction with id `txid`, if pending
    pub fn remove(&mut self, txid: &str) -> Option<Transaction> {
        let position = self.transactions.iter().position(|tx| tx.id == txid)?;
        let tx = self.transactions.remove(position)?;
        for input in &tx.inputs {
            self.claimed.remove(&input.outpoint());
        }
        Some(tx)
    }

    /// Drops every transaction spending an output that is no longer in
    /// `utxos`, returning the evicted ids
    pub fn evict_spent(&mut self, utxos: &UtxoSet) -> Vec<String> {
        let stale: Vec<String> = self
            .transactions
            .iter()
            .filter(|tx| {
                tx.inputs
                    .iter()
                    .any(|input| !utxos.contains_key(&input.outpoint()))
            })
            .map(|tx| tx.id.clone())
            .collect();

        for txid in &stale {
            self.remove(txid);
        }
        stale
    }
}
