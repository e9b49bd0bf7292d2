use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::crypto::Address;
use super::transaction::TxOutput;

/// Identifies an output by the transaction that created it and its index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: String,
    pub vout: i64,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: i64) -> Self {
        OutPoint {
            txid: txid.into(),
            vout,
        }
    }
}

/// Renders the `"{txid}:{vout}"` key form
impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// All currently unspent outputs, ordered by outpoint
pub type UtxoSet = BTreeMap<OutPoint, TxOutput>;

/// Filters `utxos` down to the outputs locked to `address`
pub fn outputs_for(utxos: &UtxoSet, address: &Address) -> UtxoSet {
    let key_hash = address.key_hash();
    utxos
        .iter()
        .filter(|(_, output)| output.recipient_key_hash == key_hash)
        .map(|(outpoint, output)| (outpoint.clone(), output.clone()))
        .collect()
}

/// Copy-on-write view over a UTXO set, used to stage a block's effects
/// before any of them touch the live set
#[derive(Debug)]
pub struct UtxoOverlay<'a> {
    base: &'a UtxoSet,
    additions: BTreeMap<OutPoint, TxOutput>,
    deletions: HashSet<OutPoint>,
}

impl<'a> UtxoOverlay<'a> {
    pub fn new(base: &'a UtxoSet) -> Self {
        UtxoOverlay {
            base,
            additions: BTreeMap::new(),
            deletions: HashSet::new(),
        }
    }

    /// Looks up an output, honouring staged spends and additions
    pub fn get(&self, outpoint: &OutPoint) -> Option<&TxOutput> {
        if self.deletions.contains(outpoint) {
            return None;
        }
        self.additions
            .get(outpoint)
            .or_else(|| self.base.get(outpoint))
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }

    /// Marks an output as spent, returning it if it was available
    pub fn spend(&mut self, outpoint: &OutPoint) -> Option<TxOutput> {
        if let Some(output) = self.additions.remove(outpoint) {
            return Some(output);
        }
        if self.deletions.contains(outpoint) {
            return None;
        }
        let output = self.base.get(outpoint)?.clone();
        self.deletions.insert(outpoint.clone());
        Some(output)
    }

    /// Stages a new output. Returns `false` if the key is already live.
    pub fn add(&mut self, outpoint: OutPoint, output: TxOutput) -> bool {
        if self.contains(&outpoint) {
            return false;
        }
        self.additions.insert(outpoint, output);
        true
    }

    /// Consumes the overlay, yielding the staged spends and additions
    pub fn into_changes(self) -> (HashSet<OutPoint>, BTreeMap<OutPoint, TxOutput>) {
        (self.deletions, self.additions)
    }
}
