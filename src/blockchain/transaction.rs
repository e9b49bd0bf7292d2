use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{verify_message, Address};
use super::hash::{now_millis, Preimage};
use super::utxo::OutPoint;

/// Output index carried by the coinbase marker input
pub const COINBASE_VOUT: i64 = -1;

/// Errors that can occur while checking a transaction's integrity
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction has no inputs")]
    EmptyInputs,

    #[error("Transaction has no outputs")]
    EmptyOutputs,

    #[error("Invalid transaction hash: stored {expected}, computed {actual}")]
    InvalidTransactionHash { expected: String, actual: String },

    #[error("Invalid signature format: expected two colon-separated hex values")]
    InvalidSignatureFormat,

    #[error("Invalid signature value: {component}")]
    InvalidSignatureValue { component: &'static str },

    #[error("Invalid public key format: {key}")]
    InvalidPublicKeyFormat { key: String },

    #[error("Signature verification failed for input spending {outpoint}")]
    SignatureVerificationFailed { outpoint: String },
}

/// A spendable amount locked to the hash of a recipient address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount carried by the output
    pub amount: i64,

    /// `sha256(address)` of the recipient
    pub recipient_key_hash: String,
}

impl TxOutput {
    pub fn new(amount: i64, recipient: &Address) -> Self {
        TxOutput {
            amount,
            recipient_key_hash: recipient.key_hash(),
        }
    }

    /// Checks whether the output is locked to `address`
    pub fn is_for(&self, address: &Address) -> bool {
        self.recipient_key_hash == address.key_hash()
    }
}

/// A reference to a previous output, plus the proof that the spender owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction that created the spent output
    pub txid: String,

    /// Index of the spent output, `-1` for the coinbase marker
    pub vout: i64,

    /// `r:s` signature, empty until signed
    pub signature: String,

    /// Signer's public key in address form
    pub public_key: Address,
}

impl TxInput {
    /// Creates an unsigned input spending `outpoint`
    pub fn new(outpoint: &OutPoint, public_key: Address) -> Self {
        TxInput {
            txid: outpoint.txid.clone(),
            vout: outpoint.vout,
            signature: String::new(),
            public_key,
        }
    }

    /// The marker input of a coinbase transaction
    pub fn coinbase() -> Self {
        TxInput {
            txid: String::new(),
            vout: COINBASE_VOUT,
            signature: String::new(),
            public_key: Address(String::new()),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.txid.is_empty() && self.vout == COINBASE_VOUT
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }

    /// Digest of the fields that identify this input: `hash(txid, vout, public_key)`
    pub fn digest(&self) -> String {
        Preimage::new()
            .str(&self.txid)
            .i64(self.vout)
            .str(self.public_key.as_str())
            .digest()
    }

    /// The bytes signed for this input: the transaction digest followed by the
    /// input's own digest
    pub fn signed_message(&self, tx_digest: &str) -> Vec<u8> {
        format!("{}{}", tx_digest, self.digest()).into_bytes()
    }

    /// Verifies this input's signature over `tx_digest`
    pub fn verify_signature(&self, tx_digest: &str) -> Result<(), TransactionError> {
        verify_message(
            &self.public_key,
            &self.signature,
            &self.signed_message(tx_digest),
            &self.outpoint().to_string(),
        )
    }
}

/// Represents a transaction in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Digest of every other field, signatures included
    pub id: String,

    /// Outputs being spent
    pub inputs: Vec<TxInput>,

    /// Outputs being created
    pub outputs: Vec<TxOutput>,

    /// Creation time in milliseconds since the Unix epoch
    pub created_at: i64,

    /// Free-form note, covered by the id
    #[serde(default)]
    pub memo: String,
}

impl Transaction {
    /// Creates a transaction stamped with the current time. The id is computed
    /// immediately, so a transaction that is signed afterwards must be
    /// re-finalized with [`Transaction::finalize`].
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, memo: impl Into<String>) -> Self {
        let mut transaction = Transaction {
            id: String::new(),
            inputs,
            outputs,
            created_at: now_millis(),
            memo: memo.into(),
        };
        transaction.finalize();
        transaction
    }

    /// Creates a coinbase transaction minting `amount` to `recipient`.
    ///
    /// The block height goes into the memo so that coinbases minted for
    /// different blocks never hash to the same id.
    pub fn new_coinbase(recipient: &Address, amount: i64, height: u64) -> Self {
        Transaction::new(
            vec![TxInput::coinbase()],
            vec![TxOutput::new(amount, recipient)],
            format!("coinbase height {}", height),
        )
    }

    /// A coinbase transaction has exactly one input, and it is the marker
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Recomputes the digest of every field except `id`
    pub fn calculate_hash(&self) -> String {
        self.preimage(true).digest()
    }

    /// Digest of the transaction with all signatures blanked.
    ///
    /// Signatures cannot cover themselves, so this is the transaction-level
    /// part of every input's signed message.
    pub fn signing_digest(&self) -> String {
        self.preimage(false).digest()
    }

    /// Sets `id` from the current contents
    pub fn finalize(&mut self) {
        self.id = self.calculate_hash();
    }

    /// Sum of all output amounts
    pub fn output_total(&self) -> i64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// Checks the transaction's integrity: non-empty, untampered id and a
    /// valid signature on every non-marker input
    ///
    /// # Returns
    ///
    /// The first failure encountered, in input order
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        if self.inputs.is_empty() {
            return Err(TransactionError::EmptyInputs);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::EmptyOutputs);
        }

        let actual = self.calculate_hash();
        if self.id != actual {
            return Err(TransactionError::InvalidTransactionHash {
                expected: self.id.clone(),
                actual,
            });
        }

        let signing_digest = self.signing_digest();
        self.inputs
            .iter()
            .filter(|input| !input.is_coinbase())
            .try_for_each(|input| input.verify_signature(&signing_digest))
    }

    fn preimage(&self, with_signatures: bool) -> Preimage {
        Preimage::new()
            .i64(self.created_at)
            .str(&self.memo)
            .list(&self.inputs, |p, input| {
                let signature = if with_signatures { input.signature.as_str() } else { "" };
                p.str(&input.txid)
                    .i64(input.vout)
                    .str(signature)
                    .str(input.public_key.as_str())
            })
            .list(&self.outputs, |p, output| {
                p.i64(output.amount).str(&output.recipient_key_hash)
            })
    }
}
