use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use thiserror::Error;

use super::crypto::{sign_message, Address};
use super::transaction::{Transaction, TransactionError, TxInput, TxOutput};
use super::utxo::{OutPoint, UtxoSet};

/// Errors that can occur during wallet operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet is not initialized")]
    NotInitialized,

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

/// Holds a P-256 key pair and signs spends of the outputs locked to it.
///
/// `Wallet::default()` holds no key; every operation that needs one fails
/// with `NotInitialized`.
#[derive(Debug, Clone, Default)]
pub struct Wallet {
    signing_key: Option<SigningKey>,
}

impl Wallet {
    /// Creates a wallet with a fresh random key pair
    pub fn generate() -> Self {
        Wallet {
            signing_key: Some(SigningKey::random(&mut OsRng)),
        }
    }

    /// Restores a wallet from a 32-byte secret scalar
    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self, WalletError> {
        let signing_key =
            SigningKey::from_slice(secret_key).map_err(|_| WalletError::InvalidSecretKey)?;
        Ok(Wallet {
            signing_key: Some(signing_key),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.signing_key.is_some()
    }

    fn signing_key(&self) -> Result<&SigningKey, WalletError> {
        self.signing_key.as_ref().ok_or(WalletError::NotInitialized)
    }

    /// The canonical `x:y` address of this wallet's public key
    pub fn address(&self) -> Result<Address, WalletError> {
        Ok(Address::from_public_key(self.signing_key()?.verifying_key()))
    }

    /// Exports the secret scalar
    pub fn export_secret_key(&self) -> Result<Vec<u8>, WalletError> {
        Ok(self.signing_key()?.to_bytes().to_vec())
    }

    /// Sums the outputs in `utxos` that belong to this wallet. An
    /// uninitialized wallet owns nothing.
    pub fn balance(&self, utxos: &UtxoSet) -> i64 {
        match self.address() {
            Ok(address) => utxos
                .values()
                .filter(|output| output.is_for(&address))
                .map(|output| output.amount)
                .sum(),
            Err(_) => 0,
        }
    }

    /// Signs every input of `transaction` and then sets its id.
    ///
    /// Each input signs the transaction's signing digest followed by the
    /// input's own digest.
    pub fn sign_transaction(&self, transaction: &mut Transaction) -> Result<(), WalletError> {
        let signing_key = self.signing_key()?;
        let signing_digest = transaction.signing_digest();

        for input in transaction.inputs.iter_mut() {
            let message = input.signed_message(&signing_digest);
            input.signature = sign_message(signing_key, &message);
        }

        transaction.finalize();
        Ok(())
    }

    /// Builds and signs a transaction paying `amount` to `recipient`
    ///
    /// # Arguments
    ///
    /// * `utxos` - The outputs available to spend
    /// * `recipient` - The address being paid
    /// * `amount` - The amount to pay
    /// * `memo` - A note carried by the transaction
    ///
    /// # Returns
    ///
    /// A signed transaction with a payment output and a change output.
    /// Outputs are selected smallest first (ties broken by outpoint) until
    /// they cover `amount`. If they never do, the change output is negative
    /// and the ledger rejects the transaction with `InsufficientFunds`.
    pub fn new_transaction(
        &self,
        utxos: &UtxoSet,
        recipient: &Address,
        amount: i64,
        memo: &str,
    ) -> Result<Transaction, WalletError> {
        let sender = self.address()?;

        let mut owned: Vec<(&OutPoint, i64)> = utxos
            .iter()
            .filter(|(_, output)| output.is_for(&sender))
            .map(|(outpoint, output)| (outpoint, output.amount))
            .collect();
        owned.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        let mut input_amount = 0;
        let mut inputs = Vec::new();
        for (outpoint, value) in owned {
            input_amount += value;
            inputs.push(TxInput::new(outpoint, sender.clone()));
            if input_amount >= amount {
                break;
            }
        }

        let outputs = vec![
            TxOutput::new(amount, recipient),
            TxOutput::new(input_amount - amount, &sender),
        ];

        let mut transaction = Transaction::new(inputs, outputs, memo);
        self.sign_transaction(&mut transaction)?;

        Ok(transaction)
    }
}
