use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use serde::{Deserialize, Serialize};

use std::fmt;

use super::hash::sha256_hex;
use super::transaction::TransactionError;

/// Length in hex characters of a P-256 scalar or coordinate
const SCALAR_HEX_LEN: usize = 64;

/// Represents a wallet address: the public key's affine coordinates as
/// unpadded hex, joined by `:`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        let point = public_key.to_encoded_point(false);
        // An uncompressed encoding always carries both coordinates
        let x = point.x().map(|x| to_unpadded_hex(x)).unwrap_or_default();
        let y = point.y().map(|y| to_unpadded_hex(y)).unwrap_or_default();
        Address(format!("{}:{}", x, y))
    }

    /// Parses the address back into a curve point
    ///
    /// # Errors
    ///
    /// `InvalidPublicKeyFormat` when the address is not two colon-separated
    /// parts or the coordinates are not on the curve, `InvalidSignatureValue`
    /// when a coordinate is not valid hex.
    pub fn to_public_key(&self) -> Result<VerifyingKey, TransactionError> {
        let (x, y) = split_pair(&self.0).ok_or_else(|| TransactionError::InvalidPublicKeyFormat {
            key: self.0.clone(),
        })?;
        let x = parse_scalar_hex(x, "public key x")?;
        let y = parse_scalar_hex(y, "public key y")?;

        let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
        VerifyingKey::from_encoded_point(&point).map_err(|_| TransactionError::InvalidPublicKeyFormat {
            key: self.0.clone(),
        })
    }

    /// The digest outputs are locked to: `sha256(address)`
    pub fn key_hash(&self) -> String {
        sha256_hex(self.0.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address(s)
    }
}

/// Signs `message` and renders the signature as `r:s` in unpadded hex
pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> String {
    let signature: Signature = signing_key.sign(message);
    let (r, s) = signature.split_bytes();
    format!("{}:{}", to_unpadded_hex(&r), to_unpadded_hex(&s))
}

/// Parses an `r:s` signature string
pub fn decode_signature(encoded: &str) -> Result<Signature, TransactionError> {
    let (r, s) = split_pair(encoded).ok_or(TransactionError::InvalidSignatureFormat)?;
    let r = parse_scalar_hex(r, "r")?;
    let s = parse_scalar_hex(s, "s")?;

    // Zero or out-of-range scalars are not valid signature values
    Signature::from_scalars(r, s).map_err(|_| TransactionError::InvalidSignatureValue {
        component: "r or s out of range",
    })
}

/// Verifies an encoded signature over `message` against an address-encoded
/// public key
///
/// # Arguments
///
/// * `public_key` - The signer's key in address form (`x:y`)
/// * `signature` - The signature in `r:s` form
/// * `message` - The signed bytes
/// * `outpoint` - The spent output, reported on failure
pub fn verify_message(
    public_key: &Address,
    signature: &str,
    message: &[u8],
    outpoint: &str,
) -> Result<(), TransactionError> {
    let signature = decode_signature(signature)?;
    let public_key = public_key.to_public_key()?;

    public_key
        .verify(message, &signature)
        .map_err(|_| TransactionError::SignatureVerificationFailed {
            outpoint: outpoint.to_string(),
        })
}

fn split_pair(value: &str) -> Option<(&str, &str)> {
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Some((a, b)),
        _ => None,
    }
}

/// Decodes an unpadded hex integer into a 32-byte big-endian field element
fn parse_scalar_hex(value: &str, component: &'static str) -> Result<FieldBytes, TransactionError> {
    let invalid = || TransactionError::InvalidSignatureValue { component };

    if value.is_empty() || value.len() > SCALAR_HEX_LEN {
        return Err(invalid());
    }

    let padded = format!("{:0>width$}", value, width = SCALAR_HEX_LEN);
    let bytes: [u8; 32] = hex::decode(padded)
        .map_err(|_| invalid())?
        .try_into()
        .map_err(|_| invalid())?;
    Ok(FieldBytes::from(bytes))
}

fn to_unpadded_hex(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    let trimmed = encoded.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
