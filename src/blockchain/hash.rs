use chrono::Utc;
use sha2::{Digest, Sha256};

/// Returns the lowercase hex SHA-256 digest of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Current UTC time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Builds the byte preimage that entities are hashed over.
///
/// Every string carries a u64 length prefix and every integer is written
/// fixed-width little-endian, so two different field sequences can never
/// produce the same bytes. Lists are written as a length followed by their
/// elements.
#[derive(Debug, Default)]
pub struct Preimage {
    bytes: Vec<u8>,
}

impl Preimage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn str(mut self, value: &str) -> Self {
        self.bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes the element count, then lets `write` append each element
    pub fn list<T>(self, items: &[T], write: impl Fn(Self, &T) -> Self) -> Self {
        items
            .iter()
            .fold(self.u64(items.len() as u64), |acc, item| write(acc, item))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hex SHA-256 of the accumulated bytes
    pub fn digest(&self) -> String {
        sha256_hex(&self.bytes)
    }
}
