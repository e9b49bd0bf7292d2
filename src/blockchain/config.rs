use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;

/// Hex digits in a block hash. A longer zero prefix can never be met.
const MAX_DIFFICULTY: u32 = 64;

/// Errors that can occur while loading ledger configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunables of the ledger. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Difficulty that locally assembled blocks are mined at
    pub difficulty: u32,

    /// Lowest difficulty an incoming block may carry
    pub min_difficulty: u32,

    /// Amount minted by each coinbase transaction
    pub block_reward: i64,

    /// Maximum number of pending transactions
    pub max_mempool_transactions: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: 2,
            min_difficulty: 1,
            block_reward: 50,
            max_mempool_transactions: 10_000,
        }
    }
}

impl LedgerConfig {
    /// Loads and validates a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: LedgerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_difficulty < 1 {
            return Err(ConfigError::Invalid("min_difficulty must be at least 1"));
        }
        if self.difficulty < self.min_difficulty {
            return Err(ConfigError::Invalid("difficulty must not be below min_difficulty"));
        }
        if self.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid("difficulty must not exceed 64"));
        }
        if self.block_reward < 0 {
            return Err(ConfigError::Invalid("block_reward must not be negative"));
        }
        if self.max_mempool_transactions == 0 {
            return Err(ConfigError::Invalid("max_mempool_transactions must be positive"));
        }
        Ok(())
    }
}
