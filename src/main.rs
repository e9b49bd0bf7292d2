use anyhow::{ensure, Context, Result};
use log::{info, warn};

use std::sync::Arc;

use utxo_ledger::blockchain::{Blockchain, LedgerConfig, Miner, Wallet};

/// Environment variable naming an optional JSON config file
const CONFIG_ENV: &str = "LEDGER_CONFIG";

/// Blocks produced by the demo run
const DEMO_BLOCKS: usize = 3;

fn load_config() -> Result<LedgerConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let config = LedgerConfig::from_json_file(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            info!("Loaded config from {}", path);
            Ok(config)
        }
        Err(_) => {
            info!("{} not set, using default config", CONFIG_ENV);
            Ok(LedgerConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = load_config()?;

    let producer = Wallet::generate();
    let producer_address = producer.address()?;
    let recipient = Wallet::generate();
    let recipient_address = recipient.address()?;
    info!("Block producer address: {}", producer_address);

    let chain = Arc::new(Blockchain::with_genesis(config, &producer_address)?);
    let miner = Miner::new(Arc::clone(&chain), producer_address.clone());

    for round in 1..=DEMO_BLOCKS {
        let payment = producer.new_transaction(
            &chain.find_utxo(&producer_address),
            &recipient_address,
            10,
            &format!("payment {}", round),
        )?;
        if let Err(err) = chain.add_transaction(payment) {
            warn!("Payment {} was not admitted: {}", round, err);
        }

        let block = miner.mine_next().await?;
        info!(
            "Block {} sealed with {} transactions, nonce {}",
            block.index,
            block.transactions.len(),
            block.nonce
        );
    }

    let utxos = chain.utxo_set();
    info!("Producer balance: {}", producer.balance(&utxos));
    info!("Recipient balance: {}", recipient.balance(&utxos));

    ensure!(chain.is_valid(), "chain failed re-verification");
    Ok(())
}
