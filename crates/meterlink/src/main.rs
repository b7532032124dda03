//! Print the effective engine config after layering and validation.
//!
//! Usage: `meterlink-config [RUNTIME_CONFIG...]`. The user layer at
//! `~/.meterlink/meterlink.json5` is applied first when present.

use anyhow::Context;
use log::info;
use meterlink::config::{EngineConfig, LayeredConfigOptions};

fn main() -> anyhow::Result<()> {
    meterlink::init_logging();
    let options = std::env::args()
        .skip(1)
        .fold(LayeredConfigOptions::new(), |options, path| {
            options.with_runtime_path(path)
        });
    let config = EngineConfig::load_layered(options).context("failed to load config")?;
    config.validate().context("config is invalid")?;
    info!(
        "config valid (chains={}, handshake_policy={:?})",
        config.network.supported_chains.len(),
        config.encryption.handshake_policy
    );
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
