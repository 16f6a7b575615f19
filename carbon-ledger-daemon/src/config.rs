use anyhow::{Context, Result};
use carbon_ledger_connector::config::MirrorConfig;
use carbon_ledger_logger::LogConfig;
use serde::Deserialize;

/// The top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub daemon: DaemonSpecificConfig,
}

/// Settings unique to the hosting binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonSpecificConfig {
    /// Where the sled database holding the mirror lives.
    pub db_path: String,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for DaemonSpecificConfig {
    fn default() -> Self {
        Self {
            db_path: "./carbon_ledger.db".to_string(),
            log: LogConfig::default(),
        }
    }
}

/// Loads the daemon configuration from a TOML file, with a
/// `CARBON_LEDGER__`-prefixed environment overlay.
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("CARBON_LEDGER").separator("__"));

    let settings: DaemonConfig = builder
        .build()
        .context(format!("Failed to build configuration from '{}'", path))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}
