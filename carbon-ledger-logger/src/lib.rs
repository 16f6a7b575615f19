//! Tracing initialization shared by the carbon-ledger binaries.

use anyhow::Result;
use serde::Deserialize;
use std::{fs::File, str::FromStr};
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, writer::MakeWriterExt},
    prelude::*,
    Registry,
};

/// Log output format.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

/// Log output destination.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct LogConfig {
    /// Log level, e.g. "info", "debug", "trace".
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub output: LogOutput,
    /// Path to the log file, required if output is "file".
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
        }
    }
}

/// Installs the global tracing subscriber described by `config`.
pub fn init(config: &LogConfig) -> Result<()> {
    let log_level = Level::from_str(&config.level).unwrap_or(Level::INFO);
    let level_filter = LevelFilter::from_level(log_level);
    let subscriber = Registry::default().with(level_filter);

    match config.output {
        LogOutput::File => {
            let file_path = config.file_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("Log output is 'file' but 'file-path' is not specified")
            })?;
            let log_file = File::create(file_path)?;
            let file_writer = log_file.with_max_level(log_level);

            match config.format {
                LogFormat::Json => subscriber
                    .with(fmt::layer().with_writer(file_writer).json())
                    .init(),
                LogFormat::Plain => subscriber
                    .with(fmt::layer().with_writer(file_writer).pretty())
                    .init(),
            }
        }
        LogOutput::Stdout => {
            let stdout_writer = std::io::stdout.with_max_level(log_level);
            match config.format {
                LogFormat::Json => subscriber
                    .with(fmt::layer().with_writer(stdout_writer).json())
                    .init(),
                LogFormat::Plain => subscriber
                    .with(fmt::layer().with_writer(stdout_writer).pretty())
                    .init(),
            }
        }
    };

    Ok(())
}
