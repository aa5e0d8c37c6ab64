//! Logging setup on top of `tracing`.
//!
//! Output formats:
//! - **pretty**: multi-line, colored, for development
//! - **compact**: one line per event
//! - **json**: one JSON object per event, for log collection
//!
//! Events always go to stderr; stdout carries command output only.

use crate::domain::error::BlocktraderError;
use crate::ports::config_port::ConfigPort;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format '{s}', expected pretty, compact or json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `blocktrader=debug`.
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Reads the `[logging]` section. `level` is checked as a filter
    /// directive up front so a typo fails before any command runs.
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, BlocktraderError> {
        let defaults = Self::default();
        let level = config
            .get_string("logging", "level")
            .unwrap_or(defaults.level);
        EnvFilter::try_new(&level).map_err(|e| BlocktraderError::ConfigInvalid {
            section: "logging".into(),
            key: "level".into(),
            reason: e.to_string(),
        })?;
        let format = match config.get_string("logging", "format") {
            Some(raw) => raw
                .parse()
                .map_err(|reason: String| BlocktraderError::ConfigInvalid {
                    section: "logging".into(),
                    key: "format".into(),
                    reason,
                })?,
            None => defaults.format,
        };
        let ansi = config.get_bool("logging", "ansi", defaults.ansi);
        Ok(Self {
            level,
            format,
            ansi,
        })
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `config.level`. A second call keeps the first subscriber.
pub fn init_logging(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(format = ?config.format, level = %config.level, "logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    #[test]
    fn format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn defaults_without_section() {
        let config = FileConfigAdapter::from_string("[sqlite]\npath = a.db\n").unwrap();
        assert_eq!(LogConfig::from_config(&config).unwrap(), LogConfig::default());
    }

    #[test]
    fn reads_logging_section() {
        let config = FileConfigAdapter::from_string(
            "[logging]\nlevel = blocktrader=debug\nformat = json\nansi = false\n",
        )
        .unwrap();
        let log = LogConfig::from_config(&config).unwrap();
        assert_eq!(log.level, "blocktrader=debug");
        assert_eq!(log.format, LogFormat::Json);
        assert!(!log.ansi);
    }

    #[test]
    fn bad_format_is_config_invalid() {
        let config = FileConfigAdapter::from_string("[logging]\nformat = xml\n").unwrap();
        assert!(matches!(
            LogConfig::from_config(&config),
            Err(BlocktraderError::ConfigInvalid { key, .. }) if key == "format"
        ));
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LogConfig {
            format: LogFormat::Compact,
            ..LogConfig::default()
        };
        init_logging(&config);
        init_logging(&config);
    }
}
