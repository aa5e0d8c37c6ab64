//! Configuration validation.
//!
//! Reads the store and mutation sections through [`ConfigPort`] and turns
//! them into typed settings, failing early on missing or out-of-range values.

use crate::domain::error::BlocktraderError;
use crate::ports::config_port::ConfigPort;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POOL_SIZE: i64 = 4;
pub const DEFAULT_BUSY_TIMEOUT_MS: i64 = 5000;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(format!("unknown backend '{other}', expected sqlite or postgres")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqliteSettings {
    pub path: String,
    pub pool_size: u32,
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresSettings {
    pub connection_string: String,
    pub pool_size: u32,
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> BlocktraderError {
    BlocktraderError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn bounded(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
) -> Result<i64, BlocktraderError> {
    // get_int falls back to the default on garbage; catch that here instead.
    if let Some(raw) = config.get_string(section, key) {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| invalid(section, key, format!("'{raw}' is not an integer")))?;
    }
    let value = config.get_int(section, key, default);
    if value < min || value > max {
        return Err(invalid(
            section,
            key,
            format!("{key} must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(value)
}

pub fn store_backend(config: &dyn ConfigPort) -> Result<StoreBackend, BlocktraderError> {
    match config.get_string("store", "backend") {
        None => Ok(StoreBackend::Sqlite),
        Some(raw) => raw
            .parse()
            .map_err(|reason: String| invalid("store", "backend", reason)),
    }
}

pub fn sqlite_settings(config: &dyn ConfigPort) -> Result<SqliteSettings, BlocktraderError> {
    let path = config
        .get_string("sqlite", "path")
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| BlocktraderError::ConfigMissing {
            section: "sqlite".into(),
            key: "path".into(),
        })?;
    let pool_size = bounded(config, "sqlite", "pool_size", DEFAULT_POOL_SIZE, 1, 64)?;
    let busy_timeout_ms = bounded(
        config,
        "sqlite",
        "busy_timeout_ms",
        DEFAULT_BUSY_TIMEOUT_MS,
        0,
        600_000,
    )?;
    Ok(SqliteSettings {
        path: path.trim().to_string(),
        pool_size: pool_size as u32,
        busy_timeout: Duration::from_millis(busy_timeout_ms as u64),
    })
}

pub fn postgres_settings(config: &dyn ConfigPort) -> Result<PostgresSettings, BlocktraderError> {
    // [postgres] connection_string first, [database] conninfo as fallback
    let connection_string = config
        .get_string("postgres", "connection_string")
        .or_else(|| config.get_string("database", "conninfo"))
        .ok_or_else(|| BlocktraderError::ConfigMissing {
            section: "database".into(),
            key: "conninfo".into(),
        })?;
    let pool_size = bounded(config, "postgres", "pool_size", DEFAULT_POOL_SIZE, 1, 64)?;
    Ok(PostgresSettings {
        connection_string,
        pool_size: pool_size as u32,
    })
}

/// How many times a mutation is planned and committed before giving up with
/// `Conflict`.
pub fn max_attempts(config: &dyn ConfigPort) -> Result<u32, BlocktraderError> {
    let value = bounded(config, "mutation", "max_attempts", DEFAULT_MAX_ATTEMPTS, 1, 9)?;
    Ok(value as u32)
}

/// Checks every section the selected backend needs.
pub fn validate_config(config: &dyn ConfigPort) -> Result<StoreBackend, BlocktraderError> {
    let backend = store_backend(config)?;
    match backend {
        StoreBackend::Sqlite => {
            sqlite_settings(config)?;
        }
        StoreBackend::Postgres => {
            postgres_settings(config)?;
        }
    }
    max_attempts(config)?;
    Ok(backend)
}
