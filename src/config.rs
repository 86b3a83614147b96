//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILLEDGER_CONFIG` (environment variable)
//! 2. `~/.config/mailledger/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailledger\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Content-key derivation.
    pub fingerprint: FingerprintConfig,
    /// Bounded fast store sizing.
    pub quota: QuotaConfig,
    /// Ledger files.
    pub ledger: LedgerConfig,
    /// Maintenance defaults.
    pub maintenance: MaintenanceConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override data directory for ledgers, snapshots, artifacts and logs.
    pub data_dir: Option<PathBuf>,
    /// Override directory where novel attachments are stored.
    pub artifact_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Content-key derivation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Timestamps are truncated to multiples of this many seconds (0 = no truncation).
    pub window_secs: u64,
    /// Number of hex characters kept from the digest.
    pub key_length: usize,
}

/// Bounded fast store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Hard cap on stored message ids.
    pub capacity: usize,
    /// Eviction starts when fewer than this many free slots remain.
    pub safety_margin: usize,
    /// Number of oldest entries evicted at once.
    pub eviction_batch: usize,
}

/// Ledger file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// CSV field separator character.
    pub csv_separator: char,
    /// Number of content-ledger hits kept in the LRU cache.
    pub lookup_cache_size: usize,
}

/// Maintenance defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Age in days used by `purge` when `--older-than` is not given.
    pub default_max_age_days: u32,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            artifact_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            key_length: 16,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            safety_margin: 5,
            eviction_batch: 10,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            csv_separator: ',',
            lookup_cache_size: 256,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            default_max_age_days: 90,
        }
    }
}

impl Config {
    /// Reject settings the stores cannot honor.
    pub fn validate(&self) -> Result<()> {
        let q = &self.quota;
        if q.capacity == 0 {
            return Err(LedgerError::InvalidConfig("quota.capacity must be > 0".into()));
        }
        if q.safety_margin >= q.capacity {
            return Err(LedgerError::InvalidConfig(format!(
                "quota.safety_margin ({}) must be smaller than quota.capacity ({})",
                q.safety_margin, q.capacity
            )));
        }
        if q.eviction_batch == 0 {
            return Err(LedgerError::InvalidConfig(
                "quota.eviction_batch must be > 0".into(),
            ));
        }
        if !(8..=64).contains(&self.fingerprint.key_length) {
            return Err(LedgerError::InvalidConfig(format!(
                "fingerprint.key_length must be between 8 and 64, got {}",
                self.fingerprint.key_length
            )));
        }
        if self.ledger.csv_separator == '"' || self.ledger.csv_separator == '\n' {
            return Err(LedgerError::InvalidConfig(
                "ledger.csv_separator cannot be a quote or newline".into(),
            ));
        }
        Ok(())
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILLEDGER_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailledger").join("config.toml"))
}

/// Return the data directory holding ledgers, the quota snapshot and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailledger")
}

/// Return the directory where novel artifacts are written.
pub fn artifact_dir(config: &Config) -> PathBuf {
    config
        .general
        .artifact_dir
        .clone()
        .unwrap_or_else(|| data_dir(config).join("artifacts"))
}

/// Path of the content ledger CSV.
pub fn content_ledger_path(config: &Config) -> PathBuf {
    data_dir(config).join("content_ledger.csv")
}

/// Path of the processing ledger CSV.
pub fn processing_ledger_path(config: &Config) -> PathBuf {
    data_dir(config).join("processing_ledger.csv")
}

/// Path of the bounded fast store snapshot.
pub fn quota_snapshot_path(config: &Config) -> PathBuf {
    data_dir(config).join("quota.bin")
}

/// Path of the inter-process run lock.
pub fn lock_file_path(config: &Config) -> PathBuf {
    data_dir(config).join("ingest.lock")
}
