use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration, loaded from a TOML file. Every field has a
/// default so a missing file just runs with stock settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Path of the shared JSON store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Seconds between billing ticks. One minute in production; tests
    /// shrink it.
    #[serde(default = "default_billing_interval_secs")]
    pub billing_interval_secs: u64,

    /// Warn the user when the balance covers at most this many more
    /// minutes.
    #[serde(default = "default_low_balance_minutes")]
    pub low_balance_minutes: i64,

    /// Number of terminals created at bootstrap.
    #[serde(default = "default_unit_pool_size")]
    pub unit_pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            billing_interval_secs: default_billing_interval_secs(),
            low_balance_minutes: default_low_balance_minutes(),
            unit_pool_size: default_unit_pool_size(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "netcafe")
        .map(|dirs| dirs.data_dir().join("store.json"))
        .unwrap_or_else(|| PathBuf::from("netcafe-store.json"))
}

fn default_billing_interval_secs() -> u64 {
    60
}

fn default_low_balance_minutes() -> i64 {
    10
}

fn default_unit_pool_size() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/netcafe.toml")).unwrap();
        assert_eq!(config.billing_interval_secs, 60);
        assert_eq!(config.low_balance_minutes, 10);
        assert_eq!(config.unit_pool_size, 10);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcafe.toml");
        std::fs::write(&path, "billing_interval_secs = 30\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.billing_interval_secs, 30);
        assert_eq!(config.low_balance_minutes, 10);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcafe.toml");
        std::fs::write(&path, "billing_interval_secs = \"soon\"\n").unwrap();

        assert!(Config::load(&path).is_err());
    }
}
