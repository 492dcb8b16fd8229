//! Configuration loading and target expansion.
//!
//! The configuration file is a JSON document with per-account and per-host
//! sections. The boolean `ipv4`/`ipv6` switches and the `mx` target may be
//! set at any level; the nearest scope wins (host > account > global), with
//! "manage the record" / "no MX" as the final defaults.

use crate::error::{DyfiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Accounts holding the managed hostnames.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Global default: manage IPv4 records.
    pub ipv4: Option<bool>,

    /// Global default: manage IPv6 records.
    pub ipv6: Option<bool>,

    /// Global default MX target.
    pub mx: Option<String>,

    /// Path of the persisted state file.
    pub state: Option<PathBuf>,

    /// Compute updates without touching the provider or the state file.
    #[serde(default, rename = "dry-run")]
    pub dry_run: bool,

    /// Log level: debug, info, warn, error.
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

/// One provider account and its hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
    pub mx: Option<String>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One managed hostname.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub hostname: String,
    pub ipv4: Option<bool>,
    pub ipv6: Option<bool>,
    pub mx: Option<String>,
}

/// Desired record set for one hostname, derived from configuration.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub email: String,
    pub password: String,
    pub ipv4: bool,
    pub ipv6: bool,
    pub mx: Option<String>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DyfiError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            DyfiError::Config(format!("Invalid configuration {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Default state file location when neither the CLI nor the
    /// configuration names one.
    pub fn default_state_path() -> Result<PathBuf> {
        let dir = dirs::state_dir()
            .or_else(dirs::config_dir)
            .ok_or_else(|| DyfiError::Config("Could not find state directory".to_string()))?;
        Ok(dir.join("dyfi-updater").join("state.json"))
    }

    /// Expand nested configuration into one [`Target`] per hostname.
    ///
    /// Duplicate hostnames across accounts overwrite earlier entries. The
    /// map is keyed by hostname and iterates in sorted order, which gives
    /// the persisted hostname list its deterministic ordering.
    pub fn targets(&self) -> Result<BTreeMap<String, Target>> {
        let mut targets = BTreeMap::new();
        for account in &self.accounts {
            if account.email.is_empty() || account.password.is_empty() {
                return Err(DyfiError::Config(
                    "Account is missing email or password".to_string(),
                ));
            }
            for host in &account.hosts {
                if host.hostname.is_empty() {
                    return Err(DyfiError::Config("Host is missing hostname".to_string()));
                }
                targets.insert(
                    host.hostname.clone(),
                    Target {
                        email: account.email.clone(),
                        password: account.password.clone(),
                        ipv4: host.ipv4.or(account.ipv4).or(self.ipv4).unwrap_or(true),
                        ipv6: host.ipv6.or(account.ipv6).or(self.ipv6).unwrap_or(true),
                        mx: host
                            .mx
                            .clone()
                            .or_else(|| account.mx.clone())
                            .or_else(|| self.mx.clone()),
                    },
                );
            }
        }
        Ok(targets)
    }
}
