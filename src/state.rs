//! Persisted run state.
//!
//! One small JSON record survives between runs: the addresses we last told
//! the provider, the managed hostname set, and the absolute time after
//! which the provider must be contacted again. It is read once at run
//! start and replaced wholesale at run end.

use crate::error::{DyfiError, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Snapshot of the previous run. All fields are defaulted so a missing,
/// partial or corrupt file degrades to "never ran before".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Locally resolved IPv4 of the previous run.
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,

    /// IPv4 the provider last confirmed, when it differed from the locally
    /// resolved one (NAT/rewrite anomaly).
    #[serde(default)]
    pub ipv4_in_dyfi: Option<Ipv4Addr>,

    /// Locally resolved IPv6 of the previous run.
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,

    /// Unix time after which an update cycle is due again.
    #[serde(default)]
    pub expires: u64,

    /// Human-readable form of `expires`, for operators reading the file.
    #[serde(default)]
    pub expires_str: Option<String>,

    /// Sorted list of hostnames under management.
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PersistedState {
    /// Validate the state file location before any network call is made.
    ///
    /// The parent directory must exist or be creatable and the file must be
    /// writable. Also checks that the system clock is not behind the file's
    /// modification time, which happens on systems without a persistent RTC.
    pub fn prepare(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DyfiError::StateFile(format!(
                        "Cannot create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                DyfiError::StateFile(format!("{} is not writable: {}", path.display(), e))
            })?;

        let mtime = file.metadata()?.modified()?;
        if SystemTime::now() < mtime {
            return Err(DyfiError::Clock(format!(
                "{} was modified in the future",
                path.display()
            )));
        }
        Ok(())
    }

    /// Load the previous snapshot, substituting defaults if the file is
    /// missing or unparsable. Never fatal.
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Atomically replace the state file with this snapshot.
    pub fn store(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", json)).map_err(|e| {
            DyfiError::StateFile(format!("Cannot write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            DyfiError::StateFile(format!("Cannot replace {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}
