//! Error types for dyfi-updater.

use thiserror::Error;

/// Result type alias for dyfi-updater.
pub type Result<T> = std::result::Result<T, DyfiError>;

/// Error taxonomy for one updater run. Every variant is fatal to the run;
/// nothing is retried internally.
#[derive(Error, Debug)]
pub enum DyfiError {
    /// Malformed or incomplete configuration. Raised before any network call.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state file is unreadable or unwritable.
    #[error("State file error: {0}")]
    StateFile(String),

    /// System clock reads earlier than a file timestamp. Seen on systems
    /// without a persistent RTC.
    #[error("System time is incorrect: {0}")]
    Clock(String),

    /// No usable global-scope IPv4 address was found.
    #[error("Address resolution failed: {0}")]
    Address(String),

    /// A configured hostname is missing from the account's freshly
    /// scraped state.
    #[error("Missing hostname {hostname} on account {email}")]
    UnknownHost { hostname: String, email: String },

    /// The provider rejected or returned unexpected content for an update
    /// call. Carries the (possibly truncated) response body.
    #[error("Updating {hostname} failed: {body}")]
    Update { hostname: String, body: String },

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for DyfiError {
    fn from(e: reqwest::Error) -> Self {
        DyfiError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for DyfiError {
    fn from(e: serde_json::Error) -> Self {
        DyfiError::Serialization(e.to_string())
    }
}
