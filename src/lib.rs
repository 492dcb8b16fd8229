//! # dyfi-updater
//!
//! Keeps dy.fi dynamic-DNS hostnames pointed at the machine's current
//! public IPv4/IPv6 addresses and optionally maintains an MX record, while
//! minimizing calls to the provider (who rate-limits clients that update
//! too often).
//!
//! One invocation performs one reconciliation run: resolve the current
//! addresses, compare against the previous run's persisted snapshot,
//! short-circuit if nothing changed, otherwise log in per account, scrape
//! the host listing, issue the minimal update calls and persist a new
//! snapshot with the next safe re-check time. Scheduling repeated runs is
//! left to cron or a systemd timer.
//!
//! ## Usage
//!
//! ```bash
//! dyfi-updater --conf /etc/dyfi-updater.json
//!
//! # Compute updates without touching the provider or the state file
//! dyfi-updater --conf /etc/dyfi-updater.json --dry-run --log-level debug
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod resolver;
pub mod session;
pub mod state;
pub mod updater;

pub use config::Config;
pub use error::{DyfiError, Result};
pub use logger::{CapturingLogger, ConsoleLogger, Level, Logger};
pub use updater::{run_once, Updater, EXPIRATION_MARGIN};
