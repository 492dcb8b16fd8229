//! Run orchestration.
//!
//! One [`Updater::run`] call reconciles the provider's records with the
//! machine's current addresses: resolve addresses, load the previous
//! snapshot, short-circuit when nothing changed, otherwise log in per
//! account, diff, issue the minimal update calls, refresh to learn the new
//! expiry windows and persist a fresh snapshot. A failure at any step
//! aborts the rest of the run; nothing is retried.

use crate::config::Config;
use crate::error::Result;
use crate::logger::{CapturingLogger, Level, Logger};
use crate::resolver::AddressResolver;
use crate::session::{HostRecord, Session, DYFI_URL};
use crate::state::{unix_now, PersistedState};
use chrono::{Local, TimeZone};
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Safety margin in seconds, subtracted from the provider's reported
/// validity window. Shared by the batch-update trigger and the next-expiry
/// computation; the two must agree.
pub const EXPIRATION_MARGIN: u64 = 12347;

/// Ceiling for the next validity window when no scraped record matches.
const MAX_VALIDITY: u64 = 7 * 86400;

/// Effective desired records for one hostname in this run.
struct Desired {
    email: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    mx: Option<String>,
}

/// Drives one reconciliation run.
pub struct Updater {
    base_url: String,
    update_url: String,
    resolver: AddressResolver,
}

impl Updater {
    /// Updater against the production dy.fi endpoints.
    pub fn new() -> Self {
        Self {
            base_url: DYFI_URL.to_string(),
            update_url: DYFI_URL.to_string(),
            resolver: AddressResolver::new(),
        }
    }

    /// Updater with custom endpoints and resolver (for testing).
    pub fn with_endpoints(base_url: &str, update_url: &str, resolver: AddressResolver) -> Self {
        Self {
            base_url: base_url.to_string(),
            update_url: update_url.to_string(),
            resolver,
        }
    }

    /// Execute one run. Terminal on first success or first fatal error.
    pub async fn run(&self, conf: &Config, logger: Arc<dyn Logger>) -> Result<()> {
        let dry_run = conf.dry_run;

        let state_file = match &conf.state {
            Some(path) => path.clone(),
            None => Config::default_state_path()?,
        };
        PersistedState::prepare(&state_file)?;
        let old = PersistedState::load(&state_file);
        let targets = conf.targets()?;
        let (ipv4, ipv6) = self.resolver.resolve().await?;

        let mut new = PersistedState {
            ipv4: Some(ipv4),
            ipv4_in_dyfi: None,
            ipv6,
            expires: old.expires,
            expires_str: None,
            hosts: targets.keys().cloned().collect(),
        };

        // If some weird routing put a different IPv4 address in dy.fi and
        // the locally resolved address has not changed, assume the old
        // provider-side address is still applicable.
        if Some(ipv4) == old.ipv4 && old.ipv4_in_dyfi.is_some() && old.ipv4_in_dyfi != Some(ipv4) {
            new.ipv4_in_dyfi = old.ipv4_in_dyfi;
        }

        if old.expires > unix_now()
            && old.ipv4 == new.ipv4
            && old.ipv6 == new.ipv6
            && old.hosts == new.hosts
        {
            logger.debug("No update needed");
            return Ok(());
        }

        // Desired records per hostname, with the carried-over provider-side
        // address taking precedence for IPv4.
        let effective_ipv4 = new.ipv4_in_dyfi.or(new.ipv4);
        let mut desired: BTreeMap<String, Desired> = targets
            .iter()
            .map(|(hostname, target)| {
                (
                    hostname.clone(),
                    Desired {
                        email: target.email.clone(),
                        ipv4: if target.ipv4 { effective_ipv4 } else { None },
                        ipv6: if target.ipv6 { new.ipv6 } else { None },
                        mx: target.mx.clone(),
                    },
                )
            })
            .collect();

        // One session per distinct credential pair.
        let mut sessions: HashMap<String, Session> = HashMap::new();
        for target in targets.values() {
            if !sessions.contains_key(&target.email) {
                sessions.insert(
                    target.email.clone(),
                    Session::with_endpoints(
                        logger.clone(),
                        dry_run,
                        target.email.clone(),
                        target.password.clone(),
                        &self.base_url,
                        &self.update_url,
                    ),
                );
            }
        }

        // Scrape each account, keeping only the records we manage.
        let mut remote: HashMap<String, HostRecord> = HashMap::new();
        for session in sessions.values_mut() {
            for (hostname, record) in session.get_state().await? {
                if desired.contains_key(&hostname) {
                    remote.insert(hostname, record);
                }
            }
        }

        // Hosts missing on the provider side must be created out-of-band;
        // drop them from this run with a warning.
        desired.retain(|hostname, _| {
            if remote.contains_key(hostname) {
                true
            } else {
                logger.warn(&format!("Missing hostname {} in dy.fi!", hostname));
                false
            }
        });

        // IPv4 is all-or-nothing: one divergent or near-expiry host
        // triggers the update for every remaining host, amortizing the
        // provider's per-request cost.
        let update_ipv4 = desired.iter().any(|(hostname, d)| {
            let record = &remote[hostname];
            record.ipv4 != d.ipv4 || record.expires < EXPIRATION_MARGIN
        });

        for (hostname, d) in &desired {
            let record = &remote[hostname];
            let Some(session) = sessions.get_mut(&d.email) else {
                continue;
            };
            if update_ipv4 {
                if let Some(confirmed) = session.update_ipv4(hostname, d.ipv4).await? {
                    new.ipv4_in_dyfi = Some(confirmed);
                }
            }
            if record.ipv6 != d.ipv6 {
                session.update_ipv6(hostname, d.ipv6).await?;
            }
            if record.mx != d.mx {
                session.update_mx(hostname, d.mx.clone()).await?;
            }
        }

        // Only the hosts that were actually reconciled count as managed.
        new.hosts = desired.keys().cloned().collect();

        // Refresh every session once and schedule the next check before
        // the shortest remaining validity window runs out.
        let mut min_expires = MAX_VALIDITY;
        for session in sessions.values_mut() {
            for record in session.refresh().await?.values() {
                if desired.contains_key(&record.hostname) {
                    min_expires = min_expires.min(record.expires);
                }
            }
        }
        new.expires = (unix_now() + min_expires).saturating_sub(EXPIRATION_MARGIN);
        new.expires_str = format_local(new.expires);

        if dry_run {
            logger.debug(&format!(
                "Dry run, final state: {}",
                serde_json::to_string_pretty(&new)?
            ));
        } else {
            new.store(&state_file)?;
        }
        Ok(())
    }
}

impl Default for Updater {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one reconciliation with a capturing logger. The full log of the run
/// is returned in both outcomes, so embedders can surface diagnostics for
/// failed runs.
pub async fn run_once(conf: &Config) -> (Result<()>, Vec<(Level, String)>) {
    let logger = Arc::new(CapturingLogger::new());
    let result = Updater::new().run(conf, logger.clone()).await;
    if let Err(e) = &result {
        logger.error(&e.to_string());
    }
    (result, logger.lines())
}

fn format_local(unix: u64) -> Option<String> {
    Local
        .timestamp_opt(unix as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, HostConfig};
    use crate::error::DyfiError;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESOLVED_IPV4: &str = "203.0.113.5";

    fn row(host_id: u64, hostname: &str, ipv4: &str, released: &str) -> String {
        format!(
            "<tr class=\"td-ht-pointed\"><td><a href=\"/?c=hopt&hostid={}\">{}</a></td><td>{}</td><td>released in: {}</td></tr>\n",
            host_id, hostname, ipv4, released
        )
    }

    fn config(hostnames: &[&str], state: PathBuf) -> Config {
        Config {
            accounts: vec![AccountConfig {
                email: "a@example.com".to_string(),
                password: "secret".to_string(),
                hosts: hostnames
                    .iter()
                    .map(|h| HostConfig {
                        hostname: h.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            state: Some(state),
            ..Default::default()
        }
    }

    async fn mock_resolver(server: &MockServer) -> AddressResolver {
        Mock::given(method("GET"))
            .and(path("/api/ipv4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("IPV4,{},v1.1", RESOLVED_IPV4)),
            )
            .mount(server)
            .await;
        // No IPv6 mock; the lookup 404s and resolves to none.
        AddressResolver::with_services(
            format!("{}/api/ipv4", server.uri()),
            format!("{}/api/ipv6", server.uri()),
        )
    }

    async fn mock_login(server: &MockServer, listing: String, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("c=login"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mock_refresh(server: &MockServer, listing: String, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mock_nic_update(server: &MockServer, hostname: &str, body: &str, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/nic/update"))
            .and(query_param("hostname", hostname))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mock_no_settings_post(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_string_contains("c=hopt"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(server)
            .await;
    }

    fn updater(server: &MockServer, resolver: AddressResolver) -> Updater {
        Updater::with_endpoints(&server.uri(), &server.uri(), resolver)
    }

    #[tokio::test]
    async fn test_first_run_updates_all_hosts_and_persists() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        let resolver = mock_resolver(&server).await;
        let stale = format!(
            "{}{}",
            row(1, "a.example", "198.51.100.7", "6d 23h"),
            row(2, "b.example", "198.51.100.7", "6d 23h")
        );
        let fresh = format!(
            "{}{}",
            row(1, "a.example", RESOLVED_IPV4, "6d 23h"),
            row(2, "b.example", RESOLVED_IPV4, "6d 23h")
        );
        mock_login(&server, stale, 1).await;
        mock_refresh(&server, fresh, 1).await;
        mock_nic_update(&server, "a.example", &format!("good {}", RESOLVED_IPV4), 1).await;
        mock_nic_update(&server, "b.example", &format!("good {}", RESOLVED_IPV4), 1).await;
        mock_no_settings_post(&server).await;

        let conf = config(&["a.example", "b.example"], state_path.clone());
        let logger = Arc::new(CapturingLogger::new());
        let before = unix_now();
        updater(&server, resolver).run(&conf, logger).await.unwrap();

        let state = PersistedState::load(&state_path);
        assert_eq!(state.hosts, vec!["a.example", "b.example"]);
        assert_eq!(state.ipv4, Some(RESOLVED_IPV4.parse().unwrap()));
        assert_eq!(state.ipv4_in_dyfi, None);
        assert_eq!(state.ipv6, None);

        let min_remaining = 6 * 86400 + 23 * 3600;
        let expected = before + min_remaining - EXPIRATION_MARGIN;
        assert!(state.expires >= expected && state.expires <= expected + 5);
        assert!(state.expires_str.is_some());
    }

    #[tokio::test]
    async fn test_unexpired_unchanged_state_short_circuits() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        let old = PersistedState {
            ipv4: Some(RESOLVED_IPV4.parse().unwrap()),
            ipv4_in_dyfi: None,
            ipv6: None,
            expires: unix_now() + 9999,
            expires_str: None,
            hosts: vec!["a.example".to_string(), "b.example".to_string()],
        };
        old.store(&state_path).unwrap();

        let resolver = mock_resolver(&server).await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nic/update"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let conf = config(&["a.example", "b.example"], state_path.clone());
        let logger = Arc::new(CapturingLogger::new());
        updater(&server, resolver)
            .run(&conf, logger.clone())
            .await
            .unwrap();

        assert!(logger
            .lines()
            .iter()
            .any(|(_, msg)| msg == "No update needed"));
        // State untouched.
        assert_eq!(PersistedState::load(&state_path), old);
    }

    #[tokio::test]
    async fn test_one_divergent_host_triggers_ipv4_update_for_all() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        let resolver = mock_resolver(&server).await;
        // a.example already points at the resolved address, b.example does
        // not; both are far from expiry.
        let listing = format!(
            "{}{}",
            row(1, "a.example", RESOLVED_IPV4, "6d 23h"),
            row(2, "b.example", "198.51.100.7", "6d 23h")
        );
        mock_login(&server, listing.clone(), 1).await;
        mock_refresh(&server, listing, 1).await;
        mock_nic_update(&server, "a.example", "nochg", 1).await;
        mock_nic_update(&server, "b.example", &format!("good {}", RESOLVED_IPV4), 1).await;
        mock_no_settings_post(&server).await;

        let conf = config(&["a.example", "b.example"], state_path);
        let logger = Arc::new(CapturingLogger::new());
        updater(&server, resolver).run(&conf, logger).await.unwrap();
    }

    #[tokio::test]
    async fn test_host_missing_from_provider_is_dropped_with_warning() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        let resolver = mock_resolver(&server).await;
        let listing = row(1, "a.example", "198.51.100.7", "6d 23h");
        mock_login(&server, listing.clone(), 1).await;
        mock_refresh(
            &server,
            row(1, "a.example", RESOLVED_IPV4, "6d 23h"),
            1,
        )
        .await;
        mock_nic_update(&server, "a.example", &format!("good {}", RESOLVED_IPV4), 1).await;

        let conf = config(&["a.example", "missing.example"], state_path.clone());
        let logger = Arc::new(CapturingLogger::new());
        updater(&server, resolver)
            .run(&conf, logger.clone())
            .await
            .unwrap();

        assert!(logger
            .lines()
            .iter()
            .any(|(level, msg)| *level == Level::Warn && msg.contains("missing.example")));
        let state = PersistedState::load(&state_path);
        assert_eq!(state.hosts, vec!["a.example"]);
    }

    #[tokio::test]
    async fn test_anomaly_address_carries_over() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        // Previous run: same local address, but the provider confirmed a
        // different one. The carried-over address is the effective desired
        // value, so a listing that already matches it needs no IPv4 call.
        let old = PersistedState {
            ipv4: Some(RESOLVED_IPV4.parse().unwrap()),
            ipv4_in_dyfi: Some("198.51.100.99".parse().unwrap()),
            ipv6: None,
            expires: 0,
            expires_str: None,
            hosts: vec!["a.example".to_string()],
        };
        old.store(&state_path).unwrap();

        let resolver = mock_resolver(&server).await;
        let listing = row(1, "a.example", "198.51.100.99", "6d 23h");
        mock_login(&server, listing.clone(), 1).await;
        mock_refresh(&server, listing, 1).await;
        Mock::given(method("GET"))
            .and(path("/nic/update"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let conf = config(&["a.example"], state_path.clone());
        let logger = Arc::new(CapturingLogger::new());
        updater(&server, resolver).run(&conf, logger).await.unwrap();

        let state = PersistedState::load(&state_path);
        assert_eq!(state.ipv4_in_dyfi, Some("198.51.100.99".parse().unwrap()));
        assert_eq!(state.ipv4, Some(RESOLVED_IPV4.parse().unwrap()));
    }

    #[tokio::test]
    async fn test_dry_run_computes_but_does_not_commit() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state.json");

        let resolver = mock_resolver(&server).await;
        let listing = row(1, "a.example", "198.51.100.7", "6d 23h");
        mock_login(&server, listing.clone(), 1).await;
        mock_refresh(&server, listing, 1).await;
        Mock::given(method("GET"))
            .and(path("/nic/update"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut conf = config(&["a.example"], state_path.clone());
        conf.dry_run = true;
        let logger = Arc::new(CapturingLogger::new());
        updater(&server, resolver)
            .run(&conf, logger.clone())
            .await
            .unwrap();

        assert!(logger
            .lines()
            .iter()
            .any(|(_, msg)| msg.starts_with("Dry run, final state:")));
        // prepare() touched the file, but nothing was committed.
        assert_eq!(PersistedState::load(&state_path), PersistedState::default());
    }

    #[tokio::test]
    async fn test_run_once_returns_log_with_error() {
        let dir = TempDir::new().unwrap();
        let conf = Config {
            accounts: vec![AccountConfig {
                email: "a@example.com".to_string(),
                password: String::new(),
                hosts: vec![HostConfig {
                    hostname: "a.example".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            state: Some(dir.path().join("state.json")),
            ..Default::default()
        };

        let (result, lines) = run_once(&conf).await;
        assert!(matches!(result, Err(DyfiError::Config(_))));
        assert!(lines
            .iter()
            .any(|(level, msg)| *level == Level::Error && msg.contains("email or password")));
    }
}
