//! Authenticated dy.fi session.
//!
//! One [`Session`] owns the cookie-authenticated connection for one
//! credential pair. Login happens lazily on first use and at most once per
//! session; the scraped host listing is cached and fully replaced on every
//! parse. Sessions never outlive one run.

use crate::error::{DyfiError, Result};
use crate::logger::Logger;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub(crate) const DYFI_URL: &str = "https://www.dy.fi";

/// Validity window the provider grants a freshly updated record.
const FRESH_EXPIRY: u64 = 7 * 86400;

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<.*td-ht-(un)?pointed.*hostid=(\d+).*>").expect("valid regex"));
static DETAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&[^;]{1,6};|\s|<[^<>]*>)+").expect("valid regex"));
static HOSTNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" (\S+) ").expect("valid regex"));
static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" (\d+\.\d+\.\d+\.\d+) ").expect("valid regex"));
static IPV6_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"IPv6: ([0-9a-f:]+) ").expect("valid regex"));
static MX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"MX: (\S+) ").expect("valid regex"));
static RELEASED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"released in: ([0-9dmh ]+) ").expect("valid regex"));
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)(d|h|m)").expect("valid regex"));
static GOOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^good (\d+\.\d+\.\d+\.\d+)").expect("valid regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// The provider's current knowledge of one managed hostname, scraped from
/// the listing page. Replaced wholesale on every parse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostRecord {
    /// Provider-assigned key, needed for the settings update form.
    pub host_id: u64,
    pub hostname: String,
    /// Host exists but has no address at all.
    pub unpointed: bool,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub mx: Option<String>,
    /// Seconds until the provider un-points the record.
    pub expires: u64,
    /// Owning account.
    pub email: String,
}

/// Authenticated session against dy.fi for one account.
pub struct Session {
    client: reqwest::Client,
    logger: Arc<dyn Logger>,
    dry_run: bool,
    email: String,
    password: String,
    base_url: String,
    update_url: String,
    logged_in: bool,
    state: HashMap<String, HostRecord>,
}

impl Session {
    /// Create a session against the production endpoints.
    pub fn new(logger: Arc<dyn Logger>, dry_run: bool, email: String, password: String) -> Self {
        Self::with_endpoints(logger, dry_run, email, password, DYFI_URL, DYFI_URL)
    }

    /// Create a session with custom endpoints (for testing). `base_url`
    /// serves the login/listing/settings pages, `update_url` the
    /// `nic/update` endpoint.
    pub fn with_endpoints(
        logger: Arc<dyn Logger>,
        dry_run: bool,
        email: String,
        password: String,
        base_url: &str,
        update_url: &str,
    ) -> Self {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .user_agent("dyfi-updater")
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            logger,
            dry_run,
            email,
            password,
            base_url: base_url.to_string(),
            update_url: update_url.to_string(),
            logged_in: false,
            state: HashMap::new(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Ensure login has happened; the login response already carries the
    /// host listing, so it is parsed right away.
    async fn ensure_login(&mut self) -> Result<()> {
        if self.logged_in {
            return Ok(());
        }
        self.logger.debug(&format!("Login for {}", self.email));
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .form(&[
                ("c", "login"),
                ("submit", "login"),
                ("lang", "en"),
                ("email", self.email.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        self.logged_in = true;
        self.replace_state(parse_listing(&body, &self.email));
        Ok(())
    }

    /// Freshly scraped records, logging in first if needed.
    pub async fn get_state(&mut self) -> Result<HashMap<String, HostRecord>> {
        self.ensure_login().await?;
        Ok(self.state.clone())
    }

    /// Re-fetch the listing page on the existing session and re-parse.
    /// Used after updates to learn new expiry windows.
    pub async fn refresh(&mut self) -> Result<HashMap<String, HostRecord>> {
        self.ensure_login().await?;
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        self.replace_state(parse_listing(&body, &self.email));
        Ok(self.state.clone())
    }

    fn replace_state(&mut self, state: HashMap<String, HostRecord>) {
        if let Ok(json) = serde_json::to_string_pretty(&state) {
            self.logger.debug(&json);
        }
        self.state = state;
    }

    async fn check(&mut self, hostname: &str) -> Result<()> {
        self.ensure_login().await?;
        if self.state.contains_key(hostname) {
            Ok(())
        } else {
            Err(DyfiError::UnknownHost {
                hostname: hostname.to_string(),
                email: self.email.clone(),
            })
        }
    }

    /// Point `hostname` at this machine via the `nic/update` endpoint.
    ///
    /// The endpoint takes no address; the provider records the connection's
    /// source address, so `desired` is only used to interpret the reply.
    /// Returns the provider-confirmed address when it differs from the
    /// desired one (NAT or asymmetric routing rewrote it), `None` for
    /// "no effective change".
    pub async fn update_ipv4(
        &mut self,
        hostname: &str,
        desired: Option<Ipv4Addr>,
    ) -> Result<Option<Ipv4Addr>> {
        self.check(hostname).await?;
        self.logger
            .info(&format!("Updating {} ipv4 to {}", hostname, display(&desired)));
        if self.dry_run {
            if let Some(record) = self.state.get_mut(hostname) {
                record.ipv4 = desired;
                record.expires = FRESH_EXPIRY;
            }
            return Ok(None);
        }

        let body = self
            .client
            .get(format!("{}/nic/update", self.update_url))
            .query(&[("hostname", hostname)])
            .basic_auth(&self.email, Some(&self.password))
            .send()
            .await?
            .text()
            .await?;

        let confirmed = if body.starts_with("nochg") {
            None
        } else if let Some(caps) = GOOD_RE.captures(&body) {
            caps[1].parse::<Ipv4Addr>().ok()
        } else {
            return Err(DyfiError::Update {
                hostname: hostname.to_string(),
                body,
            });
        };

        match confirmed {
            Some(confirmed) if Some(confirmed) != desired => {
                self.logger
                    .info(&format!("Updated {} to {}", hostname, confirmed));
                if let Some(record) = self.state.get_mut(hostname) {
                    record.ipv4 = Some(confirmed);
                    record.expires = FRESH_EXPIRY;
                }
                Ok(Some(confirmed))
            }
            _ => {
                // nochg, or the confirmed address equals the desired one.
                self.logger.info(&format!(
                    "Updated {} to {} (no change)",
                    hostname,
                    display(&desired)
                ));
                Ok(None)
            }
        }
    }

    /// Set or clear the AAAA record for `hostname`.
    pub async fn update_ipv6(&mut self, hostname: &str, ipv6: Option<Ipv6Addr>) -> Result<()> {
        self.check(hostname).await?;
        if let Some(record) = self.state.get_mut(hostname) {
            record.ipv6 = ipv6;
        }
        self.logger
            .info(&format!("Updating {} ipv6 to {}", hostname, display(&ipv6)));
        if !self.dry_run {
            self.post_settings(hostname).await?;
        }
        Ok(())
    }

    /// Set or clear the MX record for `hostname`.
    pub async fn update_mx(&mut self, hostname: &str, mx: Option<String>) -> Result<()> {
        self.check(hostname).await?;
        if let Some(record) = self.state.get_mut(hostname) {
            record.mx = mx.clone();
        }
        self.logger
            .info(&format!("Updating {} mx to {}", hostname, display(&mx)));
        if !self.dry_run {
            self.post_settings(hostname).await?;
        }
        Ok(())
    }

    /// Post the full per-host settings form. IPv6 and MX share one form, so
    /// the current local record supplies both fields.
    async fn post_settings(&mut self, hostname: &str) -> Result<()> {
        let record = match self.state.get(hostname) {
            Some(record) => record,
            None => {
                return Err(DyfiError::UnknownHost {
                    hostname: hostname.to_string(),
                    email: self.email.clone(),
                })
            }
        };
        let form = [
            ("c", "hopt".to_string()),
            ("hostid", record.host_id.to_string()),
            ("aaaa", record.ipv6.map(|a| a.to_string()).unwrap_or_default()),
            ("mx", record.mx.clone().unwrap_or_default()),
            ("url", String::new()),
            ("title", String::new()),
            ("framed", String::new()),
            ("submit", "1".to_string()),
        ];
        let body = self
            .client
            .post(format!("{}/", self.base_url))
            .form(&form)
            .send()
            .await?
            .text()
            .await?;

        if !body.contains("updated successfully") {
            let snippet: String = TAG_RE.replace_all(&body, "").chars().take(100).collect();
            return Err(DyfiError::Update {
                hostname: hostname.to_string(),
                body: snippet,
            });
        }
        self.replace_state(parse_listing(&body, &self.email));
        Ok(())
    }
}

fn display<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

/// Parse the listing page into per-hostname records.
///
/// Each host row is one marked-up line carrying a pointed/unpointed marker
/// and the provider's host id. Fields are extracted from the row's
/// de-tagged, whitespace-collapsed text; a missing pattern yields an absent
/// field, except the expiry which defaults to zero.
pub(crate) fn parse_listing(html: &str, email: &str) -> HashMap<String, HostRecord> {
    let mut state = HashMap::new();
    for caps in ROW_RE.captures_iter(html) {
        let row = &caps[0];
        let txt = format!(" {} ", DETAG_RE.replace_all(row, " "));
        let hostname = match HOSTNAME_RE.captures(&txt) {
            Some(c) => c[1].to_string(),
            None => continue,
        };
        let record = HostRecord {
            host_id: caps[2].parse().unwrap_or(0),
            hostname: hostname.clone(),
            unpointed: caps.get(1).is_some(),
            ipv4: IPV4_RE.captures(&txt).and_then(|c| c[1].parse().ok()),
            ipv6: IPV6_RE.captures(&txt).and_then(|c| c[1].parse().ok()),
            mx: MX_RE.captures(&txt).map(|c| c[1].to_string()),
            expires: RELEASED_RE
                .captures(&txt)
                .map(|c| duration_to_seconds(&c[1]))
                .unwrap_or(0),
            email: email.to_string(),
        };
        state.insert(hostname, record);
    }
    state
}

/// Sum a human-readable duration of `<N><unit>` tokens, unit d/h/m.
fn duration_to_seconds(s: &str) -> u64 {
    DURATION_RE
        .captures_iter(s)
        .map(|c| {
            let n: u64 = c[1].parse().unwrap_or(0);
            let unit = match &c[2] {
                "d" => 86400,
                "h" => 3600,
                _ => 60,
            };
            n * unit
        })
        .sum()
}
