//! Public address resolution.
//!
//! Prefers local interface enumeration (`ip -o addr`), falling back per
//! address family to a public "what is my IP" service. IPv4 is mandatory,
//! IPv6 optional. Addresses are round-tripped through their binary
//! representation so textually different but equal forms compare equal.

use crate::error::{DyfiError, Result};
use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;
use std::time::Duration;

const IPV4_SERVICE: &str = "http://ip4only.me/api/";
const IPV6_SERVICE: &str = "http://ip6only.me/api/";

static INET4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet ([0-9.]+)(?:/\d+)? .*scope global").expect("valid regex"));
static INET6_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"inet6 ([0-9a-f:]+)(?:/\d+)? scope global").expect("valid regex"));

/// Resolver for the machine's current global-scope addresses.
pub struct AddressResolver {
    client: reqwest::Client,
    ipv4_service: String,
    ipv6_service: String,
    use_interfaces: bool,
}

impl AddressResolver {
    /// Create a resolver with the default lookup services.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            ipv4_service: IPV4_SERVICE.to_string(),
            ipv6_service: IPV6_SERVICE.to_string(),
            use_interfaces: true,
        }
    }

    /// Create a resolver that skips interface enumeration and only queries
    /// the given services (for testing).
    pub fn with_services(ipv4_service: String, ipv6_service: String) -> Self {
        Self {
            ipv4_service,
            ipv6_service,
            use_interfaces: false,
            ..Self::new()
        }
    }

    /// Resolve current global-scope addresses. Fails if no usable IPv4 is
    /// found; a missing IPv6 is not an error.
    pub async fn resolve(&self) -> Result<(Ipv4Addr, Option<Ipv6Addr>)> {
        let (mut ipv4, mut ipv6) = if self.use_interfaces {
            self.interface_addresses().await
        } else {
            (None, None)
        };

        if ipv4.is_none() {
            ipv4 = self.query_service(&self.ipv4_service).await;
        }
        if ipv6.is_none() {
            ipv6 = self.query_service(&self.ipv6_service).await;
        }

        let ipv4 = ipv4.ok_or_else(|| {
            DyfiError::Address("No global-scope IPv4 address found".to_string())
        })?;
        tracing::debug!("Resolved addresses: ipv4 {}, ipv6 {:?}", ipv4, ipv6);
        Ok((ipv4, ipv6))
    }

    /// First global-scope address per family from the local interfaces.
    async fn interface_addresses(&self) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let output = tokio::process::Command::new("ip")
            .args(["-o", "addr"])
            .output()
            .await;
        match output {
            Ok(out) => scan_interface_dump(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                tracing::warn!("Interface enumeration failed: {}", e);
                (None, None)
            }
        }
    }

    /// Query one lookup service. The response is CSV with the address in
    /// the second field. Failures are soft; the caller decides whether a
    /// missing family is fatal.
    async fn query_service<A: std::str::FromStr>(&self, url: &str) -> Option<A> {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Lookup service {} failed: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!("Lookup service {} returned HTTP {}", url, response.status());
            return None;
        }
        let text = response.text().await.ok()?;
        let field = text.split(',').nth(1)?.trim();
        match field.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                tracing::warn!("Lookup service {} returned invalid address: {}", url, field);
                None
            }
        }
    }
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the first global-scope address per family from `ip -o addr` output.
fn scan_interface_dump(text: &str) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let ipv4 = INET4_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<Ipv4Addr>().ok())
        .find(is_global_v4);
    let ipv6 = INET6_RE
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<Ipv6Addr>().ok())
        .find(is_global_v6);
    (ipv4, ipv6)
}

/// Usable public IPv4: not loopback, RFC1918 private, link-local,
/// unspecified or broadcast.
fn is_global_v4(addr: &Ipv4Addr) -> bool {
    !(addr.is_loopback()
        || addr.is_private()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast())
}

/// Usable public IPv6: not loopback, unspecified, multicast (ff00::/8),
/// link-local (fe80::/10) or unique-local (fc00::/7).
fn is_global_v6(addr: &Ipv6Addr) -> bool {
    let seg0 = addr.segments()[0];
    !(addr.is_loopback()
        || addr.is_unspecified()
        || addr.is_multicast()
        || (seg0 & 0xffc0) == 0xfe80
        || (seg0 & 0xfe00) == 0xfc00)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
1: lo    inet6 ::1/128 scope host \\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.10/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 86000sec preferred_lft 86000sec
2: eth0    inet 203.0.113.5/24 brd 203.0.113.255 scope global dynamic eth0\\       valid_lft 86000sec preferred_lft 86000sec
2: eth0    inet6 fe80::1234:5678:9abc:def0/64 scope link \\       valid_lft forever preferred_lft forever
2: eth0    inet6 2001:db8:0:0:0:0:0:1/64 scope global dynamic \\       valid_lft 86000sec preferred_lft 86000sec
";

    #[test]
    fn test_scan_prefers_first_global_per_family() {
        let (ipv4, ipv6) = scan_interface_dump(DUMP);
        assert_eq!(ipv4, Some("203.0.113.5".parse().unwrap()));
        // Canonical form, not the zero-padded textual one in the dump.
        assert_eq!(ipv6.map(|a| a.to_string()), Some("2001:db8::1".to_string()));
    }

    #[test]
    fn test_scan_skips_private_and_link_local() {
        let dump = "\
2: eth0    inet 10.0.0.2/8 scope global eth0
2: eth0    inet6 fd00::5/64 scope global
";
        assert_eq!(scan_interface_dump(dump), (None, None));
    }

    #[test]
    fn test_v4_classification() {
        assert!(is_global_v4(&"203.0.113.5".parse().unwrap()));
        assert!(!is_global_v4(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_v4(&"172.20.0.1".parse().unwrap()));
        assert!(!is_global_v4(&"169.254.0.1".parse().unwrap()));
    }

    #[test]
    fn test_v6_classification() {
        assert!(is_global_v6(&"2001:db8::1".parse().unwrap()));
        assert!(!is_global_v6(&"::1".parse().unwrap()));
        assert!(!is_global_v6(&"fe80::1".parse().unwrap()));
        assert!(!is_global_v6(&"fc00::1".parse().unwrap()));
        assert!(!is_global_v6(&"fd12::1".parse().unwrap()));
        assert!(!is_global_v6(&"ff02::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_service_lookup() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("IPV4,203.0.113.9,v1.1"))
            .mount(&mock_server)
            .await;

        let resolver = AddressResolver::with_services(
            format!("{}/api/", mock_server.uri()),
            format!("{}/missing/", mock_server.uri()),
        );
        let (ipv4, ipv6) = resolver.resolve().await.unwrap();
        assert_eq!(ipv4, "203.0.113.9".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ipv6, None);
    }

    #[tokio::test]
    async fn test_missing_ipv4_is_fatal() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let resolver = AddressResolver::with_services(
            format!("{}/api/", mock_server.uri()),
            format!("{}/api6/", mock_server.uri()),
        );
        assert!(matches!(
            resolver.resolve().await,
            Err(DyfiError::Address(_))
        ));
    }
}
