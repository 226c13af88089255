//! Outbound URL safety validation against SSRF.
//!
//! A callback URL is checked in a fixed order: length, scheme, host,
//! resolution, then every resolved address against the blocked ranges. The
//! same guard runs at admission and again before each delivery attempt, and
//! each run resolves the hostname afresh so a record re-pointed at an
//! internal address after admission is caught.
//!
//! A passing check yields a [`VettedUrl`] carrying the exact addresses that
//! were validated. The delivery client connects to those addresses only.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

/// Why a URL was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsafeReason {
    /// URL exceeds the configured length bound.
    #[error("URL length {length} exceeds maximum of {max}")]
    TooLong {
        /// Length of the rejected URL
        length: usize,
        /// Configured maximum
        max: usize,
    },

    /// URL could not be parsed.
    #[error("malformed URL: {0}")]
    Malformed(String),

    /// Scheme is not `http` or `https`.
    #[error("scheme '{0}' is not allowed, use http or https")]
    BadScheme(String),

    /// URL has no host or an empty one.
    #[error("URL has no hostname")]
    NoHost,

    /// Hostname did not resolve to any address.
    #[error("could not resolve hostname '{host}': {message}")]
    ResolutionFailed {
        /// Hostname that failed to resolve
        host: String,
        /// Resolver error
        message: String,
    },

    /// A resolved address falls in a blocked range.
    #[error("URL resolves to private or reserved address {0}")]
    PrivateAddress(IpAddr),
}

impl UnsafeReason {
    /// Stable machine-readable label.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TooLong { .. } => "TooLong",
            Self::Malformed(_) => "Malformed",
            Self::BadScheme(_) => "BadScheme",
            Self::NoHost => "NoHost",
            Self::ResolutionFailed { .. } => "ResolutionFailed",
            Self::PrivateAddress(_) => "PrivateAddress",
        }
    }
}

/// Guard settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Maximum accepted URL length in characters.
    pub max_url_length: usize,

    /// Skip the blocked-range check. Intended for local testing only.
    pub allow_private: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self { max_url_length: 2048, allow_private: false }
    }
}

/// Hostname resolution seam.
pub trait Resolver: Send + Sync + fmt::Debug + 'static {
    /// Resolves `host` to one or more addresses.
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>> {
        let host = host.to_owned();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), port)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Resolver with scripted answers.
///
/// Each host has a queue of answers; every lookup consumes the front answer
/// until only one remains, which is then returned forever. Unknown hosts fail
/// to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    answers: Arc<Mutex<HashMap<String, Vec<Vec<IpAddr>>>>>,
}

impl StaticResolver {
    /// Creates a resolver that knows no hosts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an answer for `host`.
    #[must_use]
    pub fn answer(self, host: &str, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        if let Ok(mut answers) = self.answers.lock() {
            answers.entry(host.to_ascii_lowercase()).or_default().push(addrs.into_iter().collect());
        }
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(
        &self,
        host: &str,
        _port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send + '_>> {
        let found = self.answers.lock().ok().and_then(|mut answers| {
            let queue = answers.get_mut(&host.to_ascii_lowercase())?;
            if queue.len() > 1 {
                Some(queue.remove(0))
            } else {
                queue.first().cloned()
            }
        });
        let host = host.to_owned();
        Box::pin(async move {
            found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
        })
    }
}

/// A URL that passed validation, with the addresses it was validated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedUrl {
    /// Parsed URL.
    pub url: Url,
    /// Hostname when the URL names a domain; `None` for IP literals.
    pub domain: Option<String>,
    /// Validated socket addresses.
    pub addrs: Vec<SocketAddr>,
}

/// SSRF guard for callback URLs.
#[derive(Debug, Clone)]
pub struct UrlGuard {
    config: GuardConfig,
    resolver: Arc<dyn Resolver>,
}

impl UrlGuard {
    /// Creates a guard using the system resolver.
    pub fn new(config: GuardConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    /// Creates a guard with a custom resolver.
    pub fn with_resolver(config: GuardConfig, resolver: Arc<dyn Resolver>) -> Self {
        Self { config, resolver }
    }

    /// Returns the guard settings.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Validates `raw` and resolves its host.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as an [`UnsafeReason`].
    pub async fn check(&self, raw: &str) -> Result<VettedUrl, UnsafeReason> {
        let length = raw.chars().count();
        if length > self.config.max_url_length {
            return Err(UnsafeReason::TooLong { length, max: self.config.max_url_length });
        }

        let url = parse(raw)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UnsafeReason::BadScheme(url.scheme().to_string()));
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let (domain, ips) = match url.host() {
            None => return Err(UnsafeReason::NoHost),
            Some(Host::Domain(domain)) if domain.is_empty() => return Err(UnsafeReason::NoHost),
            Some(Host::Domain(domain)) => {
                let ips = self.resolver.resolve(domain, port).await.map_err(|e| {
                    UnsafeReason::ResolutionFailed { host: domain.to_string(), message: e.to_string() }
                })?;
                if ips.is_empty() {
                    return Err(UnsafeReason::ResolutionFailed {
                        host: domain.to_string(),
                        message: "no addresses returned".to_string(),
                    });
                }
                (Some(domain.to_string()), ips)
            },
            Some(Host::Ipv4(ip)) => (None, vec![IpAddr::V4(ip)]),
            Some(Host::Ipv6(ip)) => (None, vec![IpAddr::V6(ip)]),
        };

        if !self.config.allow_private {
            if let Some(blocked) = ips.iter().copied().find(|ip| is_blocked(*ip)) {
                debug!(url = raw, address = %blocked, "callback URL resolves to blocked address");
                return Err(UnsafeReason::PrivateAddress(blocked));
            }
        }

        Ok(VettedUrl {
            addrs: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
            domain,
            url,
        })
    }
}

fn parse(raw: &str) -> Result<Url, UnsafeReason> {
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(err) => {
            // Report a disallowed scheme ahead of structural problems.
            if let Some((scheme, _)) = raw.split_once(':') {
                let scheme = scheme.to_ascii_lowercase();
                let looks_like_scheme = !scheme.is_empty()
                    && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
                if looks_like_scheme && scheme != "http" && scheme != "https" {
                    return Err(UnsafeReason::BadScheme(scheme));
                }
            }
            match err {
                url::ParseError::EmptyHost => Err(UnsafeReason::NoHost),
                other => Err(UnsafeReason::Malformed(other.to_string())),
            }
        },
    }
}

/// Whether an address falls in a range callbacks may never reach.
pub fn is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

const METADATA_V4: [Ipv4Addr; 2] =
    [Ipv4Addr::new(169, 254, 169, 254), Ipv4Addr::new(100, 100, 100, 200)];

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xc0) == 64)
        || METADATA_V4.contains(&ip)
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // fec0::/10 deprecated site local
        || (first & 0xffc0) == 0xfec0
        // ::/96 IPv4-compatible
        || (ip.segments()[..6].iter().all(|s| *s == 0) && ip.to_ipv4().is_some_and(is_blocked_v4))
        // fd00:ec2::254 AWS metadata over IPv6
        || ip == Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(allow_private: bool) -> UrlGuard {
        let resolver = StaticResolver::new()
            .answer("public.example", [IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
            .answer("internal.example", [IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))])
            .answer(
                "mixed.example",
                [IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), IpAddr::V4(Ipv4Addr::LOCALHOST)],
            );
        UrlGuard::with_resolver(
            GuardConfig { max_url_length: 2048, allow_private },
            Arc::new(resolver),
        )
    }

    #[tokio::test]
    async fn public_host_is_safe() {
        let vetted = guard(false).check("https://public.example/hook?x=1").await.unwrap();
        assert_eq!(vetted.domain.as_deref(), Some("public.example"));
        assert_eq!(vetted.addrs, vec!["93.184.216.34:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn explicit_port_is_carried_into_addresses() {
        let vetted = guard(false).check("http://public.example:8080/").await.unwrap();
        assert_eq!(vetted.addrs[0].port(), 8080);
    }

    #[tokio::test]
    async fn metadata_address_is_blocked() {
        let err = guard(false).check("http://169.254.169.254/latest/meta-data/").await.unwrap_err();
        assert_eq!(err, UnsafeReason::PrivateAddress("169.254.169.254".parse().unwrap()));
    }

    #[tokio::test]
    async fn any_private_answer_blocks_the_url() {
        let err = guard(false).check("http://mixed.example/").await.unwrap_err();
        assert_eq!(err.code(), "PrivateAddress");

        let err = guard(false).check("http://internal.example/").await.unwrap_err();
        assert_eq!(err.code(), "PrivateAddress");
    }

    #[tokio::test]
    async fn allow_private_skips_range_check_only() {
        let guard = guard(true);
        assert!(guard.check("http://127.0.0.1:9000/cb").await.is_ok());
        assert!(guard.check("http://internal.example/").await.is_ok());

        let err = guard.check("ftp://public.example/").await.unwrap_err();
        assert_eq!(err.code(), "BadScheme");
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        let guard = guard(false);

        let long = format!("http://public.example/{}", "a".repeat(2048));
        assert_eq!(guard.check(&long).await.unwrap_err().code(), "TooLong");

        assert_eq!(guard.check("javascript:alert(1)").await.unwrap_err().code(), "BadScheme");
        assert_eq!(guard.check("file:///etc/passwd").await.unwrap_err().code(), "BadScheme");
        assert_eq!(guard.check("gopher://").await.unwrap_err().code(), "BadScheme");
        assert_eq!(guard.check("http://").await.unwrap_err().code(), "NoHost");
        assert_eq!(guard.check("not a url").await.unwrap_err().code(), "Malformed");
        assert_eq!(
            guard.check("http://nowhere.example/").await.unwrap_err().code(),
            "ResolutionFailed"
        );
    }

    #[tokio::test]
    async fn resolution_is_repeated_on_every_check() {
        let resolver = StaticResolver::new()
            .answer("rebind.example", [IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
            .answer("rebind.example", [IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))]);
        let guard = UrlGuard::with_resolver(GuardConfig::default(), Arc::new(resolver));

        assert!(guard.check("http://rebind.example/").await.is_ok());
        let err = guard.check("http://rebind.example/").await.unwrap_err();
        assert_eq!(err, UnsafeReason::PrivateAddress("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn blocked_ranges() {
        for ip in [
            "127.0.0.1",
            "127.255.0.9",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "169.254.0.1",
            "0.0.0.0",
            "0.1.2.3",
            "100.64.0.1",
            "100.100.100.200",
            "255.255.255.255",
            "::1",
            "::",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
            "::ffff:127.0.0.1",
            "::ffff:169.254.169.254",
            "::ffff:10.0.0.1",
            "fd00:ec2::254",
        ] {
            assert!(is_blocked(ip.parse().unwrap()), "{ip} should be blocked");
        }
    }

    #[test]
    fn public_ranges() {
        for ip in ["8.8.8.8", "93.184.216.34", "172.32.0.1", "100.128.0.1", "2606:4700::1111", "::ffff:8.8.8.8"] {
            assert!(!is_blocked(ip.parse().unwrap()), "{ip} should be allowed");
        }
    }
}
