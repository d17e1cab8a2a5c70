//! Campaign targets: `host` or `host:port`, resolved once at campaign start.

use crate::error::CampaignError;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Upper bound on a single resolver lookup.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    /// Parse `host`, `host:port`, `ip`, or `[v6]:port`.
    pub fn parse(raw: &str) -> Result<Self, CampaignError> {
        let raw = raw.trim();
        let invalid = |reason: &str| CampaignError::InvalidTarget {
            target: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty target"));
        }
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            if addr.port() == 0 {
                return Err(invalid("port must be within 1..=65535"));
            }
            return Ok(Self {
                host: addr.ip().to_string(),
                port: Some(addr.port()),
            });
        }
        if raw.parse::<IpAddr>().is_ok() {
            return Ok(Self {
                host: raw.to_string(),
                port: None,
            });
        }

        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| invalid("port is not a number within 1..=65535"))?;
                if port == 0 {
                    return Err(invalid("port must be within 1..=65535"));
                }
                if host.is_empty() || host.contains(':') {
                    return Err(invalid("malformed host"));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: Some(port),
                })
            }
            None => Ok(Self {
                host: raw.to_string(),
                port: None,
            }),
        }
    }

    /// Resolve the host through the OS resolver, preferring IPv4 because raw
    /// emission is IPv4-only.
    pub async fn resolve(&self) -> Result<IpAddr, CampaignError> {
        self.resolve_within(RESOLVE_TIMEOUT).await
    }

    /// [`resolve`](Self::resolve) with an explicit deadline. Expiry counts as
    /// unresolvable.
    pub async fn resolve_within(&self, limit: Duration) -> Result<IpAddr, CampaignError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let unresolvable = |reason: String| CampaignError::Unresolvable {
            target: self.to_string(),
            reason,
        };

        let addrs: Vec<SocketAddr> =
            within(limit, tokio::net::lookup_host((self.host.as_str(), 0)))
                .await
                .map_err(unresolvable)?
                .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| unresolvable("no addresses returned".to_string()))
    }
}

async fn within<T>(
    limit: Duration,
    lookup: impl Future<Output = io::Result<T>>,
) -> Result<T, String> {
    match tokio::time::timeout(limit, lookup).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("lookup timed out after {limit:?}")),
    }
}

/// A target after resolution: what the factory and emitter address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub address: IpAddr,
    /// Port from the target string; overrides profile ports when set.
    pub port: Option<u16>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.host.contains(':')) {
            (Some(port), true) => write!(f, "[{}]:{}", self.host, port),
            (Some(port), false) => write!(f, "{}:{}", self.host, port),
            (None, _) => f.write_str(&self.host),
        }
    }
}

/// Local address the OS would use to reach `destination`, found with a
/// connected UDP socket (no packets are sent).
pub async fn local_address_for(destination: IpAddr) -> IpAddr {
    let (bind, unspecified): (SocketAddr, IpAddr) = match destination {
        IpAddr::V4(_) => (
            (Ipv4Addr::UNSPECIFIED, 0).into(),
            Ipv4Addr::UNSPECIFIED.into(),
        ),
        IpAddr::V6(_) => (
            (Ipv6Addr::UNSPECIFIED, 0).into(),
            Ipv6Addr::UNSPECIFIED.into(),
        ),
    };

    let route = async {
        let socket = tokio::net::UdpSocket::bind(bind).await?;
        socket.connect((destination, 9)).await?;
        socket.local_addr()
    };
    match route.await {
        Ok(addr) => addr.ip(),
        Err(e) => {
            tracing::debug!(%destination, error = %e, "No route for local address lookup");
            unspecified
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            Target::parse("192.168.1.1").unwrap(),
            Target {
                host: "192.168.1.1".to_string(),
                port: None
            }
        );
        assert_eq!(Target::parse("10.0.0.2:8080").unwrap().port, Some(8080));
        assert_eq!(Target::parse("example.test:443").unwrap().host, "example.test");
        assert_eq!(Target::parse("[::1]:80").unwrap().host, "::1");
        assert_eq!(Target::parse("::1").unwrap().port, None);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("host:0").is_err());
        assert!(Target::parse("host:99999").is_err());
        assert!(Target::parse(":80").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for raw in ["10.0.0.1:53", "lab.local", "[::1]:8443"] {
            assert_eq!(Target::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[tokio::test]
    async fn test_resolve_literal_and_failure() {
        let t = Target::parse("127.0.0.1:9").unwrap();
        assert_eq!(t.resolve().await.unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let bogus = Target::parse("does-not-exist.invalid").unwrap();
        assert!(matches!(
            bogus.resolve().await,
            Err(CampaignError::Unresolvable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lookup_times_out() {
        let err = within(Duration::from_secs(5), std::future::pending::<io::Result<()>>())
            .await
            .unwrap_err();
        assert!(err.contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn test_resolve_within_zero_deadline() {
        let slow = Target::parse("resolver-deadline.invalid").unwrap();
        assert!(matches!(
            slow.resolve_within(Duration::ZERO).await,
            Err(CampaignError::Unresolvable { .. })
        ));

        // literals never touch the resolver
        let literal = Target::parse("10.1.2.3").unwrap();
        assert!(literal.resolve_within(Duration::ZERO).await.is_ok());
    }
}
