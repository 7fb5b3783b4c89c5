//! Public address lookup
//!
//! The node learns its public IPv4 and IPv6 addresses from two "what is my
//! IP" echo endpoints. Results are cached so inbound directory requests do
//! not each wait on two outbound HTTP calls.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::peer::IPV6_NONE;

/// Per-request cap, kept below the peers' read deadlines
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Addresses advertised in the local node's record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicAddresses {
    /// Public IPv4, empty if unknown
    pub ipv4: String,
    /// Public IPv6, or `"none"`
    pub ipv6: String,
}

impl PublicAddresses {
    /// Interpret the raw bodies of the two echo lookups
    ///
    /// The IPv6 answer only counts when it is a real IPv6 address (not an
    /// IPv4-mapped one) and differs from the IPv4 answer. Dual-stack echo
    /// services fall back to IPv4 when the host has no IPv6 route.
    pub fn from_lookups(ipv4_raw: &str, ipv6_raw: &str) -> Self {
        let ipv4 = ipv4_raw.trim();
        let ipv4 = match ipv4.parse::<IpAddr>() {
            Ok(_) => ipv4.to_string(),
            Err(_) => String::new(),
        };

        let ipv6_raw = ipv6_raw.trim();
        let ipv6 = match ipv6_raw.parse::<Ipv6Addr>() {
            Ok(addr) if addr.to_ipv4_mapped().is_none() && ipv6_raw != ipv4 => addr.to_string(),
            _ => IPV6_NONE.to_string(),
        };

        Self { ipv4, ipv6 }
    }

    pub fn unknown() -> Self {
        Self {
            ipv4: String::new(),
            ipv6: IPV6_NONE.to_string(),
        }
    }
}

#[derive(Debug)]
enum Source {
    Http {
        client: reqwest::Client,
        ipv4_url: String,
        ipv6_url: String,
    },
    Fixed(PublicAddresses),
}

#[derive(Debug)]
struct Shared {
    source: Source,
    ttl: Duration,
    cache: RwLock<Option<(Instant, PublicAddresses)>>,
    refreshing: AtomicBool,
}

impl Shared {
    /// Run both lookups and store the result
    async fn refresh(&self) -> PublicAddresses {
        let addrs = match &self.source {
            Source::Fixed(addrs) => return addrs.clone(),
            Source::Http {
                client,
                ipv4_url,
                ipv6_url,
            } => {
                let (raw4, raw6) = tokio::join!(
                    fetch_public_ip(client, ipv4_url),
                    fetch_public_ip(client, ipv6_url)
                );
                PublicAddresses::from_lookups(&raw4, &raw6)
            }
        };

        if addrs.ipv4.is_empty() {
            warn!(target: "bootstrap", "Public IPv4 lookup failed");
        } else {
            debug!(target: "bootstrap", ipv4 = %addrs.ipv4, ipv6 = %addrs.ipv6, "Resolved public address");
        }

        *self.cache.write().await = Some((Instant::now(), addrs.clone()));
        addrs
    }
}

/// Cached public address resolver
///
/// Only the first lookup is awaited by the caller. Afterwards the cached
/// value is served immediately and refreshed in the background once it is
/// older than the TTL.
#[derive(Debug, Clone)]
pub struct PublicAddressResolver {
    shared: Arc<Shared>,
}

impl PublicAddressResolver {
    fn with_source(source: Source, ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                ttl,
                cache: RwLock::new(None),
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Resolve through the given echo endpoints, caching results for `ttl`
    pub fn http(
        ipv4_url: impl Into<String>,
        ipv6_url: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(LOOKUP_TIMEOUT)
            .timeout(LOOKUP_TIMEOUT)
            .build()?;
        Ok(Self::with_source(
            Source::Http {
                client,
                ipv4_url: ipv4_url.into(),
                ipv6_url: ipv6_url.into(),
            },
            ttl,
        ))
    }

    /// Always answer with `addrs`, without network access
    pub fn fixed(addrs: PublicAddresses) -> Self {
        Self::with_source(Source::Fixed(addrs), Duration::ZERO)
    }

    /// Current public addresses
    ///
    /// Waits on the network only when nothing has been resolved yet.
    pub async fn current(&self) -> PublicAddresses {
        if let Source::Fixed(addrs) = &self.shared.source {
            return addrs.clone();
        }

        let cached = self.shared.cache.read().await.clone();
        match cached {
            Some((at, addrs)) => {
                if at.elapsed() >= self.shared.ttl {
                    self.refresh_in_background();
                }
                addrs
            }
            None => self.shared.refresh().await,
        }
    }

    /// Last resolved addresses, without any lookup
    pub async fn cached(&self) -> Option<PublicAddresses> {
        match &self.shared.source {
            Source::Fixed(addrs) => Some(addrs.clone()),
            Source::Http { .. } => self
                .shared
                .cache
                .read()
                .await
                .as_ref()
                .map(|(_, addrs)| addrs.clone()),
        }
    }

    fn refresh_in_background(&self) {
        if self.shared.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.refresh().await;
            shared.refreshing.store(false, Ordering::Release);
        });
    }
}

/// Body of an echo endpoint if it is an IP address, else empty
async fn fetch_public_ip(client: &reqwest::Client, url: &str) -> String {
    let body = match client.get(url).send().await {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(target: "bootstrap", url, error = %e, "Echo endpoint body unreadable");
                return String::new();
            }
        },
        Err(e) => {
            debug!(target: "bootstrap", url, error = %e, "Echo endpoint unreachable");
            return String::new();
        }
    };

    let ip = body.trim();
    if ip.parse::<IpAddr>().is_ok() {
        ip.to_string()
    } else {
        String::new()
    }
}
