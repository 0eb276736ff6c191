//! Finding the servers that accept mail for a domain.
//!
//! MX records are used when present, sorted by preference. A domain without
//! MX records is its own mail server (RFC 5321 section 5.1), so its A and
//! AAAA records are used instead. Results are cached by record TTL, bounded
//! to keep both hot and stale domains sensible.

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider, proto::rr::Record,
};
use postern_common::internal;
use serde::Deserialize;

use crate::DnsError;

pub const SMTP_PORT: u16 = 25;

/// TTL used when a lookup carries no records to take one from
const FALLBACK_TTL: u32 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailServer {
    pub host: String,
    /// Lower is preferred
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }

    /// Parse `host` or `host:port`.
    pub fn parse(address: &str) -> Result<Self, DnsError> {
        let address = address.trim();
        let invalid = || DnsError::InvalidGateway(address.to_string());

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                (host, port.parse::<u16>().map_err(|_| invalid())?)
            }
            _ => (address, SMTP_PORT),
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(host, 0, port))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolves a recipient domain to the servers to try, best first.
#[async_trait]
pub trait MxResolver: Send + Sync + Debug {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// MX resolution through the system's DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(FALLBACK_TTL);

                let mut servers = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(host.trim_end_matches('.'), mx.preference(), SMTP_PORT)
                    })
                    .collect::<Vec<_>>();

                if servers.is_empty() {
                    return self.lookup_addresses(domain).await;
                }

                servers.sort_by_key(|server| server.priority);
                Ok((servers, ttl))
            }
            Err(err) if err.is_no_records_found() => {
                internal!("No MX records for {domain}, trying A/AAAA");
                self.lookup_addresses(domain).await
            }
            Err(err) => {
                internal!(level = WARN, "MX lookup for {domain} failed: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    async fn lookup_addresses(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(Record::ttl)
                    .min()
                    .unwrap_or(FALLBACK_TTL);

                let servers = lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, SMTP_PORT))
                    .collect::<Vec<_>>();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, ttl))
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let key = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > Instant::now()
        {
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, ttl) = self.lookup(&key).await?;
        let servers = Arc::new(servers);

        let ttl = u64::from(ttl).clamp(self.config.min_cache_ttl_secs, self.config.max_cache_ttl_secs);
        self.cache.insert(
            key,
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );

        internal!(
            "Resolved {domain} to {} server(s), cached for {ttl}s",
            servers.len()
        );
        Ok(servers)
    }
}

/// Sends everything to a fixed list of servers, whatever the domain.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    servers: Arc<Vec<MailServer>>,
}

impl StaticResolver {
    pub fn new(servers: Vec<MailServer>) -> Self {
        Self {
            servers: Arc::new(servers),
        }
    }

    /// Servers given as `host` or `host:port`, in order of preference.
    pub fn from_addresses<S: AsRef<str>>(addresses: &[S]) -> Result<Self, DnsError> {
        let servers = addresses
            .iter()
            .zip(0_u16..)
            .map(|(address, priority)| {
                MailServer::parse(address.as_ref()).map(|server| MailServer {
                    priority,
                    ..server
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(servers))
    }
}

#[async_trait]
impl MxResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if self.servers.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        Ok(Arc::clone(&self.servers))
    }
}
