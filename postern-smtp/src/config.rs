use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use cidr::IpCidr;
use serde::Deserialize;

/// Whether relaying requires SMTP AUTH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum AuthRequired {
    /// No authentication, AUTH is not offered
    #[default]
    Disabled,
    /// Relaying requires authentication. AUTH is offered to clients
    /// outside `authorized_addresses`.
    Required,
    /// As `Required`, but AUTH is offered to every client.
    Announce,
}

impl AuthRequired {
    pub const fn enforced(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "defaults::listen")]
    pub listen: SocketAddr,
    #[serde(default = "defaults::hostname")]
    pub hostname: String,
    #[serde(default = "defaults::software")]
    pub software: String,
    #[serde(default)]
    pub auth_required: AuthRequired,
    /// Clients in these networks may relay without authenticating
    #[serde(default)]
    pub authorized_addresses: Vec<IpCidr>,
    /// Kilobytes, 0 for unlimited
    #[serde(default)]
    pub max_message_size: usize,
    #[serde(default = "defaults::enabled")]
    pub helo_ehlo_enforcement: bool,
    /// Authenticated users may only send as themselves
    #[serde(default)]
    pub verify_identity: bool,
    /// Seconds a client may stay idle
    #[serde(default = "defaults::connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default)]
    pub local_domains: Vec<String>,
}

mod defaults {
    use std::net::SocketAddr;

    pub fn listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 25))
    }

    pub fn hostname() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("localhost"))
    }

    pub fn software() -> String {
        format!("postern {}", env!("CARGO_PKG_VERSION"))
    }

    pub const fn enabled() -> bool {
        true
    }

    pub const fn connection_timeout() -> u64 {
        360
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            hostname: defaults::hostname(),
            software: defaults::software(),
            auth_required: AuthRequired::default(),
            authorized_addresses: Vec::default(),
            max_message_size: 0,
            helo_ehlo_enforcement: defaults::enabled(),
            verify_identity: false,
            connection_timeout: defaults::connection_timeout(),
            local_domains: Vec::default(),
        }
    }
}

impl SmtpConfig {
    pub fn max_message_bytes(&self) -> Option<usize> {
        (self.max_message_size > 0).then(|| self.max_message_size.saturating_mul(1024))
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains
            .iter()
            .any(|local| local.eq_ignore_ascii_case(domain))
    }

    pub fn is_authorized(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            IpAddr::V4(_) => ip,
        };

        self.authorized_addresses
            .iter()
            .any(|network| network.contains(&ip))
    }

    /// Whether EHLO should list AUTH for this client.
    pub fn offers_auth(&self, ip: IpAddr) -> bool {
        match self.auth_required {
            AuthRequired::Disabled => false,
            AuthRequired::Required => !self.is_authorized(ip),
            AuthRequired::Announce => true,
        }
    }
}
