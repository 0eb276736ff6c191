use serde::Deserialize;

use crate::{RetrySchedule, dns::DnsConfig};

/// ```text
/// delivery: (
///     delay_time: ["5 minutes", "2*30 minutes", "6 hours"],
///     max_retries: 5,
///     sendpartial: true,
///     gateway: ["smarthost.example:587"],
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub delay_time: RetrySchedule,

    /// Failed attempts after which the mail is bounced
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Deliver to the recipients a server accepted even when it refuses others
    #[serde(default)]
    pub sendpartial: bool,

    #[serde(default = "defaults::delivery_threads")]
    pub delivery_threads: usize,

    /// Seconds to wait for each reply from a remote server
    #[serde(default = "defaults::timeout")]
    pub timeout: u64,

    /// Relay everything through these servers instead of looking up MX records
    #[serde(default)]
    pub gateway: Vec<String>,

    #[serde(default)]
    pub dns: DnsConfig,
}

mod defaults {
    pub const fn max_retries() -> u32 {
        5
    }

    pub const fn delivery_threads() -> usize {
        1
    }

    pub const fn timeout() -> u64 {
        180
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            delay_time: RetrySchedule::default(),
            max_retries: defaults::max_retries(),
            sendpartial: false,
            delivery_threads: defaults::delivery_threads(),
            timeout: defaults::timeout(),
            gateway: Vec::new(),
            dns: DnsConfig::default(),
        }
    }
}
