//! When an outgoing mail may be tried again.
//!
//! Delays are written as `[count*]amount[unit]`, e.g. `"500ms"`,
//! `"2*5 minutes"` or `"1 hour"`. A bare number is in milliseconds. The
//! n-th retry waits for the n-th delay, and the last delay repeats once
//! the list runs out.

use std::time::{Duration, SystemTime};

use postern_common::mail::Mail;
use postern_spool::AcceptFilter;
use serde::Deserialize;
use thiserror::Error;

/// Attribute holding how many delivery attempts have failed so far
pub const RETRY_COUNT: &str = "delivery.retry-count";

const DEFAULT_DELAY: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("Invalid delay '{0}'")]
    Invalid(String),

    #[error("Unknown time unit '{unit}' in delay '{delay}'")]
    UnknownUnit { delay: String, unit: String },
}

pub fn retry_count(mail: &Mail) -> u32 {
    mail.attribute(RETRY_COUNT)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

fn unit(delay: &str, unit: &str) -> Result<Duration, RetryError> {
    Ok(match unit.to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => Duration::from_millis(1),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(60),
        "h" | "hour" | "hours" => Duration::from_secs(60 * 60),
        "d" | "day" | "days" => Duration::from_secs(24 * 60 * 60),
        _ => {
            return Err(RetryError::UnknownUnit {
                delay: delay.to_string(),
                unit: unit.to_string(),
            });
        }
    })
}

/// Parse one delay entry into `count` copies of its duration.
fn parse_delay(delay: &str) -> Result<(usize, Duration), RetryError> {
    let invalid = || RetryError::Invalid(delay.to_string());

    let (count, rest) = match delay.split_once('*') {
        Some((count, rest)) => (count.trim().parse::<usize>().map_err(|_| invalid())?, rest),
        None => (1, delay),
    };

    let rest = rest.trim();
    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let amount = rest[..digits].parse::<u32>().map_err(|_| invalid())?;

    Ok((count, unit(delay, rest[digits..].trim())? * amount))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![DEFAULT_DELAY],
        }
    }
}

impl TryFrom<Vec<String>> for RetrySchedule {
    type Error = RetryError;

    fn try_from(delays: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse(&delays)
    }
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            Self::default()
        } else {
            Self { delays }
        }
    }

    pub fn parse<S: AsRef<str>>(delays: &[S]) -> Result<Self, RetryError> {
        let mut expanded = Vec::new();

        for delay in delays {
            let (count, duration) = parse_delay(delay.as_ref())?;
            expanded.extend(std::iter::repeat_n(duration, count));
        }

        Ok(Self::new(expanded))
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// How long to wait after the `retries`-th failed attempt. The first
    /// attempt does not wait.
    pub fn delay(&self, retries: u32) -> Duration {
        let Some(index) = usize::try_from(retries).ok().and_then(|r| r.checked_sub(1)) else {
            return Duration::ZERO;
        };

        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(DEFAULT_DELAY)
    }
}

/// An outgoing mail is ready once its last attempt is far enough behind.
impl AcceptFilter for RetrySchedule {
    fn wait_time(&self, mail: &Mail, now: SystemTime) -> Duration {
        let ready_at = mail.last_updated + self.delay(retry_count(mail));
        ready_at.duration_since(now).unwrap_or(Duration::ZERO)
    }
}
