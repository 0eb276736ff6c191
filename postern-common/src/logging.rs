use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Emits an event inside a span named after the traffic direction.
#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Lines written to a peer.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Lines read from a peer.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

/// Everything that is not wire traffic.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level used when `LOG_LEVEL` is not set
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default = "defaults::ansi")]
    pub ansi: bool,
}

mod defaults {
    pub const fn ansi() -> bool {
        true
    }
}

fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// Resolve the effective level. `LOG_LEVEL` wins over the configured value,
/// and anything unparsable falls back to the build default.
pub fn resolve_level(env: Option<&str>, configured: Option<&str>) -> LevelFilter {
    let default = default_level();

    env.or(configured).map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

pub fn init(config: &LoggingConfig) {
    let env = std::env::var("LOG_LEVEL").ok();
    let level = resolve_level(env.as_deref(), config.level.as_deref());

    let result = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(config.ansi)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("postern")
                })),
        )
        .try_init();

    if let Err(err) = result {
        eprintln!("Logging already initialised: {err}");
    }
}
