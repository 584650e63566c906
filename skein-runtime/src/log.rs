//! Logging Infrastructure
//!
//! The runtime logs through `tracing`; this module installs a
//! `tracing-subscriber` fmt layer configured from [`LogConfig`].
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_runtime::{config::LogConfig, log, LogLevel};
//!
//! let config = LogConfig { level: LogLevel::Debug, ..LogConfig::default() };
//! log::init(&config);
//! tracing::info!("runtime started");
//! ```
//!
//! Installing a subscriber is process-wide and happens at most once. Later
//! calls leave the existing subscriber in place.

use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::{LogConfig, LogLevel};

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install the global subscriber, ignoring one that is already installed.
pub fn init(config: &LogConfig) {
    let _ = try_init(config);
}

/// Install the global subscriber.
///
/// Fails if another subscriber was installed first.
pub fn try_init(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = LevelFilter::from(config.level);
    Registry::default()
        .with(fmt_layer(config).with_filter(filter))
        .try_init()
}

fn fmt_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(config.targets)
        .with_thread_names(true);
    match (config.compact, config.timestamps) {
        (true, true) => layer.compact().boxed(),
        (true, false) => layer.compact().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}
