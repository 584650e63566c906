//! Runtime Configuration
//!
//! This module provides configuration for the Skein runtime.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SKEIN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SKEIN_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SKEIN_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `SKEIN_MAX_OPS_BEFORE_YIELD` | Interpreter steps before a fiber yields | 2048 |
//! | `SKEIN_INTERRUPTIBLE` | Whether fibers start interruptible | true |
//! | `SKEIN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `SKEIN_LOG_TIMESTAMPS` | Include timestamps in log output | true |
//!
//! # Example
//!
//! ```rust
//! use skein_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//! assert!(config.scheduler.num_workers >= 1);
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops_before_yield(512)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.fiber.max_ops_before_yield, 512);
//! ```

use std::env;

use thiserror::Error;

use crate::fiber::FiberSettings;
use crate::flags::RuntimeFlags;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            work_stealing: true,
        }
    }
}

/// Fiber configuration.
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Interpreter steps a fiber may run before yielding to the scheduler.
    /// Default: 2048.
    pub max_ops_before_yield: usize,

    /// Whether fibers start out interruptible.
    /// Default: true.
    pub interruptible: bool,

    /// Whether fibers yield after `max_ops_before_yield` steps.
    /// Default: true.
    pub cooperative_yielding: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            max_ops_before_yield: 2048,
            interruptible: true,
            cooperative_yielding: true,
        }
    }
}

impl FiberConfig {
    /// The flags a fresh fiber starts with.
    pub fn initial_flags(&self) -> RuntimeFlags {
        let mut flags = RuntimeFlags::NONE;
        if self.interruptible {
            flags = flags.enable(RuntimeFlags::INTERRUPTION);
        }
        if self.cooperative_yielding {
            flags = flags.enable(RuntimeFlags::COOPERATIVE_YIELDING);
        }
        flags
    }

    pub(crate) fn settings(&self) -> FiberSettings {
        FiberSettings {
            max_ops_before_yield: self.max_ops_before_yield,
            initial_flags: self.initial_flags(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include the event target (module path) in log output.
    /// Default: false (only in debug builds).
    pub targets: bool,

    /// Use the compact single-line format instead of the full one.
    /// Default: true.
    pub compact: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            targets: cfg!(debug_assertions),
            compact: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Fiber configuration.
    pub fiber: FiberConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or hold invalid values, keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("SKEIN_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("SKEIN_MAX_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.fiber.max_ops_before_yield = val;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_INTERRUPTIBLE") {
            config.fiber.interruptible = val;
        }

        if let Ok(val) = env::var("SKEIN_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Some(val) = parse_env_bool("SKEIN_LOG_TIMESTAMPS") {
            config.log.timestamps = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.fiber.max_ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fiber.max_ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set how many interpreter steps a fiber runs before yielding.
    pub fn max_ops_before_yield(mut self, ops: usize) -> Self {
        self.config.fiber.max_ops_before_yield = ops;
        self
    }

    /// Set whether fibers start interruptible.
    pub fn interruptible(mut self, enabled: bool) -> Self {
        self.config.fiber.interruptible = enabled;
        self
    }

    /// Enable or disable cooperative yielding.
    pub fn cooperative_yielding(mut self, enabled: bool) -> Self {
        self.config.fiber.cooperative_yielding = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable log timestamps.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert!(config.scheduler.work_stealing);
        assert_eq!(config.fiber.max_ops_before_yield, 2048);
        assert_eq!(config.fiber.initial_flags(), RuntimeFlags::DEFAULT);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_ops_before_yield(64)
            .interruptible(false)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.fiber.max_ops_before_yield, 64);
        assert!(!config.fiber.initial_flags().interruptible());
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().max_ops_before_yield(0).build().is_err());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_settings_follow_config() {
        let config = RuntimeConfig::builder()
            .cooperative_yielding(false)
            .max_ops_before_yield(10)
            .build()
            .unwrap();
        let settings = config.fiber.settings();
        assert_eq!(settings.max_ops_before_yield, 10);
        assert!(!settings.initial_flags.cooperative_yielding());
        assert!(settings.initial_flags.interruptible());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("SKEIN_NUM_WORKERS");
        env::remove_var("SKEIN_MAX_OPS_BEFORE_YIELD");

        let config = RuntimeConfig::from_env();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.fiber.max_ops_before_yield, 2048);
    }
}
