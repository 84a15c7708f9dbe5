//! Runtime Configuration
//!
//! Configuration for the effect runtime. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `EFFECT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EFFECT_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `EFFECT_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `EFFECT_THREAD_NAME` | Prefix for runtime thread names | effect-worker |
//! | `EFFECT_YIELD_OP_COUNT` | Instructions a fiber runs before yielding | 2048 |
//! | `EFFECT_REPORT_UNHANDLED` | Log failures no one observed ("true"/"false") | true |
//! | `EFFECT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use effect_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .yield_op_count(512)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.scheduler.num_workers, 4);
//! ```

use std::env;
use std::str::FromStr;

use thiserror::Error;

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

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            other => Err(ConfigError::EnvParse {
                var: "log level".into(),
                message: format!("unknown level '{}'", other),
            }),
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

    /// Prefix for worker and timer thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            work_stealing: true,
            thread_name_prefix: "effect-worker".to_string(),
        }
    }
}

/// Fiber execution configuration.
#[derive(Debug, Clone)]
pub struct FiberConfig {
    /// Instructions a fiber evaluates before yielding its worker.
    /// Default: 2048.
    pub yield_op_count: usize,

    /// Log fibers that fail without anyone observing the failure.
    /// Default: true.
    pub report_unhandled_failures: bool,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            yield_op_count: 2048,
            report_unhandled_failures: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level, used when `RUST_LOG` is not set.
    pub level: LogLevel,

    /// Emit ANSI colors.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            ansi: true,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Fiber settings.
    pub fiber: FiberConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("EFFECT_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_bool("EFFECT_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Ok(val) = env::var("EFFECT_THREAD_NAME") {
            if !val.is_empty() {
                config.scheduler.thread_name_prefix = val;
            }
        }

        if let Some(val) = parse_env_usize("EFFECT_YIELD_OP_COUNT") {
            if val > 0 {
                config.fiber.yield_op_count = val;
            }
        }

        if let Some(val) = parse_env_bool("EFFECT_REPORT_UNHANDLED") {
            config.fiber.report_unhandled_failures = val;
        }

        if let Ok(val) = env::var("EFFECT_LOG_LEVEL") {
            if let Ok(level) = val.parse() {
                config.log.level = level;
            }
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

        if self.scheduler.thread_name_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.thread_name_prefix".into(),
                message: "must not be empty".into(),
            });
        }

        if self.fiber.yield_op_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fiber.yield_op_count".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
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
    EnvParse {
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

    /// Set the thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.scheduler.thread_name_prefix = prefix.into();
        self
    }

    /// Set how many instructions a fiber runs before yielding.
    pub fn yield_op_count(mut self, ops: usize) -> Self {
        self.config.fiber.yield_op_count = ops;
        self
    }

    /// Enable or disable reporting of unobserved fiber failures.
    pub fn report_unhandled_failures(mut self, enabled: bool) -> Self {
        self.config.fiber.report_unhandled_failures = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable ANSI colors in log output.
    pub fn log_ansi(mut self, enabled: bool) -> Self {
        self.config.log.ansi = enabled;
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
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}

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
        assert_eq!(config.fiber.yield_op_count, 2048);
        assert!(config.fiber.report_unhandled_failures);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .yield_op_count(64)
            .report_unhandled_failures(false)
            .log_level(LogLevel::Debug)
            .thread_name_prefix("test-rt")
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.fiber.yield_op_count, 64);
        assert!(!config.fiber.report_unhandled_failures);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.scheduler.thread_name_prefix, "test-rt");
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().yield_op_count(0).build().is_err());
        assert!(RuntimeConfig::builder().thread_name_prefix("").build().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(config.scheduler.num_workers, 0);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("off".parse(), Ok(LogLevel::Off));
        assert_eq!("ERROR".parse(), Ok(LogLevel::Error));
        assert_eq!("warn".parse(), Ok(LogLevel::Warn));
        assert_eq!("INFO".parse(), Ok(LogLevel::Info));
        assert_eq!("debug".parse(), Ok(LogLevel::Debug));
        assert_eq!("TRACE".parse(), Ok(LogLevel::Trace));
        assert!("invalid".parse::<LogLevel>().is_err());
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
        env::remove_var("EFFECT_NUM_WORKERS");
        env::remove_var("EFFECT_YIELD_OP_COUNT");

        let config = RuntimeConfig::from_env();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.fiber.yield_op_count, 2048);
    }
}
