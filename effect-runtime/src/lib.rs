//! # Effect Runtime
//!
//! A fiber-based effect runtime:
//!
//! - **Effects**: lazy, reusable descriptions of computations that need an
//!   environment, may fail with a typed error, and succeed with a value
//! - **Fibers**: M:N cooperative scheduling with work-stealing, parent/child
//!   supervision and asynchronous interruption
//! - **Resource Safety**: `bracket_exit`, `ensuring` and [`Managed`]
//!   release their resources on success, failure and interruption
//! - **Parallelism**: racing, zipping and bounded traversal over fibers
//! - **Schedules**: composable retry and repeat policies
//! - **Streams**: pull-based sequences built on managed resources
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         EFFECT RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Stream    │  │   Schedule   │  │   Parallel   │          │
//! │  │ (stream.rs)  │  │(schedule.rs) │  │(parallel.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Managed    │  │   Bracket    │  │   Promise    │          │
//! │  │ (managed.rs) │  │ (bracket.rs) │  │ (promise.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         └─────────────────┼─────────────────┘                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │    Fiber     │  │  Exit/Cause  │          │
//! │  │ (effect.rs)  │  │(context.rs)  │  │  (exit.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         └─────────────────┼─────────────────┘                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Runtime    │  │  Scheduler   │  │    Timer     │          │
//! │  │ (runtime.rs) │  │(scheduler.rs)│  │  (timer.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use effect_runtime::{Effect, Exit, Schedule};
//!
//! let rt = effect_runtime::init().unwrap();
//! let program = Effect::<(), String, u32>::succeed(1)
//!     .zip_with_par(Effect::succeed(2), |a, b| a + b)
//!     .retry(Schedule::spaced(Duration::from_millis(5)).both(Schedule::recurs(3)));
//! assert_eq!(rt.unsafe_run_sync(program), Exit::Success(3));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bracket;
pub mod capability;
pub mod cause;
pub mod config;
pub(crate) mod context;
pub(crate) mod continuation;
pub mod effect;
pub mod effect_option;
pub mod exit;
pub mod fiber;
pub mod log;
pub mod managed;
pub mod panic;
pub mod parallel;
pub mod promise;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod stream;
pub(crate) mod timer;

// Re-exports
pub use capability::{
    equal_both, make_associative, make_commutative, make_equal, structural_equal, Associative, Commutative, Equal,
    FnAssociative, FnCommutative, FnEqual, StructuralEqual,
};
pub use cause::Cause;
pub use config::{ConfigError, FiberConfig, LogConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use continuation::Canceler;
pub use effect::{Callback, Effect, Restore, IO, UIO};
pub use effect_option::{first_some, last_some, EffectOption};
pub use exit::{Dynamic, Exit, Never};
pub use fiber::{Fiber, FiberDescriptor, FiberId, FiberStatus};
pub use managed::{release_exit, Finalizer, Managed, ReleaseExit, ReleaseKey, ReleaseMap};
pub use panic::{Defect, Location as PanicLocation};
pub use parallel::ExecutionStrategy;
pub use promise::Promise;
pub use runtime::{Runtime, RuntimeError, RuntimeStats};
pub use schedule::{Decision, Schedule, ScheduleDriver};
pub use stream::{Pull, Stream};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a runtime with the default configuration.
pub fn init() -> Result<Runtime, RuntimeError> {
    init_with(RuntimeConfig::default())
}

/// Start a runtime with `config` and install the configured log
/// subscriber.
///
/// # Example
///
/// ```rust
/// use effect_runtime::{init_with, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(2)
///     .yield_op_count(512)
///     .build()
///     .unwrap();
///
/// let rt = init_with(config).unwrap();
/// assert_eq!(rt.config().scheduler.num_workers, 2);
/// ```
pub fn init_with(config: RuntimeConfig) -> Result<Runtime, RuntimeError> {
    config.validate()?;
    log::init_logging(&config.log);
    Runtime::new(config)
}

/// Start a runtime configured from `EFFECT_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<Runtime, RuntimeError> {
    init_with(RuntimeConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_runs_effects() {
        let rt = init().unwrap();
        assert_eq!(rt.unsafe_run_sync(UIO::succeed(7)), Exit::Success(7));
    }

    #[test]
    fn test_init_with_rejects_invalid_config() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert!(matches!(init_with(config), Err(RuntimeError::Config(_))));
    }
}
