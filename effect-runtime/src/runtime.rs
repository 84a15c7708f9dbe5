//! # Runtime
//!
//! Owns the worker pool and the timer thread, and is the boundary where
//! effects are turned into running fibers.
//!
//! Cloning a [`Runtime`] is cheap. Worker and timer threads stop when the
//! last clone is dropped; fibers still running at that point are abandoned.
//!
//! The synchronous entry points block the calling thread. Calling them from
//! inside a fiber ties up a worker for the duration of the nested run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::cause::Cause;
use crate::config::{ConfigError, RuntimeConfig};
use crate::continuation::{unerase_exit, AnyExit, Completion, TypedExit};
use crate::context::FiberContext;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::panic::{self, Defect};
use crate::scheduler::Scheduler;
use crate::timer::Timer;

/// Errors raised while starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration failed validation.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),
    /// A worker or timer thread could not be spawned.
    #[error("failed to spawn runtime thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Counters describing fiber activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Fibers created, including root fibers.
    pub fibers_started: u64,
    /// Fibers that reached an exit.
    pub fibers_completed: u64,
    /// Fibers that failed while nobody observed them.
    pub unhandled_failures: u64,
}

#[derive(Default)]
pub(crate) struct Stats {
    started: AtomicU64,
    completed: AtomicU64,
    unhandled: AtomicU64,
}

impl Stats {
    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            fibers_started: self.started.load(Ordering::Relaxed),
            fibers_completed: self.completed.load(Ordering::Relaxed),
            unhandled_failures: self.unhandled.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every fiber of a runtime.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) scheduler: Scheduler,
    pub(crate) timer: Timer,
    pub(crate) stats: Stats,
}

impl Shared {
    fn shutdown(&self) {
        self.timer.shutdown();
        self.scheduler.shutdown();
    }
}

struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        debug!("runtime dropped");
        self.shared.shutdown();
    }
}

/// Executes effects on a pool of worker threads.
#[derive(Clone)]
pub struct Runtime {
    handle: Arc<RuntimeHandle>,
}

impl Runtime {
    /// Start a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        panic::install_panic_hook();

        let scheduler = Scheduler::start(&config.scheduler)?;
        let timer = match Timer::start(&config.scheduler.thread_name_prefix) {
            Ok(timer) => timer,
            Err(err) => {
                scheduler.shutdown();
                return Err(err);
            }
        };

        debug!(
            workers = config.scheduler.num_workers,
            yield_op_count = config.fiber.yield_op_count,
            "runtime started"
        );

        Ok(Self {
            handle: Arc::new(RuntimeHandle {
                shared: Arc::new(Shared {
                    config,
                    scheduler,
                    timer,
                    stats: Stats::default(),
                }),
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// The configuration the runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared().config
    }

    /// Current fiber counters.
    pub fn stats(&self) -> RuntimeStats {
        self.shared().stats.snapshot()
    }

    /// Number of sleeps and delays currently waiting on the timer.
    pub fn pending_timers(&self) -> usize {
        self.shared().timer.pending()
    }

    /// Stop the runtime now, even if clones are still alive.
    pub fn shutdown(&self) {
        self.shared().shutdown();
    }

    /// Start `effect` in a root fiber with environment `env` and return
    /// immediately. `callback` receives the exit.
    pub fn unsafe_run_async_with<R, E, A, F>(&self, env: R, effect: Effect<R, E, A>, callback: F) -> FiberId
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let callback = Mutex::new(Some(callback));
        let completion: Completion = Arc::new(move |exit: AnyExit| {
            if let Some(callback) = callback.lock().take() {
                callback(unerase_exit::<E, A>(exit));
            }
            Box::new(()) as TypedExit
        });

        let fiber = FiberContext::new(Arc::clone(self.shared()), None, completion);
        fiber.mark_observed();
        fiber.start(Arc::new(env), effect.instr());
        fiber.id()
    }

    /// [`unsafe_run_async_with`](Self::unsafe_run_async_with) for effects
    /// that need no environment.
    pub fn unsafe_run_async<E, A, F>(&self, effect: Effect<(), E, A>, callback: F) -> FiberId
    where
        E: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        self.unsafe_run_async_with((), effect, callback)
    }

    /// Run `effect` with environment `env`, blocking until it exits.
    pub fn unsafe_run_sync_with<R, E, A>(&self, env: R, effect: Effect<R, E, A>) -> Exit<E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.unsafe_run_async_with(env, effect, move |exit| {
            let _ = tx.send(exit);
        });
        rx.recv()
            .unwrap_or_else(|_| Exit::die(Defect::new("runtime stopped before the fiber exited")))
    }

    /// Run `effect`, blocking until it exits.
    pub fn unsafe_run_sync<E, A>(&self, effect: Effect<(), E, A>) -> Exit<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        self.unsafe_run_sync_with((), effect)
    }

    /// Run `effect`, blocking, and return the value or the failure cause.
    pub fn run_to_result<E, A>(&self, effect: Effect<(), E, A>) -> Result<A, Cause<E>>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        self.unsafe_run_sync(effect).into_result()
    }
}
