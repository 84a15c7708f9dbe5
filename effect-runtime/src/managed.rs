//! # Managed Resources
//!
//! A [`Managed<R, E, A>`] describes how to acquire a resource `A` and how
//! to release it. Nothing is acquired until the managed value is used with
//! [`Managed::use_`]; the resource is released when `use_` finishes, on
//! every exit path.
//!
//! ## Release maps
//!
//! While a scope is open, finalizers live in a [`ReleaseMap`]. Closing the
//! scope runs them with the exit of the scope:
//!
//! ```text
//! use_ ──► acquire a ──► acquire b ──► body ──► release b ──► release a
//!              │              │                     ▲             ▲
//!              └── add(fa) ───┼─────────────────────┼─────────────┘
//!                             └── add(fb) ──────────┘
//! ```
//!
//! Finalizers do not know the scope's error type, so they see a
//! [`ReleaseExit`] whose failures are [`Dynamic`] values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cause::Cause;
use crate::continuation::{once_step, Step};
use crate::effect::Effect;
use crate::exit::{Dynamic, Exit, Never};
use crate::panic;
use crate::parallel::ExecutionStrategy;

/// The exit a finalizer observes.
pub type ReleaseExit = Exit<Dynamic, ()>;

/// A registered cleanup action.
pub type Finalizer = Box<dyn FnOnce(&ReleaseExit) -> Effect<(), Never, ()> + Send>;

/// Identifies a finalizer in a [`ReleaseMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseKey(u64);

enum ReleaseState {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Exited(ReleaseExit),
}

/// Finalizers of an open scope.
///
/// Safe to share between fibers. Once the scope is closed with
/// [`release_all`](Self::release_all), finalizers added later run
/// immediately.
#[derive(Clone)]
pub struct ReleaseMap {
    state: Arc<Mutex<ReleaseState>>,
}

impl fmt::Debug for ReleaseMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.lock() {
            ReleaseState::Running { finalizers, .. } => f
                .debug_struct("ReleaseMap")
                .field("pending", &finalizers.len())
                .finish(),
            ReleaseState::Exited(exit) => f.debug_struct("ReleaseMap").field("exited", exit).finish(),
        }
    }
}

impl Default for ReleaseMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an exit to the form finalizers observe.
pub fn release_exit<E, A>(exit: &Exit<E, A>) -> ReleaseExit
where
    E: Clone + Send + Sync + 'static,
{
    match exit {
        Exit::Success(_) => Exit::Success(()),
        Exit::Failure(cause) => Exit::Failure(cause.clone().map(Dynamic::new)),
        Exit::Interrupted(by) => Exit::Interrupted(*by),
    }
}

fn call_finalizer(finalizer: Finalizer, exit: &ReleaseExit) -> Effect<(), Never, ()> {
    panic::catch(move || finalizer(exit)).unwrap_or_else(Effect::die)
}

/// Fold finalizer exits into one. Finalizers can only die or be
/// interrupted.
type Combine = fn(Vec<Cause<Never>>) -> Cause<Never>;

fn combine_exits(exits: Vec<Exit<Never, ()>>, combine: Combine) -> Cause<Never> {
    combine(exits.into_iter().filter_map(Exit::cause).collect())
}

impl ReleaseMap {
    /// An open, empty map.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReleaseState::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }

    /// Number of registered finalizers.
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            ReleaseState::Running { finalizers, .. } => finalizers.len(),
            ReleaseState::Exited(_) => 0,
        }
    }

    /// Whether no finalizers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the scope has been closed.
    pub fn is_exited(&self) -> bool {
        matches!(*self.state.lock(), ReleaseState::Exited(_))
    }

    fn register(&self, finalizer: Finalizer) -> Result<ReleaseKey, (Finalizer, ReleaseExit)> {
        match &mut *self.state.lock() {
            ReleaseState::Running { next_key, finalizers } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.insert(key, finalizer);
                Ok(ReleaseKey(key))
            }
            ReleaseState::Exited(exit) => Err((finalizer, exit.clone())),
        }
    }

    /// Register `finalizer`. If the scope is already closed the finalizer
    /// runs at once and the effect yields `None`.
    ///
    /// The returned effect is single-use.
    pub fn add<R: 'static, E: Send + 'static>(&self, finalizer: Finalizer) -> Effect<R, E, Option<ReleaseKey>> {
        let map = self.clone();
        let add = Effect::<(), Never, Option<ReleaseKey>>::from_instr(once_step(move || match map.register(finalizer) {
            Ok(key) => Step::Value(Box::new(Some(key))),
            Err((finalizer, exit)) => {
                let run = call_finalizer(finalizer, &exit);
                Step::Then(run.instr(), Box::new(|_| Step::Value(Box::new(None::<ReleaseKey>))))
            }
        }));
        add.uninterruptible().lift_env().widen_error()
    }

    /// Remove a finalizer without running it.
    pub fn remove(&self, key: ReleaseKey) -> Option<Finalizer> {
        match &mut *self.state.lock() {
            ReleaseState::Running { finalizers, .. } => finalizers.remove(&key.0),
            ReleaseState::Exited(_) => None,
        }
    }

    /// Run and remove one finalizer. Does nothing if it is gone.
    pub fn release(&self, key: ReleaseKey, exit: ReleaseExit) -> Effect<(), Never, ()> {
        let map = self.clone();
        Effect::suspend(move || match map.remove(key) {
            Some(finalizer) => call_finalizer(finalizer, &exit),
            None => Effect::unit(),
        })
        .uninterruptible()
    }

    /// Close the scope and run every finalizer with `exit`.
    ///
    /// `Sequential` runs them in reverse registration order. Defects from
    /// finalizers are combined and fail the returned effect after all of
    /// them have run. Closing twice does nothing.
    pub fn release_all(&self, exit: ReleaseExit, strategy: ExecutionStrategy) -> Effect<(), Never, ()> {
        let map = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = map.state.lock();
                match std::mem::replace(&mut *state, ReleaseState::Exited(exit.clone())) {
                    ReleaseState::Running { finalizers, .. } => finalizers,
                    ReleaseState::Exited(previous) => {
                        *state = ReleaseState::Exited(previous);
                        return Effect::unit();
                    }
                }
            };
            trace!(finalizers = finalizers.len(), ?strategy, "releasing scope");

            let runs: Vec<Effect<(), Never, Exit<Never, ()>>> = finalizers
                .into_values()
                .rev()
                .map(|finalizer| call_finalizer(finalizer, &exit).result())
                .collect();
            let (all, combine): (Effect<(), Never, Vec<Exit<Never, ()>>>, Combine) = match strategy {
                ExecutionStrategy::Sequential => (Effect::collect_all(runs), Cause::then_all),
                ExecutionStrategy::Parallel => (Effect::collect_all_par(runs), Cause::both_all),
                ExecutionStrategy::ParallelN(width) => (Effect::collect_all_par_n(width, runs), Cause::both_all),
            };
            all.chain_once(move |exits| {
                let cause = combine_exits(exits, combine);
                if cause.is_empty() {
                    Effect::unit()
                } else {
                    warn!(cause = %cause.describe(), "finalizer failed");
                    Effect::halt_once(cause)
                }
            })
        })
        .uninterruptible()
    }
}

/// A resource with guaranteed release.
pub struct Managed<R, E, A> {
    run: Arc<dyn Fn(ReleaseMap) -> Effect<R, E, A> + Send + Sync>,
}

impl<R, E, A> Clone for Managed<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<R, E, A> fmt::Debug for Managed<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Managed")
    }
}

impl<R, E, A> Managed<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Build from an effect that acquires into the given release map.
    pub fn from_release_map(run: impl Fn(ReleaseMap) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self { run: Arc::new(run) }
    }

    /// The acquisition, registering finalizers in `release_map`.
    pub fn acquire_into(&self, release_map: ReleaseMap) -> Effect<R, E, A> {
        (self.run)(release_map)
    }

    /// Acquire with `acquire`, release with `release`. The release sees the
    /// exit of the scope.
    ///
    /// Acquisition and registration are uninterruptible. If `acquire`
    /// fails, nothing is registered.
    pub fn make_exit<X: Send + 'static>(
        acquire: Effect<R, E, A>,
        release: impl Fn(&A, &ReleaseExit) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self
    where
        R: Clone + Send + Sync,
        A: Clone,
    {
        let release = Arc::new(release);
        Self::from_release_map(move |release_map: ReleaseMap| {
            let release = Arc::clone(&release);
            let acquire = acquire.clone();
            Effect::<R, E, R>::environment()
                .chain(move |env: R| {
                    let release = Arc::clone(&release);
                    let release_map = release_map.clone();
                    acquire.clone().chain(move |resource: A| {
                        let held = resource.clone();
                        let release = Arc::clone(&release);
                        let env = env.clone();
                        let finalizer: Finalizer =
                            Box::new(move |exit: &ReleaseExit| release(&held, exit).provide_all(env).as_unit());
                        release_map
                            .add::<R, E>(finalizer)
                            .chain_once(move |_| Effect::succeed_once(resource))
                    })
                })
                .uninterruptible()
        })
    }

    /// [`make_exit`](Self::make_exit) with a release that ignores the exit.
    pub fn make<X: Send + 'static>(
        acquire: Effect<R, E, A>,
        release: impl Fn(&A) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self
    where
        R: Clone + Send + Sync,
        A: Clone,
    {
        Self::make_exit(acquire, move |a, _| release(a))
    }

    /// Lift an effect with no release.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Self::from_release_map(move |_| effect.clone())
    }

    /// A resource that is already available.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_effect(Effect::succeed(value))
    }

    /// A resource that fails to acquire.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_effect(Effect::fail(error))
    }

    /// Transform the resource.
    pub fn map<B: Send + 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Managed<R, E, B> {
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map| {
            let f = Arc::clone(&f);
            self.acquire_into(release_map).map(move |a| f(a))
        })
    }

    /// Transform acquisition failures.
    pub fn map_error<E2: Send + 'static>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Managed<R, E2, A> {
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map| {
            let f = Arc::clone(&f);
            self.acquire_into(release_map).map_error(move |e| f(e))
        })
    }

    /// Acquire a resource that depends on this one. Released in reverse
    /// order.
    pub fn chain<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, B> {
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map: ReleaseMap| {
            let f = Arc::clone(&f);
            let inner_map = release_map.clone();
            self.acquire_into(release_map)
                .chain(move |a| f(a).acquire_into(inner_map.clone()))
        })
    }

    /// Acquire both in sequence and combine.
    pub fn zip_with<B, C>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map: ReleaseMap| {
            let f = Arc::clone(&f);
            self.acquire_into(release_map.clone())
                .zip_with(that.acquire_into(release_map), move |a, b| f(a, b))
        })
    }

    /// Acquire both in sequence.
    pub fn zip<B: Send + 'static>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Acquire both concurrently and combine.
    pub fn zip_with_par<B, C>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map: ReleaseMap| {
            let f = Arc::clone(&f);
            self.acquire_into(release_map.clone())
                .zip_with_par(that.acquire_into(release_map), move |a, b| f(a, b))
        })
    }

    /// Acquire, run `f` with the resource, then release.
    pub fn use_<B: Send + 'static>(self, f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static) -> Effect<R, E, B>
    where
        E: Clone + Sync,
    {
        let f = Arc::new(f);
        Effect::<R, E, ReleaseMap>::effect_total(ReleaseMap::new).bracket_exit(
            move |release_map: &ReleaseMap| {
                let f = Arc::clone(&f);
                self.acquire_into(release_map.clone()).chain(move |a| f(a))
            },
            |release_map, exit| {
                release_map
                    .release_all(release_exit(exit), ExecutionStrategy::Sequential)
                    .lift_env()
                    .widen_error()
            },
        )
    }

    /// Acquire and release, keeping the resource value.
    pub fn use_now(self) -> Effect<R, E, A>
    where
        E: Clone + Sync,
    {
        self.use_(Effect::succeed_once)
    }
}

impl<R, E> Managed<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    /// A scope that only runs `finalizer` on release.
    pub fn finalizer<X: Send + 'static>(finalizer: Effect<R, Never, X>) -> Self
    where
        R: Clone + Send + Sync,
    {
        Self::finalizer_exit(move |_| finalizer.clone())
    }

    /// A scope that runs `finalizer` with the release exit.
    pub fn finalizer_exit<X: Send + 'static>(
        finalizer: impl Fn(&ReleaseExit) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self
    where
        R: Clone + Send + Sync,
    {
        Self::make_exit(Effect::unit(), move |_, exit| finalizer(exit))
    }

    /// Acquire a resource per element in order.
    pub fn foreach<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        Self::foreach_exec(ExecutionStrategy::Sequential, items, f)
    }

    /// Acquire a resource per element concurrently.
    pub fn foreach_par<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        Self::foreach_exec(ExecutionStrategy::Parallel, items, f)
    }

    /// Acquire a resource per element using `strategy`.
    pub fn foreach_exec<X, B>(
        strategy: ExecutionStrategy,
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        let items: Arc<[X]> = items.into_iter().collect();
        let f = Arc::new(f);
        Managed::from_release_map(move |release_map: ReleaseMap| {
            let f = Arc::clone(&f);
            Effect::foreach_exec(strategy, items.iter().cloned(), move |x| f(x).acquire_into(release_map.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn resource(log: &Log, name: &'static str) -> Managed<(), String, &'static str> {
        let (open, close) = (Arc::clone(log), Arc::clone(log));
        Managed::make(
            Effect::effect_total(move || {
                open.lock().push(format!("open {}", name));
                name
            }),
            move |name: &&'static str| {
                let close = Arc::clone(&close);
                let name = *name;
                Effect::<(), Never, ()>::effect_total(move || close.lock().push(format!("close {}", name)))
            },
        )
    }

    #[test]
    fn test_release_in_reverse_order() {
        let rt = runtime();
        let log: Log = Arc::default();
        let program = resource(&log, "a")
            .zip(resource(&log, "b"))
            .use_(|(a, b)| Effect::succeed(format!("{}{}", a, b)));

        assert_eq!(rt.unsafe_run_sync(program), Exit::Success("ab".to_string()));
        assert_eq!(*log.lock(), vec!["open a", "open b", "close b", "close a"]);
    }

    #[test]
    fn test_release_sees_failure() {
        let rt = runtime();
        let seen: Arc<Mutex<Vec<(i32, Option<String>)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let managed = Managed::<(), String, i32>::make_exit(Effect::succeed(1), move |a, exit| {
            let failure = exit
                .clone()
                .cause()
                .and_then(|c| c.failures().first().and_then(|d| d.downcast_ref::<String>().cloned()));
            let entry = (*a, failure);
            let sink = Arc::clone(&sink);
            Effect::<(), Never, ()>::effect_total(move || sink.lock().push(entry.clone()))
        });
        let program = managed.use_(|_| Effect::<(), String, i32>::fail("boom".to_string()));

        assert_eq!(rt.unsafe_run_sync(program), Exit::fail("boom".to_string()));
        assert_eq!(*seen.lock(), vec![(1, Some("boom".to_string()))]);
    }

    #[test]
    fn test_failed_acquire_releases_earlier_resources() {
        let rt = runtime();
        let log: Log = Arc::default();
        let program = resource(&log, "a")
            .chain(|_| Managed::<(), String, &'static str>::fail("second".to_string()))
            .use_now();

        assert_eq!(rt.unsafe_run_sync(program), Exit::fail("second".to_string()));
        assert_eq!(*log.lock(), vec!["open a", "close a"]);
    }

    #[test]
    fn test_finalizer_defect_is_reported() {
        let rt = runtime();
        let managed = Managed::<(), String, ()>::finalizer(Effect::<(), Never, ()>::die_message("cleanup"));
        let exit = rt.unsafe_run_sync(managed.use_(|_| Effect::succeed(5)));
        assert!(exit.cause().map_or(false, |c| c.is_die()));
    }

    #[test]
    fn test_add_after_exit_runs_immediately() {
        let rt = runtime();
        let map = ReleaseMap::new();
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let program = map
            .release_all(Exit::Success(()), ExecutionStrategy::Sequential)
            .zip_right(map.add::<(), Never>(Box::new(move |_: &ReleaseExit| {
                Effect::effect_total(move || *flag.lock() = true)
            })));

        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(None));
        assert!(*ran.lock());
        assert!(map.is_exited());
    }

    #[test]
    fn test_release_one_key() {
        let rt = runtime();
        let map = ReleaseMap::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let finalizer: Finalizer = Box::new(move |_: &ReleaseExit| Effect::effect_total(move || *counter.lock() += 1));
        let add = map.add::<(), Never>(finalizer);
        let key = rt.unsafe_run_sync(add).value().copied().flatten().unwrap();

        rt.unsafe_run_sync(map.release(key, Exit::Success(())));
        rt.unsafe_run_sync(map.release(key, Exit::Success(())));
        assert_eq!(*count.lock(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_interrupted_use_releases() {
        let rt = runtime();
        let log: Log = Arc::default();
        let program = resource(&log, "r")
            .use_(|_| Effect::<(), String, ()>::never())
            .fork()
            .chain(|fiber| Effect::sleep(Duration::from_millis(20)).zip_right(fiber.interrupt().widen_error()));

        assert!(rt.unsafe_run_sync(program).value().map_or(false, Exit::is_interrupted));
        assert_eq!(*log.lock(), vec!["open r", "close r"]);
    }
}
