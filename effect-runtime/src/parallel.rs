//! # Parallel Combinators
//!
//! Run effects on concurrent child fibers and combine their results.
//!
//! ## Failure semantics
//!
//! When a child fails, or the parent is interrupted while waiting, every
//! other child is interrupted and awaited. The parent then fails with all
//! observed causes combined with [`Cause::both`] in input order. Siblings
//! that were only interrupted by this teardown are left out when a real
//! failure is present.
//!
//! Results always come back in input order, whatever order the children
//! finish in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::capability::Associative;
use crate::cause::Cause;
use crate::effect::{Effect, Restore};
use crate::exit::{Exit, Never};
use crate::fiber::Fiber;
use crate::panic::Defect;
use crate::promise::Promise;

/// How a batch of effects is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One after another, in order.
    #[default]
    Sequential,
    /// All at once.
    Parallel,
    /// At most `n` at a time.
    ParallelN(usize),
}

type Slots<B> = Arc<Mutex<Vec<Option<B>>>>;
type ItemFn<R, E, X, B> = Arc<dyn Fn(X) -> Effect<R, E, B> + Send + Sync>;
type Children = Vec<Fiber<Never, ()>>;

fn slots<B>(len: usize) -> Slots<B> {
    Arc::new(Mutex::new((0..len).map(|_| None).collect()))
}

fn take_slots<B, E>(slots: &Mutex<Vec<Option<B>>>) -> Result<Vec<B>, Cause<E>> {
    std::mem::take(&mut *slots.lock())
        .into_iter()
        .collect::<Option<Vec<B>>>()
        .ok_or_else(|| Cause::die(Defect::new("parallel result missing")))
}

/// Bookkeeping shared by the children of one parallel run.
struct Batch<E> {
    failures: Mutex<Vec<(usize, Cause<E>)>>,
    remaining: AtomicUsize,
    done: Promise<Never, ()>,
}

impl<E> Batch<E> {
    fn new(children: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(Vec::new()),
            remaining: AtomicUsize::new(children),
            done: Promise::new(),
        })
    }

    fn succeeded(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn failed(&self, index: usize, cause: Cause<E>) {
        self.failures.lock().push((index, cause));
    }

    fn signal(&self) {
        self.done.unsafe_complete(Exit::Success(()));
    }

    fn has_failures(&self) -> bool {
        !self.failures.lock().is_empty()
    }

    fn take_failures(&self) -> Vec<(usize, Cause<E>)> {
        std::mem::take(&mut *self.failures.lock())
    }
}

/// Combine child causes in input order. Children without a recorded cause
/// contribute the cause from their exit.
fn merge_causes<E>(recorded: Vec<(usize, Cause<E>)>, exits: Vec<Exit<Never, ()>>, parent: Option<Cause<E>>) -> Cause<E> {
    let mut by_index: Vec<Option<Cause<E>>> = (0..exits.len()).map(|_| None).collect();
    for (index, cause) in recorded {
        if let Some(slot) = by_index.get_mut(index) {
            *slot = Some(cause);
        }
    }
    for (slot, exit) in by_index.iter_mut().zip(exits) {
        if slot.is_none() {
            *slot = exit.cause().map(Cause::strip_failures);
        }
    }

    let causes: Vec<Cause<E>> = by_index.into_iter().flatten().collect();
    let has_failure = causes.iter().any(|c| !c.is_empty() && !c.is_interrupted_only());
    let merged = Cause::both_all(causes.into_iter().filter(|c| !has_failure || !c.is_interrupted_only()));
    match parent {
        Some(parent) => Cause::both(merged, parent),
        None => merged,
    }
}

/// Fork every child, restoring the caller's interruptibility inside it.
/// The bookkeeping fold runs uninterruptibly so it sees every exit.
fn fork_children<R, E, A>(
    restore: Restore,
    effects: &[Effect<R, E, A>],
    on_failure: impl Fn(usize, Cause<E>) + Send + Sync + Clone + 'static,
    on_success: impl Fn(A) + Send + Sync + Clone + 'static,
) -> Effect<R, E, Children>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let forks: Vec<Effect<R, E, Fiber<Never, ()>>> = effects
        .iter()
        .enumerate()
        .map(|(index, effect)| {
            let on_failure = on_failure.clone();
            let on_success = on_success.clone();
            restore
                .apply(effect.clone())
                .fold_cause_m(
                    move |cause| {
                        on_failure(index, cause);
                        Effect::<R, Never, ()>::unit()
                    },
                    move |a| {
                        on_success(a);
                        Effect::unit()
                    },
                )
                .uninterruptible()
                .fork_as::<E>()
        })
        .collect();
    Effect::collect_all(forks)
}

/// Interrupt every child, then wait for all of them.
fn teardown<R, E>(children: Children) -> Effect<R, E, Vec<Exit<Never, ()>>>
where
    R: 'static,
    E: Send + 'static,
{
    trace!(children = children.len(), "interrupting parallel children");
    Effect::foreach_(children.clone(), |child: Fiber<Never, ()>| child.interrupt_fork())
        .zip_right(Effect::foreach(children, |child: Fiber<Never, ()>| {
            child.await_exit().widen_error()
        }))
}

/// Run all effects concurrently. Fails if any of them fails.
fn par_all<R, E>(effects: Vec<Effect<R, E, ()>>) -> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    let effects: Arc<[Effect<R, E, ()>]> = effects.into();
    Effect::uninterruptible_mask(move |restore| {
        if effects.is_empty() {
            return Effect::unit();
        }
        let batch = Batch::<E>::new(effects.len());
        let on_failure = {
            let batch = Arc::clone(&batch);
            move |index, cause| {
                batch.failed(index, cause);
                batch.signal();
            }
        };
        let on_success = {
            let batch = Arc::clone(&batch);
            move |()| {
                if batch.succeeded() {
                    batch.signal();
                }
            }
        };

        fork_children(restore, &effects, on_failure, on_success).chain(move |children: Children| {
            let batch = Arc::clone(&batch);
            restore
                .apply(batch.done.await_::<R>().widen_error::<E>())
                .result_as::<E>()
                .chain_once(move |awaited: Exit<E, ()>| {
                    if awaited.is_success() && !batch.has_failures() {
                        return Effect::unit();
                    }
                    let parent = awaited.cause();
                    teardown(children).chain_once(move |exits| {
                        Effect::halt_once(merge_causes(batch.take_failures(), exits, parent))
                    })
                })
        })
    })
}

fn drain_queue<R, E, X, B>(
    queue: Arc<Mutex<VecDeque<(usize, X)>>>,
    f: ItemFn<R, E, X, B>,
    slots: Slots<B>,
) -> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
    X: Send + 'static,
    B: Send + 'static,
{
    Effect::suspend(move || {
        let next = queue.lock().pop_front();
        match next {
            None => Effect::unit(),
            Some((index, x)) => {
                let store = Arc::clone(&slots);
                let rest = drain_queue(Arc::clone(&queue), Arc::clone(&f), Arc::clone(&slots));
                f(x).map(move |b| store.lock()[index] = Some(b)).zip_right(rest)
            }
        }
    })
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run both effects concurrently and combine their values. If either
    /// fails the other is interrupted and both causes are kept.
    pub fn zip_with_par<B, C>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Effect::suspend(move || {
            let left: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
            let right: Arc<Mutex<Option<B>>> = Arc::new(Mutex::new(None));
            let store_left = Arc::clone(&left);
            let store_right = Arc::clone(&right);
            let both = vec![
                self.clone().map(move |a| *store_left.lock() = Some(a)),
                that.clone().map(move |b| *store_right.lock() = Some(b)),
            ];
            let f = Arc::clone(&f);
            par_all(both).map_result(move |()| match (left.lock().take(), right.lock().take()) {
                (Some(a), Some(b)) => Ok(f(a, b)),
                _ => Err(Cause::die(Defect::new("parallel result missing"))),
            })
        })
    }

    /// Run both effects concurrently and pair their values.
    pub fn zip_par<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with_par(that, |a, b| (a, b))
    }

    /// Run both effects concurrently. The first success wins and the loser
    /// is interrupted. If both fail, the causes are combined.
    pub fn race(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        self.race_all(std::iter::once(that))
    }

    /// [`race`](Self::race) over any number of effects.
    pub fn race_all(self, others: impl IntoIterator<Item = Effect<R, E, A>>) -> Effect<R, E, A> {
        let racers: Arc<[Effect<R, E, A>]> = std::iter::once(self).chain(others).collect();
        Effect::uninterruptible_mask(move |restore| {
            let batch = Batch::<E>::new(racers.len());
            let winner: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
            let on_failure = {
                let batch = Arc::clone(&batch);
                move |index, cause| {
                    batch.failed(index, cause);
                    if batch.succeeded() {
                        batch.signal();
                    }
                }
            };
            let on_success = {
                let batch = Arc::clone(&batch);
                let winner = Arc::clone(&winner);
                move |a| {
                    let mut slot = winner.lock();
                    if slot.is_none() {
                        *slot = Some(a);
                    }
                    drop(slot);
                    batch.signal();
                }
            };

            fork_children(restore, &racers, on_failure, on_success).chain(move |children: Children| {
                let batch = Arc::clone(&batch);
                let winner = Arc::clone(&winner);
                restore
                    .apply(batch.done.await_::<R>().widen_error::<E>())
                    .result_as::<E>()
                    .chain_once(move |awaited: Exit<E, ()>| {
                        teardown(children).chain_once(move |exits| match (awaited.cause(), winner.lock().take()) {
                            (None, Some(a)) => Effect::succeed_once(a),
                            (parent, _) => {
                                Effect::halt_once(merge_causes(batch.take_failures(), exits, parent))
                            }
                        })
                    })
            })
        })
    }

    /// Run both effects concurrently. Whichever finishes first, with a
    /// success or a failure, decides the outcome and the other is
    /// interrupted.
    pub fn race_first(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        let racers: Arc<[Effect<R, E, A>]> = vec![self, that].into();
        Effect::uninterruptible_mask(move |restore| {
            let batch = Batch::<E>::new(racers.len());
            let first: Arc<Mutex<Option<Result<A, Cause<E>>>>> = Arc::new(Mutex::new(None));
            let on_failure = {
                let batch = Arc::clone(&batch);
                let first = Arc::clone(&first);
                move |_index: usize, cause: Cause<E>| {
                    let mut slot = first.lock();
                    if slot.is_none() {
                        *slot = Some(Err(cause));
                    }
                    drop(slot);
                    batch.signal();
                }
            };
            let on_success = {
                let batch = Arc::clone(&batch);
                let first = Arc::clone(&first);
                move |a| {
                    let mut slot = first.lock();
                    if slot.is_none() {
                        *slot = Some(Ok(a));
                    }
                    drop(slot);
                    batch.signal();
                }
            };

            fork_children(restore, &racers, on_failure, on_success).chain(move |children: Children| {
                let first = Arc::clone(&first);
                restore
                    .apply(batch.done.await_::<R>().widen_error::<E>())
                    .result_as::<E>()
                    .chain_once(move |awaited: Exit<E, ()>| {
                        teardown(children).chain_once(move |_exits| {
                            let outcome = first.lock().take();
                            match (awaited.cause(), outcome) {
                                (None, Some(Ok(a))) => Effect::succeed_once(a),
                                (None, Some(Err(cause))) => Effect::halt_once(cause),
                                (None, None) => Effect::die_message("race finished without a winner"),
                                (Some(parent), Some(Err(cause))) => Effect::halt_once(Cause::both(cause, parent)),
                                (Some(parent), _) => Effect::halt_once(parent),
                            }
                        })
                    })
            })
        })
    }

    /// Succeed with `None` if this effect does not finish within
    /// `duration`. The effect is interrupted on timeout; a failure before
    /// the deadline is returned as is.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.map(Some)
            .race_first(Effect::<R, E, ()>::sleep(duration).map(|()| None))
    }

    /// Fail with `error` if this effect does not finish within `duration`.
    pub fn timeout_fail(self, error: E, duration: Duration) -> Effect<R, E, A>
    where
        E: Clone + Sync,
    {
        self.timeout(duration).chain(move |outcome| match outcome {
            Some(a) => Effect::succeed_once(a),
            None => Effect::fail(error.clone()),
        })
    }
}

impl<R, E> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    /// Apply `f` to every element concurrently, collecting results in
    /// input order.
    pub fn foreach_par<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        let items: Arc<[X]> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::suspend(move || {
            let results = slots::<B>(items.len());
            let effects = items
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, x)| {
                    let store = Arc::clone(&results);
                    f(x).map(move |b| store.lock()[index] = Some(b))
                })
                .collect();
            par_all(effects).map_result(move |()| take_slots(&results))
        })
    }

    /// Apply `f` to every element concurrently, discarding results.
    pub fn foreach_par_<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, ()>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        let items: Arc<[X]> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::suspend(move || par_all(items.iter().cloned().map(|x| f(x).as_unit()).collect()))
    }

    /// Apply `f` to every element with at most `width` running at once,
    /// collecting results in input order. A width of zero is a defect.
    pub fn foreach_par_n<X, B>(
        width: usize,
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        if width == 0 {
            return Effect::die_message("foreach_par_n requires a positive width");
        }
        let items: Arc<[X]> = items.into_iter().collect();
        let f: ItemFn<R, E, X, B> = Arc::new(f);
        Effect::suspend(move || {
            let queue = Arc::new(Mutex::new(items.iter().cloned().enumerate().collect::<VecDeque<_>>()));
            let results = slots::<B>(items.len());
            let workers = (0..width.min(items.len()))
                .map(|_| drain_queue(Arc::clone(&queue), Arc::clone(&f), Arc::clone(&results)))
                .collect();
            let results = Arc::clone(&results);
            par_all(workers).map_result(move |()| take_slots(&results))
        })
    }

    /// Apply `f` to every element using `strategy`.
    pub fn foreach_exec<X, B>(
        strategy: ExecutionStrategy,
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        match strategy {
            ExecutionStrategy::Sequential => Effect::foreach(items, f),
            ExecutionStrategy::Parallel => Effect::foreach_par(items, f),
            ExecutionStrategy::ParallelN(width) => Effect::foreach_par_n(width, items, f),
        }
    }

    /// Run the effects concurrently, collecting results in input order.
    pub fn collect_all_par<B: Send + 'static>(
        effects: impl IntoIterator<Item = Effect<R, E, B>>,
    ) -> Effect<R, E, Vec<B>> {
        Effect::foreach_par(effects, |effect| effect)
    }

    /// Run the effects with at most `width` at once.
    pub fn collect_all_par_n<B: Send + 'static>(
        width: usize,
        effects: impl IntoIterator<Item = Effect<R, E, B>>,
    ) -> Effect<R, E, Vec<B>> {
        Effect::foreach_par_n(width, effects, |effect| effect)
    }

    /// Run `first` and `rest` concurrently and combine the values left to
    /// right with `associative`.
    pub fn reduce_all_par<A>(
        first: Effect<R, E, A>,
        rest: impl IntoIterator<Item = Effect<R, E, A>>,
        associative: impl Associative<A> + 'static,
    ) -> Effect<R, E, A>
    where
        A: Send + 'static,
    {
        Effect::collect_all_par(std::iter::once(first).chain(rest)).map_result(move |values: Vec<A>| {
            let mut values = values.into_iter();
            match values.next() {
                Some(head) => Ok(values.fold(head, |acc, a| associative.combine(acc, a))),
                None => Err(Cause::die(Defect::new("parallel result missing"))),
            }
        })
    }
}
