//! # Streams
//!
//! A [`Stream<R, E, A>`] is a lazy, pull-based sequence of `A` values. It is
//! a [`Managed`] resource whose acquired value is a [`Pull`]: an effect that
//! yields the next non-empty chunk, fails with `None` at the end of the
//! stream, or fails with `Some(e)` on error.
//!
//! ```text
//!  Stream ─── Managed ──acquire──► Pull ──► chunk | end | error
//!                │                   ▲
//!                └── release ◄───────┴── consumer scope closes
//! ```
//!
//! Every resource a stream opens is registered in the consumer's scope, so
//! a consumer that fails or is interrupted still closes it.
//!
//! ## Pull contract
//!
//! - Chunks are never empty.
//! - End is sticky: once a pull reports end, every later pull on the same
//!   handle reports end without touching upstream.
//! - One consumer pulls at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capability::{Associative, Equal};
use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::{Exit, Never};
use crate::managed::{Finalizer, Managed, ReleaseExit, ReleaseKey, ReleaseMap};
use crate::parallel::ExecutionStrategy;
use crate::schedule::{Decision, Schedule, ScheduleDriver};

/// Maximum chunk size produced by the iterator constructors.
pub const CHUNK_SIZE: usize = 64;

/// One step of a stream: the next chunk, `None` at the end, or `Some(e)`.
pub type Pull<R, E, A> = Effect<R, Option<E>, Vec<A>>;

fn end<R: 'static, E: Send + 'static, A: Send + 'static>() -> Pull<R, E, A> {
    Effect::fail_with(|| None)
}

/// `None` when the cause is the end signal.
fn end_or_cause<E>(cause: Cause<Option<E>>) -> Option<Cause<E>> {
    match cause {
        Cause::Fail(None) => None,
        other => Some(other.filter_map(|e| e)),
    }
}

/// Make end sticky and skip empty chunks.
fn latch<R, E, A>(pull: Pull<R, E, A>) -> Pull<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let ended = Arc::new(AtomicBool::new(false));
    latched(pull, ended)
}

fn latched<R, E, A>(pull: Pull<R, E, A>, ended: Arc<AtomicBool>) -> Pull<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    Effect::suspend(move || {
        if ended.load(Ordering::Acquire) {
            return end();
        }
        let (on_end, again) = (Arc::clone(&ended), Arc::clone(&ended));
        let retry = pull.clone();
        pull.clone()
            .catch_all_cause(move |cause: Cause<Option<E>>| {
                if matches!(cause, Cause::Fail(None)) {
                    on_end.store(true, Ordering::Release);
                }
                Effect::halt_once(cause)
            })
            .chain_once(move |chunk: Vec<A>| {
                if chunk.is_empty() {
                    latched(retry, again)
                } else {
                    Effect::succeed_once(chunk)
                }
            })
    })
}

/// Take the next chunk out of a per-acquisition queue.
fn drain_chunks<R, E, A>(chunks: VecDeque<Vec<A>>) -> Pull<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let queue = Arc::new(Mutex::new(chunks));
    Effect::suspend(move || match queue.lock().pop_front() {
        Some(chunk) => Effect::succeed_once(chunk),
        None => end(),
    })
}

/// Run `f` over `items` in order.
fn traverse<R, E, A, B>(
    mut items: VecDeque<A>,
    mut acc: Vec<B>,
    f: Arc<dyn Fn(A) -> Effect<R, E, B> + Send + Sync>,
) -> Effect<R, E, Vec<B>>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    match items.pop_front() {
        None => Effect::succeed_once(acc),
        Some(a) => f(a).chain_once(move |b| {
            acc.push(b);
            traverse(items, acc, f)
        }),
    }
}

fn fold_chunk<R, E, A, S>(
    state: S,
    mut items: VecDeque<A>,
    f: Arc<dyn Fn(S, A) -> Effect<R, E, S> + Send + Sync>,
) -> Effect<R, E, S>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    S: Send + 'static,
{
    match items.pop_front() {
        None => Effect::succeed_once(state),
        Some(a) => f(state, a).chain_once(move |state| fold_chunk(state, items, f)),
    }
}

type ChunkStep<R, E, A, S> = Arc<dyn Fn(S, Vec<A>) -> Effect<R, E, S> + Send + Sync>;

fn fold_pull<R, E, A, S>(pull: Pull<R, E, A>, state: S, step: ChunkStep<R, E, A, S>) -> Effect<R, E, S>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    S: Send + 'static,
{
    pull.clone()
        .result_as::<E>()
        .chain_once(move |exit: Exit<Option<E>, Vec<A>>| match exit {
            Exit::Success(chunk) => step(state, chunk).chain_once(move |state| fold_pull(pull, state, step)),
            failed => match failed.cause().and_then(end_or_cause) {
                None => Effect::succeed_once(state),
                Some(cause) => Effect::halt_once(cause),
            },
        })
}

/// A lazy, resource-safe sequence of values.
pub struct Stream<R, E, A> {
    process: Managed<R, E, Pull<R, E, A>>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            process: self.process.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Stream<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stream")
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<R, E, A> Stream<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// A stream from a managed pull. Each acquisition gets its own handle.
    pub fn new(process: Managed<R, E, Pull<R, E, A>>) -> Self {
        Self {
            process: process.map(latch),
        }
    }

    /// A stream over a shared pull effect.
    pub fn from_pull(pull: Pull<R, E, A>) -> Self {
        Self::new(Managed::succeed(pull))
    }

    /// The managed pull behind this stream.
    pub fn process(&self) -> Managed<R, E, Pull<R, E, A>> {
        self.process.clone()
    }

    /// The stream with no elements.
    pub fn empty() -> Self {
        Self::from_pull(end())
    }

    /// A stream that fails with `error` on the first pull.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_pull(Effect::fail(Some(error)))
    }

    /// A single chunk.
    pub fn from_chunk(chunk: Vec<A>) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_chunks(vec![chunk])
    }

    fn from_chunks(chunks: Vec<Vec<A>>) -> Self
    where
        A: Clone + Sync,
    {
        Self::new(Managed::from_effect(Effect::effect_total(move || {
            drain_chunks(chunks.iter().cloned().collect())
        })))
    }

    /// The items of an iterator, in chunks of at most [`CHUNK_SIZE`].
    pub fn from_iter(items: impl IntoIterator<Item = A>) -> Self
    where
        A: Clone + Sync,
    {
        let mut chunks = Vec::new();
        let mut current = Vec::with_capacity(CHUNK_SIZE);
        for item in items {
            current.push(item);
            if current.len() == CHUNK_SIZE {
                chunks.push(std::mem::replace(&mut current, Vec::with_capacity(CHUNK_SIZE)));
            }
        }
        chunks.push(current);
        Self::from_chunks(chunks)
    }

    /// One element.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_chunk(vec![value])
    }

    /// The value of `effect`, once.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Self::new(Managed::from_effect(Effect::effect_total(move || {
            let effect = effect.clone();
            let taken = Arc::new(AtomicBool::new(false));
            Effect::suspend(move || {
                if taken.swap(true, Ordering::AcqRel) {
                    end()
                } else {
                    effect.clone().map_error(Some).map(|a| vec![a])
                }
            })
        })))
    }

    /// The values of `effect`, run again on every pull. Never ends on its
    /// own.
    pub fn repeat_effect(effect: Effect<R, E, A>) -> Self {
        Self::from_pull(effect.map_error(Some).map(|a| vec![a]))
    }

    /// Run `effect` on every pull, waiting between runs as `schedule`
    /// says. Ends after the element on which the schedule is done.
    pub fn repeat_effect_with<B: Send + 'static>(effect: Effect<R, E, A>, schedule: Schedule<A, B>) -> Self {
        struct Ticker<A, B> {
            driver: ScheduleDriver<A, B>,
            wait: Duration,
            done: bool,
        }

        Self::new(Managed::from_effect(Effect::effect_total(move || {
            let effect = effect.clone();
            let ticker = Arc::new(Mutex::new(Ticker {
                driver: schedule.driver(),
                wait: Duration::ZERO,
                done: false,
            }));
            Effect::suspend(move || {
                let (wait, done) = {
                    let t = ticker.lock();
                    (t.wait, t.done)
                };
                if done {
                    return end();
                }
                let pause = if wait.is_zero() {
                    Effect::unit()
                } else {
                    Effect::sleep(wait)
                };
                let ticker = Arc::clone(&ticker);
                pause.zip_right(effect.clone().map_error(Some)).map(move |a| {
                    let mut t = ticker.lock();
                    let decision = t.driver.next(Instant::now(), &a);
                    match decision {
                        Decision::Continue { delay, .. } => t.wait = delay,
                        Decision::Done(_) => t.done = true,
                    }
                    vec![a]
                })
            })
        })))
    }

    /// A stream of the one resource `managed` acquires. The resource stays
    /// open until the consumer's scope closes.
    pub fn managed(managed: Managed<R, E, A>) -> Self {
        Self::new(managed.map(|resource| {
            let slot = Arc::new(Mutex::new(Some(resource)));
            Effect::suspend(move || match slot.lock().take() {
                Some(resource) => Effect::succeed_once(vec![resource]),
                None => end(),
            })
        }))
    }

    /// A stream of one resource acquired by `acquire` and released by
    /// `release` with the exit of the consumer's scope.
    pub fn bracket_exit<X: Send + 'static>(
        acquire: Effect<R, E, A>,
        release: impl Fn(&A, &ReleaseExit) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self
    where
        R: Clone + Send + Sync,
        A: Clone,
    {
        Self::managed(Managed::make_exit(acquire, release))
    }
}

impl<R: 'static, E: Send + 'static> Stream<R, E, i64> {
    /// The integers in `start..end`.
    pub fn range(start: i64, end_exclusive: i64) -> Self {
        Self::new(Managed::from_effect(Effect::effect_total(move || {
            let next = Arc::new(Mutex::new(start));
            Effect::suspend(move || {
                let mut next = next.lock();
                if *next >= end_exclusive {
                    return end();
                }
                let stop = end_exclusive.min(next.saturating_add(CHUNK_SIZE as i64));
                let chunk: Vec<i64> = (*next..stop).collect();
                *next = stop;
                Effect::succeed_once(chunk)
            })
        })))
    }
}

// ============================================================================
// Combinators
// ============================================================================

struct FlatState<R, E, A, B> {
    pending: VecDeque<A>,
    current: Option<(Option<ReleaseKey>, Pull<R, E, B>)>,
}

struct FlatMap<R, E, A, B> {
    outer: Pull<R, E, A>,
    scope: ReleaseMap,
    f: Arc<dyn Fn(A) -> Stream<R, E, B> + Send + Sync>,
    state: Mutex<FlatState<R, E, A, B>>,
}

fn flat_pull<R, E, A, B>(ctx: Arc<FlatMap<R, E, A, B>>) -> Pull<R, E, B>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    Effect::suspend(move || {
        let current = ctx.state.lock().current.clone();
        if let Some((key, pull)) = current {
            let ctx = Arc::clone(&ctx);
            return pull.catch_all_cause(move |cause: Cause<Option<E>>| match cause {
                Cause::Fail(None) => {
                    ctx.state.lock().current = None;
                    let close: Effect<R, Option<E>, ()> = match key {
                        Some(key) => ctx.scope.release(key, Exit::succeed(())).lift_env().widen_error(),
                        None => Effect::unit(),
                    };
                    close.zip_right(flat_pull(Arc::clone(&ctx)))
                }
                other => Effect::halt_once(other),
            });
        }

        let next = ctx.state.lock().pending.pop_front();
        match next {
            Some(a) => open_inner(Arc::clone(&ctx), a).zip_right(flat_pull(Arc::clone(&ctx))),
            None => {
                let ctx = Arc::clone(&ctx);
                ctx.outer.clone().chain_once(move |chunk| {
                    ctx.state.lock().pending.extend(chunk);
                    flat_pull(ctx)
                })
            }
        }
    })
}

/// Acquire the stream for `a` into a child scope registered with the
/// consumer's scope.
fn open_inner<R, E, A, B>(ctx: Arc<FlatMap<R, E, A, B>>, a: A) -> Effect<R, Option<E>, ()>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let stream = (ctx.f)(a);
    let child = ReleaseMap::new();
    let closing = child.clone();
    let finalizer: Finalizer =
        Box::new(move |exit: &ReleaseExit| closing.release_all(exit.clone(), ExecutionStrategy::Sequential));
    ctx.scope
        .add::<R, Option<E>>(finalizer)
        .chain_once(move |key| {
            stream
                .process
                .acquire_into(child)
                .map_error(Some)
                .map(move |pull| ctx.state.lock().current = Some((key, pull)))
        })
        .uninterruptible()
}

impl<R, E, A> Stream<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    fn map_pull<B: Send + 'static>(self, f: impl Fn(Pull<R, E, A>) -> Pull<R, E, B> + Send + Sync + 'static) -> Stream<R, E, B> {
        Stream::new(self.process.map(f))
    }

    /// Transform each element.
    pub fn map<B: Send + 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stream<R, E, B> {
        let f = Arc::new(f);
        self.map_pull(move |pull| {
            let f = Arc::clone(&f);
            pull.map(move |chunk| chunk.into_iter().map(|a| f(a)).collect())
        })
    }

    /// Transform the error.
    pub fn map_error<E2: Send + 'static>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Stream<R, E2, A> {
        let f = Arc::new(f);
        let on_acquire = Arc::clone(&f);
        Stream::new(self.process.map_error(move |e| on_acquire(e)).map(move |pull| {
            let f = Arc::clone(&f);
            pull.map_error(move |e: Option<E>| e.map(|e| f(e)))
        }))
    }

    /// Transform each element with an effect, in order.
    pub fn map_effect<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Stream<R, E, B> {
        let f: Arc<dyn Fn(A) -> Effect<R, Option<E>, B> + Send + Sync> = Arc::new(move |a| f(a).map_error(Some));
        self.map_pull(move |pull| {
            let f = Arc::clone(&f);
            pull.chain(move |chunk| traverse(chunk.into(), Vec::new(), Arc::clone(&f)))
        })
    }

    /// Run an effect for each element, passing the element on.
    pub fn tap<X: Send + 'static>(self, f: impl Fn(&A) -> Effect<R, E, X> + Send + Sync + 'static) -> Self {
        self.map_effect(move |a| f(&a).chain_once(move |_| Effect::succeed_once(a)))
    }

    /// Keep the elements satisfying `predicate`.
    pub fn filter(self, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        let predicate = Arc::new(predicate);
        self.map_pull(move |pull| {
            let predicate = Arc::clone(&predicate);
            pull.map(move |mut chunk| {
                chunk.retain(|a| predicate(a));
                chunk
            })
        })
    }

    /// The first `n` elements. Upstream is not pulled once `n` are taken.
    pub fn take(self, n: usize) -> Self {
        self.map_pull(move |pull| {
            let remaining = Arc::new(Mutex::new(n));
            Effect::suspend(move || {
                if *remaining.lock() == 0 {
                    return end();
                }
                let remaining = Arc::clone(&remaining);
                pull.clone().map(move |mut chunk| {
                    let mut left = remaining.lock();
                    chunk.truncate(*left);
                    *left -= chunk.len();
                    chunk
                })
            })
        })
    }

    /// Elements up to the first one failing `predicate`.
    pub fn take_while(self, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        let predicate = Arc::new(predicate);
        self.map_pull(move |pull| {
            let predicate = Arc::clone(&predicate);
            let stopped = Arc::new(AtomicBool::new(false));
            Effect::suspend(move || {
                if stopped.load(Ordering::Acquire) {
                    return end();
                }
                let (predicate, stopped) = (Arc::clone(&predicate), Arc::clone(&stopped));
                pull.clone().map(move |mut chunk| {
                    if let Some(cut) = chunk.iter().position(|a| !predicate(a)) {
                        chunk.truncate(cut);
                        stopped.store(true, Ordering::Release);
                    }
                    chunk
                })
            })
        })
    }

    /// Pair each element with its index.
    pub fn zip_with_index(self) -> Stream<R, E, (A, u64)> {
        self.map_pull(|pull| {
            let index = Arc::new(AtomicU64::new(0));
            pull.map(move |chunk| {
                chunk
                    .into_iter()
                    .map(|a| (a, index.fetch_add(1, Ordering::Relaxed)))
                    .collect()
            })
        })
    }

    /// Combine elements pairwise. Ends when either side ends.
    pub fn zip_with<B, C>(self, that: Stream<R, E, B>, f: impl Fn(A, B) -> C + Send + Sync + 'static) -> Stream<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Stream::new(self.process.zip(that.process).map(move |(left, right)| {
            let f = Arc::clone(&f);
            let buffers = Arc::new(Mutex::new((VecDeque::<A>::new(), VecDeque::<B>::new())));
            Effect::suspend(move || {
                let (need_left, need_right) = {
                    let b = buffers.lock();
                    (b.0.is_empty(), b.1.is_empty())
                };
                let fill_left = if need_left { left.clone() } else { Effect::succeed_once(Vec::new()) };
                let fill_right = if need_right { right.clone() } else { Effect::succeed_once(Vec::new()) };
                let (buffers, f) = (Arc::clone(&buffers), Arc::clone(&f));
                fill_left.zip(fill_right).map(move |(new_left, new_right)| {
                    let mut b = buffers.lock();
                    b.0.extend(new_left);
                    b.1.extend(new_right);
                    let n = b.0.len().min(b.1.len());
                    let mut out = Vec::with_capacity(n);
                    for _ in 0..n {
                        if let (Some(a), Some(b2)) = (b.0.pop_front(), b.1.pop_front()) {
                            out.push(f(a, b2));
                        }
                    }
                    out
                })
            })
        }))
    }

    /// Pair elements.
    pub fn zip<B: Send + 'static>(self, that: Stream<R, E, B>) -> Stream<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Replace each element with a stream and flatten. Each inner stream's
    /// resources are released as soon as it ends.
    pub fn flat_map<B: Send + 'static>(self, f: impl Fn(A) -> Stream<R, E, B> + Send + Sync + 'static) -> Stream<R, E, B> {
        let f: Arc<dyn Fn(A) -> Stream<R, E, B> + Send + Sync> = Arc::new(f);
        let process = self.process;
        Stream::new(Managed::from_release_map(move |scope: ReleaseMap| {
            let f = Arc::clone(&f);
            process.acquire_into(scope.clone()).map(move |outer| {
                flat_pull(Arc::new(FlatMap {
                    outer,
                    scope: scope.clone(),
                    f: Arc::clone(&f),
                    state: Mutex::new(FlatState {
                        pending: VecDeque::new(),
                        current: None,
                    }),
                }))
            })
        }))
    }

    /// Alias for [`flat_map`](Self::flat_map).
    pub fn chain<B: Send + 'static>(self, f: impl Fn(A) -> Stream<R, E, B> + Send + Sync + 'static) -> Stream<R, E, B> {
        self.flat_map(f)
    }

    /// This stream, then `that`. `that` is opened only after this stream
    /// ends and its resources are released.
    pub fn concat(self, that: Stream<R, E, A>) -> Self {
        Stream::from_iter([self, that]).flat_map(|stream| stream)
    }

    /// Drop elements equal to the one before them.
    pub fn changes_with(self, equal: impl Equal<A> + 'static) -> Self
    where
        A: Clone,
    {
        let equal = Arc::new(equal);
        self.map_pull(move |pull| {
            let equal = Arc::clone(&equal);
            let last: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
            pull.map(move |chunk| {
                let mut last = last.lock();
                let mut out = Vec::with_capacity(chunk.len());
                for a in chunk {
                    if last.as_ref().map_or(true, |prev| !equal.equals(prev, &a)) {
                        *last = Some(a.clone());
                        out.push(a);
                    }
                }
                out
            })
        })
    }
}

// ============================================================================
// Sinks
// ============================================================================

impl<R, E, A> Stream<R, E, A>
where
    R: 'static,
    E: Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Fold whole chunks with an effect. Resources are released when the
    /// fold ends, fails, or is interrupted.
    pub fn fold_chunks_m<S>(self, init: S, f: impl Fn(S, Vec<A>) -> Effect<R, E, S> + Send + Sync + 'static) -> Effect<R, E, S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let step: ChunkStep<R, E, A, S> = Arc::new(f);
        self.process.use_(move |pull| fold_pull(pull, init.clone(), Arc::clone(&step)))
    }

    /// Fold elements with an effect.
    pub fn fold_m<S>(self, init: S, f: impl Fn(S, A) -> Effect<R, E, S> + Send + Sync + 'static) -> Effect<R, E, S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(S, A) -> Effect<R, E, S> + Send + Sync> = Arc::new(f);
        self.fold_chunks_m(init, move |s, chunk| fold_chunk(s, chunk.into(), Arc::clone(&f)))
    }

    /// Fold elements.
    pub fn fold<S>(self, init: S, f: impl Fn(S, A) -> S + Send + Sync + 'static) -> Effect<R, E, S>
    where
        S: Clone + Send + Sync + 'static,
    {
        self.fold_chunks_m(init, move |s, chunk| Effect::succeed_once(chunk.into_iter().fold(s, &f)))
    }

    /// Combine all elements. `None` for an empty stream.
    pub fn fold_with(self, associative: impl Associative<A> + 'static) -> Effect<R, E, Option<A>>
    where
        A: Clone + Sync,
    {
        self.fold(None, move |acc, a| {
            Some(match acc {
                None => a,
                Some(x) => associative.combine(x, a),
            })
        })
    }

    /// Collect every element.
    pub fn run_collect(self) -> Effect<R, E, Vec<A>>
    where
        A: Clone + Sync,
    {
        self.fold_chunks_m(Vec::new(), |mut acc, chunk| {
            acc.extend(chunk);
            Effect::succeed_once(acc)
        })
    }

    /// Run the stream for its effects.
    pub fn run_drain(self) -> Effect<R, E, ()> {
        self.fold_chunks_m((), |_, _| Effect::unit())
    }

    /// Run `f` on each element.
    pub fn for_each<X: Send + 'static>(self, f: impl Fn(A) -> Effect<R, E, X> + Send + Sync + 'static) -> Effect<R, E, ()> {
        self.fold_m((), move |_, a| f(a).as_unit())
    }
}
