//! # Schedules
//!
//! A [`Schedule<A, B>`] decides, for each input `A`, whether to recur and
//! after what delay, producing an output `B`. Schedules drive
//! [`Effect::retry`] (inputs are failures) and [`Effect::repeat`] (inputs
//! are successes).
//!
//! Schedules are pure values. Each run of a retry or repeat loop starts a
//! fresh [`ScheduleDriver`] holding that run's state.
//!
//! ```rust
//! use std::time::Duration;
//! use effect_runtime::Schedule;
//!
//! // Exponential backoff from 10ms, at most 5 retries.
//! let policy = Schedule::<String, _>::exponential(Duration::from_millis(10), 2.0)
//!     .both(Schedule::recurs(5));
//! # let _ = policy;
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::cause::Cause;
use crate::effect::Effect;

/// Type-erased schedule state.
pub struct State(Box<dyn Any + Send>);

impl State {
    fn new<S: Send + 'static>(state: S) -> Self {
        State(Box::new(state))
    }

    fn into_inner<S: 'static>(self) -> S {
        match self.0.downcast::<S>() {
            Ok(state) => *state,
            Err(_) => panic!("schedule state is not a {}", std::any::type_name::<S>()),
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("State(..)")
    }
}

/// The outcome of one schedule step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<S, B> {
    /// Recur after `delay`.
    Continue {
        /// State for the next step.
        state: S,
        /// Wait before the next recurrence.
        delay: Duration,
        /// Output of this step.
        output: B,
    },
    /// Stop with a final output.
    Done(B),
}

impl<S, B> Decision<S, B> {
    /// Whether the schedule stopped.
    pub fn is_done(&self) -> bool {
        matches!(self, Decision::Done(_))
    }

    /// The output of this step.
    pub fn output(&self) -> &B {
        match self {
            Decision::Continue { output, .. } | Decision::Done(output) => output,
        }
    }

    /// The delay, if the schedule continues.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Decision::Continue { delay, .. } => Some(*delay),
            Decision::Done(_) => None,
        }
    }

    fn map_state<S2>(self, f: impl FnOnce(S) -> S2) -> Decision<S2, B> {
        match self {
            Decision::Continue { state, delay, output } => Decision::Continue {
                state: f(state),
                delay,
                output,
            },
            Decision::Done(output) => Decision::Done(output),
        }
    }

    fn map_output<C>(self, f: impl FnOnce(B) -> C) -> Decision<S, C> {
        match self {
            Decision::Continue { state, delay, output } => Decision::Continue {
                state,
                delay,
                output: f(output),
            },
            Decision::Done(output) => Decision::Done(f(output)),
        }
    }

    fn map_delay(self, f: impl FnOnce(&B, Duration) -> Duration) -> Self {
        match self {
            Decision::Continue { state, delay, output } => Decision::Continue {
                delay: f(&output, delay),
                state,
                output,
            },
            done => done,
        }
    }
}

type Initial = Arc<dyn Fn() -> State + Send + Sync>;
type StepFn<A, B> = Arc<dyn Fn(State, Instant, &A) -> Decision<State, B> + Send + Sync>;

/// A recurrence policy consuming `A` and producing `B`.
pub struct Schedule<A, B> {
    initial: Initial,
    step: StepFn<A, B>,
}

impl<A, B> Clone for Schedule<A, B> {
    fn clone(&self) -> Self {
        Self {
            initial: Arc::clone(&self.initial),
            step: Arc::clone(&self.step),
        }
    }
}

impl<A, B> fmt::Debug for Schedule<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Schedule")
    }
}

/// Runs a schedule one step at a time.
pub struct ScheduleDriver<A, B> {
    schedule: Schedule<A, B>,
    state: Option<State>,
}

impl<A, B> ScheduleDriver<A, B> {
    /// Feed one input. A driver that returned `Done` starts over on the
    /// next call.
    pub fn next(&mut self, now: Instant, input: &A) -> Decision<(), B> {
        let state = self.state.take().unwrap_or_else(|| (self.schedule.initial)());
        match (self.schedule.step)(state, now, input) {
            Decision::Continue { state, delay, output } => {
                self.state = Some(state);
                Decision::Continue {
                    state: (),
                    delay,
                    output,
                }
            }
            Decision::Done(output) => Decision::Done(output),
        }
    }

    /// Drop the current state.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

impl<A, B> fmt::Debug for ScheduleDriver<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleDriver")
            .field("started", &self.state.is_some())
            .finish()
    }
}

impl<A: 'static, B: 'static> Schedule<A, B> {
    /// A schedule with typed state `S`.
    pub fn new<S>(initial: S, step: impl Fn(S, Instant, &A) -> Decision<S, B> + Send + Sync + 'static) -> Self
    where
        S: Clone + Send + Sync + 'static,
    {
        Self {
            initial: Arc::new(move || State::new(initial.clone())),
            step: Arc::new(move |state: State, now: Instant, input: &A| {
                step(state.into_inner::<S>(), now, input).map_state(State::new)
            }),
        }
    }

    /// Start a run.
    pub fn driver(&self) -> ScheduleDriver<A, B> {
        ScheduleDriver {
            schedule: self.clone(),
            state: None,
        }
    }

    /// Transform the output.
    pub fn map<C: 'static>(self, f: impl Fn(B) -> C + Send + Sync + 'static) -> Schedule<A, C> {
        let step = self.step;
        Schedule {
            initial: self.initial,
            step: Arc::new(move |state: State, now: Instant, input: &A| step(state, now, input).map_output(&f)),
        }
    }

    /// Discard the output.
    pub fn unit(self) -> Schedule<A, ()> {
        self.map(|_| ())
    }

    /// Adapt the input.
    pub fn contramap<A2: 'static>(self, f: impl Fn(&A2) -> A + Send + Sync + 'static) -> Schedule<A2, B> {
        let step = self.step;
        Schedule {
            initial: self.initial,
            step: Arc::new(move |state: State, now: Instant, input: &A2| step(state, now, &f(input))),
        }
    }

    /// Recur only while both schedules recur, waiting for the longer delay.
    pub fn both<C: 'static>(self, that: Schedule<A, C>) -> Schedule<A, (B, C)> {
        let (left_init, right_init) = (self.initial, that.initial);
        let (left, right) = (self.step, that.step);
        Schedule {
            initial: Arc::new(move || State::new((left_init(), right_init()))),
            step: Arc::new(move |state: State, now: Instant, input: &A| {
                let (l, r) = state.into_inner::<(State, State)>();
                match (left(l, now, input), right(r, now, input)) {
                    (
                        Decision::Continue {
                            state: l,
                            delay: ld,
                            output: b,
                        },
                        Decision::Continue {
                            state: r,
                            delay: rd,
                            output: c,
                        },
                    ) => Decision::Continue {
                        state: State::new((l, r)),
                        delay: ld.max(rd),
                        output: (b, c),
                    },
                    (l, r) => Decision::Done((into_output(l), into_output(r))),
                }
            }),
        }
    }

    /// Recur while either schedule recurs, waiting for the shorter delay.
    /// A finished side contributes `None`.
    pub fn either<C: 'static>(self, that: Schedule<A, C>) -> Schedule<A, (Option<B>, Option<C>)> {
        let (left_init, right_init) = (self.initial, that.initial);
        let (left, right) = (self.step, that.step);
        Schedule {
            initial: Arc::new(move || State::new((Some(left_init()), Some(right_init())))),
            step: Arc::new(move |state: State, now: Instant, input: &A| {
                let (l, r) = state.into_inner::<(Option<State>, Option<State>)>();
                let l = l.map(|s| left(s, now, input));
                let r = r.map(|s| right(s, now, input));
                let delay = [
                    l.as_ref().and_then(Decision::delay),
                    r.as_ref().and_then(Decision::delay),
                ]
                .into_iter()
                .flatten()
                .min();
                let (l_state, b) = split(l);
                let (r_state, c) = split(r);
                match delay {
                    Some(delay) => Decision::Continue {
                        state: State::new((l_state, r_state)),
                        delay,
                        output: (b, c),
                    },
                    None => Decision::Done((b, c)),
                }
            }),
        }
    }

    /// Run this schedule to completion, then `that`.
    pub fn and_then(self, that: Schedule<A, B>) -> Schedule<A, B> {
        enum Phase {
            First(State),
            Second(State),
        }
        let first_init = self.initial;
        let (first, second) = (self.step, that.step);
        let second_init = that.initial;
        Schedule {
            initial: Arc::new(move || State::new(Phase::First(first_init()))),
            step: Arc::new(move |state: State, now: Instant, input: &A| match state.into_inner::<Phase>() {
                Phase::First(s) => match first(s, now, input) {
                    Decision::Done(_) => second(second_init(), now, input).map_state(|s| State::new(Phase::Second(s))),
                    going => going.map_state(|s| State::new(Phase::First(s))),
                },
                Phase::Second(s) => second(s, now, input).map_state(|s| State::new(Phase::Second(s))),
            }),
        }
    }

    fn check(self, keep_going: impl Fn(&A, &B) -> bool + Send + Sync + 'static) -> Self {
        let step = self.step;
        Schedule {
            initial: self.initial,
            step: Arc::new(move |state: State, now: Instant, input: &A| match step(state, now, input) {
                Decision::Continue { state, delay, output } => {
                    if keep_going(input, &output) {
                        Decision::Continue { state, delay, output }
                    } else {
                        Decision::Done(output)
                    }
                }
                done => done,
            }),
        }
    }

    /// Stop when `predicate` rejects an input.
    pub fn while_input(self, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.check(move |a, _| predicate(a))
    }

    /// Stop when `predicate` accepts an input.
    pub fn until_input(self, predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.check(move |a, _| !predicate(a))
    }

    /// Stop when `predicate` rejects an output.
    pub fn while_output(self, predicate: impl Fn(&B) -> bool + Send + Sync + 'static) -> Self {
        self.check(move |_, b| predicate(b))
    }

    /// Stop when `predicate` accepts an output.
    pub fn until_output(self, predicate: impl Fn(&B) -> bool + Send + Sync + 'static) -> Self {
        self.check(move |_, b| !predicate(b))
    }

    /// Stop once `limit` has elapsed since the first step.
    pub fn up_to(self, limit: Duration) -> Self {
        self.both(Schedule::during(limit)).map(|(b, _)| b)
    }

    /// Change each delay.
    pub fn modify_delay(self, f: impl Fn(&B, Duration) -> Duration + Send + Sync + 'static) -> Self {
        let step = self.step;
        Schedule {
            initial: self.initial,
            step: Arc::new(move |state: State, now: Instant, input: &A| step(state, now, input).map_delay(&f)),
        }
    }

    /// Add to each delay.
    pub fn add_delay(self, f: impl Fn(&B) -> Duration + Send + Sync + 'static) -> Self {
        self.modify_delay(move |b, delay| delay.saturating_add(f(b)))
    }

    /// Scale each delay by a random factor in `[min, max)`.
    pub fn jittered(self, min: f64, max: f64) -> Self {
        self.modify_delay(move |_, delay| {
            let factor = if max > min {
                rand::rng().random_range(min..max)
            } else {
                min
            };
            scale(delay, factor)
        })
    }

    /// Fold the outputs.
    pub fn fold<Z>(self, zero: Z, f: impl Fn(Z, &B) -> Z + Send + Sync + 'static) -> Schedule<A, Z>
    where
        Z: Clone + Send + Sync + 'static,
    {
        let (init, step) = (self.initial, self.step);
        Schedule {
            initial: Arc::new(move || State::new((init(), zero.clone()))),
            step: Arc::new(move |state: State, now: Instant, input: &A| {
                let (inner, acc) = state.into_inner::<(State, Z)>();
                match step(inner, now, input) {
                    Decision::Continue { state, delay, output } => {
                        let acc = f(acc, &output);
                        Decision::Continue {
                            state: State::new((state, acc.clone())),
                            delay,
                            output: acc,
                        }
                    }
                    Decision::Done(output) => Decision::Done(f(acc, &output)),
                }
            }),
        }
    }

    /// Collect every output.
    pub fn collect_all(self) -> Schedule<A, Vec<B>>
    where
        B: Clone + Send + Sync,
    {
        self.fold(Vec::new(), |mut acc, b| {
            acc.push(b.clone());
            acc
        })
    }

    /// Output the delays instead.
    pub fn delays(self) -> Schedule<A, Duration> {
        let step = self.step;
        Schedule {
            initial: self.initial,
            step: Arc::new(move |state: State, now: Instant, input: &A| match step(state, now, input) {
                Decision::Continue { state, delay, .. } => Decision::Continue {
                    state,
                    delay,
                    output: delay,
                },
                Decision::Done(_) => Decision::Done(Duration::ZERO),
            }),
        }
    }
}

fn into_output<S, B>(decision: Decision<S, B>) -> B {
    match decision {
        Decision::Continue { output, .. } | Decision::Done(output) => output,
    }
}

/// `delay * factor`, saturating at `Duration::MAX`. Negative or NaN
/// factors give zero.
fn scale(delay: Duration, factor: f64) -> Duration {
    if delay.is_zero() || factor.is_nan() || factor <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

fn split<B>(decision: Option<Decision<State, B>>) -> (Option<State>, Option<B>) {
    match decision {
        Some(Decision::Continue { state, output, .. }) => (Some(state), Some(output)),
        Some(Decision::Done(output)) => (None, Some(output)),
        None => (None, None),
    }
}

fn count_schedule<A: 'static>(delay_for: impl Fn(u64) -> Option<Duration> + Send + Sync + 'static) -> Schedule<A, u64> {
    Schedule::new(0u64, move |n, _, _| match delay_for(n) {
        Some(delay) => Decision::Continue {
            state: n + 1,
            delay,
            output: n,
        },
        None => Decision::Done(n),
    })
}

impl<A: 'static> Schedule<A, u64> {
    /// Recur forever without delay. Outputs the recurrence count.
    pub fn forever() -> Self {
        count_schedule(|_| Some(Duration::ZERO))
    }

    /// Recur `times` times.
    pub fn recurs(times: u64) -> Self {
        count_schedule(move |n| (n < times).then_some(Duration::ZERO))
    }

    /// Recur forever, waiting `interval` between recurrences.
    pub fn spaced(interval: Duration) -> Self {
        count_schedule(move |_| Some(interval))
    }

    /// Recur with the delay `f` gives for the n-th recurrence; `None` stops.
    pub fn from_fn(f: impl Fn(u64) -> Option<Duration> + Send + Sync + 'static) -> Self {
        count_schedule(f)
    }

    /// Recur on a fixed interval measured from the first step. Late
    /// recurrences run immediately without piling up.
    pub fn fixed(interval: Duration) -> Self {
        Schedule::new((None::<Instant>, 0u64), move |(start, n), now, _| {
            let start = start.unwrap_or(now);
            let behind = match interval.as_nanos() {
                0 => 0,
                nanos => (now.saturating_duration_since(start).as_nanos() / nanos) as u64,
            };
            let ticks = (n + 1).max(behind + 1);
            let next = start + interval.saturating_mul(ticks.min(u32::MAX as u64) as u32);
            Decision::Continue {
                state: (Some(start), ticks),
                delay: next.saturating_duration_since(now),
                output: n,
            }
        })
    }
}

impl<A: 'static> Schedule<A, ()> {
    /// Recur once.
    pub fn once() -> Self {
        Schedule::recurs(1).unit()
    }

    /// Never recur.
    pub fn stop() -> Self {
        Schedule::recurs(0).unit()
    }
}

impl<A: 'static> Schedule<A, Duration> {
    /// Delays of `base * factor^n`. Outputs the delay.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Schedule::new(0i32, move |n, _, _| {
            let delay = scale(base, factor.powi(n));
            Decision::Continue {
                state: n.saturating_add(1),
                delay,
                output: delay,
            }
        })
    }

    /// Delays following the Fibonacci sequence from `one`.
    pub fn fibonacci(one: Duration) -> Self {
        Schedule::new((one, one), |(a, b), _, _| Decision::Continue {
            state: (b, a.saturating_add(b)),
            delay: a,
            output: a,
        })
    }

    /// Delays of `base * (n + 1)`.
    pub fn linear(base: Duration) -> Self {
        Schedule::new(1u32, move |n, _, _| {
            let delay = base.saturating_mul(n);
            Decision::Continue {
                state: n.saturating_add(1),
                delay,
                output: delay,
            }
        })
    }

    /// Recur forever without delay, outputting time since the first step.
    pub fn elapsed() -> Self {
        Schedule::new(None::<Instant>, |start, now, _| {
            let start = start.unwrap_or(now);
            Decision::Continue {
                state: Some(start),
                delay: Duration::ZERO,
                output: now.saturating_duration_since(start),
            }
        })
    }

    /// Recur without delay until `limit` has elapsed.
    pub fn during(limit: Duration) -> Self {
        Schedule::elapsed().while_output(move |elapsed| *elapsed < limit)
    }
}

impl<A: Clone + 'static> Schedule<A, A> {
    /// Recur forever, outputting each input.
    pub fn identity() -> Self {
        Schedule::new((), |(), _, input: &A| Decision::Continue {
            state: (),
            delay: Duration::ZERO,
            output: input.clone(),
        })
    }

    /// Recur while inputs satisfy `predicate`.
    pub fn recur_while(predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        Schedule::identity().while_input(predicate)
    }

    /// Recur until an input satisfies `predicate`.
    pub fn recur_until(predicate: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        Schedule::identity().until_input(predicate)
    }
}

// ============================================================================
// Effect drivers
// ============================================================================

type Shared<T> = Arc<Mutex<T>>;

fn pause<R: 'static, E: Send + 'static>(delay: Duration) -> Effect<R, E, ()> {
    if delay.is_zero() {
        Effect::unit()
    } else {
        Effect::sleep(delay)
    }
}

fn repeat_loop<R, E, E2, A, B>(
    effect: Effect<R, E, A>,
    driver: Shared<ScheduleDriver<A, B>>,
    last: Shared<Option<B>>,
    or_else: Arc<dyn Fn(E, Option<B>) -> Effect<R, E2, B> + Send + Sync>,
) -> Effect<R, E2, B>
where
    R: 'static,
    E: Send + 'static,
    E2: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let again = effect.clone();
    let (on_failure_last, on_failure) = (Arc::clone(&last), Arc::clone(&or_else));
    effect.fold_m(
        move |e| on_failure(e, on_failure_last.lock().take()),
        move |a| {
            let decision = driver.lock().next(Instant::now(), &a);
            match decision {
                Decision::Continue { delay, output, .. } => {
                    *last.lock() = Some(output);
                    let next = repeat_loop(again.clone(), Arc::clone(&driver), Arc::clone(&last), Arc::clone(&or_else));
                    pause(delay).zip_right(next)
                }
                Decision::Done(output) => Effect::succeed_once(output),
            }
        },
    )
}

fn retry_loop<R, E, E2, A, B>(
    effect: Effect<R, E, A>,
    driver: Shared<ScheduleDriver<E, B>>,
    or_else: Arc<dyn Fn(E, B) -> Effect<R, E2, A> + Send + Sync>,
) -> Effect<R, E2, A>
where
    R: 'static,
    E: Send + 'static,
    E2: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let again = effect.clone();
    effect.catch_all(move |e| {
        let decision = driver.lock().next(Instant::now(), &e);
        match decision {
            Decision::Continue { delay, .. } => {
                let next = retry_loop(again.clone(), Arc::clone(&driver), Arc::clone(&or_else));
                pause(delay).zip_right(next)
            }
            Decision::Done(output) => or_else(e, output),
        }
    })
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run once, then again as long as `schedule` recurs on the success
    /// values. Succeeds with the schedule's final output.
    pub fn repeat<B: Send + 'static>(self, schedule: Schedule<A, B>) -> Effect<R, E, B> {
        self.repeat_or_else(schedule, |e, _| Effect::halt_once(Cause::fail(e)))
    }

    /// [`repeat`](Self::repeat), handing a failure and the last schedule
    /// output to `or_else`.
    pub fn repeat_or_else<B, E2>(
        self,
        schedule: Schedule<A, B>,
        or_else: impl Fn(E, Option<B>) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        let or_else: Arc<dyn Fn(E, Option<B>) -> Effect<R, E2, B> + Send + Sync> = Arc::new(or_else);
        Effect::suspend(move || {
            let driver = Arc::new(Mutex::new(schedule.driver()));
            repeat_loop(self.clone(), driver, Arc::new(Mutex::new(None)), Arc::clone(&or_else))
        })
    }

    /// Retry on typed failure as long as `schedule` recurs on the errors.
    /// Defects and interruptions are not retried.
    pub fn retry<B: Send + 'static>(self, schedule: Schedule<E, B>) -> Effect<R, E, A> {
        self.retry_or_else(schedule, |e, _| Effect::halt_once(Cause::fail(e)))
    }

    /// [`retry`](Self::retry), handing the last error and the schedule
    /// output to `or_else` once the schedule is done.
    pub fn retry_or_else<B, E2>(
        self,
        schedule: Schedule<E, B>,
        or_else: impl Fn(E, B) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A>
    where
        B: Send + 'static,
        E2: Send + 'static,
    {
        let or_else: Arc<dyn Fn(E, B) -> Effect<R, E2, A> + Send + Sync> = Arc::new(or_else);
        Effect::suspend(move || {
            let driver = Arc::new(Mutex::new(schedule.driver()));
            retry_loop(self.clone(), driver, Arc::clone(&or_else))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::exit::{Exit, Never};
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn run<A: 'static, B: 'static>(schedule: &Schedule<A, B>, inputs: &[A]) -> Vec<Decision<(), B>> {
        let mut driver = schedule.driver();
        let now = Instant::now();
        inputs.iter().map(|a| driver.next(now, a)).collect()
    }

    fn delays<A: 'static, B: 'static>(schedule: &Schedule<A, B>, inputs: &[A]) -> Vec<Option<Duration>> {
        run(schedule, inputs).iter().map(Decision::delay).collect()
    }

    #[test]
    fn test_recurs() {
        let decisions = run(&Schedule::<(), u64>::recurs(2), &[(), (), ()]);
        assert!(!decisions[0].is_done());
        assert!(!decisions[1].is_done());
        assert_eq!(decisions[2], Decision::Done(2));
    }

    #[test]
    fn test_exponential() {
        let ms = Duration::from_millis;
        let schedule = Schedule::<(), Duration>::exponential(ms(10), 2.0);
        assert_eq!(delays(&schedule, &[(), (), ()]), vec![Some(ms(10)), Some(ms(20)), Some(ms(40))]);
    }

    #[test]
    fn test_fibonacci_and_linear() {
        let ms = Duration::from_millis;
        let fib = Schedule::<(), Duration>::fibonacci(ms(1));
        assert_eq!(
            delays(&fib, &[(), (), (), (), ()]),
            vec![Some(ms(1)), Some(ms(1)), Some(ms(2)), Some(ms(3)), Some(ms(5))]
        );
        let linear = Schedule::<(), Duration>::linear(ms(5));
        assert_eq!(delays(&linear, &[(), (), ()]), vec![Some(ms(5)), Some(ms(10)), Some(ms(15))]);
    }

    #[test]
    fn test_both_takes_max_delay_and_stops_early() {
        let ms = Duration::from_millis;
        let schedule = Schedule::<(), u64>::spaced(ms(5)).both(Schedule::recurs(1).modify_delay(move |_, _| ms(9)));
        let decisions = run(&schedule, &[(), ()]);
        assert_eq!(decisions[0].delay(), Some(ms(9)));
        assert!(decisions[1].is_done());
    }

    #[test]
    fn test_either_takes_min_delay_and_runs_longer() {
        let ms = Duration::from_millis;
        let schedule = Schedule::<(), u64>::spaced(ms(5)).either(Schedule::recurs(1));
        let decisions = run(&schedule, &[(), (), ()]);
        assert_eq!(decisions[0].delay(), Some(Duration::ZERO));
        assert_eq!(decisions[1].delay(), Some(ms(5)));
        assert_eq!(decisions[2].delay(), Some(ms(5)));
        assert_eq!(decisions[2].output().1, None);
    }

    #[test]
    fn test_either_done_when_both_done() {
        let schedule = Schedule::<(), u64>::recurs(1).either(Schedule::recurs(2));
        let decisions = run(&schedule, &[(), (), ()]);
        assert!(!decisions[1].is_done());
        assert_eq!(decisions[1].output(), &(Some(1), Some(1)));
        assert_eq!(decisions[2], Decision::Done((None, Some(2))));
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let exponential = Schedule::<(), Duration>::exponential(Duration::from_nanos(1), 2.0);
        let last = delays(&exponential, &[(); 2_000]).pop().flatten();
        assert_eq!(last, Some(Duration::MAX));

        let fibonacci = Schedule::<(), Duration>::fibonacci(Duration::from_secs(1));
        assert!(delays(&fibonacci, &[(); 500]).into_iter().all(|d| d.is_some()));

        let linear = Schedule::<(), Duration>::linear(Duration::MAX / 2);
        assert_eq!(delays(&linear, &[(); 3])[2], Some(Duration::MAX));

        let jittered = Schedule::<(), u64>::spaced(Duration::MAX).jittered(1.5, 2.0);
        assert_eq!(delays(&jittered, &[()])[0], Some(Duration::MAX));
    }

    #[test]
    fn test_and_then_switches_schedules() {
        let ms = Duration::from_millis;
        let schedule = Schedule::<(), u64>::recurs(1)
            .map(move |_| ms(1))
            .modify_delay(move |_, _| ms(1))
            .and_then(Schedule::spaced(ms(7)).map(move |_| ms(7)));
        assert_eq!(delays(&schedule, &[(), (), ()]), vec![Some(ms(1)), Some(ms(7)), Some(ms(7))]);
    }

    #[test]
    fn test_recur_while_and_collect() {
        let schedule = Schedule::<i32, i32>::recur_while(|n| *n < 3).collect_all();
        let decisions = run(&schedule, &[1, 2, 3]);
        assert_eq!(decisions[1].output(), &vec![1, 2]);
        assert_eq!(decisions[2], Decision::Done(vec![1, 2, 3]));
    }

    #[test]
    fn test_jittered_stays_in_range() {
        let base = Duration::from_millis(100);
        let schedule = Schedule::<(), u64>::spaced(base).jittered(0.5, 1.5);
        for delay in delays(&schedule, &[(); 20]).into_iter().flatten() {
            assert!(delay >= base / 2 && delay <= base * 3 / 2);
        }
    }

    #[test]
    fn test_driver_restarts_after_done() {
        let schedule = Schedule::<(), u64>::recurs(1);
        let mut driver = schedule.driver();
        let now = Instant::now();
        assert!(!driver.next(now, &()).is_done());
        assert!(driver.next(now, &()).is_done());
        assert!(!driver.next(now, &()).is_done());
    }

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_retry_until_success() {
        let rt = runtime();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let flaky = Effect::<(), String, u32>::effect_partial(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {}", n))
            } else {
                Ok(n)
            }
        });
        let program = flaky.retry(Schedule::recurs(5));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(3));
    }

    #[test]
    fn test_retry_gives_up_with_last_error() {
        let rt = runtime();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let failing = Effect::<(), String, ()>::effect_partial(move || {
            Err(format!("attempt {}", counter.fetch_add(1, Ordering::SeqCst) + 1))
        });
        let program = failing.retry(Schedule::spaced(Duration::from_millis(1)).both(Schedule::recurs(2)));
        assert_eq!(rt.unsafe_run_sync(program), Exit::fail("attempt 3".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_long_retry_with_capped_backoff() {
        let rt = runtime();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let failing = Effect::<(), String, ()>::effect_partial(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("e".to_string())
        });
        let policy = Schedule::exponential(Duration::from_nanos(1), 2.0)
            .modify_delay(|_, delay| delay.min(Duration::from_micros(100)))
            .both(Schedule::recurs(250));
        assert_eq!(rt.unsafe_run_sync(failing.retry(policy)), Exit::fail("e".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 251);
    }

    #[test]
    fn test_retry_or_else_receives_output() {
        let rt = runtime();
        let program = Effect::<(), String, u64>::fail("nope".to_string())
            .retry_or_else(Schedule::recurs(2), |e, n| Effect::<(), Never, u64>::succeed(e.len() as u64 * 100 + n));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(402));
    }

    #[test]
    fn test_repeat_runs_once_plus_recurrences() {
        let rt = runtime();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let tick = Effect::<(), Never, ()>::effect_total(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(rt.unsafe_run_sync(tick.repeat(Schedule::recurs(3))), Exit::Success(3));
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_repeat_stops_on_failure() {
        let rt = runtime();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let step = Effect::<(), String, u32>::effect_partial(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 2 {
                Err("third".to_string())
            } else {
                Ok(n)
            }
        });
        assert_eq!(rt.unsafe_run_sync(step.repeat(Schedule::forever())), Exit::fail("third".to_string()));
    }
}
