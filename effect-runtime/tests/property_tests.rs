//! Property-based tests for the effect runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use effect_runtime::{
    make_associative, Cause, Decision, Effect, ExecutionStrategy, Exit, Runtime, RuntimeConfig, Schedule, Stream, IO,
};
use proptest::prelude::*;

fn rt() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap()).unwrap())
}

/// Strategy for generating a small pause in microseconds
fn jitter() -> impl Strategy<Value = u64> {
    0u64..200
}

/// Strategy for generating an execution strategy
fn strategy() -> impl Strategy<Value = ExecutionStrategy> {
    prop_oneof![
        Just(ExecutionStrategy::Sequential),
        Just(ExecutionStrategy::Parallel),
        (1usize..6).prop_map(ExecutionStrategy::ParallelN),
    ]
}

fn delays<B: 'static>(schedule: &Schedule<(), B>, steps: usize) -> Vec<Option<Duration>> {
    let mut driver = schedule.driver();
    let now = Instant::now();
    (0..steps).map(|_| driver.next(now, &()).delay()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Parallel traversal returns results in input order whatever the timing
    #[test]
    fn foreach_exec_preserves_order(
        items in prop::collection::vec((any::<i32>(), jitter()), 0..40),
        strategy in strategy(),
    ) {
        let program = IO::<String, ()>::foreach_exec(strategy, items.clone(), |(n, pause)| {
            IO::<String, i64>::succeed(n as i64 * 2).delay(Duration::from_micros(pause))
        });
        let expected: Vec<i64> = items.iter().map(|(n, _)| *n as i64 * 2).collect();
        prop_assert_eq!(rt().unsafe_run_sync(program), Exit::Success(expected));
    }

    /// Parallel reduction agrees with a left fold for associative operations
    #[test]
    fn reduce_all_par_matches_fold(words in prop::collection::vec("[a-z]{0,4}", 1..20)) {
        let effects: Vec<IO<String, String>> = words.iter().map(|w| Effect::succeed(w.clone())).collect();
        let concat = make_associative(|a: String, b: String| a + &b);
        let program = IO::<String, ()>::reduce_all_par(effects[0].clone(), effects[1..].to_vec(), concat);
        prop_assert_eq!(rt().unsafe_run_sync(program), Exit::Success(words.concat()));
    }

    /// Running an effect twice gives the same result
    #[test]
    fn runs_are_deterministic(values in prop::collection::vec(any::<u16>(), 0..30)) {
        let program = IO::<String, ()>::foreach_par(values.clone(), |v| IO::<String, u32>::succeed(v as u32 + 1))
            .map(|vs| vs.into_iter().sum::<u32>());
        let first = rt().unsafe_run_sync(program.clone());
        prop_assert_eq!(first, rt().unsafe_run_sync(program));
    }

    /// The first failure in sequence order is the one reported
    #[test]
    fn sequential_failure_is_first(values in prop::collection::vec(0u8..10, 1..30), bad in 0u8..10) {
        let program = IO::<u8, ()>::foreach(values.clone(), move |v| {
            if v == bad { IO::<u8, u8>::fail(v) } else { IO::<u8, u8>::succeed(v) }
        });
        let expected = if values.contains(&bad) { Exit::fail(bad) } else { Exit::Success(values) };
        prop_assert_eq!(rt().unsafe_run_sync(program), expected);
    }

    /// `recurs(n)` continues exactly n times
    #[test]
    fn recurs_counts(n in 0u64..50) {
        let steps = delays(&Schedule::recurs(n), n as usize + 1);
        prop_assert!(steps[..n as usize].iter().all(Option::is_some));
        prop_assert_eq!(steps[n as usize], None);
    }

    /// `both` waits for the longer delay and `either` for the shorter
    #[test]
    fn both_max_either_min(a in 0u64..1000, b in 0u64..1000) {
        let left = || Schedule::<(), u64>::spaced(Duration::from_millis(a));
        let right = || Schedule::<(), u64>::spaced(Duration::from_millis(b));
        prop_assert_eq!(delays(&left().both(right()), 1)[0], Some(Duration::from_millis(a.max(b))));
        prop_assert_eq!(delays(&left().either(right()), 1)[0], Some(Duration::from_millis(a.min(b))));
    }

    /// Exponential backoff never shrinks for factors of at least one
    #[test]
    fn exponential_is_monotonic(base in 1u64..100, factor in 1.0f64..3.0) {
        let steps = delays(&Schedule::<(), Duration>::exponential(Duration::from_millis(base), factor), 8);
        let steps: Vec<Duration> = steps.into_iter().flatten().collect();
        prop_assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Jittered delays stay within the requested bounds
    #[test]
    fn jitter_in_bounds(base in 1u64..1000, min in 0.0f64..1.0, spread in 0.0f64..1.0) {
        let base = Duration::from_millis(base);
        let max = min + spread;
        let schedule = Schedule::<(), u64>::spaced(base).jittered(min, max);
        for delay in delays(&schedule, 10).into_iter().flatten() {
            prop_assert!(delay <= base.mul_f64(max) + Duration::from_nanos(1));
        }
    }

    /// A stream built from a vector collects back to it
    #[test]
    fn stream_collects_input(items in prop::collection::vec(any::<i32>(), 0..300)) {
        let program = Stream::<(), String, i32>::from_iter(items.clone()).run_collect();
        prop_assert_eq!(rt().unsafe_run_sync(program), Exit::Success(items));
    }

    /// Stream combinators agree with iterator adapters
    #[test]
    fn stream_matches_iterator(items in prop::collection::vec(any::<i16>(), 0..300), n in 0usize..100) {
        let program = Stream::<(), String, i16>::from_iter(items.clone())
            .filter(|x| x % 2 == 0)
            .map(|x| x as i32 * 3)
            .take(n)
            .run_collect();
        let expected: Vec<i32> = items.iter().filter(|x| *x % 2 == 0).map(|x| *x as i32 * 3).take(n).collect();
        prop_assert_eq!(rt().unsafe_run_sync(program), Exit::Success(expected));
    }

    /// Zipping stops at the shorter stream
    #[test]
    fn stream_zip_is_shortest(left in 0i64..200, right in 0i64..200) {
        let program = Stream::<(), String, i64>::range(0, left)
            .zip(Stream::range(0, right))
            .run_collect();
        let expected: Vec<(i64, i64)> = (0..left.min(right)).map(|i| (i, i)).collect();
        prop_assert_eq!(rt().unsafe_run_sync(program), Exit::Success(expected));
    }

    /// Typed failures keep their order through `then` and `both`
    #[test]
    fn cause_failures_keep_order(a in any::<u8>(), b in any::<u8>(), c in any::<u8>()) {
        let cause = Cause::then(Cause::fail(a), Cause::both(Cause::fail(b), Cause::fail(c)));
        prop_assert_eq!(cause.into_failures(), vec![a, b, c]);
    }
}

#[test]
fn decision_accessors() {
    let step: Decision<(), u8> = Decision::Continue {
        state: (),
        delay: Duration::from_millis(3),
        output: 7,
    };
    assert_eq!(step.output(), &7);
    assert_eq!(step.delay(), Some(Duration::from_millis(3)));
    assert!(Decision::<(), u8>::Done(1).is_done());
}
