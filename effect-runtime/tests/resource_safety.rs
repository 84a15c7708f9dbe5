//! Resource safety: every acquired resource is released exactly once, on
//! success, failure, defect and interruption.

use std::sync::Arc;
use std::time::Duration;

use effect_runtime::{
    Effect, ExecutionStrategy, Exit, Managed, Never, ReleaseExit, ReleaseMap, Runtime, RuntimeConfig, IO, UIO,
};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(4).build().unwrap()).unwrap()
}

fn push(log: &Log, entry: impl Into<String>) -> UIO<()> {
    let log = Arc::clone(log);
    let entry = entry.into();
    Effect::effect_total(move || log.lock().push(entry.clone()))
}

fn resource(log: &Log, name: &'static str) -> Managed<(), String, &'static str> {
    let release_log = Arc::clone(log);
    Managed::make_exit(
        push(log, format!("acquire {}", name)).widen_error().as_(name),
        move |name: &&'static str, exit: &ReleaseExit| {
            let outcome = match exit {
                Exit::Success(()) => "success",
                Exit::Failure(_) => "failure",
                Exit::Interrupted(_) => "interrupted",
            };
            push(&release_log, format!("release {} ({})", name, outcome))
        },
    )
}

#[test]
fn nested_resources_release_in_reverse_order() {
    let rt = runtime();
    let log: Log = Arc::default();
    let body_log = Arc::clone(&log);
    let program = resource(&log, "db")
        .zip(resource(&log, "cache"))
        .use_(move |(a, b)| push(&body_log, format!("use {} {}", a, b)).widen_error());

    assert_eq!(rt.unsafe_run_sync(program), Exit::Success(()));
    assert_eq!(
        *log.lock(),
        vec![
            "acquire db",
            "acquire cache",
            "use db cache",
            "release cache (success)",
            "release db (success)",
        ]
    );
}

#[test]
fn failing_body_releases_with_failure() {
    let rt = runtime();
    let log: Log = Arc::default();
    let program = resource(&log, "file").use_(|_| IO::<String, ()>::fail("write failed".to_string()));

    assert_eq!(rt.unsafe_run_sync(program), Exit::fail("write failed".to_string()));
    assert_eq!(*log.lock(), vec!["acquire file", "release file (failure)"]);
}

#[test]
fn defect_in_body_releases() {
    let rt = runtime();
    let log: Log = Arc::default();
    let program = resource(&log, "socket").use_(|_| IO::<String, ()>::effect_total(|| panic!("bug in handler")));

    assert!(rt.unsafe_run_sync(program).cause().map_or(false, |c| c.is_die()));
    assert_eq!(*log.lock(), vec!["acquire socket", "release socket (failure)"]);
}

#[test]
fn interrupted_body_releases() {
    let rt = runtime();
    let log: Log = Arc::default();
    let scoped = resource(&log, "lock").use_(|_| IO::<String, ()>::never());
    let program = scoped
        .fork()
        .chain(|fiber| IO::<String, ()>::sleep(Duration::from_millis(20)).zip_right(fiber.interrupt().widen_error()));

    let exit = rt.unsafe_run_sync(program);
    assert!(exit.value().map_or(false, Exit::is_interrupted));
    assert_eq!(*log.lock(), vec!["acquire lock", "release lock (interrupted)"]);
}

#[test]
fn acquisition_is_not_interrupted() {
    let rt = runtime();
    let log: Log = Arc::default();
    let slow_log = Arc::clone(&log);
    let release_log = Arc::clone(&log);
    let slow = Managed::<(), String, u8>::make(
        IO::<String, ()>::sleep(Duration::from_millis(30))
            .zip_right(push(&slow_log, "acquired").widen_error())
            .as_(1),
        move |_| push(&release_log, "released"),
    );
    let program = slow
        .use_(|_| IO::<String, ()>::never())
        .fork()
        .chain(|fiber| IO::<String, ()>::sleep(Duration::from_millis(5)).zip_right(fiber.interrupt().widen_error()));

    rt.unsafe_run_sync(program);
    assert_eq!(*log.lock(), vec!["acquired", "released"]);
}

#[test]
fn parallel_acquisition_releases_everything_on_failure() {
    let rt = runtime();
    let log: Log = Arc::default();
    let broken = Managed::<(), String, &'static str>::fail("no quota".to_string());
    let program = resource(&log, "a")
        .zip_with_par(broken, |a, _| a)
        .use_(|_| IO::<String, ()>::unit());

    assert_eq!(rt.unsafe_run_sync(program), Exit::fail("no quota".to_string()));
    let log = log.lock();
    assert!(log.iter().all(|entry| entry.starts_with("acquire a") || entry.starts_with("release a")));
    assert_eq!(
        log.iter().filter(|e| e.starts_with("acquire")).count(),
        log.iter().filter(|e| e.starts_with("release")).count()
    );
}

#[test]
fn failing_finalizer_does_not_skip_others() {
    let rt = runtime();
    let log: Log = Arc::default();
    let bad = Managed::<(), String, ()>::finalizer(UIO::<()>::die_message("finalizer exploded"));
    let program = resource(&log, "outer")
        .zip(bad)
        .zip(resource(&log, "inner"))
        .use_(|_| IO::<String, ()>::unit());

    let exit = rt.unsafe_run_sync(program);
    assert!(exit.cause().map_or(false, |c| c.is_die()));
    assert_eq!(
        *log.lock(),
        vec![
            "acquire outer",
            "acquire inner",
            "release inner (success)",
            "release outer (success)",
        ]
    );
}

#[test]
fn release_map_parallel_release_runs_all() {
    let rt = runtime();
    let log: Log = Arc::default();
    let map = ReleaseMap::new();
    let adds: Vec<IO<Never, ()>> = (0..5)
        .map(|i| {
            let entry_log = Arc::clone(&log);
            map.add::<(), Never>(Box::new(move |_: &ReleaseExit| push(&entry_log, format!("f{}", i))))
                .as_unit()
        })
        .collect();
    rt.unsafe_run_sync(IO::<Never, ()>::collect_all(adds));
    assert_eq!(map.len(), 5);

    let exit = rt.unsafe_run_sync(map.release_all(Exit::Success(()), ExecutionStrategy::Parallel));
    assert_eq!(exit, Exit::Success(()));
    assert!(map.is_exited());
    let mut entries = log.lock().clone();
    entries.sort();
    assert_eq!(entries, vec!["f0", "f1", "f2", "f3", "f4"]);
}

#[test]
fn bracket_exit_releases_once_per_run() {
    let rt = runtime();
    let log: Log = Arc::default();
    let release_log = Arc::clone(&log);
    let program = IO::<String, u32>::succeed(3).bracket_exit(
        |n| IO::<String, u32>::succeed(*n * 2),
        move |n, exit| push(&release_log, format!("release {} {}", n, exit.is_success())).widen_error::<String>(),
    );
    assert_eq!(rt.unsafe_run_sync(program.clone()), Exit::Success(6));
    assert_eq!(rt.unsafe_run_sync(program), Exit::Success(6));
    assert_eq!(*log.lock(), vec!["release 3 true", "release 3 true"]);
}
