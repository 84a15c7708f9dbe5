//! Timer thread backing `Effect::sleep` and schedule delays.
//!
//! Deadlines live in a min-heap. Callbacks run on the timer thread and are
//! expected to be short: in practice they resume a fiber, which only queues
//! a job on the scheduler.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::panic;
use crate::runtime::RuntimeError;

type Callback = Box<dyn FnOnce() + Send>;

/// Cancelled entries tolerated in the heap before it is compacted.
const COMPACT_SLACK: usize = 64;

/// Handle for cancelling a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerKey(u64);

#[derive(Clone)]
pub(crate) struct Timer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

impl Timer {
    pub(crate) fn start(thread_name: &str) -> Result<Self, RuntimeError> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name(format!("{}-timer", thread_name))
            .spawn(move || worker.run())
            .map_err(RuntimeError::ThreadSpawn)?;
        Ok(Self { inner })
    }

    /// Run `callback` at or after `deadline`.
    pub(crate) fn schedule(&self, deadline: Instant, callback: Callback) -> TimerKey {
        let mut state = self.inner.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            return TimerKey(key);
        }
        state.queue.push(Reverse((deadline, key)));
        state.pending.insert(key, callback);
        self.inner.wakeup.notify_one();
        TimerKey(key)
    }

    /// Drop a callback that has not run yet. Returns whether it was pending.
    ///
    /// The heap entry stays behind until its deadline; once stale entries
    /// outnumber live ones the heap is rebuilt.
    pub(crate) fn cancel(&self, key: TimerKey) -> bool {
        let mut state = self.inner.state.lock();
        let removed = state.pending.remove(&key.0).is_some();
        if removed && state.queue.len() > COMPACT_SLACK + 2 * state.pending.len() {
            let TimerState { queue, pending, .. } = &mut *state;
            queue.retain(|Reverse((_, key))| pending.contains_key(key));
        }
        removed
    }

    /// Entries in the deadline heap, including cancelled ones.
    #[cfg(test)]
    fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of callbacks waiting to fire.
    pub(crate) fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.queue.clear();
        let dropped = state.pending.len();
        // Callbacks are dropped outside the lock; they may own fibers.
        let pending = std::mem::take(&mut state.pending);
        self.inner.wakeup.notify_all();
        drop(state);
        drop(pending);
        debug!(dropped, "timer stopped");
    }
}

impl TimerInner {
    fn run(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(&Reverse((deadline, key))) = state.queue.peek() {
                if deadline > now {
                    break;
                }
                state.queue.pop();
                if let Some(callback) = state.pending.remove(&key) {
                    due.push(callback);
                }
            }

            if !due.is_empty() {
                MutexGuard::unlocked(&mut state, || {
                    for callback in due {
                        if let Err(defect) = panic::catch(callback) {
                            error!(%defect, "timer callback panicked");
                        }
                    }
                });
                continue;
            }

            match state.queue.peek() {
                Some(&Reverse((deadline, _))) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_callbacks_fire_in_deadline_order() {
        let timer = Timer::start("timer-test").unwrap();
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();
        for (delay, label) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let tx = tx.clone();
            timer.schedule(
                now + Duration::from_millis(delay),
                Box::new(move || tx.send(label).unwrap()),
            );
        }
        let order: Vec<&str> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_callback_does_not_fire() {
        let timer = Timer::start("timer-test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let key = timer.schedule(
            Instant::now() + Duration::from_millis(20),
            Box::new(move || tx.send(()).unwrap()),
        );
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert_eq!(timer.pending(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_entries_are_compacted() {
        let timer = Timer::start("timer-test").unwrap();
        let far = Instant::now() + Duration::from_secs(3_600);
        for _ in 0..10_000 {
            let key = timer.schedule(far, Box::new(|| {}));
            assert!(timer.cancel(key));
        }
        assert_eq!(timer.pending(), 0);
        assert!(timer.queued() <= COMPACT_SLACK + 1);

        let live = timer.schedule(far, Box::new(|| {}));
        for _ in 0..1_000 {
            let key = timer.schedule(far, Box::new(|| {}));
            timer.cancel(key);
        }
        assert_eq!(timer.pending(), 1);
        assert!(timer.queued() <= COMPACT_SLACK + 3);
        assert!(timer.cancel(live));
        timer.shutdown();
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let timer = Timer::start("timer-test").unwrap();
        let (tx, rx) = mpsc::channel();
        timer.schedule(Instant::now(), Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        timer.shutdown();
    }
}
