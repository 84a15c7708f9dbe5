//! # Work-Stealing Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads each with a local deque
//! - Global injection queue that every submission goes through
//! - Idle workers steal batches from the global queue, then single jobs
//!   from their siblings
//!
//! A job is one slice of a fiber's run loop. Fibers are not tracked here;
//! a suspended fiber is owned by whoever holds its resumption callback.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::config::SchedulerConfig;
use crate::panic;
use crate::runtime::RuntimeError;

/// A unit of work.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// How long an idle worker sleeps before looking for stealable work.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Work-stealing scheduler.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct SchedulerShared {
    /// Global injection queue.
    injector: Injector<Job>,
    /// Stealers for every worker's local deque.
    stealers: Vec<Stealer<Job>>,
    work_stealing: bool,
    shutdown: AtomicBool,
    active_workers: AtomicUsize,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

impl Scheduler {
    /// Spawn the worker threads.
    pub(crate) fn start(config: &SchedulerConfig) -> Result<Self, RuntimeError> {
        let deques: Vec<Deque<Job>> = (0..config.num_workers).map(|_| Deque::new_fifo()).collect();
        let shared = Arc::new(SchedulerShared {
            injector: Injector::new(),
            stealers: deques.iter().map(Deque::stealer).collect(),
            work_stealing: config.work_stealing,
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let scheduler = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(config.num_workers)),
        };

        for (id, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id,
                shared: Arc::clone(&shared),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || worker.run_loop(deque));
            match spawned {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(err) => {
                    scheduler.shutdown();
                    return Err(RuntimeError::ThreadSpawn(err));
                }
            }
        }

        debug!(workers = config.num_workers, work_stealing = config.work_stealing, "scheduler started");
        Ok(scheduler)
    }

    /// Queue a job. Jobs submitted after shutdown are dropped.
    pub(crate) fn submit(&self, job: Job) {
        if self.is_shutting_down() {
            return;
        }
        self.shared.injector.push(job);
        let _guard = self.shared.sleep_lock.lock();
        self.shared.wakeup.notify_one();
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Workers currently inside their run loop.
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }

    /// Check if the scheduler is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and drop queued jobs.
    ///
    /// Joins every worker except the calling thread.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wakeup.notify_all();
        }

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        loop {
            match self.shared.injector.steal() {
                Steal::Success(job) => drop(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        debug!("scheduler stopped");
    }
}

/// A worker thread in the scheduler.
struct Worker {
    id: usize,
    shared: Arc<SchedulerShared>,
}

impl Worker {
    fn run_loop(self, local: Deque<Job>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);

        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.find_work(&local) {
                Some(job) => {
                    if let Err(defect) = panic::catch(job) {
                        error!(worker = self.id, %defect, "job panicked outside fiber supervision");
                    }
                }
                None => self.park(),
            }
        }

        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Find work using work-stealing.
    fn find_work(&self, local: &Deque<Job>) -> Option<Job> {
        if let Some(job) = local.pop() {
            return Some(job);
        }

        loop {
            match self.shared.injector.steal_batch_and_pop(local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if !self.shared.work_stealing {
            return None;
        }

        for (id, stealer) in self.shared.stealers.iter().enumerate() {
            if id == self.id {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn park(&self) {
        let mut guard = self.shared.sleep_lock.lock();
        if self.shared.injector.is_empty() && !self.shared.shutdown.load(Ordering::Acquire) {
            self.shared.wakeup.wait_for(&mut guard, IDLE_PARK);
        }
    }
}
