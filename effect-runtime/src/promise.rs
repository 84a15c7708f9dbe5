//! # Promises
//!
//! A [`Promise`] is a single-assignment cell that fibers can wait on. The
//! first completion wins; later completions are ignored and report `false`.
//!
//! Waiting on a promise suspends the fiber. Interrupting a waiting fiber
//! removes it from the promise.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::continuation::{erase_exit, Canceler, Node, Resume, Step};
use crate::effect::Effect;
use crate::exit::Exit;

type Waiter<E, A> = Box<dyn FnOnce(Exit<E, A>) + Send>;

enum PromiseState<E, A> {
    Pending {
        next_key: u64,
        waiters: Vec<(u64, Waiter<E, A>)>,
    },
    Done(Exit<E, A>),
}

/// A single-assignment cell.
pub struct Promise<E, A> {
    state: Arc<Mutex<PromiseState<E, A>>>,
}

impl<E, A> Clone for Promise<E, A> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E, A> fmt::Debug for Promise<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("done", &self.is_done()).finish()
    }
}

impl<E, A> Default for Promise<E, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A> Promise<E, A> {
    /// An empty promise.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Pending {
                next_key: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Whether the promise has been completed.
    pub fn is_done(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Done(_))
    }

    fn remove_waiter(&self, key: u64) {
        if let PromiseState::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(k, _)| *k != key);
        }
    }
}

impl<E, A> Promise<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Create a promise inside an effect.
    pub fn make<R: 'static, E2: Send + 'static>() -> Effect<R, E2, Promise<E, A>> {
        Effect::effect_total(Promise::new)
    }
}

impl<E, A> Promise<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    /// Complete outside of an effect. Returns `false` if already completed.
    pub fn unsafe_complete(&self, exit: Exit<E, A>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Done(_) => return false,
                PromiseState::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = PromiseState::Done(exit.clone());
                    waiters
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(exit.clone());
        }
        true
    }

    /// Run `waiter` once the promise completes. Returns a key for
    /// [`remove_waiter`](Self::remove_waiter), or `None` if `waiter`
    /// already ran.
    fn on_complete(&self, waiter: Waiter<E, A>) -> Option<u64> {
        let done = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Done(exit) => exit.clone(),
                PromiseState::Pending { next_key, waiters } => {
                    let key = *next_key;
                    *next_key += 1;
                    waiters.push((key, waiter));
                    return Some(key);
                }
            }
        };
        waiter(done);
        None
    }

    /// Wait for the promise and adopt its exit.
    pub fn await_<R: 'static>(&self) -> Effect<R, E, A> {
        let promise = self.clone();
        Effect::from_node(Node::Async(Arc::new(move |resume: Resume| {
            let key = promise.on_complete(Box::new(move |exit: Exit<E, A>| {
                resume.resume(Step::from_exit(erase_exit(exit)));
            }))?;
            let promise = promise.clone();
            Some(Box::new(move || promise.remove_waiter(key)) as Canceler)
        })))
    }

    /// The exit, if completed.
    pub fn poll(&self) -> Option<Exit<E, A>> {
        match &*self.state.lock() {
            PromiseState::Done(exit) => Some(exit.clone()),
            PromiseState::Pending { .. } => None,
        }
    }
}

impl<E, A> Promise<E, A>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Complete with `exit`. Succeeds with `false` if already completed.
    pub fn complete<R: 'static, E2: Send + 'static>(&self, exit: Exit<E, A>) -> Effect<R, E2, bool> {
        let promise = self.clone();
        Effect::effect_total(move || promise.unsafe_complete(exit.clone()))
    }

    /// Complete with a value.
    pub fn succeed<R: 'static, E2: Send + 'static>(&self, value: A) -> Effect<R, E2, bool> {
        self.complete(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail<R: 'static, E2: Send + 'static>(&self, error: E) -> Effect<R, E2, bool> {
        self.complete(Exit::fail(error))
    }

    /// Complete with a failure cause.
    pub fn halt<R: 'static, E2: Send + 'static>(&self, cause: Cause<E>) -> Effect<R, E2, bool> {
        self.complete(Exit::halt(cause))
    }
}
