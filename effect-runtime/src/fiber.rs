//! # Fibers
//!
//! Lightweight, cooperatively-scheduled units of execution.
//!
//! ## Design
//!
//! - M:N scheduling: many fibers are multiplexed over the worker threads of
//!   a [`Runtime`](crate::runtime::Runtime).
//! - A fiber gives up its worker when it suspends on an asynchronous
//!   instruction or after a fixed number of instructions.
//! - Ordinary forks are children of the forking fiber and are interrupted
//!   when it finishes. Daemon forks are not.
//!
//! A [`Fiber`] handle is the typed view of a running fiber: it can be
//! joined, awaited, polled and interrupted from other fibers.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::continuation::{Node, Resume, Step};
use crate::context::{ExitSlot, FiberContext};
use crate::effect::Effect;
use crate::exit::{Exit, Never};
use crate::panic::Defect;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Coarse execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// On a worker or waiting in a run queue.
    Running,
    /// Waiting for an asynchronous callback.
    Suspended,
    /// Finished; the exit is available.
    Done,
}

/// Snapshot of the fiber evaluating an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiberDescriptor {
    /// The fiber's ID.
    pub id: FiberId,
    /// The forking fiber, unless this is a root or daemon fiber.
    pub parent: Option<FiberId>,
    /// Interruptibility of the current region.
    pub interruptible: bool,
    /// Whether interruption has been requested.
    pub interrupt_requested: bool,
}

/// Handle to a forked fiber.
pub struct Fiber<E, A> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl<E, A> Fiber<E, A> {
    pub(crate) fn new(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    /// The fiber's ID.
    pub fn id(&self) -> FiberId {
        self.context.id()
    }

    /// Current status.
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// Request interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, ()> {
        let context = Arc::clone(&self.context);
        Effect::from_node(Node::Descriptor(Arc::new(move |me| {
            context.request_interrupt(me.id);
            Step::Value(Box::new(()))
        })))
    }
}

fn read_exit<E, A>(slot: &ExitSlot) -> Exit<E, A>
where
    E: Clone + 'static,
    A: Clone + 'static,
{
    match slot.lock().downcast_ref::<Exit<E, A>>() {
        Some(exit) => exit.clone(),
        None => Exit::die(Defect::new("fiber exit has an unexpected type")),
    }
}

impl<E, A> Fiber<E, A>
where
    E: Clone + Send + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn observe_exit<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, Exit<E, A>> {
        let context = Arc::clone(&self.context);
        Effect::from_node(Node::Async(Arc::new(move |resume: Resume| {
            context.observe(Box::new(move |slot: &ExitSlot| {
                resume.resume(Step::Value(Box::new(read_exit::<E, A>(slot))));
            }));
            None
        })))
    }

    /// Wait for the fiber and return its exit.
    pub fn await_exit<R: 'static>(&self) -> Effect<R, Never, Exit<E, A>> {
        self.observe_exit()
    }

    /// Wait for the fiber and adopt its outcome.
    ///
    /// A failed fiber fails the joiner with the same cause; an interrupted
    /// fiber interrupts it.
    pub fn join<R: 'static>(&self) -> Effect<R, E, A> {
        self.observe_exit::<R, E>()
            .map_result(|exit: Exit<E, A>| exit.into_result())
    }

    /// Interrupt the fiber and wait for it to finish.
    pub fn interrupt<R: 'static>(&self) -> Effect<R, Never, Exit<E, A>> {
        self.interrupt_as_current()
    }

    /// Interrupt on behalf of `by` and wait for the fiber to finish.
    pub fn interrupt_as<R: 'static>(&self, by: FiberId) -> Effect<R, Never, Exit<E, A>> {
        let context = Arc::clone(&self.context);
        let wait = self.await_exit::<R>();
        Effect::suspend(move || {
            context.request_interrupt(by);
            wait.clone()
        })
    }

    fn interrupt_as_current<R: 'static, E2: Send + 'static>(&self) -> Effect<R, E2, Exit<E, A>> {
        let context = Arc::clone(&self.context);
        let wait = self.observe_exit::<R, E2>();
        Effect::from_node(Node::Descriptor(Arc::new(move |me| {
            context.request_interrupt(me.id);
            Step::Eval(wait.instr())
        })))
    }

    /// The exit, if the fiber has finished. Marks the fiber as observed.
    pub fn poll(&self) -> Option<Exit<E, A>> {
        self.context.poll().map(|slot| read_exit(&slot))
    }
}
