//! # Erased Instruction Set
//!
//! Every [`Effect`](crate::effect::Effect) is a typed view over an
//! [`Instr`], an immutable tree of [`Node`]s shared through `Arc`. Values and
//! errors travel through the interpreter as `Box<dyn Any + Send>` and are
//! downcast back at the typed boundary.
//!
//! ## Continuations
//!
//! Instruction closures are `Fn`, so an effect can be run any number of
//! times. Continuations built while a fiber runs are one-shot: a
//! [`Step::Then`] pushes a `FnOnce` frame that owns whatever it captured,
//! and [`once_step`] wraps a `FnOnce` into a node that refuses a second
//! evaluation.

use std::any::{type_name, Any};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::context::FiberContext;
use crate::exit::Exit;
use crate::fiber::FiberDescriptor;
use crate::panic::Defect;
use crate::timer::Timer;

/// Erased value.
pub(crate) type AnyValue = Box<dyn Any + Send>;
/// Erased cause.
pub(crate) type AnyCause = Cause<AnyValue>;
/// Erased exit.
pub(crate) type AnyExit = Exit<AnyValue, AnyValue>;
/// Environment as seen by the interpreter.
pub(crate) type Env = Arc<dyn Any + Send + Sync>;
/// Shared instruction tree.
pub(crate) type Instr = Arc<Node>;
/// Typed exit of a completed fiber, boxed as `Exit<E, A>`.
pub(crate) type TypedExit = Box<dyn Any + Send>;

pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Step + Send + Sync>;
pub(crate) type Recover = Arc<dyn Fn(AnyCause) -> Step + Send + Sync>;
pub(crate) type CauseMap = Arc<dyn Fn(AnyCause) -> AnyCause + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Resume) -> Option<Canceler> + Send + Sync>;
/// Converts a fiber's erased exit into its typed exit.
pub(crate) type Completion = Arc<dyn Fn(AnyExit) -> TypedExit + Send + Sync>;

/// Cancels a pending asynchronous registration.
pub type Canceler = Box<dyn FnOnce() + Send>;

/// One instruction.
pub(crate) enum Node {
    /// Produce a value.
    Succeed(Arc<dyn Fn() -> AnyValue + Send + Sync>),
    /// Fail with a cause.
    Fail(Arc<dyn Fn() -> AnyCause + Send + Sync>),
    /// Defer construction of the next step.
    Suspend(Arc<dyn Fn() -> Step + Send + Sync>),
    /// Sequence: run the instruction, feed its value to the continuation.
    FlatMap(Instr, Cont),
    /// Recover: failure handler and success continuation. Skipped while
    /// the fiber is being interrupted.
    Fold(Instr, Recover, Cont),
    /// Rewrite a failure cause. Never skipped.
    MapCause(Instr, CauseMap),
    /// Suspend until a callback resumes the fiber.
    Async(Register),
    /// Run the instruction with the given interruptibility.
    SetInterruptible(Instr, bool),
    /// Read the current interruptibility.
    CheckInterruptible(Arc<dyn Fn(bool) -> Step + Send + Sync>),
    /// Read the current environment.
    Access(Arc<dyn Fn(&Env) -> Step + Send + Sync>),
    /// Run the instruction with a new environment.
    Provide(Env, Instr),
    /// Start a child fiber.
    Fork {
        instr: Instr,
        daemon: bool,
        completion: Completion,
    },
    /// Read the fiber descriptor.
    Descriptor(Arc<dyn Fn(FiberDescriptor) -> Step + Send + Sync>),
    /// Give up the worker.
    Yield,
}

/// What the run loop does next.
pub(crate) enum Step {
    Eval(Instr),
    /// Evaluate the instruction, then apply the one-shot continuation.
    Then(Instr, Box<dyn FnOnce(AnyValue) -> Step + Send>),
    Value(AnyValue),
    Failure(AnyCause),
}

impl Step {
    pub(crate) fn die(message: impl Into<String>) -> Step {
        Step::Failure(Cause::die(Defect::new(message)))
    }

    pub(crate) fn from_exit(exit: AnyExit) -> Step {
        match exit {
            Exit::Success(value) => Step::Value(value),
            Exit::Failure(cause) => Step::Failure(cause),
            Exit::Interrupted(id) => Step::Failure(Cause::interrupt(id)),
        }
    }
}

/// Run loop stack frame.
pub(crate) enum Frame {
    Apply(Cont),
    ApplyOnce(Box<dyn FnOnce(AnyValue) -> Step + Send>),
    Fold(Recover, Cont),
    MapCause(CauseMap),
    RestoreInterruptible,
    PopEnv,
}

/// Resumes a fiber suspended on an asynchronous instruction.
///
/// Tied to one suspension: resuming after the fiber moved on, or a second
/// time, is ignored.
pub(crate) struct Resume {
    fiber: Arc<FiberContext>,
    epoch: u64,
}

impl Resume {
    pub(crate) fn new(fiber: Arc<FiberContext>, epoch: u64) -> Self {
        Self { fiber, epoch }
    }

    pub(crate) fn resume(self, step: Step) {
        self.fiber.resume_async(self.epoch, step);
    }

    pub(crate) fn timer(&self) -> Timer {
        self.fiber.timer()
    }
}

pub(crate) fn erase<A: Send + 'static>(value: A) -> AnyValue {
    Box::new(value)
}

pub(crate) fn unerase<A: 'static>(value: AnyValue) -> A {
    match value.downcast::<A>() {
        Ok(value) => *value,
        Err(_) => panic!("effect value type mismatch: expected {}", type_name::<A>()),
    }
}

pub(crate) fn erase_cause<E: Send + 'static>(cause: Cause<E>) -> AnyCause {
    cause.map(erase)
}

pub(crate) fn unerase_cause<E: 'static>(cause: AnyCause) -> Cause<E> {
    cause.map(unerase::<E>)
}

pub(crate) fn erase_exit<E: Send + 'static, A: Send + 'static>(exit: Exit<E, A>) -> AnyExit {
    match exit {
        Exit::Success(a) => Exit::Success(erase(a)),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
        Exit::Interrupted(id) => Exit::Interrupted(id),
    }
}

pub(crate) fn unerase_exit<E: 'static, A: 'static>(exit: AnyExit) -> Exit<E, A> {
    match exit {
        Exit::Success(a) => Exit::Success(unerase(a)),
        Exit::Failure(cause) => Exit::halt(unerase_cause(cause)),
        Exit::Interrupted(id) => Exit::Interrupted(id),
    }
}

/// Completion that stores the exit as a typed `Exit<E, A>`.
pub(crate) fn typed_completion<E: Send + 'static, A: Send + 'static>() -> Completion {
    Arc::new(|exit: AnyExit| Box::new(unerase_exit::<E, A>(exit)) as TypedExit)
}

/// A node that evaluates `f` once. A second evaluation is a defect.
pub(crate) fn once_step(f: impl FnOnce() -> Step + Send + 'static) -> Instr {
    let cell = Mutex::new(Some(f));
    Arc::new(Node::Suspend(Arc::new(move || match cell.lock().take() {
        Some(f) => f(),
        None => Step::die("one-shot continuation resumed twice"),
    })))
}
