//! Exit Values
//!
//! The terminal outcome of running an effect: a value, a failure cause, or
//! interruption.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::cause::Cause;
use crate::fiber::FiberId;
use crate::panic::Defect;

/// The error type of effects that cannot fail.
pub type Never = std::convert::Infallible;

/// Outcome of an effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<E, A> {
    /// Completed with a value.
    Success(A),
    /// Failed with a cause that is not interruption alone.
    Failure(Cause<E>),
    /// Interrupted by the given fiber.
    Interrupted(FiberId),
}

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// Interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Exit::Interrupted(by)
    }

    /// Classify a cause. Interruption-only causes become [`Exit::Interrupted`].
    pub fn halt(cause: Cause<E>) -> Self {
        if cause.is_interrupted_only() {
            match cause.interruptors().first() {
                Some(id) => Exit::Interrupted(*id),
                None => Exit::Failure(cause),
            }
        } else {
            Exit::Failure(cause)
        }
    }

    /// Lift a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }

    /// True for [`Exit::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True for [`Exit::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True for [`Exit::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Interrupted(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            _ => None,
        }
    }

    /// The failure as a cause; `None` on success.
    pub fn cause(self) -> Option<Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
            Exit::Interrupted(id) => Some(Cause::interrupt(id)),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
            Exit::Interrupted(id) => Exit::Interrupted(id),
        }
    }

    /// Transform every typed failure.
    pub fn map_error<E2>(self, f: impl FnMut(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
            Exit::Interrupted(id) => Exit::Interrupted(id),
        }
    }

    /// Convert to a `Result` over the cause.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            other => Err(other.cause().unwrap_or(Cause::Empty)),
        }
    }

    /// Combine two exits. Both successes are merged with `f`; failures are
    /// composed with `combine` (`Cause::then` or `Cause::both`).
    pub fn zip_with<B, C>(
        self,
        that: Exit<E, B>,
        f: impl FnOnce(A, B) -> C,
        combine: impl FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    ) -> Exit<E, C> {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success(f(a, b)),
            (Exit::Success(_), other) => Exit::halt(other.cause().unwrap_or(Cause::Empty)),
            (other, Exit::Success(_)) => Exit::halt(other.cause().unwrap_or(Cause::Empty)),
            (left, right) => Exit::halt(combine(
                left.cause().unwrap_or(Cause::Empty),
                right.cause().unwrap_or(Cause::Empty),
            )),
        }
    }
}

impl<E, A> Exit<E, Exit<E, A>> {
    /// Collapse a nested exit.
    pub fn flatten(self) -> Exit<E, A> {
        match self {
            Exit::Success(inner) => inner,
            Exit::Failure(cause) => Exit::Failure(cause),
            Exit::Interrupted(id) => Exit::Interrupted(id),
        }
    }
}

/// Sequence a body exit with the exit of its finalizer.
///
/// A failing finalizer turns a success into its own failure and is appended
/// with [`Cause::then`] to an existing failure.
pub(crate) fn then_finalizer<E, A, X>(body: Exit<E, A>, finalizer: Exit<E, X>) -> Exit<E, A> {
    match (body, finalizer) {
        (body, Exit::Success(_)) => body,
        (Exit::Success(_), failed) => Exit::halt(failed.cause().unwrap_or(Cause::Empty)),
        (failed, released) => Exit::halt(Cause::then(
            failed.cause().unwrap_or(Cause::Empty),
            released.cause().unwrap_or(Cause::Empty),
        )),
    }
}

/// A shared, type-erased value.
///
/// Finalizers registered in a [`ReleaseMap`](crate::managed::ReleaseMap)
/// observe the exit of the scope they belong to without knowing its error
/// type; the failures are carried as `Dynamic` and recovered with
/// [`Dynamic::downcast_ref`].
#[derive(Clone)]
pub struct Dynamic(Arc<dyn Any + Send + Sync>);

impl Dynamic {
    /// Wrap a value.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Dynamic(Arc::new(value))
    }

    /// Borrow the value if it is a `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// True if the value is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dynamic(..)")
    }
}
