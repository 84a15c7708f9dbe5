//! # Effects
//!
//! An [`Effect<R, E, A>`] is a description of a computation that needs an
//! environment `R`, may fail with `E`, and succeeds with `A`. Describing an
//! effect runs nothing; a [`Runtime`](crate::runtime::Runtime) interprets it
//! on a fiber. The same effect can be run any number of times.
//!
//! ```rust
//! use effect_runtime::{Effect, Exit, Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let program = Effect::<(), String, i32>::succeed(20)
//!     .zip_with(Effect::succeed(22), |a, b| a + b)
//!     .chain(|n| {
//!         if n == 42 {
//!             Effect::succeed(n)
//!         } else {
//!             Effect::fail(format!("unexpected {}", n))
//!         }
//!     });
//! assert_eq!(rt.unsafe_run_sync(program), Exit::Success(42));
//! ```
//!
//! ## Closure bounds
//!
//! Closures passed to combinators are `Fn + Send + Sync` because an effect
//! is shared between fibers and may run more than once. Values captured by
//! constructors such as [`Effect::succeed`] are cloned on every run.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::context::FiberContext;
use crate::continuation::{
    erase, erase_cause, erase_exit, once_step, typed_completion, unerase, unerase_cause, AnyCause,
    AnyValue, Canceler, Cont, Env, Instr, Node, Recover, Resume, Step,
};
use crate::exit::{Exit, Never};
use crate::fiber::{Fiber, FiberDescriptor, FiberId};
use crate::panic::Defect;

/// A lazy, reusable description of a computation.
pub struct Effect<R, E, A> {
    instr: Instr,
    _marker: PhantomData<fn(R) -> (E, A)>,
}

/// A typed view of an environment-free effect that cannot fail.
pub type UIO<A> = Effect<(), Never, A>;
/// An environment-free effect.
pub type IO<E, A> = Effect<(), E, A>;

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            instr: Arc::clone(&self.instr),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Effect<{}, {}, {}>",
            type_name::<R>(),
            type_name::<E>(),
            type_name::<A>()
        )
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_instr(Arc::new(node))
    }

    pub(crate) fn from_instr(instr: Instr) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn instr(&self) -> Instr {
        Arc::clone(&self.instr)
    }
}

fn cont<A: 'static>(f: impl Fn(A) -> Step + Send + Sync + 'static) -> Cont {
    Arc::new(move |value: AnyValue| f(unerase(value)))
}

fn recover<E: 'static>(f: impl Fn(Cause<E>) -> Step + Send + Sync + 'static) -> Recover {
    Arc::new(move |cause: AnyCause| f(unerase_cause(cause)))
}

fn passthrough() -> Cont {
    Arc::new(Step::Value)
}

fn env_mismatch<R>() -> Step {
    Step::die(format!("environment is not a {}", type_name::<R>()))
}

/// Restores the interruptibility that was in effect outside an
/// [`Effect::uninterruptible_mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn apply<R, E, A>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        Effect::from_node(Node::SetInterruptible(effect.instr, self.interruptible))
    }
}

/// Completes an asynchronous effect. Only the first completion counts.
pub struct Callback<E, A> {
    resume: Resume,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E: Send + 'static, A: Send + 'static> Callback<E, A> {
    /// Resume with a value.
    pub fn succeed(self, value: A) {
        self.resume.resume(Step::Value(erase(value)));
    }

    /// Resume with a typed failure.
    pub fn fail(self, error: E) {
        self.halt(Cause::fail(error));
    }

    /// Resume with a failure cause.
    pub fn halt(self, cause: Cause<E>) {
        self.resume.resume(Step::Failure(erase_cause(cause)));
    }

    /// Resume with an exit.
    pub fn complete(self, exit: Exit<E, A>) {
        self.resume.resume(Step::from_exit(erase_exit(exit)));
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::Succeed(Arc::new(move || erase(value.clone()))))
    }

    /// Alias for [`succeed`](Self::succeed).
    pub fn succeed_now(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::succeed(value)
    }

    /// Succeed with the result of a side-effecting function. A panic in
    /// `f` becomes a defect.
    pub fn effect_total(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Succeed(Arc::new(move || erase(f()))))
    }

    /// Run a side-effecting function that may fail.
    pub fn effect_partial(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Suspend(Arc::new(move || match f() {
            Ok(a) => Step::Value(erase(a)),
            Err(e) => Step::Failure(Cause::fail(erase(e))),
        })))
    }

    /// Build the effect lazily, once per run.
    pub fn suspend(f: impl Fn() -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Suspend(Arc::new(move || Step::Eval(f().instr))))
    }

    /// Fail with `error`.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_node(Node::Fail(Arc::new(move || Cause::fail(erase(error.clone())))))
    }

    /// Fail with an error built on every run.
    pub fn fail_with(f: impl Fn() -> E + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Fail(Arc::new(move || Cause::fail(erase(f())))))
    }

    /// Fail with a cause.
    pub fn halt(cause: Cause<E>) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_node(Node::Fail(Arc::new(move || erase_cause(cause.clone()))))
    }

    /// Fail with a cause built on every run.
    pub fn halt_with(f: impl Fn() -> Cause<E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Fail(Arc::new(move || erase_cause(f()))))
    }

    /// Fail with a defect.
    pub fn die(defect: Defect) -> Self {
        Self::from_node(Node::Fail(Arc::new(move || Cause::die(defect.clone()))))
    }

    /// Fail with a defect located at the caller.
    #[track_caller]
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Complete with `exit`.
    pub fn done(exit: Exit<E, A>) -> Self
    where
        E: Clone + Sync,
        A: Clone + Sync,
    {
        Self::from_node(Node::Suspend(Arc::new(move || {
            Step::from_exit(erase_exit(exit.clone()))
        })))
    }

    /// Lift a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Clone + Sync,
        A: Clone + Sync,
    {
        Self::done(Exit::from_result(result))
    }

    /// Never completes. Interruptible.
    pub fn never() -> Self {
        Self::from_node(Node::Async(Arc::new(|_resume: Resume| None)))
    }

    /// Interrupt the current fiber.
    pub fn interrupt() -> Self {
        Self::from_node(Node::Descriptor(Arc::new(|me: FiberDescriptor| {
            Step::Failure(Cause::interrupt(me.id))
        })))
    }

    /// Read from the environment.
    pub fn access(f: impl Fn(&R) -> A + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Access(Arc::new(move |env: &Env| {
            match (**env).downcast_ref::<R>() {
                Some(r) => Step::Value(erase(f(r))),
                None => env_mismatch::<R>(),
            }
        })))
    }

    /// Choose an effect based on the environment.
    pub fn access_m(f: impl Fn(&R) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Access(Arc::new(move |env: &Env| {
            match (**env).downcast_ref::<R>() {
                Some(r) => Step::Eval(f(r).instr),
                None => env_mismatch::<R>(),
            }
        })))
    }

    /// Suspend until `register`'s callback is completed.
    pub fn async_(register: impl Fn(Callback<E, A>) + Send + Sync + 'static) -> Self {
        Self::async_interrupt(move |callback| {
            register(callback);
            None
        })
    }

    /// Suspend until the callback is completed. The returned canceler runs
    /// if the fiber is interrupted while waiting.
    pub fn async_interrupt(
        register: impl Fn(Callback<E, A>) -> Option<Canceler> + Send + Sync + 'static,
    ) -> Self {
        Self::from_node(Node::Async(Arc::new(move |resume: Resume| {
            register(Callback {
                resume,
                _marker: PhantomData,
            })
        })))
    }

    /// Run `f` with a [`Restore`] inside an uninterruptible region.
    ///
    /// Only the parts of the returned effect wrapped with
    /// [`Restore::apply`] can be interrupted.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::CheckInterruptible(Arc::new(move |interruptible| {
            let inner = f(Restore { interruptible }).instr;
            Step::Eval(Arc::new(Node::SetInterruptible(inner, false)))
        })))
    }

    /// Choose an effect based on the current interruptibility.
    pub fn check_interruptible(f: impl Fn(bool) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::CheckInterruptible(Arc::new(move |interruptible| {
            Step::Eval(f(interruptible).instr)
        })))
    }

    /// Choose an effect based on the current fiber.
    pub fn with_descriptor(f: impl Fn(FiberDescriptor) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Descriptor(Arc::new(move |d| Step::Eval(f(d).instr))))
    }

    /// Succeed with a value the fiber produced earlier in this run.
    pub(crate) fn succeed_once(value: A) -> Self {
        Self::from_instr(once_step(move || Step::Value(erase(value))))
    }

    /// Fail with a cause the fiber produced earlier in this run.
    pub(crate) fn halt_once(cause: Cause<E>) -> Self {
        Self::from_instr(once_step(move || Step::Failure(erase_cause(cause))))
    }

    /// Complete with an exit the fiber produced earlier in this run.
    pub(crate) fn done_once(exit: Exit<E, A>) -> Self {
        Self::from_instr(once_step(move || Step::from_exit(erase_exit(exit))))
    }
}

impl<R: 'static, E: Send + 'static> Effect<R, E, ()> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::from_node(Node::Succeed(Arc::new(|| erase(()))))
    }

    /// Give the worker to other fibers.
    pub fn yield_now() -> Self {
        Self::from_node(Node::Yield)
    }

    /// Complete after `duration`. Interruptible; interruption cancels the
    /// pending timer.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Async(Arc::new(move |resume: Resume| {
            // A deadline past the end of `Instant` never fires.
            let deadline = Instant::now().checked_add(duration)?;
            let timer = resume.timer();
            let key = timer.schedule(deadline, Box::new(move || resume.resume(Step::Value(erase(())))));
            Some(Box::new(move || {
                timer.cancel(key);
            }) as Canceler)
        })))
    }
}

impl<R: Clone + Send + 'static, E: Send + 'static> Effect<R, E, R> {
    /// The whole environment.
    pub fn environment() -> Self {
        Self::access(R::clone)
    }
}

impl<R: 'static, E: Send + 'static> Effect<R, E, FiberDescriptor> {
    /// Describe the current fiber.
    pub fn descriptor() -> Self {
        Self::from_node(Node::Descriptor(Arc::new(|d| Step::Value(erase(d)))))
    }
}

impl<R: 'static, E: Send + 'static> Effect<R, E, FiberId> {
    /// The current fiber's ID.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::Descriptor(Arc::new(|d| Step::Value(erase(d.id)))))
    }
}

// ============================================================================
// Combinators
// ============================================================================

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Transform the success value.
    pub fn map<B: Send + 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<R, E, B> {
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| Step::Value(erase(f(a)))),
        ))
    }

    /// Transform the success value with a function that may fail with a
    /// cause.
    pub(crate) fn map_result<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Result<B, Cause<E>> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| match f(a) {
                Ok(b) => Step::Value(erase(b)),
                Err(cause) => Step::Failure(erase_cause(cause)),
            }),
        ))
    }

    /// Transform every typed failure.
    pub fn map_error<E2: Send + 'static>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<R, E2, A> {
        self.map_cause(move |cause| cause.map(&f))
    }

    /// Transform the failure cause.
    pub fn map_cause<E2: Send + 'static>(
        self,
        f: impl Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::MapCause(
            self.instr,
            Arc::new(move |cause: AnyCause| erase_cause(f(unerase_cause::<E>(cause)))),
        ))
    }

    /// Transform both channels.
    pub fn bimap<E2: Send + 'static, B: Send + 'static>(
        self,
        on_error: impl Fn(E) -> E2 + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        self.map_error(on_error).map(on_success)
    }

    /// Run `f` on the success value and continue with its effect.
    pub fn chain<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| Step::Eval(f(a).instr)),
        ))
    }

    /// [`chain`](Self::chain) for continuations built during a run.
    pub(crate) fn chain_once<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<R, E, B> + Send + 'static,
    ) -> Effect<R, E, B> {
        let cell = Mutex::new(Some(f));
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| match cell.lock().take() {
                Some(f) => Step::Eval(f(a).instr),
                None => Step::die("one-shot continuation resumed twice"),
            }),
        ))
    }

    /// Run both effects in sequence and combine their values.
    pub fn zip_with<B, C>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| {
                let f = Arc::clone(&f);
                Step::Then(
                    that.instr(),
                    Box::new(move |b: AnyValue| Step::Value(erase(f(a, unerase::<B>(b))))),
                )
            }),
        ))
    }

    /// Run both effects in sequence and pair their values.
    pub fn zip<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both effects in sequence, keeping the first value.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.zip_with(that, |a, _| a)
    }

    /// Run both effects in sequence, keeping the second value.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.chain(move |_| that.clone())
    }

    /// Replace the success value.
    pub fn as_<B: Clone + Send + Sync + 'static>(self, value: B) -> Effect<R, E, B> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.map(|_| ())
    }

    /// Run an effect on the success value, keeping the value.
    pub fn tap<X: Send + 'static>(
        self,
        f: impl Fn(&A) -> Effect<R, E, X> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        Effect::from_node(Node::FlatMap(
            self.instr,
            cont(move |a: A| {
                let effect = f(&a);
                Step::Then(effect.instr, Box::new(move |_| Step::Value(erase(a))))
            }),
        ))
    }

    /// Run an effect on a failure cause, then fail with the same cause.
    pub fn tap_cause<X: Send + 'static>(
        self,
        f: impl Fn(&Cause<E>) -> Effect<R, E, X> + Send + Sync + 'static,
    ) -> Effect<R, E, A> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| {
                let effect = f(&cause);
                Step::Then(
                    effect.instr,
                    Box::new(move |_| Step::Failure(erase_cause(cause))),
                )
            }),
            passthrough(),
        ))
    }

    /// Observe a failure cause synchronously. Runs even while the fiber is
    /// being interrupted.
    pub(crate) fn on_cause_sync(self, f: impl Fn(&Cause<E>) + Send + Sync + 'static) -> Self {
        self.map_cause(move |cause| {
            f(&cause);
            cause
        })
    }

    /// Handle both the failure cause and the success value.
    pub fn fold_cause_m<E2, B>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
    {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| Step::Eval(on_failure(cause).instr)),
            cont(move |a: A| Step::Eval(on_success(a).instr)),
        ))
    }

    /// Handle a typed failure and the success value. Defects and
    /// interruptions pass through.
    pub fn fold_m<E2, B>(
        self,
        on_failure: impl Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
    {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| match cause.failure_or_cause() {
                Ok(e) => Step::Eval(on_failure(e).instr),
                Err(other) => Step::Failure(other.strip_failures()),
            }),
            cont(move |a: A| Step::Eval(on_success(a).instr)),
        ))
    }

    /// Fold both channels into a value.
    pub fn fold<B: Send + 'static>(
        self,
        on_failure: impl Fn(E) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, Never, B> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| match cause.failure_or_cause() {
                Ok(e) => Step::Value(erase(on_failure(e))),
                Err(other) => Step::Failure(other.strip_failures()),
            }),
            cont(move |a: A| Step::Value(erase(on_success(a)))),
        ))
    }

    /// Fold the cause or value into a value.
    pub fn fold_cause<B: Send + 'static>(
        self,
        on_failure: impl Fn(Cause<E>) -> B + Send + Sync + 'static,
        on_success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, Never, B> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| Step::Value(erase(on_failure(cause)))),
            cont(move |a: A| Step::Value(erase(on_success(a)))),
        ))
    }

    /// Recover from any typed failure.
    pub fn catch_all<E2: Send + 'static>(
        self,
        f: impl Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| match cause.failure_or_cause() {
                Ok(e) => Step::Eval(f(e).instr),
                Err(other) => Step::Failure(other.strip_failures()),
            }),
            passthrough(),
        ))
    }

    /// Recover from any failure cause, including defects.
    pub fn catch_all_cause<E2: Send + 'static>(
        self,
        f: impl Fn(Cause<E>) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(move |cause: Cause<E>| Step::Eval(f(cause).instr)),
            passthrough(),
        ))
    }

    /// Fall back to `that` on a typed failure.
    pub fn or_else<E2: Send + 'static>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that.clone())
    }

    /// Expose the typed failure as a `Result`.
    pub fn either(self) -> Effect<R, Never, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Turn typed failures into defects.
    pub fn or_die(self) -> Effect<R, Never, A>
    where
        E: fmt::Debug,
    {
        self.map_cause(|cause: Cause<E>| {
            cause.flat_map(|e| Cause::die(Defect::new(format!("{:?}", e))))
        })
    }

    /// Expose the full cause as the typed error.
    pub fn sandbox(self) -> Effect<R, Cause<E>, A> {
        self.map_cause(|cause: Cause<E>| Cause::fail(cause))
    }

    /// The exit of this effect as a value.
    pub fn result(self) -> Effect<R, Never, Exit<E, A>> {
        self.result_as()
    }

    pub(crate) fn result_as<E2: Send + 'static>(self) -> Effect<R, E2, Exit<E, A>> {
        Effect::from_node(Node::Fold(
            self.instr,
            recover(|cause: Cause<E>| Step::Value(erase(Exit::<E, A>::halt(cause)))),
            cont(|a: A| Step::Value(erase(Exit::<E, A>::Success(a)))),
        ))
    }

    /// Run with environment `env`; the result needs no environment of its
    /// own type.
    pub fn provide_all<R0: 'static>(self, env: R) -> Effect<R0, E, A>
    where
        R: Send + Sync,
    {
        Effect::from_node(Node::Provide(Arc::new(env), self.instr))
    }

    /// Run with an environment derived from the outer one.
    pub fn provide_some<R0: 'static>(self, f: impl Fn(&R0) -> R + Send + Sync + 'static) -> Effect<R0, E, A>
    where
        R: Send + Sync,
    {
        let instr = self.instr;
        Effect::from_node(Node::Access(Arc::new(move |env: &Env| {
            match (**env).downcast_ref::<R0>() {
                Some(outer) => {
                    let inner: Env = Arc::new(f(outer));
                    Step::Eval(Arc::new(Node::Provide(inner, Arc::clone(&instr))))
                }
                None => env_mismatch::<R0>(),
            }
        })))
    }

    /// Start this effect on a child fiber. The child is interrupted when
    /// the current fiber finishes.
    pub fn fork(self) -> Effect<R, E, Fiber<E, A>> {
        self.fork_with(false)
    }

    /// Start this effect on a fiber that outlives the current one.
    pub fn fork_daemon(self) -> Effect<R, E, Fiber<E, A>> {
        self.fork_with(true)
    }

    pub(crate) fn fork_as<E2: Send + 'static>(self) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with(false)
    }

    fn fork_with<E2: Send + 'static>(self, daemon: bool) -> Effect<R, E2, Fiber<E, A>> {
        let fork = Arc::new(Node::Fork {
            instr: self.instr,
            daemon,
            completion: typed_completion::<E, A>(),
        });
        Effect::from_node(Node::FlatMap(
            fork,
            cont(|context: Arc<FiberContext>| Step::Value(erase(Fiber::<E, A>::new(context)))),
        ))
    }

    /// Run without interruption.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::SetInterruptible(self.instr, false))
    }

    /// Run with interruption enabled.
    pub fn interruptible(self) -> Self {
        Self::from_node(Node::SetInterruptible(self.instr, true))
    }

    /// Wait `duration`, then run.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<R, E, ()>::sleep(duration).zip_right(self)
    }

    /// Repeat until failure.
    pub fn forever(self) -> Effect<R, E, Never> {
        let again = self.clone();
        self.chain(move |_| again.clone().forever())
    }

    /// Run only when `condition` holds.
    pub fn when(self, condition: bool) -> Effect<R, E, ()> {
        if condition {
            self.as_unit()
        } else {
            Effect::unit()
        }
    }
}

impl<R, E, B> Effect<R, E, Effect<R, E, B>>
where
    R: 'static,
    E: Send + 'static,
    B: Send + 'static,
{
    /// Run the inner effect.
    pub fn flatten(self) -> Effect<R, E, B> {
        self.chain(|inner| inner)
    }
}

impl<R, E, A> Effect<R, Cause<E>, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Undo [`sandbox`](Effect::sandbox).
    pub fn unsandbox(self) -> Effect<R, E, A> {
        self.map_cause(|cause: Cause<Cause<E>>| cause.flat_map(|inner| inner))
    }
}

impl<R: 'static, A: Send + 'static> Effect<R, Never, A> {
    /// View an infallible effect as one with any error type.
    pub fn widen_error<E2: Send + 'static>(self) -> Effect<R, E2, A> {
        Effect::from_instr(self.instr)
    }
}

impl<E: Send + 'static, A: Send + 'static> Effect<(), E, A> {
    /// View an environment-free effect as one requiring any environment.
    pub fn lift_env<R2: 'static>(self) -> Effect<R2, E, A> {
        self.provide_all(())
    }
}

// ============================================================================
// Sequential collections
// ============================================================================

impl<R, E> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    /// Apply `f` to each element in order, collecting the results.
    pub fn foreach<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, Vec<B>>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        let items: Arc<[X]> = items.into_iter().collect();
        let f = Arc::new(f);
        Effect::suspend(move || {
            let effects: Vec<Effect<R, E, B>> = items.iter().cloned().map(|x| f(x)).collect();
            Effect::collect_all(effects)
        })
    }

    /// Apply `f` to each element in order, discarding the results.
    pub fn foreach_<X, B>(
        items: impl IntoIterator<Item = X>,
        f: impl Fn(X) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, ()>
    where
        X: Clone + Send + Sync + 'static,
        B: Send + 'static,
    {
        let items: Arc<[X]> = items.into_iter().collect();
        let f = Arc::new(f);
        run_in_order(items.len(), move |index| f(items[index].clone()).as_unit())
    }

    /// Run the effects in order, collecting the results.
    pub fn collect_all<B: Send + 'static>(
        effects: impl IntoIterator<Item = Effect<R, E, B>>,
    ) -> Effect<R, E, Vec<B>> {
        let effects: Arc<[Effect<R, E, B>]> = effects.into_iter().collect();
        Effect::suspend(move || {
            let acc: Arc<Mutex<Vec<B>>> = Arc::new(Mutex::new(Vec::with_capacity(effects.len())));
            let push = Arc::clone(&acc);
            let effects = Arc::clone(&effects);
            run_in_order(effects.len(), move |index| {
                let push = Arc::clone(&push);
                effects[index].clone().map(move |b| push.lock().push(b))
            })
            .map(move |()| std::mem::take(&mut *acc.lock()))
        })
    }
}

/// Run `step(0)` through `step(len - 1)` one after another. Each step is
/// built only when the previous one has succeeded, so the instruction tree
/// stays shallow however many steps there are.
fn run_in_order<R, E>(
    len: usize,
    step: impl Fn(usize) -> Effect<R, E, ()> + Send + Sync + 'static,
) -> Effect<R, E, ()>
where
    R: 'static,
    E: Send + 'static,
{
    fn go<R: 'static, E: Send + 'static>(
        index: usize,
        len: usize,
        step: Arc<dyn Fn(usize) -> Effect<R, E, ()> + Send + Sync>,
    ) -> Effect<R, E, ()> {
        Effect::suspend(move || {
            if index >= len {
                return Effect::unit();
            }
            let next = Arc::clone(&step);
            step(index).chain(move |()| go(index + 1, len, Arc::clone(&next)))
        })
    }
    go(0, len, Arc::new(step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build().unwrap()).unwrap()
    }

    #[test]
    fn test_succeed_map_chain() {
        let rt = runtime();
        let program = IO::<String, i32>::succeed(20)
            .map(|n| n + 1)
            .chain(|n| Effect::succeed(n * 2));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(42));
    }

    #[test]
    fn test_effect_is_reusable() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let program = UIO::effect_total(move || counter.fetch_add(1, Ordering::SeqCst));
        assert_eq!(rt.unsafe_run_sync(program.clone()), Exit::Success(0));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(1));
    }

    #[test]
    fn test_failure_skips_continuation() {
        let rt = runtime();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let program = IO::<String, i32>::fail("early".to_string()).chain(move |n| {
            flag.store(true, Ordering::SeqCst);
            Effect::succeed(n)
        });
        assert_eq!(rt.unsafe_run_sync(program), Exit::fail("early".to_string()));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fold_cause_m_observes_every_cause() {
        let rt = runtime();
        let describe = |effect: IO<String, i32>| {
            effect.fold_cause_m(
                |cause: Cause<String>| UIO::succeed_once(if cause.is_die() { "die" } else { "fail" }),
                |_| UIO::succeed("ok"),
            )
        };
        assert_eq!(rt.unsafe_run_sync(describe(Effect::succeed(1))), Exit::Success("ok"));
        assert_eq!(rt.unsafe_run_sync(describe(Effect::fail("x".to_string()))), Exit::Success("fail"));
        assert_eq!(rt.unsafe_run_sync(describe(Effect::die_message("broken"))), Exit::Success("die"));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let program = IO::<String, i32>::effect_total(|| panic!("kaboom"));
        let cause = rt.unsafe_run_sync(program).cause().unwrap();
        assert!(cause.is_die());
        assert!(cause.defects()[0].message().contains("kaboom"));
    }

    #[test]
    fn test_catch_all_and_either() {
        let rt = runtime();
        let recovered = IO::<String, usize>::fail("bad".to_string()).catch_all(|e| IO::<Never, usize>::succeed(e.len()));
        assert_eq!(rt.unsafe_run_sync(recovered), Exit::Success(3));

        let either = IO::<String, i32>::fail("bad".to_string()).either();
        assert_eq!(rt.unsafe_run_sync(either), Exit::Success(Err("bad".to_string())));
    }

    #[test]
    fn test_catch_all_ignores_defects() {
        let rt = runtime();
        let program = IO::<String, i32>::die_message("invariant").catch_all(|_| IO::<String, i32>::succeed(0));
        assert!(rt.unsafe_run_sync(program).cause().map_or(false, |c| c.is_die()));
    }

    #[test]
    fn test_sandbox_round_trip() {
        let rt = runtime();
        let sandboxed = IO::<String, i32>::die_message("hidden").sandbox();
        let exposed = sandboxed.clone().either();
        assert!(matches!(rt.unsafe_run_sync(exposed), Exit::Success(Err(cause)) if cause.is_die()));
        assert!(rt.unsafe_run_sync(sandboxed.unsandbox()).cause().map_or(false, |c| c.is_die()));
    }

    #[test]
    fn test_or_die() {
        let rt = runtime();
        let program = IO::<String, i32>::fail("typed".to_string()).or_die();
        let cause = rt.unsafe_run_sync(program).cause().unwrap();
        assert!(cause.defects()[0].message().contains("typed"));
    }

    #[test]
    fn test_environment_access() {
        let rt = runtime();
        let port = Effect::<u16, Never, u16>::access(|port: &u16| *port + 1);
        assert_eq!(rt.unsafe_run_sync(port.clone().provide_all(8079)), Exit::Success(8080));

        let from_tuple = port.provide_some(|env: &(u16, String)| env.0);
        assert_eq!(
            rt.unsafe_run_sync_with((9000u16, "host".to_string()), from_tuple),
            Exit::Success(9001)
        );
    }

    #[test]
    fn test_async_completes_from_another_thread() {
        let rt = runtime();
        let program = IO::<String, i32>::async_(|callback: Callback<String, i32>| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                callback.succeed(99);
            });
        });
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(99));
    }

    #[test]
    fn test_join_adopts_child_failure() {
        let rt = runtime();
        let program = IO::<String, i32>::fail("child".to_string())
            .fork()
            .chain(|fiber| fiber.join());
        assert_eq!(rt.unsafe_run_sync(program), Exit::fail("child".to_string()));
    }

    #[test]
    fn test_uninterruptible_region_completes() {
        let rt = runtime();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let critical = UIO::<()>::sleep(Duration::from_millis(30))
            .zip_right(UIO::effect_total(move || flag.store(true, Ordering::SeqCst)))
            .uninterruptible();
        let program = critical.fork().chain(|fiber| {
            UIO::<()>::sleep(Duration::from_millis(5)).zip_right(fiber.interrupt())
        });
        assert!(rt.unsafe_run_sync(program).is_success());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restore_reenables_interruption() {
        let rt = runtime();
        let after = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&after);
        let masked = UIO::<()>::uninterruptible_mask(move |restore| {
            let flag = Arc::clone(&flag);
            restore
                .apply(UIO::<()>::never())
                .zip_right(UIO::effect_total(move || flag.store(true, Ordering::SeqCst)))
        });
        let program = masked.fork().chain(|fiber| {
            UIO::<()>::sleep(Duration::from_millis(5)).zip_right(fiber.interrupt())
        });
        let exit = rt.unsafe_run_sync(program);
        assert!(exit.value().map_or(false, Exit::is_interrupted));
        assert!(!after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_interrupting_sleep_cancels_timer() {
        let rt = runtime();
        let program = UIO::<()>::sleep(Duration::from_secs(60))
            .fork()
            .chain(|fiber| UIO::<()>::sleep(Duration::from_millis(5)).zip_right(fiber.interrupt()));
        let exit = rt.unsafe_run_sync(program);
        assert!(exit.value().map_or(false, Exit::is_interrupted));
        assert_eq!(rt.pending_timers(), 0);
    }

    #[test]
    fn test_unbounded_sleep_is_interruptible() {
        let rt = runtime();
        let program = UIO::<()>::sleep(Duration::MAX)
            .fork()
            .chain(|fiber| UIO::<()>::sleep(Duration::from_millis(5)).zip_right(fiber.interrupt()));
        let exit = rt.unsafe_run_sync(program);
        assert!(exit.value().map_or(false, Exit::is_interrupted));
        assert_eq!(rt.pending_timers(), 0);
    }

    #[test]
    fn test_children_interrupted_with_parent() {
        let rt = runtime();
        let child_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&child_done);
        let child = UIO::<()>::never().on_interrupt(UIO::effect_total(move || flag.store(true, Ordering::SeqCst)));
        let parent = child.fork().as_unit();
        assert_eq!(rt.unsafe_run_sync(parent), Exit::Success(()));
        std::thread::sleep(Duration::from_millis(50));
        assert!(child_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_daemon_outlives_parent() {
        let rt = runtime();
        let program = UIO::<i32>::succeed(5)
            .delay(Duration::from_millis(20))
            .fork_daemon()
            .chain(|fiber| UIO::succeed(fiber));
        let fiber = match rt.unsafe_run_sync(program) {
            Exit::Success(fiber) => fiber,
            other => panic!("unexpected exit {:?}", other),
        };
        assert_eq!(rt.unsafe_run_sync(fiber.join()), Exit::Success(5));
    }

    #[test]
    fn test_self_interrupt() {
        let rt = runtime();
        let program = UIO::<i32>::interrupt().zip_right(UIO::succeed(1));
        assert!(rt.unsafe_run_sync(program).is_interrupted());
    }

    #[test]
    fn test_unobserved_failure_is_counted() {
        let rt = runtime();
        let before = rt.stats().unhandled_failures;
        let program = IO::<String, ()>::fail("lost".to_string())
            .fork_daemon()
            .zip_right(IO::<String, ()>::sleep(Duration::from_millis(30)));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(()));
        assert!(rt.stats().unhandled_failures > before);
    }

    #[test]
    fn test_foreach_and_collect_all_keep_order() {
        let rt = runtime();
        let doubled = IO::<String, ()>::foreach(vec![1, 2, 3], |n| Effect::succeed(n * 2));
        assert_eq!(rt.unsafe_run_sync(doubled), Exit::Success(vec![2, 4, 6]));

        let all = IO::<String, ()>::collect_all(vec![Effect::succeed('a'), Effect::succeed('b')]);
        assert_eq!(rt.unsafe_run_sync(all), Exit::Success(vec!['a', 'b']));
    }

    #[test]
    fn test_large_collect_all() {
        let rt = runtime();
        let all = IO::<String, ()>::collect_all((0..200_000u32).map(|n| Effect::succeed(n)));
        let values = match rt.unsafe_run_sync(all) {
            Exit::Success(values) => values,
            other => panic!("unexpected exit {:?}", other),
        };
        assert_eq!(values.len(), 200_000);
        assert_eq!(values.last(), Some(&199_999));
    }

    #[test]
    fn test_deep_chain_is_stack_safe() {
        let rt = runtime();
        let program = (0..10_000).fold(UIO::<u64>::succeed(0), |acc, _| acc.map(|n| n + 1));
        assert_eq!(rt.unsafe_run_sync(program), Exit::Success(10_000));
    }
}
