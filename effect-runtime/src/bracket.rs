//! # Finalization
//!
//! Combinators that attach cleanup to an effect. Cleanup always runs
//! uninterruptibly and always observes the real exit of the guarded
//! effect: success, failure or interruption.
//!
//! A failing finalizer never hides the outcome it is cleaning up after. It
//! replaces a success, and is appended with [`Cause::then`] to a failure.

use std::sync::Arc;

use crate::cause::Cause;
use crate::effect::{Effect, Restore};
use crate::exit::{then_finalizer, Exit, Never};
use crate::panic;

type Cleanup<R, E, A, X> = Arc<dyn Fn(&Exit<E, A>) -> Effect<R, E, X> + Send + Sync>;

/// Whether an exit was caused by interruption.
pub(crate) fn interrupted<E, A>(exit: &Exit<E, A>) -> bool {
    match exit {
        Exit::Interrupted(_) => true,
        Exit::Failure(cause) => cause.is_interrupted(),
        Exit::Success(_) => false,
    }
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run `self` with `restore`, then `cleanup` with its exit.
    fn guarantee_with<X: Send + 'static>(self, restore: Restore, cleanup: Cleanup<R, E, A, X>) -> Self {
        restore
            .apply(self)
            .result_as::<E>()
            .chain(move |exit: Exit<E, A>| {
                cleanup(&exit)
                    .result_as::<E>()
                    .chain_once(move |released| Effect::done_once(then_finalizer(exit, released)))
            })
    }

    /// Run `cleanup` with the exit of this effect, however it ends.
    pub fn on_exit<X: Send + 'static>(
        self,
        cleanup: impl Fn(&Exit<E, A>) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self {
        let cleanup: Cleanup<R, E, A, X> = Arc::new(move |exit: &Exit<E, A>| cleanup(exit).widen_error());
        Effect::uninterruptible_mask(move |restore| self.clone().guarantee_with(restore, Arc::clone(&cleanup)))
    }

    /// Run `finalizer` after this effect, however it ends.
    pub fn ensuring<X: Send + 'static>(self, finalizer: Effect<R, Never, X>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` only if this effect is interrupted.
    pub fn on_interrupt<X: Send + 'static>(self, cleanup: Effect<R, Never, X>) -> Self {
        self.on_exit(move |exit| {
            if interrupted(exit) {
                cleanup.clone().as_unit()
            } else {
                Effect::unit()
            }
        })
    }

    /// Run `cleanup` only if this effect fails or is interrupted.
    pub fn on_error<X: Send + 'static>(
        self,
        cleanup: impl Fn(&Cause<E>) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Self {
        self.on_exit(move |exit| match exit {
            Exit::Success(_) => Effect::unit(),
            Exit::Failure(cause) => cleanup(cause).as_unit(),
            Exit::Interrupted(by) => cleanup(&Cause::interrupt(*by)).as_unit(),
        })
    }

    /// Use the resource acquired by `self`, then release it.
    ///
    /// Acquisition and release are uninterruptible; `use_` runs with the
    /// caller's interruptibility. If acquisition fails nothing is released.
    /// `release` sees the resource and the exit of `use_`.
    pub fn bracket_exit<B, X>(
        self,
        use_: impl Fn(&A) -> Effect<R, E, B> + Send + Sync + 'static,
        release: impl Fn(&A, &Exit<E, B>) -> Effect<R, E, X> + Send + Sync + 'static,
    ) -> Effect<R, E, B>
    where
        B: Send + 'static,
        X: Send + 'static,
    {
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_ = Arc::clone(&use_);
            let release = Arc::clone(&release);
            self.clone().chain(move |resource: A| {
                let used = panic::catch(|| use_(&resource)).unwrap_or_else(Effect::die);
                let release = Arc::clone(&release);
                restore
                    .apply(used)
                    .result_as::<E>()
                    .chain_once(move |exit: Exit<E, B>| {
                        let released = panic::catch(|| release(&resource, &exit)).unwrap_or_else(Effect::die);
                        released
                            .result_as::<E>()
                            .chain_once(move |released| Effect::done_once(then_finalizer(exit, released)))
                    })
            })
        })
    }

    /// [`bracket_exit`](Self::bracket_exit) with a release that ignores the
    /// exit.
    pub fn bracket<B, X>(
        self,
        use_: impl Fn(&A) -> Effect<R, E, B> + Send + Sync + 'static,
        release: impl Fn(&A) -> Effect<R, Never, X> + Send + Sync + 'static,
    ) -> Effect<R, E, B>
    where
        B: Send + 'static,
        X: Send + 'static,
    {
        self.bracket_exit(use_, move |resource, _| release(resource).widen_error())
    }

    /// Use the value of this effect, then run `finalizer`.
    pub fn bracket_<B, X>(
        self,
        use_: Effect<R, E, B>,
        finalizer: Effect<R, Never, X>,
    ) -> Effect<R, E, B>
    where
        B: Send + 'static,
        X: Send + 'static,
    {
        self.bracket(move |_| use_.clone(), move |_| finalizer.clone())
    }
}
