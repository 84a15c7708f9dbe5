//! # Optional Effects
//!
//! Combinators for effects that may succeed without a value,
//! `Effect<R, E, Option<A>>`. A `None` short-circuits the `*_some`
//! combinators the way a failure short-circuits `chain`, but it is not an
//! error: the effect still succeeds.
//!
//! ```rust
//! use effect_runtime::{EffectOption, Exit, Runtime, RuntimeConfig};
//!
//! fn lookup(id: u32) -> EffectOption<(), String, &'static str> {
//!     EffectOption::from_option(if id == 1 { Some("root") } else { None })
//! }
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let name = lookup(2).or_else_none(lookup(1)).map_some(str::len);
//! assert_eq!(rt.unsafe_run_sync(name), Exit::Success(Some(4)));
//! ```

use std::sync::Arc;

use crate::capability::{make_associative, FnAssociative};
use crate::effect::Effect;

/// An effect that may produce no value.
pub type EffectOption<R, E, A> = Effect<R, E, Option<A>>;

impl<R, E, A> Effect<R, E, Option<A>>
where
    R: 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeed with `Some(value)`.
    pub fn some(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Effect::succeed(Some(value))
    }

    /// Succeed with `None`.
    pub fn none() -> Self {
        Effect::effect_total(|| None)
    }

    /// Succeed with `value`.
    pub fn from_option(value: Option<A>) -> Self
    where
        A: Clone + Sync,
    {
        Effect::succeed(value)
    }

    /// Lift a plain effect into one that always produces a value.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        effect.map(Some)
    }

    /// Transform the value, if there is one.
    pub fn map_some<B: Send + 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> EffectOption<R, E, B> {
        self.map(move |value| value.map(&f))
    }

    /// Continue with `f` when there is a value. `None` skips `f`.
    pub fn chain_some<B: Send + 'static>(
        self,
        f: impl Fn(A) -> EffectOption<R, E, B> + Send + Sync + 'static,
    ) -> EffectOption<R, E, B> {
        self.chain(move |value| match value {
            Some(a) => f(a),
            None => Effect::none(),
        })
    }

    /// Run `f` on the value for its effect, keeping the value.
    pub fn tap_some<X: Send + 'static>(self, f: impl Fn(&A) -> Effect<R, E, X> + Send + Sync + 'static) -> Self {
        self.chain(move |value| match value {
            Some(a) => f(&a).chain_once(move |_| Effect::succeed_once(Some(a))),
            None => Effect::none(),
        })
    }

    /// Fall back to `that` when there is no value.
    pub fn or_else_none(self, that: EffectOption<R, E, A>) -> Self {
        self.chain(move |value| match value {
            Some(a) => Effect::succeed_once(Some(a)),
            None => that.clone(),
        })
    }

    /// The value, or `default()` when there is none.
    pub fn get_or_else(self, default: impl Fn() -> A + Send + Sync + 'static) -> Effect<R, E, A> {
        self.map(move |value| value.unwrap_or_else(&default))
    }

    /// The value, or a failure with `error` when there is none.
    pub fn some_or_fail(self, error: E) -> Effect<R, E, A>
    where
        E: Clone + Sync,
    {
        self.chain(move |value| match value {
            Some(a) => Effect::succeed_once(a),
            None => Effect::fail(error.clone()),
        })
    }

    /// Combine with `that` in sequence. `that` only runs when this effect
    /// produced a value.
    pub fn zip_with_some<B, C>(
        self,
        that: EffectOption<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> EffectOption<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        self.chain(move |value| match value {
            Some(a) => {
                let f = Arc::clone(&f);
                that.clone().chain_once(move |other| Effect::succeed_once(other.map(|b| f(a, b))))
            }
            None => Effect::none(),
        })
    }

    /// Run both effects concurrently and combine their values when both
    /// produced one.
    pub fn zip_with_some_par<B, C>(
        self,
        that: EffectOption<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> EffectOption<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        self.zip_with_par(that, move |a, b| Some(f(a?, b?)))
    }
}

/// Keeps the first value present.
pub fn first_some<A: Send + 'static>() -> FnAssociative<Option<A>> {
    make_associative(|x: Option<A>, y: Option<A>| x.or(y))
}

/// Keeps the last value present.
pub fn last_some<A: Send + 'static>() -> FnAssociative<Option<A>> {
    make_associative(|x: Option<A>, y: Option<A>| y.or(x))
}
