//! # Capabilities
//!
//! Small algebraic interfaces that generic combinators are parameterized
//! over: [`Associative`] for combining values, [`Commutative`] for
//! order-independent combining, and [`Equal`] for equivalence.
//!
//! Implement the traits on your own types, or build instances from closures
//! with [`make_associative`], [`make_commutative`] and [`make_equal`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// An associative binary operation: `combine(x, combine(y, z)) ==
/// combine(combine(x, y), z)`.
pub trait Associative<A>: Send + Sync {
    /// Combine two values.
    fn combine(&self, x: A, y: A) -> A;
}

/// An associative operation whose result does not depend on argument order.
pub trait Commutative<A>: Associative<A> {
    /// Combine with the arguments swapped.
    fn commute(&self, x: A, y: A) -> A {
        self.combine(y, x)
    }
}

/// An equivalence relation.
pub trait Equal<A>: Send + Sync {
    /// Whether `x` and `y` are equivalent.
    fn equals(&self, x: &A, y: &A) -> bool;
}

/// [`Associative`] instance backed by a closure.
pub struct FnAssociative<A> {
    combine: Arc<dyn Fn(A, A) -> A + Send + Sync>,
}

impl<A> Clone for FnAssociative<A> {
    fn clone(&self) -> Self {
        Self {
            combine: Arc::clone(&self.combine),
        }
    }
}

impl<A> fmt::Debug for FnAssociative<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnAssociative")
    }
}

impl<A> Associative<A> for FnAssociative<A> {
    fn combine(&self, x: A, y: A) -> A {
        (self.combine)(x, y)
    }
}

/// Build an [`Associative`] from a closure. Associativity is the caller's
/// obligation.
pub fn make_associative<A>(combine: impl Fn(A, A) -> A + Send + Sync + 'static) -> FnAssociative<A> {
    FnAssociative {
        combine: Arc::new(combine),
    }
}

/// [`Commutative`] instance backed by a closure.
pub struct FnCommutative<A>(FnAssociative<A>);

impl<A> Clone for FnCommutative<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A> fmt::Debug for FnCommutative<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCommutative")
    }
}

impl<A> Associative<A> for FnCommutative<A> {
    fn combine(&self, x: A, y: A) -> A {
        self.0.combine(x, y)
    }
}

impl<A> Commutative<A> for FnCommutative<A> {}

/// Build a [`Commutative`] from a closure.
pub fn make_commutative<A>(combine: impl Fn(A, A) -> A + Send + Sync + 'static) -> FnCommutative<A> {
    FnCommutative(make_associative(combine))
}

/// [`Equal`] instance backed by a closure.
pub struct FnEqual<A> {
    equals: Arc<dyn Fn(&A, &A) -> bool + Send + Sync>,
}

impl<A> Clone for FnEqual<A> {
    fn clone(&self) -> Self {
        Self {
            equals: Arc::clone(&self.equals),
        }
    }
}

impl<A> fmt::Debug for FnEqual<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnEqual")
    }
}

impl<A> Equal<A> for FnEqual<A> {
    fn equals(&self, x: &A, y: &A) -> bool {
        (self.equals)(x, y)
    }
}

impl<A: 'static> FnEqual<A> {
    /// Compare values of another type by projecting them to `A`.
    pub fn contramap<B>(self, f: impl Fn(&B) -> A + Send + Sync + 'static) -> FnEqual<B> {
        FnEqual {
            equals: Arc::new(move |x: &B, y: &B| (self.equals)(&f(x), &f(y))),
        }
    }
}

/// Build an [`Equal`] from a closure.
pub fn make_equal<A>(equals: impl Fn(&A, &A) -> bool + Send + Sync + 'static) -> FnEqual<A> {
    FnEqual {
        equals: Arc::new(equals),
    }
}

/// Pairs are equal when both components are.
pub fn equal_both<A: 'static, B: 'static>(
    left: impl Equal<A> + 'static,
    right: impl Equal<B> + 'static,
) -> FnEqual<(A, B)> {
    make_equal(move |x: &(A, B), y: &(A, B)| left.equals(&x.0, &y.0) && right.equals(&x.1, &y.1))
}

/// [`Equal`] given by `PartialEq`.
pub struct StructuralEqual<A>(PhantomData<fn(&A)>);

impl<A> Default for StructuralEqual<A> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<A> Clone for StructuralEqual<A> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<A> Copy for StructuralEqual<A> {}

impl<A> fmt::Debug for StructuralEqual<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StructuralEqual")
    }
}

impl<A: PartialEq> Equal<A> for StructuralEqual<A> {
    fn equals(&self, x: &A, y: &A) -> bool {
        x == y
    }
}

/// Equality by `PartialEq`.
pub fn structural_equal<A: PartialEq>() -> StructuralEqual<A> {
    StructuralEqual::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_associative_from_closure() {
        let concat = make_associative(|x: String, y: String| x + &y);
        assert_eq!(concat.combine("ab".into(), "cd".into()), "abcd");
    }

    #[test]
    fn test_commute_swaps_arguments() {
        let sub = make_commutative(|x: i32, y: i32| x - y);
        assert_eq!(sub.combine(5, 3), 2);
        assert_eq!(sub.commute(5, 3), -2);
    }

    #[test]
    fn test_equal_contramap() {
        let by_len = make_equal(|x: &usize, y: &usize| x == y).contramap(|s: &String| s.len());
        assert!(by_len.equals(&"abc".to_string(), &"xyz".to_string()));
        assert!(!by_len.equals(&"ab".to_string(), &"xyz".to_string()));
    }

    #[test]
    fn test_equal_both() {
        let eq = equal_both(structural_equal::<i32>(), make_equal(|x: &String, y: &String| x.eq_ignore_ascii_case(y)));
        assert!(eq.equals(&(1, "A".to_string()), &(1, "a".to_string())));
        assert!(!eq.equals(&(2, "A".to_string()), &(1, "a".to_string())));
    }
}
