//! Failure Causes
//!
//! A [`Cause`] is the full story of why an effect did not succeed. Typed
//! failures, defects and interruptions are leaves; `Then` records failures
//! that happened one after another (a finalizer failing after the body
//! failed) and `Both` records failures of concurrent branches.

use std::fmt;

use crate::fiber::FiberId;
use crate::panic::Defect;

/// Why an effect failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure. Identity for [`Cause::then`] and [`Cause::both`].
    Empty,
    /// A typed, recoverable failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// Sequential composition.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Parallel composition.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// An interruption by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// `left` followed by `right`. Empty sides are dropped.
    pub fn then(left: Cause<E>, right: Cause<E>) -> Self {
        if left.is_empty() {
            right
        } else if right.is_empty() {
            left
        } else {
            Cause::Then(Box::new(left), Box::new(right))
        }
    }

    /// `left` concurrently with `right`. Empty sides are dropped.
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        if left.is_empty() {
            right
        } else if right.is_empty() {
            left
        } else {
            Cause::Both(Box::new(left), Box::new(right))
        }
    }

    /// Sequential composition of many causes, left to right.
    pub fn then_all(causes: impl IntoIterator<Item = Cause<E>>) -> Self {
        Self::balanced(causes, Cause::then)
    }

    /// Parallel composition of many causes, left to right.
    pub fn both_all(causes: impl IntoIterator<Item = Cause<E>>) -> Self {
        Self::balanced(causes, Cause::both)
    }

    /// Merge neighbours pairwise so the tree depth grows with the log of
    /// the number of causes.
    fn balanced(causes: impl IntoIterator<Item = Cause<E>>, join: fn(Cause<E>, Cause<E>) -> Cause<E>) -> Self {
        let mut layer: Vec<Cause<E>> = causes.into_iter().filter(|c| !c.is_empty()).collect();
        while layer.len() > 1 {
            let mut next = Vec::with_capacity(layer.len().div_ceil(2));
            let mut iter = layer.into_iter();
            while let Some(left) = iter.next() {
                next.push(match iter.next() {
                    Some(right) => join(left, right),
                    None => left,
                });
            }
            layer = next;
        }
        layer.pop().unwrap_or(Cause::Empty)
    }

    /// True when the cause contains no failure of any kind.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.visit(&mut |leaf| {
            if !matches!(leaf, Cause::Empty) {
                empty = false;
            }
        });
        empty
    }

    /// True when any leaf is an interruption.
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// True when the cause is made of interruptions only.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && self.failures().is_empty() && self.defects().is_empty()
    }

    /// True when any leaf is a defect.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// True when any leaf is a typed failure.
    pub fn is_failure(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Cause::Fail(e) = leaf {
                out.push(e);
            }
        });
        out
    }

    /// Defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Cause::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// Interrupting fibers, left to right.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.visit(&mut |leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.push(*id);
            }
        });
        out
    }

    /// Visit every leaf left to right without recursing.
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Cause<E>)) {
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            match cause {
                Cause::Then(l, r) | Cause::Both(l, r) => {
                    stack.push(r);
                    stack.push(l);
                }
                leaf => f(leaf),
            }
        }
    }

    /// Consume the cause, returning its typed failures left to right.
    pub fn into_failures(self) -> Vec<E> {
        let mut out = Vec::new();
        self.filter_map(|e| {
            out.push(e);
            None::<E>
        });
        out
    }

    /// The first typed failure, or the cause itself when there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if self.is_failure() {
            match self.into_failures().into_iter().next() {
                Some(e) => Ok(e),
                None => Err(Cause::Empty),
            }
        } else {
            Err(self)
        }
    }

    /// Transform every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.filter_map(|e| Some(f(e)))
    }

    /// Transform typed failures, dropping those mapped to `None`.
    pub fn filter_map<E2>(self, mut f: impl FnMut(E) -> Option<E2>) -> Cause<E2> {
        self.flat_map(|e| f(e).map_or(Cause::Empty, Cause::Fail))
    }

    /// Replace every typed failure with a cause.
    pub fn flat_map<E2>(self, mut f: impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        self.flat_map_with(&mut f)
    }

    fn flat_map_with<E2, F: FnMut(E) -> Cause<E2>>(self, f: &mut F) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => Cause::then(l.flat_map_with(f), r.flat_map_with(f)),
            Cause::Both(l, r) => Cause::both(l.flat_map_with(f), r.flat_map_with(f)),
        }
    }

    /// Drop every typed failure, keeping defects and interruptions.
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        self.filter_map(|_| None)
    }

    /// Render the shape of the cause without requiring `E: Debug`.
    pub(crate) fn describe(&self) -> String {
        match self {
            Cause::Empty => "Empty".to_string(),
            Cause::Fail(_) => "Fail(..)".to_string(),
            Cause::Die(d) => format!("Die({})", d),
            Cause::Interrupt(id) => format!("Interrupt({})", id),
            Cause::Then(l, r) => format!("Then({}, {})", l.describe(), r.describe()),
            Cause::Both(l, r) => format!("Both({}, {})", l.describe(), r.describe()),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => f.write_str("Empty"),
            Cause::Fail(e) => write!(f, "Fail({:?})", e),
            Cause::Die(d) => write!(f, "Die({})", d),
            Cause::Interrupt(id) => write!(f, "Interrupt({})", id),
            Cause::Then(l, r) => write!(f, "Then({}, {})", l, r),
            Cause::Both(l, r) => write!(f, "Both({}, {})", l, r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_then_drops_empty() {
        let cause = Cause::then(Cause::Empty, Cause::fail("a"));
        assert_eq!(cause, Cause::Fail("a"));
        let cause = Cause::then(Cause::fail("a"), Cause::Empty);
        assert_eq!(cause, Cause::Fail("a"));
    }

    #[test]
    fn test_both_keeps_order() {
        let cause = Cause::both(Cause::fail(1), Cause::fail(2));
        assert_eq!(cause.failures(), vec![&1, &2]);
    }

    #[test]
    fn test_interrupted_only() {
        let id = FiberId::new(7);
        let cause: Cause<()> = Cause::then(Cause::interrupt(id), Cause::interrupt(id));
        assert!(cause.is_interrupted_only());
        assert_eq!(cause.interruptors(), vec![id, id]);

        let mixed = Cause::both(Cause::interrupt(id), Cause::fail(()));
        assert!(mixed.is_interrupted());
        assert!(!mixed.is_interrupted_only());
    }

    #[test]
    fn test_empty_is_not_interrupted() {
        let cause: Cause<()> = Cause::Empty;
        assert!(cause.is_empty());
        assert!(!cause.is_interrupted_only());
    }

    #[test]
    fn test_map_preserves_structure() {
        let cause = Cause::then(Cause::fail(2), Cause::die(Defect::new("x")));
        let mapped = cause.map(|n| n * 10);
        assert_eq!(mapped.failures(), vec![&20]);
        assert!(mapped.is_die());
    }

    #[test]
    fn test_strip_failures() {
        let id = FiberId::new(3);
        let cause = Cause::both(Cause::fail("e"), Cause::interrupt(id));
        let stripped: Cause<u8> = cause.strip_failures();
        assert_eq!(stripped, Cause::Interrupt(id));
    }

    #[test]
    fn test_failure_or_cause() {
        let cause = Cause::then(Cause::die(Defect::new("d")), Cause::fail("first"));
        assert_eq!(cause.failure_or_cause(), Ok("first"));

        let id = FiberId::new(1);
        let cause: Cause<&str> = Cause::interrupt(id);
        assert_eq!(cause.failure_or_cause(), Err(Cause::Interrupt(id)));
    }

    fn depth<E>(cause: &Cause<E>) -> usize {
        match cause {
            Cause::Then(l, r) | Cause::Both(l, r) => 1 + depth(l).max(depth(r)),
            _ => 0,
        }
    }

    #[test]
    fn test_both_all_is_balanced_and_ordered() {
        let cause = Cause::both_all((0..100_000).map(Cause::fail));
        assert!(depth(&cause) <= 17);
        let failures: Vec<i32> = cause.failures().into_iter().copied().collect();
        assert_eq!(failures, (0..100_000).collect::<Vec<_>>());
    }

    #[test]
    fn test_then_all_skips_empty() {
        let cause = Cause::then_all(vec![Cause::Empty, Cause::fail("a"), Cause::Empty, Cause::fail("b")]);
        assert_eq!(cause, Cause::then(Cause::fail("a"), Cause::fail("b")));
        assert_eq!(Cause::<()>::both_all(Vec::new()), Cause::Empty);
    }

    #[test]
    fn test_display() {
        let cause = Cause::both(Cause::fail("a"), Cause::interrupt(FiberId::new(4)));
        assert_eq!(cause.to_string(), "Both(Fail(\"a\"), Interrupt(Fiber(4)))");
        assert_eq!(cause.describe(), "Both(Fail(..), Interrupt(Fiber(4)))");
    }
}
