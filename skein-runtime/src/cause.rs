//! # Cause
//!
//! The structured, composable description of why a fiber did not succeed.
//!
//! ## Design
//!
//! A cause is a binary tree whose leaves are one of:
//!
//! - `Fail(E)`: an expected, typed domain error
//! - `Die(Defect)`: an untyped programming error or panic
//! - `Interrupt(FiberId)`: cancellation requested by the given fiber
//!
//! Leaves are combined with `Sequential` (one after another, e.g. a body error
//! followed by a finalizer error) and `Parallel` (concurrent siblings). No
//! information is ever dropped: analysis walks the tree without flattening it.
//!
//! Equality is semantic. Two causes are equal when their linearizations (a list
//! of sequential steps, each a set of leaves that happened in parallel) match.
//! This makes both compositions associative with `Empty` as identity.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

/// An untyped failure: a panic or a violated invariant.
#[derive(Clone)]
pub struct Defect {
    message: Arc<str>,
    error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
            error: None,
        }
    }

    /// Create a defect carrying an error value.
    pub fn from_error<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: Arc::from(error.to_string()),
            error: Some(Arc::new(error)),
        }
    }

    /// Create a defect from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::new(message)
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying error, if the defect was created from one.
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.error.as_deref()
    }

    /// Downcast the underlying error to a concrete type.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.error.as_deref().and_then(|e| e.downcast_ref::<T>())
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defect({:?})", self.message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Why a computation did not succeed.
#[derive(Clone, Debug)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// An expected error.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interrupted by the given fiber.
    Interrupt(FiberId),
    /// Left happened, then right.
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    /// Left and right happened concurrently.
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

/// A leaf of a cause, borrowed for analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Leaf<'a, E> {
    /// An expected error.
    Fail(&'a E),
    /// A defect.
    Die(&'a Defect),
    /// An interruption.
    Interrupt(FiberId),
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// A defect built from a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Compose sequentially. `Empty` on either side is dropped.
    pub fn then(self, next: Cause<E>) -> Self {
        match (self.is_empty_node(), next.is_empty_node()) {
            (true, _) => next,
            (_, true) => self,
            _ => Cause::Sequential(Box::new(self), Box::new(next)),
        }
    }

    /// Compose in parallel. `Empty` on either side is dropped.
    pub fn both(self, other: Cause<E>) -> Self {
        match (self.is_empty_node(), other.is_empty_node()) {
            (true, _) => other,
            (_, true) => self,
            _ => Cause::Parallel(Box::new(self), Box::new(other)),
        }
    }

    fn is_empty_node(&self) -> bool {
        matches!(self, Cause::Empty)
    }

    /// All leaves, left to right.
    pub fn leaves(&self) -> Vec<Leaf<'_, E>> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            match cause {
                Cause::Empty => {}
                Cause::Fail(e) => out.push(Leaf::Fail(e)),
                Cause::Die(d) => out.push(Leaf::Die(d)),
                Cause::Interrupt(id) => out.push(Leaf::Interrupt(*id)),
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    stack.push(r);
                    stack.push(l);
                }
            }
        }
        out
    }

    /// True when the cause contains no leaves.
    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }

    /// True when the cause contains at least one `Fail`.
    pub fn is_failure(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Leaf::Fail(_)))
    }

    /// True when the cause contains at least one `Die`.
    pub fn is_die(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Leaf::Die(_)))
    }

    /// True when the cause contains at least one `Interrupt`.
    pub fn is_interrupted(&self) -> bool {
        self.leaves().iter().any(|l| matches!(l, Leaf::Interrupt(_)))
    }

    /// True when the cause is made only of interruptions.
    pub fn is_interrupted_only(&self) -> bool {
        let leaves = self.leaves();
        !leaves.is_empty() && leaves.iter().all(|l| matches!(l, Leaf::Interrupt(_)))
    }

    /// Every typed failure, left to right.
    pub fn failures(&self) -> Vec<&E> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Leaf::Fail(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Every defect, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Leaf::Die(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Every interrupting fiber, left to right.
    pub fn interruptors(&self) -> Vec<FiberId> {
        self.leaves()
            .into_iter()
            .filter_map(|l| match l {
                Leaf::Interrupt(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// The first typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// Transform the typed failures.
    pub fn map<E2>(self, f: impl Fn(E) -> E2) -> Cause<E2> {
        self.map_ref(&f)
    }

    fn map_ref<E2>(self, f: &impl Fn(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Sequential(l, r) => {
                Cause::Sequential(Box::new(l.map_ref(f)), Box::new(r.map_ref(f)))
            }
            Cause::Parallel(l, r) => Cause::Parallel(Box::new(l.map_ref(f)), Box::new(r.map_ref(f))),
        }
    }

    /// Remove every `Fail` leaf, keeping defects and interruptions.
    pub fn strip_failures(self) -> Cause<E> {
        match self {
            Cause::Fail(_) => Cause::Empty,
            Cause::Sequential(l, r) => l.strip_failures().then(r.strip_failures()),
            Cause::Parallel(l, r) => l.strip_failures().both(r.strip_failures()),
            other => other,
        }
    }

    /// Linearize into sequential steps, each holding the leaves that happened
    /// in parallel at that step. The tree itself is left untouched.
    pub fn linearize(&self) -> Vec<Vec<Leaf<'_, E>>> {
        match self {
            Cause::Empty => Vec::new(),
            Cause::Fail(e) => vec![vec![Leaf::Fail(e)]],
            Cause::Die(d) => vec![vec![Leaf::Die(d)]],
            Cause::Interrupt(id) => vec![vec![Leaf::Interrupt(*id)]],
            Cause::Sequential(l, r) => {
                let mut steps = l.linearize();
                steps.extend(r.linearize());
                steps
            }
            Cause::Parallel(l, r) => {
                let mut left = l.linearize();
                let right = r.linearize();
                if left.len() < right.len() {
                    left.resize_with(right.len(), Vec::new);
                }
                for (step, leaves) in left.iter_mut().zip(right) {
                    step.extend(leaves);
                }
                left
            }
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Render the full tree in a human-readable form.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, false);
        out
    }

    fn render(&self, out: &mut String, nested: bool) {
        match self {
            Cause::Empty => out.push_str("Empty"),
            Cause::Fail(e) => out.push_str(&format!("Fail({:?})", e)),
            Cause::Die(d) => out.push_str(&format!("Die({})", d)),
            Cause::Interrupt(id) => out.push_str(&format!("Interrupted by {}", id)),
            Cause::Sequential(l, r) => {
                if nested {
                    out.push('(');
                }
                l.render(out, true);
                out.push_str(" then ");
                r.render(out, true);
                if nested {
                    out.push(')');
                }
            }
            Cause::Parallel(l, r) => {
                if nested {
                    out.push('(');
                }
                l.render(out, true);
                out.push_str(" | ");
                r.render(out, true);
                if nested {
                    out.push(')');
                }
            }
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        let left = self.linearize();
        let right = other.linearize();
        left.len() == right.len()
            && left
                .iter()
                .zip(right.iter())
                .all(|(a, b)| a.iter().all(|x| b.contains(x)) && b.iter().all(|y| a.contains(y)))
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(n: u64) -> FiberId {
        FiberId::new(n, 0)
    }

    #[test]
    fn test_empty_is_identity() {
        let c: Cause<&str> = Cause::fail("boom");
        assert_eq!(Cause::Empty.then(c.clone()), c);
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.both(c.clone()), c);
        assert!(Cause::<&str>::Empty.then(Cause::Empty).is_empty());
    }

    #[test]
    fn test_sequential_is_associative() {
        let a = Cause::fail(1);
        let b = Cause::die_message("b");
        let c = Cause::interrupt(fid(3));
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        assert_eq!(left, right);
    }

    #[test]
    fn test_sequential_order_matters() {
        let ab = Cause::fail(1).then(Cause::fail(2));
        let ba = Cause::fail(2).then(Cause::fail(1));
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_parallel_is_commutative() {
        let ab = Cause::fail(1).both(Cause::fail(2));
        let ba = Cause::fail(2).both(Cause::fail(1));
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_tree_not_flattened() {
        let c = Cause::fail("a").then(Cause::die_message("b"));
        assert!(matches!(c, Cause::Sequential(_, _)));
        assert_eq!(c.failures(), vec![&"a"]);
        assert_eq!(c.defects().len(), 1);
    }

    #[test]
    fn test_strip_failures() {
        let c = Cause::fail("a").then(Cause::interrupt(fid(7)));
        let stripped = c.strip_failures();
        assert!(!stripped.is_failure());
        assert!(stripped.is_interrupted_only());
        assert_eq!(stripped.interruptors(), vec![fid(7)]);
    }

    #[test]
    fn test_map() {
        let c = Cause::fail(2).both(Cause::die_message("x"));
        let mapped = c.map(|n| n * 10);
        assert_eq!(mapped.failures(), vec![&20]);
    }

    #[test]
    fn test_pretty() {
        let c = Cause::fail("a").then(Cause::fail("b").both(Cause::die_message("oops")));
        let text = c.pretty();
        assert!(text.contains("Fail(\"a\")"));
        assert!(text.contains("then"));
        assert!(text.contains("Die(oops)"));
    }

    #[test]
    fn test_defect_from_panic() {
        let payload: Box<dyn Any + Send> = Box::new("kaput");
        assert_eq!(Defect::from_panic(payload).message(), "kaput");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(Defect::from_panic(payload).message(), "owned");
    }
}
