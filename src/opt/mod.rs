//! The trace optimizer.
//!
//! [`pipeline::optimize_loop`] drives one loop through the pass chain:
//! 1. `intbounds`: integer interval propagation, bound-provable guard and
//!    comparison elimination, overflow-check removal
//! 2. `rewrite`: constant folding, algebraic identities, CSE of pure
//!    operations, guard strengthening and merging
//! 3. `virtualize`: escape analysis of fresh allocations, with lazy
//!    forcing when a virtual escapes
//! 4. `earlyforce`: forcing of virtuals flowing into operations that need
//!    real pointers before the later passes run
//! 5. `vstring`: virtual strings (char-by-char, concatenation, slices)
//!    and folding of recognized string builtins
//! 6. `heap`: redundant load elimination, lazy stores, call-effect
//!    invalidation
//!
//! Passes share one [`ValueState`]: a replacement map from boxes to the
//! values they are known equal to, pointer facts learned from guards, and
//! the virtual objects currently being tracked. Any pass can reject the
//! loop with [`InvalidLoop`]; the caller then discards all partial output
//! and keeps running the unoptimized trace.

pub mod earlyforce;
pub mod heap;
pub mod intbounds;
pub mod pipeline;
pub mod rewrite;
pub mod virtualize;
pub mod vstring;

pub use intbounds::IntBound;
pub use pipeline::{optimize_loop, Pipeline};

use rustc_hash::FxHashMap;

use crate::ir::value::{BoxId, RefConst, Value};
use crate::resume::tagged::TagOverflow;

use virtualize::VirtualState;

/// The trace cannot be soundly specialized under its guard set. The
/// compilation driver discards the optimized output and falls back to the
/// unoptimized trace; partial results are never applied.
#[derive(Debug, PartialEq, Eq)]
pub enum InvalidLoop {
    /// A guard is provably false given earlier guards and constants.
    UnsatisfiableGuard(&'static str),
    /// Interval propagation produced an empty range for a live value.
    EmptyIntBound,
    /// A virtual graph refers to an object that was never constructed.
    DanglingVirtual,
    /// Resume encoding ran out of 14-bit payload space.
    ResumeOverflow,
    /// The trace violates a structural invariant.
    MalformedTrace(&'static str),
}

impl std::fmt::Display for InvalidLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidLoop::UnsatisfiableGuard(what) => {
                write!(f, "guard is provably false: {}", what)
            }
            InvalidLoop::EmptyIntBound => f.write_str("contradictory integer bounds"),
            InvalidLoop::DanglingVirtual => {
                f.write_str("virtual graph references an object never constructed")
            }
            InvalidLoop::ResumeOverflow => f.write_str("resume data payload overflow"),
            InvalidLoop::MalformedTrace(what) => write!(f, "malformed trace: {}", what),
        }
    }
}

impl std::error::Error for InvalidLoop {}

impl From<TagOverflow> for InvalidLoop {
    fn from(_: TagOverflow) -> Self {
        InvalidLoop::ResumeOverflow
    }
}

/// Tunables of one optimization run.
#[derive(Debug, Clone)]
pub struct OptOptions {
    /// Backend limit on guard fail-args length; drives the resume cache
    /// clearing heuristic.
    pub failargs_limit: usize,
}

impl Default for OptOptions {
    fn default() -> Self {
        OptOptions {
            failargs_limit: 1000,
        }
    }
}

/// Pointer facts learned from guards and allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtrFacts {
    pub nonnull: bool,
    pub known_class: Option<RefConst>,
}

/// Value knowledge shared by every pass.
#[derive(Default)]
pub struct ValueState {
    replacements: FxHashMap<BoxId, Value>,
    ptr_facts: FxHashMap<BoxId, PtrFacts>,
    pub virtuals: FxHashMap<BoxId, VirtualState>,
}

impl ValueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final replacement of a value, following chains to the end. Chains
    /// stay short because new equalities are recorded against resolved
    /// values.
    pub fn resolve(&self, v: Value) -> Value {
        let mut cur = v;
        while let Value::Box(b) = cur {
            match self.replacements.get(&b) {
                Some(&next) => cur = next,
                None => break,
            }
        }
        cur
    }

    /// Record that `b` is henceforth the same as `replacement`.
    pub fn make_equal(&mut self, b: BoxId, replacement: Value) {
        debug_assert!(Value::Box(b) != replacement);
        self.replacements.insert(b, replacement);
    }

    /// Check whether the box currently denotes an unforced virtual.
    #[inline]
    pub fn is_virtual(&self, b: BoxId) -> bool {
        self.virtuals.contains_key(&b)
    }

    /// Facts known about a pointer box.
    pub fn ptr_facts(&self, b: BoxId) -> PtrFacts {
        if self.is_virtual(b) {
            return PtrFacts {
                nonnull: true,
                known_class: None,
            };
        }
        self.ptr_facts.get(&b).copied().unwrap_or_default()
    }

    /// Check whether the value is known not to be null.
    pub fn known_nonnull(&self, v: Value) -> bool {
        match self.resolve(v) {
            Value::Const(c) => !c.is_zero_like(),
            Value::Box(b) => self.ptr_facts(b).nonnull,
        }
    }

    pub fn mark_nonnull(&mut self, b: BoxId) {
        self.ptr_facts.entry(b).or_default().nonnull = true;
    }

    pub fn mark_class(&mut self, b: BoxId, class: RefConst) {
        let facts = self.ptr_facts.entry(b).or_default();
        facts.nonnull = true;
        facts.known_class = Some(class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::ValueKind;

    fn b(i: u32) -> BoxId {
        BoxId::new(i, ValueKind::Int)
    }

    #[test]
    fn test_resolve_chain() {
        let mut vals = ValueState::new();
        vals.make_equal(b(0), Value::Box(b(1)));
        vals.make_equal(b(1), Value::Box(b(2)));
        vals.make_equal(b(2), Value::int(5));
        assert_eq!(vals.resolve(Value::Box(b(0))), Value::int(5));
        assert_eq!(vals.resolve(Value::Box(b(1))), Value::int(5));
    }

    #[test]
    fn test_resolve_untracked() {
        let mut vals = ValueState::new();
        assert_eq!(vals.resolve(Value::Box(b(9))), Value::Box(b(9)));
        assert_eq!(vals.resolve(Value::int(3)), Value::int(3));
    }

    #[test]
    fn test_ptr_facts() {
        let mut vals = ValueState::new();
        let p = BoxId::new(0, ValueKind::Ref);
        assert!(!vals.known_nonnull(Value::Box(p)));
        vals.mark_class(p, RefConst(0x40));
        assert!(vals.known_nonnull(Value::Box(p)));
        assert_eq!(vals.ptr_facts(p).known_class, Some(RefConst(0x40)));
        assert!(!vals.known_nonnull(Value::NULL));
        assert!(vals.known_nonnull(Value::reference(RefConst(0x8))));
    }
}
