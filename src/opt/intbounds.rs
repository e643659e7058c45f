//! Integer interval tracking.
//!
//! Every integer box carries an inferred `[lower, upper]` interval,
//! widened by arithmetic and narrowed by surviving guards. Intervals let
//! the pipeline fold comparisons whose outcome is already implied, drop
//! the guards that tested them, and replace overflow-checked arithmetic
//! with the plain variant when the operand ranges cannot overflow.

use rustc_hash::FxHashMap;

use crate::ir::ops::OpKind;
use crate::ir::trace::Operation;
use crate::ir::value::{BoxId, Value};

use super::pipeline::Pipeline;
use super::InvalidLoop;

/// A (possibly half-open) integer interval. `None` means unbounded on
/// that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntBound {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
}

impl IntBound {
    pub const UNBOUNDED: IntBound = IntBound {
        lower: None,
        upper: None,
    };

    #[inline]
    pub const fn constant(v: i64) -> IntBound {
        IntBound {
            lower: Some(v),
            upper: Some(v),
        }
    }

    #[inline]
    pub const fn at_least(lower: i64) -> IntBound {
        IntBound {
            lower: Some(lower),
            upper: None,
        }
    }

    #[inline]
    pub const fn at_most(upper: i64) -> IntBound {
        IntBound {
            lower: None,
            upper: Some(upper),
        }
    }

    #[inline]
    pub const fn range(lower: i64, upper: i64) -> IntBound {
        IntBound {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    /// The single value of the interval, if it has exactly one.
    #[inline]
    pub fn as_const(self) -> Option<i64> {
        match (self.lower, self.upper) {
            (Some(l), Some(u)) if l == u => Some(l),
            _ => None,
        }
    }

    #[inline]
    pub fn known_nonnegative(self) -> bool {
        matches!(self.lower, Some(l) if l >= 0)
    }

    #[inline]
    pub fn known_nonzero(self) -> bool {
        matches!(self.lower, Some(l) if l > 0) || matches!(self.upper, Some(u) if u < 0)
    }

    #[inline]
    pub fn known_lt(self, other: IntBound) -> bool {
        matches!((self.upper, other.lower), (Some(u), Some(l)) if u < l)
    }

    #[inline]
    pub fn known_le(self, other: IntBound) -> bool {
        matches!((self.upper, other.lower), (Some(u), Some(l)) if u <= l)
    }

    #[inline]
    pub fn known_gt(self, other: IntBound) -> bool {
        other.known_lt(self)
    }

    #[inline]
    pub fn known_ge(self, other: IntBound) -> bool {
        other.known_le(self)
    }

    /// Intersection; `None` when the result would be empty.
    pub fn intersect(self, other: IntBound) -> Option<IntBound> {
        let lower = match (self.lower, other.lower) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let upper = match (self.upper, other.upper) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let (Some(l), Some(u)) = (lower, upper) {
            if l > u {
                return None;
            }
        }
        IntBound { lower, upper }.into()
    }

    /// Interval sum; a side overflowing i64 becomes unbounded.
    pub fn add(self, other: IntBound) -> IntBound {
        IntBound {
            lower: match (self.lower, other.lower) {
                (Some(a), Some(b)) => a.checked_add(b),
                _ => None,
            },
            upper: match (self.upper, other.upper) {
                (Some(a), Some(b)) => a.checked_add(b),
                _ => None,
            },
        }
    }

    pub fn neg(self) -> IntBound {
        IntBound {
            lower: self.upper.and_then(i64::checked_neg),
            upper: self.lower.and_then(i64::checked_neg),
        }
    }

    pub fn sub(self, other: IntBound) -> IntBound {
        self.add(other.neg())
    }

    /// Interval product; unbounded unless all four corners are finite and
    /// representable.
    pub fn mul(self, other: IntBound) -> IntBound {
        let corners = match (self.lower, self.upper, other.lower, other.upper) {
            (Some(a), Some(b), Some(c), Some(d)) => [
                a.checked_mul(c),
                a.checked_mul(d),
                b.checked_mul(c),
                b.checked_mul(d),
            ],
            _ => return IntBound::UNBOUNDED,
        };
        let mut lower = i64::MAX;
        let mut upper = i64::MIN;
        for c in corners {
            match c {
                Some(v) => {
                    lower = lower.min(v);
                    upper = upper.max(v);
                }
                None => return IntBound::UNBOUNDED,
            }
        }
        IntBound::range(lower, upper)
    }

    /// Bitwise and; precise only for nonnegative intervals.
    pub fn and(self, other: IntBound) -> IntBound {
        if self.known_nonnegative() && other.known_nonnegative() {
            let upper = match (self.upper, other.upper) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            IntBound {
                lower: Some(0),
                upper,
            }
        } else {
            IntBound::UNBOUNDED
        }
    }

    /// Remainder by a constant positive divisor.
    pub fn mod_const(divisor: i64) -> IntBound {
        if divisor > 0 {
            IntBound::range(0, divisor - 1)
        } else {
            IntBound::UNBOUNDED
        }
    }

    /// Left shift by a constant in [0, 63]; unbounded on overflow.
    pub fn lshift_const(self, shift: i64) -> IntBound {
        if !(0..64).contains(&shift) {
            return IntBound::UNBOUNDED;
        }
        let shl = |v: i64| {
            let shifted = v.checked_shl(shift as u32)?;
            if shifted >> shift == v {
                Some(shifted)
            } else {
                None
            }
        };
        IntBound {
            lower: self.lower.and_then(shl),
            upper: self.upper.and_then(shl),
        }
    }

    /// Arithmetic right shift by a constant in [0, 63].
    pub fn rshift_const(self, shift: i64) -> IntBound {
        if !(0..64).contains(&shift) {
            return IntBound::UNBOUNDED;
        }
        IntBound {
            lower: self.lower.map(|v| v >> shift),
            upper: self.upper.map(|v| v >> shift),
        }
    }
}

/// Per-loop interval state.
#[derive(Default)]
pub struct BoundsState {
    bounds: FxHashMap<BoxId, IntBound>,
    /// Producing operation of comparison results, for narrowing operand
    /// intervals when a guard pins the result.
    producers: FxHashMap<BoxId, (OpKind, Value, Value)>,
    /// Set when the most recent overflow-checked operation was proven in
    /// range; the following overflow guard is then redundant.
    pub last_ovf_in_range: bool,
}

impl BoundsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval of a resolved value.
    pub fn bound_of(&self, v: Value) -> IntBound {
        match v {
            Value::Const(c) => match c.as_int() {
                Some(i) => IntBound::constant(i),
                None => IntBound::UNBOUNDED,
            },
            Value::Box(b) => self.bounds.get(&b).copied().unwrap_or(IntBound::UNBOUNDED),
        }
    }

    pub fn set(&mut self, b: BoxId, bound: IntBound) {
        if bound != IntBound::UNBOUNDED {
            self.bounds.insert(b, bound);
        }
    }

    /// Narrow a value's interval; constants are checked, not stored.
    pub fn narrow(&mut self, v: Value, with: IntBound) -> Result<(), InvalidLoop> {
        match v {
            Value::Const(c) => {
                if let Some(i) = c.as_int() {
                    if with.intersect(IntBound::constant(i)).is_none() {
                        return Err(InvalidLoop::EmptyIntBound);
                    }
                }
                Ok(())
            }
            Value::Box(b) => {
                let cur = self.bounds.get(&b).copied().unwrap_or(IntBound::UNBOUNDED);
                match cur.intersect(with) {
                    Some(narrowed) => {
                        self.set(b, narrowed);
                        Ok(())
                    }
                    None => Err(InvalidLoop::EmptyIntBound),
                }
            }
        }
    }

    pub fn record_producer(&mut self, result: BoxId, kind: OpKind, a: Value, b: Value) {
        self.producers.insert(result, (kind, a, b));
    }

    pub fn producer(&self, b: BoxId) -> Option<(OpKind, Value, Value)> {
        self.producers.get(&b).copied()
    }
}

impl Pipeline<'_> {
    /// Widen the result interval of an emitted arithmetic operation.
    pub(crate) fn update_arith_bounds(&mut self, op: &Operation) {
        let result = match op.result {
            Some(r) => r,
            None => return,
        };
        let bound = match op.kind {
            OpKind::IntAdd | OpKind::IntAddOvf => self
                .bounds
                .bound_of(op.arg(0))
                .add(self.bounds.bound_of(op.arg(1))),
            OpKind::IntSub | OpKind::IntSubOvf => self
                .bounds
                .bound_of(op.arg(0))
                .sub(self.bounds.bound_of(op.arg(1))),
            OpKind::IntMul | OpKind::IntMulOvf => self
                .bounds
                .bound_of(op.arg(0))
                .mul(self.bounds.bound_of(op.arg(1))),
            OpKind::IntNeg => self.bounds.bound_of(op.arg(0)).neg(),
            OpKind::IntAnd => self
                .bounds
                .bound_of(op.arg(0))
                .and(self.bounds.bound_of(op.arg(1))),
            OpKind::IntMod => match op.arg(1).as_const_int() {
                Some(d) => IntBound::mod_const(d),
                None => {
                    let d = self.bounds.bound_of(op.arg(1));
                    match d.upper {
                        Some(u) if d.known_nonnegative() => IntBound::range(0, u.max(1) - 1),
                        _ => IntBound::UNBOUNDED,
                    }
                }
            },
            OpKind::IntLshift => match op.arg(1).as_const_int() {
                Some(s) => self.bounds.bound_of(op.arg(0)).lshift_const(s),
                None => IntBound::UNBOUNDED,
            },
            OpKind::IntRshift => match op.arg(1).as_const_int() {
                Some(s) => self.bounds.bound_of(op.arg(0)).rshift_const(s),
                None => IntBound::UNBOUNDED,
            },
            OpKind::IntForceGeZero => self
                .bounds
                .bound_of(op.arg(0))
                .intersect(IntBound::at_least(0))
                .unwrap_or(IntBound::at_least(0)),
            OpKind::ArraylenGc | OpKind::StrLen | OpKind::UnicodeLen => IntBound::at_least(0),
            _ => return,
        };
        self.bounds.set(result, bound);
    }

    /// Try to decide a comparison from intervals alone. Returns the folded
    /// boolean if provable.
    pub(crate) fn prove_int_cmp(&self, kind: OpKind, a: Value, b: Value) -> Option<bool> {
        let ba = self.bounds.bound_of(a);
        let bb = self.bounds.bound_of(b);
        match kind {
            OpKind::IntLt => {
                if ba.known_lt(bb) {
                    Some(true)
                } else if ba.known_ge(bb) {
                    Some(false)
                } else {
                    None
                }
            }
            OpKind::IntLe => {
                if ba.known_le(bb) {
                    Some(true)
                } else if ba.known_gt(bb) {
                    Some(false)
                } else {
                    None
                }
            }
            OpKind::IntGt => self.prove_int_cmp(OpKind::IntLt, b, a),
            OpKind::IntGe => self.prove_int_cmp(OpKind::IntLe, b, a),
            OpKind::IntEq => {
                if a.same_value(b) {
                    Some(true)
                } else if ba.known_lt(bb) || ba.known_gt(bb) {
                    Some(false)
                } else {
                    None
                }
            }
            OpKind::IntNe => self.prove_int_cmp(OpKind::IntEq, a, b).map(|r| !r),
            _ => None,
        }
    }

    /// A guard pinned a comparison result; narrow the operand intervals.
    pub(crate) fn propagate_cmp_bounds(
        &mut self,
        kind: OpKind,
        a: Value,
        b: Value,
        outcome: bool,
    ) -> Result<(), InvalidLoop> {
        // reduce to lt/le/eq/ne with a positive outcome
        let (kind, a, b) = match (kind, outcome) {
            (OpKind::IntLt, false) => (OpKind::IntLe, b, a),
            (OpKind::IntLe, false) => (OpKind::IntLt, b, a),
            (OpKind::IntGt, true) => (OpKind::IntLt, b, a),
            (OpKind::IntGt, false) => (OpKind::IntLe, a, b),
            (OpKind::IntGe, true) => (OpKind::IntLe, b, a),
            (OpKind::IntGe, false) => (OpKind::IntLt, a, b),
            (OpKind::IntEq, false) => (OpKind::IntNe, a, b),
            (OpKind::IntNe, false) => (OpKind::IntEq, a, b),
            (k, _) => (k, a, b),
        };
        let ba = self.bounds.bound_of(a);
        let bb = self.bounds.bound_of(b);
        match kind {
            OpKind::IntLt => {
                if let Some(u) = bb.upper {
                    self.bounds.narrow(a, IntBound::at_most(u - 1))?;
                }
                if let Some(l) = ba.lower {
                    self.bounds.narrow(b, IntBound::at_least(l + 1))?;
                }
            }
            OpKind::IntLe => {
                if let Some(u) = bb.upper {
                    self.bounds.narrow(a, IntBound::at_most(u))?;
                }
                if let Some(l) = ba.lower {
                    self.bounds.narrow(b, IntBound::at_least(l))?;
                }
            }
            OpKind::IntEq => {
                self.bounds.narrow(a, bb)?;
                self.bounds.narrow(b, ba)?;
            }
            OpKind::IntNe => {
                // only useful against a constant endpoint
                if let Some(c) = bb.as_const() {
                    if ba.lower == Some(c) {
                        self.bounds.narrow(a, IntBound::at_least(c + 1))?;
                    } else if ba.upper == Some(c) {
                        self.bounds.narrow(a, IntBound::at_most(c - 1))?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub() {
        let a = IntBound::range(0, 10);
        let b = IntBound::range(5, 5);
        assert_eq!(a.add(b), IntBound::range(5, 15));
        assert_eq!(a.sub(b), IntBound::range(-5, 5));
        assert_eq!(a.add(IntBound::at_least(0)), IntBound::at_least(0));
    }

    #[test]
    fn test_add_overflow_widen() {
        let a = IntBound::constant(i64::MAX);
        let widened = a.add(IntBound::constant(1));
        assert_eq!(widened, IntBound::UNBOUNDED);
    }

    #[test]
    fn test_mul_corners() {
        let a = IntBound::range(-2, 3);
        let b = IntBound::range(-5, 4);
        assert_eq!(a.mul(b), IntBound::range(-15, 12));
    }

    #[test]
    fn test_cmp_knowledge() {
        let a = IntBound::range(0, 4);
        let b = IntBound::range(5, 9);
        assert!(a.known_lt(b));
        assert!(a.known_le(b));
        assert!(b.known_gt(a));
        assert!(!b.known_lt(a));
        assert!(IntBound::range(1, 5).known_nonzero());
        assert!(IntBound::range(-3, -1).known_nonzero());
        assert!(!IntBound::range(-1, 1).known_nonzero());
    }

    #[test]
    fn test_intersect_empty() {
        let a = IntBound::range(0, 4);
        assert_eq!(a.intersect(IntBound::range(2, 8)), Some(IntBound::range(2, 4)));
        assert_eq!(a.intersect(IntBound::range(5, 8)), None);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(
            IntBound::range(1, 4).lshift_const(2),
            IntBound::range(4, 16)
        );
        assert_eq!(
            IntBound::range(8, 17).rshift_const(3),
            IntBound::range(1, 2)
        );
        assert_eq!(IntBound::constant(i64::MAX).lshift_const(1), IntBound::UNBOUNDED);
    }
}
