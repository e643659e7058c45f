//! Constant folding, algebraic simplification and CSE of pure operations.
//!
//! Folding uses the run-time executor's arithmetic: word-sized two's
//! complement with wraparound for the plain variants, Python-style floor
//! division and remainder. Operations that survive folding go through the
//! pure-operation table so a repeated computation reuses the earlier
//! result box.

use crate::ir::ops::OpKind;
use crate::ir::trace::Operation;
use crate::ir::value::{ConstValue, Value};

use super::pipeline::Pipeline;
use super::InvalidLoop;

/// Floor division, truncating toward negative infinity. `b` must be
/// nonzero.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

/// Remainder with the sign of the divisor. `b` must be nonzero.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        r + b
    } else {
        r
    }
}

/// Fold a pure integer/float operation over constant arguments. `None`
/// when the operation cannot be folded (division by zero, out-of-range
/// shift, overflow of a checked variant).
pub(crate) fn eval_pure(kind: OpKind, args: &[Value]) -> Option<ConstValue> {
    use OpKind::*;
    let int = |i: usize| args[i].as_const_int();
    let float = |i: usize| match args[i] {
        Value::Const(c) => c.as_float(),
        _ => None,
    };
    let ok_int = |v: i64| Some(ConstValue::Int(v));
    let ok_bool = |v: bool| Some(ConstValue::Int(v as i64));
    let ok_float = |v: f64| Some(ConstValue::float(v));
    match kind {
        IntAdd => ok_int(int(0)?.wrapping_add(int(1)?)),
        IntSub => ok_int(int(0)?.wrapping_sub(int(1)?)),
        IntMul => ok_int(int(0)?.wrapping_mul(int(1)?)),
        IntFloorDiv => {
            let b = int(1)?;
            if b == 0 {
                return None;
            }
            ok_int(floor_div(int(0)?, b))
        }
        IntMod => {
            let b = int(1)?;
            if b == 0 {
                return None;
            }
            ok_int(floor_mod(int(0)?, b))
        }
        IntAnd => ok_int(int(0)? & int(1)?),
        IntOr => ok_int(int(0)? | int(1)?),
        IntXor => ok_int(int(0)? ^ int(1)?),
        IntLshift => {
            let s = int(1)?;
            if !(0..64).contains(&s) {
                return None;
            }
            ok_int(int(0)?.wrapping_shl(s as u32))
        }
        IntRshift => {
            let s = int(1)?;
            if !(0..64).contains(&s) {
                return None;
            }
            ok_int(int(0)? >> s)
        }
        UintRshift => {
            let s = int(1)?;
            if !(0..64).contains(&s) {
                return None;
            }
            ok_int(((int(0)? as u64) >> s) as i64)
        }
        IntNeg => ok_int(int(0)?.wrapping_neg()),
        IntInvert => ok_int(!int(0)?),
        IntForceGeZero => ok_int(int(0)?.max(0)),
        IntSignext => {
            let bytes = int(1)?;
            match bytes {
                1 => ok_int(int(0)? as i8 as i64),
                2 => ok_int(int(0)? as i16 as i64),
                4 => ok_int(int(0)? as i32 as i64),
                _ => None,
            }
        }
        IntAddOvf => ok_int(int(0)?.checked_add(int(1)?)?),
        IntSubOvf => ok_int(int(0)?.checked_sub(int(1)?)?),
        IntMulOvf => ok_int(int(0)?.checked_mul(int(1)?)?),
        IntLt => ok_bool(int(0)? < int(1)?),
        IntLe => ok_bool(int(0)? <= int(1)?),
        IntEq => ok_bool(int(0)? == int(1)?),
        IntNe => ok_bool(int(0)? != int(1)?),
        IntGt => ok_bool(int(0)? > int(1)?),
        IntGe => ok_bool(int(0)? >= int(1)?),
        UintLt => ok_bool((int(0)? as u64) < int(1)? as u64),
        UintLe => ok_bool(int(0)? as u64 <= int(1)? as u64),
        UintGt => ok_bool(int(0)? as u64 > int(1)? as u64),
        UintGe => ok_bool(int(0)? as u64 >= int(1)? as u64),
        IntIsZero => ok_bool(int(0)? == 0),
        IntIsTrue => ok_bool(int(0)? != 0),
        FloatAdd => ok_float(float(0)? + float(1)?),
        FloatSub => ok_float(float(0)? - float(1)?),
        FloatMul => ok_float(float(0)? * float(1)?),
        FloatTruediv => ok_float(float(0)? / float(1)?),
        FloatNeg => ok_float(-float(0)?),
        FloatAbs => ok_float(float(0)?.abs()),
        FloatLt => ok_bool(float(0)? < float(1)?),
        FloatLe => ok_bool(float(0)? <= float(1)?),
        FloatEq => ok_bool(float(0)? == float(1)?),
        FloatNe => ok_bool(float(0)? != float(1)?),
        FloatGt => ok_bool(float(0)? > float(1)?),
        FloatGe => ok_bool(float(0)? >= float(1)?),
        CastFloatToInt => ok_int(float(0)? as i64),
        CastIntToFloat => ok_float(int(0)? as f64),
        _ => None,
    }
}

impl Pipeline<'_> {
    /// Pure arithmetic and casts: fold, simplify, CSE, emit.
    pub(crate) fn opt_pure_arith(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        if let Some(folded) = eval_pure(op.kind, &op.args) {
            self.vals.make_equal(result, Value::Const(folded));
            return Ok(());
        }
        if let Some(simplified) = self.simplify(&op) {
            self.vals.make_equal(result, simplified);
            return Ok(());
        }
        let mut op = self.normalize_commutative(op);
        if op.kind == OpKind::IntMul && op.arg(1).as_const_int() == Some(-1) {
            op.kind = OpKind::IntNeg;
            op.args.truncate(1);
        }
        self.cse_or_emit(op)
    }

    /// Algebraic identities that replace the result without emitting.
    fn simplify(&mut self, op: &Operation) -> Option<Value> {
        use OpKind::*;
        let a = op.arg(0);
        let b = || op.arg(1);
        let is_zero = |v: Value| v.as_const_int() == Some(0);
        let is_one = |v: Value| v.as_const_int() == Some(1);
        match op.kind {
            IntAdd => {
                if is_zero(a) {
                    Some(b())
                } else if is_zero(b()) {
                    Some(a)
                } else {
                    None
                }
            }
            IntSub => {
                if is_zero(b()) {
                    Some(a)
                } else if a.same_value(b()) {
                    Some(Value::int(0))
                } else {
                    None
                }
            }
            IntMul => {
                if is_one(a) {
                    Some(b())
                } else if is_one(b()) {
                    Some(a)
                } else if is_zero(a) || is_zero(b()) {
                    Some(Value::int(0))
                } else {
                    None
                }
            }
            IntAnd => {
                if is_zero(a) || is_zero(b()) {
                    Some(Value::int(0))
                } else if a.same_value(b()) {
                    Some(a)
                } else {
                    None
                }
            }
            IntOr => {
                if is_zero(a) {
                    Some(b())
                } else if is_zero(b()) {
                    Some(a)
                } else if a.same_value(b()) {
                    Some(a)
                } else {
                    None
                }
            }
            IntXor => {
                if is_zero(a) {
                    Some(b())
                } else if is_zero(b()) {
                    Some(a)
                } else if a.same_value(b()) {
                    Some(Value::int(0))
                } else {
                    None
                }
            }
            IntLshift | IntRshift | UintRshift => {
                if is_zero(b()) {
                    Some(a)
                } else {
                    None
                }
            }
            IntFloorDiv => {
                if is_one(b()) {
                    Some(a)
                } else {
                    None
                }
            }
            IntForceGeZero => {
                if self.bounds.bound_of(a).known_nonnegative() {
                    Some(a)
                } else {
                    None
                }
            }
            IntIsTrue => {
                if self.bounds.bound_of(a).known_nonzero() {
                    Some(Value::int(1))
                } else {
                    None
                }
            }
            IntIsZero => {
                if self.bounds.bound_of(a).known_nonzero() {
                    Some(Value::int(0))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Put constants second for commutative operations so the CSE key is
    /// canonical.
    fn normalize_commutative(&self, mut op: Operation) -> Operation {
        use OpKind::*;
        let commutative = matches!(
            op.kind,
            IntAdd | IntMul | IntAnd | IntOr | IntXor | FloatAdd | FloatMul | IntEq | IntNe
                | PtrEq | PtrNe | InstancePtrEq | InstancePtrNe
        );
        if commutative && op.arg(0).is_const() && !op.arg(1).is_const() {
            op.args.swap(0, 1);
        }
        op
    }

    /// Integer and pointer comparisons.
    pub(crate) fn opt_cmp(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        use OpKind::*;
        let result = self.op_result(&op)?;
        let a = op.arg(0);
        let b = op.arg(1);
        if let Some(folded) = eval_pure(op.kind, &op.args) {
            self.vals.make_equal(result, Value::Const(folded));
            return Ok(());
        }
        match op.kind {
            IntLt | IntLe | IntEq | IntNe | IntGt | IntGe => {
                if let Some(outcome) = self.prove_int_cmp(op.kind, a, b) {
                    self.vals.make_equal(result, Value::int(outcome as i64));
                    return Ok(());
                }
                self.bounds.record_producer(result, op.kind, a, b);
            }
            UintLt | UintGt => {
                if a.same_value(b) {
                    self.vals.make_equal(result, Value::int(0));
                    return Ok(());
                }
            }
            UintLe | UintGe => {
                if a.same_value(b) {
                    self.vals.make_equal(result, Value::int(1));
                    return Ok(());
                }
            }
            PtrEq | PtrNe | InstancePtrEq | InstancePtrNe => {
                let eq = matches!(op.kind, PtrEq | InstancePtrEq);
                if let Some(outcome) = self.prove_ptr_eq(a, b) {
                    self.vals
                        .make_equal(result, Value::int((outcome == eq) as i64));
                    return Ok(());
                }
                // comparing a virtual forces it
                return self.force_args_then_cse(op);
            }
            _ => {}
        }
        let op = self.normalize_commutative(op);
        self.cse_or_emit(op)
    }

    /// Decide pointer identity without forcing, when possible.
    fn prove_ptr_eq(&mut self, a: Value, b: Value) -> Option<bool> {
        if a.same_value(b) {
            return Some(true);
        }
        let a_virtual = matches!(a, Value::Box(p) if self.vals.is_virtual(p));
        let b_virtual = matches!(b, Value::Box(p) if self.vals.is_virtual(p));
        // a virtual has no address yet; it cannot equal any other value
        if a_virtual || b_virtual {
            return Some(false);
        }
        if (a.is_null_const() && self.vals.known_nonnull(b))
            || (b.is_null_const() && self.vals.known_nonnull(a))
        {
            return Some(false);
        }
        None
    }

    fn force_args_then_cse(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        for i in 0..op.args.len() {
            let forced = self.force_value(op.args[i])?;
            op.args[i] = forced;
        }
        self.cse_or_emit(op)
    }

    /// Overflow-checked arithmetic. When the operand intervals prove the
    /// result in range, the plain variant is emitted and the following
    /// overflow guard becomes redundant.
    pub(crate) fn opt_ovf(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        self.seen_ovf_op = true;
        if let Some(folded) = eval_pure(op.kind, &op.args) {
            self.vals.make_equal(result, Value::Const(folded));
            self.bounds.last_ovf_in_range = true;
            return Ok(());
        }
        let a = self.bounds.bound_of(op.arg(0));
        let b = self.bounds.bound_of(op.arg(1));
        let (plain, computed) = match op.kind {
            OpKind::IntAddOvf => (OpKind::IntAdd, a.add(b)),
            OpKind::IntSubOvf => (OpKind::IntSub, a.sub(b)),
            OpKind::IntMulOvf => (OpKind::IntMul, a.mul(b)),
            _ => unreachable!("not an overflow-checked operation"),
        };
        let in_range = computed.lower.is_some() && computed.upper.is_some();
        if in_range {
            op.kind = plain;
        }
        self.bounds.last_ovf_in_range = in_range;
        self.cse_or_emit(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_semantics() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
        assert_eq!(floor_mod(-7, 2), 1);
        assert_eq!(floor_mod(7, -2), -1);
    }

    #[test]
    fn test_eval_wraps() {
        assert_eq!(
            eval_pure(OpKind::IntAdd, &[Value::int(i64::MAX), Value::int(1)]),
            Some(ConstValue::Int(i64::MIN))
        );
        // checked variant refuses instead
        assert_eq!(
            eval_pure(OpKind::IntAddOvf, &[Value::int(i64::MAX), Value::int(1)]),
            None
        );
    }

    #[test]
    fn test_eval_guards_div_zero() {
        assert_eq!(
            eval_pure(OpKind::IntFloorDiv, &[Value::int(1), Value::int(0)]),
            None
        );
        assert_eq!(
            eval_pure(OpKind::IntMod, &[Value::int(1), Value::int(0)]),
            None
        );
    }

    #[test]
    fn test_eval_cmp() {
        assert_eq!(
            eval_pure(OpKind::IntLt, &[Value::int(-1), Value::int(0)]),
            Some(ConstValue::Int(1))
        );
        assert_eq!(
            eval_pure(OpKind::UintLt, &[Value::int(-1), Value::int(0)]),
            Some(ConstValue::Int(0))
        );
    }
}
