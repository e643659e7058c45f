//! The optimization driver.
//!
//! [`optimize_loop`] walks the recorded operations once, front to back.
//! Each operation first has its arguments replaced by whatever earlier
//! processing proved them equal to, then goes to the handler for its
//! category. Handlers either swallow the operation (recording why its
//! result is already known), rewrite it, or emit it into the output
//! stream. Guards that survive get their resume data encoded at the
//! moment they are emitted, against the value state at that point.
//!
//! A `guard_nonnull` is not emitted immediately: it is held back one
//! operation so that a directly following `guard_class` on the same value
//! merges with it into `guard_nonnull_class`, saving one deoptimization
//! point.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ir::descr::{DescrTable, EffectLevel, OopSpec};
use crate::ir::ops::OpKind;
use crate::ir::trace::{DescrRef, Operation, TraceLoop};
use crate::ir::value::{BoxId, ConstValue, RefConst, Value, ValueKind};
use crate::resume::encode::{ResumeEncoder, ResumeMemo};

use super::heap::HeapState;
use super::intbounds::{BoundsState, IntBound};
use super::rewrite::eval_pure;
use super::virtualize::{EncodeView, VirtualData};
use super::{InvalidLoop, OptOptions, ValueState};

/// CSE key of a pure operation: opcode, descriptor, resolved arguments.
#[derive(PartialEq, Eq, Hash)]
struct PureKey {
    kind: OpKind,
    descr: Option<DescrRef>,
    args: SmallVec<[Value; 3]>,
}

/// State threaded through one optimization run.
pub struct Pipeline<'a> {
    pub(crate) descrs: &'a DescrTable,
    pub(crate) vals: ValueState,
    pub(crate) bounds: BoundsState,
    pub(crate) heap: HeapState,
    pub(crate) memo: ResumeMemo,
    /// The loop being rewritten; its `ops` are drained up front and the
    /// container keeps minting boxes and owning the snapshot store.
    pub(crate) tl: TraceLoop,
    pub(crate) out: Vec<Operation>,
    pure_table: FxHashMap<PureKey, Value>,
    /// A `guard_nonnull` waiting one operation for a `guard_class` to
    /// merge with.
    postponed_nonnull: Option<Operation>,
    /// The previous operation was overflow-checked arithmetic, so an
    /// overflow guard is allowed to follow.
    pub(crate) seen_ovf_op: bool,
}

/// Optimize one recorded loop. On [`InvalidLoop`] the caller keeps
/// running the unoptimized trace; nothing of the partial output survives.
pub fn optimize_loop(
    descrs: &DescrTable,
    options: &OptOptions,
    mut tl: TraceLoop,
) -> Result<TraceLoop, InvalidLoop> {
    let ops = std::mem::take(&mut tl.ops);
    let mut pipeline = Pipeline {
        descrs,
        vals: ValueState::new(),
        bounds: BoundsState::new(),
        heap: HeapState::new(),
        memo: ResumeMemo::new(options.failargs_limit),
        tl,
        out: Vec::with_capacity(ops.len()),
        pure_table: FxHashMap::default(),
        postponed_nonnull: None,
        seen_ovf_op: false,
    };
    for op in ops {
        pipeline.process_op(op)?;
    }
    pipeline.flush_postponed_nonnull()?;
    match pipeline.out.last() {
        Some(op) if op.kind.is_final() => {}
        _ => {
            return Err(InvalidLoop::MalformedTrace(
                "trace does not end in jump or finish",
            ))
        }
    }
    let mut tl = pipeline.tl;
    tl.ops = pipeline.out;
    Ok(tl)
}

impl Pipeline<'_> {
    fn process_op(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        use OpKind::*;
        if !matches!(op.kind, GuardClass) {
            // the merge window is exactly one operation wide
            self.flush_postponed_nonnull()?;
        }
        if !op.kind.is_ovf() && !op.kind.is_overflow_guard() {
            self.bounds.last_ovf_in_range = false;
            self.seen_ovf_op = false;
        }
        if let Some(arity) = op.kind.fixed_arity() {
            if op.args.len() != arity {
                return Err(InvalidLoop::MalformedTrace(
                    "operation has wrong argument count",
                ));
            }
        }
        for i in 0..op.args.len() {
            op.args[i] = self.vals.resolve(op.args[i]);
        }
        match op.kind {
            _ if op.kind.is_guard() => self.handle_guard(op),

            IntAddOvf | IntSubOvf | IntMulOvf => self.opt_ovf(op),
            IntIsTrue | IntIsZero => self.opt_int_is(op),
            IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt | UintLe | UintGt
            | UintGe | FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe | PtrEq
            | PtrNe | InstancePtrEq | InstancePtrNe => self.opt_cmp(op),
            IntAdd | IntSub | IntMul | IntFloorDiv | IntMod | IntAnd | IntOr | IntXor
            | IntLshift | IntRshift | UintRshift | IntNeg | IntInvert | IntForceGeZero
            | IntSignext | FloatAdd | FloatSub | FloatMul | FloatTruediv | FloatNeg
            | FloatAbs | CastFloatToInt | CastIntToFloat => self.opt_pure_arith(op),

            SameAs => {
                let result = self.op_result(&op)?;
                self.vals.make_equal(result, op.arg(0));
                Ok(())
            }

            NewWithVtable | New | NewArray => self.opt_new(op),
            NewStr => self.opt_newstr(op, false),
            NewUnicode => self.opt_newstr(op, true),

            GetfieldGc | GetfieldGcPure => self.opt_getfield(op),
            SetfieldGc => self.opt_setfield(op),
            GetarrayitemGc | GetarrayitemGcPure => self.opt_getarrayitem(op),
            SetarrayitemGc => self.opt_setarrayitem(op),
            ArraylenGc => self.opt_arraylen(op),

            StrLen | UnicodeLen => self.opt_strlen(op),
            StrGetItem | UnicodeGetItem => self.opt_strgetitem(op),
            StrSetItem | UnicodeSetItem => self.opt_strsetitem(op),
            CopyStrContent | CopyUnicodeContent => self.opt_escape(op),

            Call | CallPure => self.opt_call(op),
            CallMayForce => self.opt_call_may_force(op),

            Jump => self.opt_jump(op),
            Finish => self.opt_finish(op),

            _ => unreachable!("opcode not dispatched"),
        }
    }

    // ------------------------------------------------------------------
    // Output helpers used by every pass
    // ------------------------------------------------------------------

    /// The operation's result box; a handler that needs one treats its
    /// absence as a recording bug.
    pub(crate) fn op_result(&self, op: &Operation) -> Result<BoxId, InvalidLoop> {
        op.result
            .ok_or(InvalidLoop::MalformedTrace("operation is missing its result box"))
    }

    /// Append to the output, updating interval knowledge.
    pub(crate) fn push_out(&mut self, op: Operation) {
        self.update_arith_bounds(&op);
        if op.kind.has_bool_result() {
            if let Some(r) = op.result {
                self.bounds.set(r, IntBound::range(0, 1));
            }
        }
        self.out.push(op);
    }

    /// Append to the output; `Result`-shaped for use in handler tails.
    pub(crate) fn emit(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        self.push_out(op);
        Ok(())
    }

    /// Emit unless an identical pure operation already ran; then the old
    /// result is reused and nothing is emitted.
    pub(crate) fn cse_or_emit(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        if op.kind.is_always_pure() {
            let key = PureKey {
                kind: op.kind,
                descr: op.descr,
                args: op.args.clone(),
            };
            let result = self.op_result(&op)?;
            if let Some(&previous) = self.pure_table.get(&key) {
                self.vals.make_equal(result, previous);
                return Ok(());
            }
            self.pure_table.insert(key, Value::Box(result));
        }
        self.push_out(op);
        Ok(())
    }

    /// Emit a pure operation with a fresh result box, folding and CSE
    /// applied; returns the value the result stands for.
    pub(crate) fn emit_pure_fresh(
        &mut self,
        kind: OpKind,
        args: SmallVec<[Value; 3]>,
        result_kind: ValueKind,
    ) -> Result<Value, InvalidLoop> {
        if let Some(folded) = eval_pure(kind, &args) {
            return Ok(Value::Const(folded));
        }
        let result = self.tl.new_box(result_kind);
        self.cse_or_emit(Operation {
            kind,
            args,
            result: Some(result),
            descr: None,
            guard: None,
        })?;
        Ok(self.vals.resolve(Value::Box(result)))
    }

    /// `int_is_true` / `int_is_zero`: simplified like arithmetic, but the
    /// result additionally acts as a comparison against zero for guard
    /// back-propagation.
    fn opt_int_is(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let a = op.arg(0);
        let cmp = if op.kind == OpKind::IntIsTrue {
            OpKind::IntNe
        } else {
            OpKind::IntEq
        };
        self.opt_pure_arith(op)?;
        if !self.vals.resolve(Value::Box(result)).is_const() {
            self.bounds.record_producer(result, cmp, a, Value::int(0));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    fn handle_guard(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        use OpKind::*;
        match op.kind {
            GuardNoOverflow => {
                if !self.seen_ovf_op {
                    return Err(InvalidLoop::MalformedTrace(
                        "overflow guard without overflow operation",
                    ));
                }
                self.seen_ovf_op = false;
                if self.bounds.last_ovf_in_range {
                    self.bounds.last_ovf_in_range = false;
                    return Ok(());
                }
                self.finalize_guard(op)
            }
            GuardOverflow => {
                if !self.seen_ovf_op {
                    return Err(InvalidLoop::MalformedTrace(
                        "overflow guard without overflow operation",
                    ));
                }
                self.seen_ovf_op = false;
                if self.bounds.last_ovf_in_range {
                    return Err(InvalidLoop::UnsatisfiableGuard(
                        "overflow cannot happen here",
                    ));
                }
                self.finalize_guard(op)
            }
            GuardTrue | GuardFalse => self.handle_bool_guard(op),
            GuardValue => self.handle_guard_value(op),
            GuardNonnull => {
                let v = op.arg(0);
                if self.vals.known_nonnull(v) {
                    return Ok(());
                }
                if v.is_null_const() {
                    return Err(InvalidLoop::UnsatisfiableGuard("value is null"));
                }
                self.postponed_nonnull = Some(op);
                Ok(())
            }
            GuardIsnull => {
                let v = op.arg(0);
                if v.is_null_const() {
                    return Ok(());
                }
                if self.vals.known_nonnull(v) {
                    return Err(InvalidLoop::UnsatisfiableGuard("value is not null"));
                }
                self.finalize_guard(op)?;
                if let Value::Box(b) = v {
                    self.vals.make_equal(b, Value::NULL);
                }
                Ok(())
            }
            GuardClass => self.handle_guard_class(op),
            GuardNonnullClass => {
                let v = op.arg(0);
                let expected = self.expected_class(&op)?;
                if v.is_null_const() {
                    return Err(InvalidLoop::UnsatisfiableGuard("value is null"));
                }
                match self.class_of(v) {
                    Some(actual) if actual == expected => return Ok(()),
                    Some(_) => {
                        return Err(InvalidLoop::UnsatisfiableGuard("class mismatch"))
                    }
                    None => {}
                }
                self.finalize_guard(op)?;
                if let Value::Box(b) = v {
                    self.vals.mark_class(b, expected);
                }
                Ok(())
            }
            GuardNotForced | GuardNotInvalidated | GuardNoException => self.finalize_guard(op),
            _ => unreachable!("not a guard"),
        }
    }

    fn handle_bool_guard(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let expect = op.kind == OpKind::GuardTrue;
        let cond = op.arg(0);
        if let Some(c) = cond.as_const_int() {
            return if (c != 0) == expect {
                Ok(())
            } else {
                Err(InvalidLoop::UnsatisfiableGuard("constant condition"))
            };
        }
        let cond_box = match cond {
            Value::Box(b) => b,
            Value::Const(_) => {
                return Err(InvalidLoop::MalformedTrace("non-integer guard condition"))
            }
        };
        let producer = self.bounds.producer(cond_box);
        if let Some((kind, a, b)) = producer {
            if let Some(outcome) = self.prove_int_cmp(kind, a, b) {
                return if outcome == expect {
                    Ok(())
                } else {
                    Err(InvalidLoop::UnsatisfiableGuard("condition already decided"))
                };
            }
        }
        self.finalize_guard(op)?;
        self.vals.make_equal(cond_box, Value::int(expect as i64));
        if let Some((kind, a, b)) = producer {
            self.propagate_cmp_bounds(kind, a, b, expect)?;
        }
        Ok(())
    }

    fn handle_guard_value(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let expected = match op.arg(1) {
            Value::Const(c) => c,
            Value::Box(_) => {
                return Err(InvalidLoop::MalformedTrace("guard_value expects a constant"))
            }
        };
        // a guard_value on a comparison result is really a bool guard;
        // the bool path back-propagates bounds through the producer
        if let (Value::Box(b), Some(e)) = (op.arg(0), expected.as_int()) {
            if (e == 0 || e == 1) && self.bounds.producer(b).is_some() {
                op.kind = if e == 1 {
                    OpKind::GuardTrue
                } else {
                    OpKind::GuardFalse
                };
                op.args.truncate(1);
                return self.handle_bool_guard(op);
            }
        }
        match op.arg(0) {
            Value::Const(c) => {
                if Value::Const(c).same_value(Value::Const(expected)) {
                    Ok(())
                } else {
                    Err(InvalidLoop::UnsatisfiableGuard("constant value differs"))
                }
            }
            Value::Box(b) => {
                if self.vals.is_virtual(b) {
                    // a virtual has no address; it cannot be any known constant
                    return Err(InvalidLoop::UnsatisfiableGuard(
                        "virtual compared against a constant",
                    ));
                }
                if let Some(i) = expected.as_int() {
                    if self
                        .bounds
                        .bound_of(Value::Box(b))
                        .intersect(IntBound::constant(i))
                        .is_none()
                    {
                        return Err(InvalidLoop::UnsatisfiableGuard("value out of range"));
                    }
                }
                self.finalize_guard(op)?;
                self.vals.make_equal(b, Value::Const(expected));
                Ok(())
            }
        }
    }

    fn handle_guard_class(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let v = op.arg(0);
        let expected = self.expected_class(&op)?;
        match self.class_of(v) {
            Some(actual) if actual == expected => {
                // known class implies nonnull, so no guard on this value
                // can be sitting postponed; flush whatever else is
                self.flush_postponed_nonnull()?;
                return Ok(());
            }
            Some(_) => return Err(InvalidLoop::UnsatisfiableGuard("class mismatch")),
            None => {}
        }
        if let Value::Box(b) = v {
            if self.vals.is_virtual(b) {
                // virtuals without a vtable never satisfy a class test
                return Err(InvalidLoop::UnsatisfiableGuard("class of a virtual"));
            }
        }
        match self.postponed_nonnull.take() {
            Some(mut pg) if pg.arg(0).same_value(v) => {
                // merge: deoptimize at the earlier guard's state
                op.kind = OpKind::GuardNonnullClass;
                op.guard = pg.guard.take();
            }
            Some(pg) => {
                self.finalize_nonnull(pg)?;
            }
            None => {}
        }
        self.finalize_guard(op)?;
        if let Value::Box(b) = v {
            self.vals.mark_class(b, expected);
        }
        Ok(())
    }

    fn expected_class(&self, op: &Operation) -> Result<RefConst, InvalidLoop> {
        match op.arg(1) {
            Value::Const(ConstValue::Ref(r)) => Ok(r),
            _ => Err(InvalidLoop::MalformedTrace(
                "class guard expects a class constant",
            )),
        }
    }

    /// Known class of a value: from guards on real pointers, from the type
    /// descriptor for virtuals.
    fn class_of(&self, v: Value) -> Option<RefConst> {
        let b = match v {
            Value::Box(b) => b,
            Value::Const(_) => return None,
        };
        if let Some(state) = self.vals.virtuals.get(&b) {
            return match &state.data {
                VirtualData::Struct {
                    ty,
                    has_vtable: true,
                    ..
                } => self.descrs.types[*ty].vtable,
                _ => None,
            };
        }
        self.vals.ptr_facts(b).known_class
    }

    pub(crate) fn flush_postponed_nonnull(&mut self) -> Result<(), InvalidLoop> {
        match self.postponed_nonnull.take() {
            Some(op) => self.finalize_nonnull(op),
            None => Ok(()),
        }
    }

    fn finalize_nonnull(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let v = op.arg(0);
        self.finalize_guard(op)?;
        if let Value::Box(b) = v {
            self.vals.mark_nonnull(b);
        }
        Ok(())
    }

    /// Emit a surviving guard: encode its resume data against the current
    /// value state and attach the fail-args.
    fn finalize_guard(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let pending = self.heap_stores_for_guard()?;
        let guard = match op.guard.as_mut() {
            Some(g) => g,
            None => {
                return Err(InvalidLoop::MalformedTrace("guard without captured state"))
            }
        };
        let mut view = EncodeView {
            vals: &mut self.vals,
            descrs: self.descrs,
        };
        let encoded = ResumeEncoder::new(&mut self.memo, &mut view).finish(
            &self.tl.store,
            guard.snapshot,
            guard.frame_info,
            &pending,
        )?;
        guard.fail_args = encoded.fail_args;
        guard.resume = Some(encoded.resume);
        self.push_out(op);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls and trace ends
    // ------------------------------------------------------------------

    fn opt_call(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        let call = match op.descr.and_then(DescrRef::as_call) {
            Some(c) => c,
            None => return Err(InvalidLoop::MalformedTrace("call without descriptor")),
        };
        let spec = self.descrs.calls[call].effect.oopspec;
        if spec != OopSpec::None {
            return self.opt_str_call(op, spec);
        }
        let level = self.descrs.calls[call].effect.level;
        self.force_op_args(&mut op)?;
        if level == EffectLevel::Elidable {
            // elidable calls memoize like pure operations; one whose
            // result is unused has no observable effect at all
            if op.result.is_none() {
                return Ok(());
            }
            let key = PureKey {
                kind: op.kind,
                descr: op.descr,
                args: op.args.clone(),
            };
            let result = self.op_result(&op)?;
            if let Some(&previous) = self.pure_table.get(&key) {
                self.vals.make_equal(result, previous);
                return Ok(());
            }
            self.pure_table.insert(key, Value::Box(result));
            self.push_out(op);
            return Ok(());
        }
        self.heap_effects_of_call(call)?;
        self.push_out(op);
        Ok(())
    }

    fn opt_jump(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        if op.args.len() != self.tl.input_args.len() {
            return Err(InvalidLoop::MalformedTrace(
                "back-edge argument count mismatch",
            ));
        }
        // values carried over the back edge must be real
        self.force_op_args(&mut op)?;
        self.heap_flush_deferred()?;
        self.push_out(op);
        Ok(())
    }

    fn opt_finish(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        self.force_op_args(&mut op)?;
        self.heap_flush_deferred()?;
        self.push_out(op);
        Ok(())
    }
}
