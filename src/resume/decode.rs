//! Resume-data decoding.
//!
//! [`ResumeReader`] owns the tagged-slot walk shared by both decoder
//! variants; what "a decoded value" means is behind the [`ResumeTarget`]
//! trait:
//! - [`BoxRebuilder`] produces fresh trace boxes plus a replayable list of
//!   [`RebuildStep`]s, for resuming the tracer after a guard failure;
//! - [`DirectRebuilder`] produces machine-level values and pushes them
//!   straight into a [`LowLevelVm`], for blackhole re-interpretation.
//!
//! Virtuals are materialized at most once per decode via `virtuals_cache`,
//! and a struct or array registers its cache entry before decoding its own
//! contents, which is what lets cyclic virtual graphs terminate. Index
//! errors in this module are unrecoverable: encoder and decoder walk
//! matching structures, so a bad index means the resume data itself is
//! corrupt and the process must not continue.

use std::rc::Rc;

use crate::ir::descr::{ArrayDescrId, FieldDescrId, TypeDescrId};
use crate::ir::snapshot::{CodeId, SnapshotStore};
use crate::ir::value::{BoxId, ConstValue, RefConst, Value, ValueKind};

use super::numbering::{Numbering, PendingKind, ResumeData, VirtualInfo};
use super::tagged::{Tag, TaggedSlot};

/// Consumer of decoded values; implemented once per decoder variant.
pub trait ResumeTarget {
    /// A decoded value in the target's representation.
    type Val: Clone;

    /// Value of the failing guard's fail-arg `index`.
    fn raw_value(&mut self, index: usize) -> Self::Val;
    /// A table constant.
    fn const_value(&mut self, c: ConstValue) -> Self::Val;
    /// An inline small integer.
    fn int_value(&mut self, v: i64) -> Self::Val;

    fn allocate_with_vtable(&mut self, ty: TypeDescrId) -> Self::Val;
    fn allocate_struct(&mut self, ty: TypeDescrId) -> Self::Val;
    fn allocate_array(&mut self, descr: ArrayDescrId, length: usize) -> Self::Val;
    fn allocate_string(&mut self, length: usize, unicode: bool) -> Self::Val;
    fn setfield(&mut self, obj: Self::Val, field: FieldDescrId, value: Self::Val);
    fn setarrayitem(&mut self, arr: Self::Val, descr: ArrayDescrId, index: usize, value: Self::Val);
    fn string_setitem(&mut self, s: Self::Val, index: usize, ch: Self::Val);
    fn concat_strings(&mut self, left: Self::Val, right: Self::Val, unicode: bool) -> Self::Val;
    fn slice_string(
        &mut self,
        source: Self::Val,
        start: Self::Val,
        length: Self::Val,
        unicode: bool,
    ) -> Self::Val;

    /// Open the next frame, outermost first.
    fn enter_frame(&mut self, code: CodeId, pc: u32);
    /// Write local `slot` of the frame most recently entered.
    fn write_local(&mut self, slot: usize, value: Self::Val);
}

/// The shared tagged-slot walker.
pub struct ResumeReader<'a, T: ResumeTarget> {
    data: &'a ResumeData,
    target: &'a mut T,
    /// Decoded fail-arg values; a box index decoded twice yields the same
    /// value both times.
    boxes: Vec<Option<T::Val>>,
    virtuals_cache: Vec<Option<T::Val>>,
}

impl<'a, T: ResumeTarget> ResumeReader<'a, T> {
    pub fn new(data: &'a ResumeData, target: &'a mut T) -> Self {
        ResumeReader {
            boxes: vec![None; data.num_boxes],
            virtuals_cache: vec![None; data.virtuals.len()],
            data,
            target,
        }
    }

    /// Re-entry mode: virtuals already materialized by an earlier partial
    /// decode. Seeded entries are handed out as-is; their `VirtualInfo`
    /// is never consulted again.
    pub fn seed_virtuals(&mut self, materialized: Vec<Option<T::Val>>) {
        assert_eq!(materialized.len(), self.virtuals_cache.len());
        self.virtuals_cache = materialized;
    }

    /// Decode one tagged slot.
    pub fn decode(&mut self, slot: TaggedSlot) -> T::Val {
        let (payload, tag) = slot.untag();
        match tag {
            Tag::SmallInt => self.target.int_value(payload as i64),
            Tag::Const => {
                if slot == TaggedSlot::NULLREF {
                    self.target.const_value(ConstValue::NULL)
                } else {
                    let c = self.data.consts.get(payload as usize);
                    self.target.const_value(c)
                }
            }
            Tag::Box => {
                let index = self.wrap_index(payload, self.data.num_boxes, "fail-args");
                if let Some(v) = &self.boxes[index] {
                    return v.clone();
                }
                let v = self.target.raw_value(index);
                self.boxes[index] = Some(v.clone());
                v
            }
            Tag::Virtual => {
                let index = self.wrap_index(payload, self.data.virtuals.len(), "virtuals");
                if let Some(v) = &self.virtuals_cache[index] {
                    return v.clone();
                }
                self.materialize_virtual(index)
            }
        }
    }

    fn wrap_index(&self, payload: i32, len: usize, table: &str) -> usize {
        let index = if payload < 0 {
            payload + len as i32
        } else {
            payload
        };
        assert!(
            index >= 0 && (index as usize) < len,
            "resume slot index {} outside {} table of length {}",
            payload,
            table,
            len
        );
        index as usize
    }

    fn materialize_virtual(&mut self, index: usize) -> T::Val {
        let info = match &self.data.virtuals[index] {
            Some(info) => Rc::clone(info),
            None => panic!("virtuals table slot {} empty at decode", index),
        };
        match &*info {
            VirtualInfo::Object { ty, fields, nums } => {
                let obj = self.target.allocate_with_vtable(*ty);
                // cache before contents, so cycles through this object
                // resolve to it instead of recursing forever
                self.virtuals_cache[index] = Some(obj.clone());
                for (&field, &num) in fields.iter().zip(nums.iter()) {
                    let v = self.decode(num);
                    self.target.setfield(obj.clone(), field, v);
                }
                obj
            }
            VirtualInfo::Struct { ty, fields, nums } => {
                let obj = self.target.allocate_struct(*ty);
                self.virtuals_cache[index] = Some(obj.clone());
                for (&field, &num) in fields.iter().zip(nums.iter()) {
                    let v = self.decode(num);
                    self.target.setfield(obj.clone(), field, v);
                }
                obj
            }
            VirtualInfo::Array { descr, nums } => {
                let arr = self.target.allocate_array(*descr, nums.len());
                self.virtuals_cache[index] = Some(arr.clone());
                for (i, &num) in nums.iter().enumerate() {
                    let v = self.decode(num);
                    self.target.setarrayitem(arr.clone(), *descr, i, v);
                }
                arr
            }
            VirtualInfo::StrPlain { unicode, nums } => {
                let s = self.target.allocate_string(nums.len(), *unicode);
                self.virtuals_cache[index] = Some(s.clone());
                for (i, &num) in nums.iter().enumerate() {
                    let ch = self.decode(num);
                    self.target.string_setitem(s.clone(), i, ch);
                }
                s
            }
            VirtualInfo::StrConcat { unicode, nums } => {
                // strings cannot be cyclic; parts first, then the result
                let left = self.decode(nums[0]);
                let right = self.decode(nums[1]);
                let s = self.target.concat_strings(left, right, *unicode);
                self.virtuals_cache[index] = Some(s.clone());
                s
            }
            VirtualInfo::StrSlice { unicode, nums } => {
                let source = self.decode(nums[0]);
                let start = self.decode(nums[1]);
                let length = self.decode(nums[2]);
                let s = self.target.slice_string(source, start, length, *unicode);
                self.virtuals_cache[index] = Some(s.clone());
                s
            }
        }
    }

    /// Materialize every virtual of this guard without rebuilding frames.
    /// Used when a `guard_not_forced` failure needs the objects early; a
    /// later full decode is seeded with the result via [`seed_virtuals`].
    ///
    /// [`seed_virtuals`]: ResumeReader::seed_virtuals
    pub fn force_all_virtuals(&mut self) -> Vec<Option<T::Val>> {
        for index in 0..self.data.virtuals.len() {
            if self.data.virtuals[index].is_some() && self.virtuals_cache[index].is_none() {
                self.materialize_virtual(index);
            }
        }
        self.virtuals_cache.clone()
    }

    /// Rebuild every frame, outermost first, then replay pending stores.
    pub fn rebuild_frames(&mut self, store: &SnapshotStore) {
        let mut numbs: Vec<Rc<Numbering>> = Vec::new();
        let mut numb = Rc::clone(&self.data.numbering);
        loop {
            numbs.push(Rc::clone(&numb));
            match &numb.prev {
                Some(prev) => {
                    let prev = Rc::clone(prev);
                    numb = prev;
                }
                None => break,
            }
        }
        let mut positions = Vec::new();
        let mut fi = Some(self.data.frame_info);
        while let Some(id) = fi {
            let info = &store.frame_infos[id];
            positions.push((info.code, info.pc));
            fi = info.prev;
        }
        assert_eq!(
            numbs.len(),
            positions.len(),
            "frame-position chain does not match encoded frames"
        );
        for (numb, (code, pc)) in numbs.iter().rev().zip(positions.iter().rev()) {
            self.target.enter_frame(*code, *pc);
            for (slot, &num) in numb.nums.iter().enumerate() {
                let v = self.decode(num);
                self.target.write_local(slot, v);
            }
        }
        self.replay_pending();
    }

    fn replay_pending(&mut self) {
        for i in 0..self.data.pending.len() {
            let p = self.data.pending[i];
            let target_obj = self.decode(p.target);
            let value = self.decode(p.value);
            match p.kind {
                PendingKind::Field(f) => self.target.setfield(target_obj, f, value),
                PendingKind::ArrayItem(d, index) => {
                    self.target.setarrayitem(target_obj, d, index, value)
                }
            }
        }
    }
}

// ======================================================================
// Box-reconstructing variant
// ======================================================================

/// One reconstruction action recorded by [`BoxRebuilder`]; the tracer
/// replays these to rebind its state to fresh boxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildStep {
    /// Bind a fresh box to the failing guard's fail-arg `index`.
    FromFailArg { index: usize, result: BoxId },
    AllocateWithVtable { result: BoxId, ty: TypeDescrId },
    AllocateStruct { result: BoxId, ty: TypeDescrId },
    AllocateArray {
        result: BoxId,
        descr: ArrayDescrId,
        length: usize,
    },
    AllocateString {
        result: BoxId,
        length: usize,
        unicode: bool,
    },
    SetField {
        target: Value,
        field: FieldDescrId,
        value: Value,
    },
    SetArrayItem {
        target: Value,
        descr: ArrayDescrId,
        index: usize,
        value: Value,
    },
    StringSetItem {
        target: Value,
        index: usize,
        value: Value,
    },
    ConcatStrings {
        result: BoxId,
        left: Value,
        right: Value,
        unicode: bool,
    },
    SliceString {
        result: BoxId,
        source: Value,
        start: Value,
        length: Value,
        unicode: bool,
    },
}

/// A reconstructed interpreter frame in box form.
#[derive(Debug)]
pub struct RebuiltFrame {
    pub code: CodeId,
    pub pc: u32,
    pub locals: Vec<Value>,
}

/// Decoder target that produces fresh trace boxes, for resuming tracing.
pub struct BoxRebuilder<'a> {
    fail_args: &'a [Option<BoxId>],
    next_box: u32,
    pub steps: Vec<RebuildStep>,
    pub frames: Vec<RebuiltFrame>,
}

impl<'a> BoxRebuilder<'a> {
    /// `first_fresh_box` must be past every box index the trace has used.
    pub fn new(fail_args: &'a [Option<BoxId>], first_fresh_box: u32) -> Self {
        BoxRebuilder {
            fail_args,
            next_box: first_fresh_box,
            steps: Vec::new(),
            frames: Vec::new(),
        }
    }

    fn fresh(&mut self, kind: ValueKind) -> BoxId {
        let b = BoxId::new(self.next_box, kind);
        self.next_box += 1;
        b
    }
}

impl ResumeTarget for BoxRebuilder<'_> {
    type Val = Value;

    fn raw_value(&mut self, index: usize) -> Value {
        let kind = match self.fail_args[index] {
            Some(b) => b.kind(),
            None => panic!("fail-args hole {} referenced at decode", index),
        };
        let result = self.fresh(kind);
        self.steps.push(RebuildStep::FromFailArg { index, result });
        Value::Box(result)
    }

    fn const_value(&mut self, c: ConstValue) -> Value {
        Value::Const(c)
    }

    fn int_value(&mut self, v: i64) -> Value {
        Value::int(v)
    }

    fn allocate_with_vtable(&mut self, ty: TypeDescrId) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::AllocateWithVtable { result, ty });
        Value::Box(result)
    }

    fn allocate_struct(&mut self, ty: TypeDescrId) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::AllocateStruct { result, ty });
        Value::Box(result)
    }

    fn allocate_array(&mut self, descr: ArrayDescrId, length: usize) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::AllocateArray {
            result,
            descr,
            length,
        });
        Value::Box(result)
    }

    fn allocate_string(&mut self, length: usize, unicode: bool) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::AllocateString {
            result,
            length,
            unicode,
        });
        Value::Box(result)
    }

    fn setfield(&mut self, obj: Value, field: FieldDescrId, value: Value) {
        self.steps.push(RebuildStep::SetField {
            target: obj,
            field,
            value,
        });
    }

    fn setarrayitem(&mut self, arr: Value, descr: ArrayDescrId, index: usize, value: Value) {
        self.steps.push(RebuildStep::SetArrayItem {
            target: arr,
            descr,
            index,
            value,
        });
    }

    fn string_setitem(&mut self, s: Value, index: usize, ch: Value) {
        self.steps.push(RebuildStep::StringSetItem {
            target: s,
            index,
            value: ch,
        });
    }

    fn concat_strings(&mut self, left: Value, right: Value, unicode: bool) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::ConcatStrings {
            result,
            left,
            right,
            unicode,
        });
        Value::Box(result)
    }

    fn slice_string(&mut self, source: Value, start: Value, length: Value, unicode: bool) -> Value {
        let result = self.fresh(ValueKind::Ref);
        self.steps.push(RebuildStep::SliceString {
            result,
            source,
            start,
            length,
            unicode,
        });
        Value::Box(result)
    }

    fn enter_frame(&mut self, code: CodeId, pc: u32) {
        self.frames.push(RebuiltFrame {
            code,
            pc,
            locals: Vec::new(),
        });
    }

    fn write_local(&mut self, slot: usize, value: Value) {
        let frame = match self.frames.last_mut() {
            Some(f) => f,
            None => panic!("local written before any frame was entered"),
        };
        debug_assert_eq!(slot, frame.locals.len());
        frame.locals.push(value);
    }
}

// ======================================================================
// Direct-value variant
// ======================================================================

/// A machine-level decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineValue<R> {
    Int(i64),
    Ref(R),
    Float(f64),
}

impl<R> MachineValue<R> {
    /// The integer inside, or a fatal kind-mismatch.
    pub fn unwrap_int(self) -> i64 {
        match self {
            MachineValue::Int(v) => v,
            _ => panic!("integer expected at decode"),
        }
    }

    /// The reference inside, or a fatal kind-mismatch.
    pub fn unwrap_ref(self) -> R {
        match self {
            MachineValue::Ref(r) => r,
            _ => panic!("reference expected at decode"),
        }
    }
}

/// Low-level runtime services for the direct decoder: raw allocation and
/// direct writes into interpreter frames.
pub trait LowLevelVm {
    /// A runtime GC reference.
    type Ref: Clone;

    /// Resolve a trace-time reference constant to a runtime reference.
    fn ref_const(&mut self, r: RefConst) -> Self::Ref;
    fn allocate_with_vtable(&mut self, ty: TypeDescrId) -> Self::Ref;
    fn allocate_struct(&mut self, ty: TypeDescrId) -> Self::Ref;
    fn allocate_array(&mut self, descr: ArrayDescrId, length: usize) -> Self::Ref;
    fn allocate_string(&mut self, length: usize, unicode: bool) -> Self::Ref;
    fn setfield(&mut self, obj: Self::Ref, field: FieldDescrId, value: MachineValue<Self::Ref>);
    fn setarrayitem(
        &mut self,
        arr: Self::Ref,
        descr: ArrayDescrId,
        index: usize,
        value: MachineValue<Self::Ref>,
    );
    fn string_setitem(&mut self, s: Self::Ref, index: usize, ch: i64);
    fn concat_strings(&mut self, left: Self::Ref, right: Self::Ref, unicode: bool) -> Self::Ref;
    fn slice_string(&mut self, source: Self::Ref, start: i64, length: i64, unicode: bool)
        -> Self::Ref;
    fn enter_frame(&mut self, code: CodeId, pc: u32);
    fn write_local(&mut self, slot: usize, value: MachineValue<Self::Ref>);
}

/// Decoder target that feeds a [`LowLevelVm`] directly, skipping box
/// reconstruction. Fail-arg values come from the failing guard's saved
/// machine state.
pub struct DirectRebuilder<'a, V: LowLevelVm> {
    vm: &'a mut V,
    fail_values: &'a [MachineValue<V::Ref>],
}

impl<'a, V: LowLevelVm> DirectRebuilder<'a, V> {
    pub fn new(vm: &'a mut V, fail_values: &'a [MachineValue<V::Ref>]) -> Self {
        DirectRebuilder { vm, fail_values }
    }
}

impl<V: LowLevelVm> ResumeTarget for DirectRebuilder<'_, V> {
    type Val = MachineValue<V::Ref>;

    fn raw_value(&mut self, index: usize) -> Self::Val {
        self.fail_values[index].clone()
    }

    fn const_value(&mut self, c: ConstValue) -> Self::Val {
        match c {
            ConstValue::Int(v) => MachineValue::Int(v),
            ConstValue::Ref(r) => MachineValue::Ref(self.vm.ref_const(r)),
            ConstValue::Float(bits) => MachineValue::Float(f64::from_bits(bits)),
        }
    }

    fn int_value(&mut self, v: i64) -> Self::Val {
        MachineValue::Int(v)
    }

    fn allocate_with_vtable(&mut self, ty: TypeDescrId) -> Self::Val {
        MachineValue::Ref(self.vm.allocate_with_vtable(ty))
    }

    fn allocate_struct(&mut self, ty: TypeDescrId) -> Self::Val {
        MachineValue::Ref(self.vm.allocate_struct(ty))
    }

    fn allocate_array(&mut self, descr: ArrayDescrId, length: usize) -> Self::Val {
        MachineValue::Ref(self.vm.allocate_array(descr, length))
    }

    fn allocate_string(&mut self, length: usize, unicode: bool) -> Self::Val {
        MachineValue::Ref(self.vm.allocate_string(length, unicode))
    }

    fn setfield(&mut self, obj: Self::Val, field: FieldDescrId, value: Self::Val) {
        self.vm.setfield(obj.unwrap_ref(), field, value);
    }

    fn setarrayitem(&mut self, arr: Self::Val, descr: ArrayDescrId, index: usize, value: Self::Val) {
        self.vm.setarrayitem(arr.unwrap_ref(), descr, index, value);
    }

    fn string_setitem(&mut self, s: Self::Val, index: usize, ch: Self::Val) {
        self.vm.string_setitem(s.unwrap_ref(), index, ch.unwrap_int());
    }

    fn concat_strings(&mut self, left: Self::Val, right: Self::Val, unicode: bool) -> Self::Val {
        MachineValue::Ref(
            self.vm
                .concat_strings(left.unwrap_ref(), right.unwrap_ref(), unicode),
        )
    }

    fn slice_string(
        &mut self,
        source: Self::Val,
        start: Self::Val,
        length: Self::Val,
        unicode: bool,
    ) -> Self::Val {
        MachineValue::Ref(self.vm.slice_string(
            source.unwrap_ref(),
            start.unwrap_int(),
            length.unwrap_int(),
            unicode,
        ))
    }

    fn enter_frame(&mut self, code: CodeId, pc: u32) {
        self.vm.enter_frame(code, pc);
    }

    fn write_local(&mut self, slot: usize, value: Self::Val) {
        self.vm.write_local(slot, value);
    }
}
