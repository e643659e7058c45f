//! Virtual escape analysis.
//!
//! A fresh allocation whose result never escapes is a *virtual*: the
//! allocation and every store into it are removed from the trace, and its
//! contents live only in the optimizer's field map. Reads are answered
//! from the map; an unset field reads as the type's default. The moment a
//! virtual escapes (call argument, store into a real object, pointer
//! comparison that needs an address, back-edge argument) it is *forced*:
//! the allocation and the deferred stores are emitted right there, and the
//! box behaves like any heap pointer afterwards.
//!
//! A virtual referenced only by guard fail-args is not forced; the resume
//! encoder describes it symbolically instead, and the decoder rebuilds it
//! if the guard ever fails.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::smallvec;

use crate::ir::descr::{ArrayDescrId, DescrTable, FieldDescrId, TypeDescrId};
use crate::ir::ops::OpKind;
use crate::ir::trace::{DescrRef, Operation};
use crate::ir::value::{BoxId, ConstValue, Value};
use crate::resume::encode::ResumeEnv;
use crate::resume::numbering::{VirtualInfo, VirtualShape};

use super::pipeline::Pipeline;
use super::{InvalidLoop, ValueState};

/// Contents of one tracked virtual.
#[derive(Debug)]
pub enum VirtualData {
    /// Struct allocated by `new`/`new_with_vtable`.
    Struct {
        ty: TypeDescrId,
        has_vtable: bool,
        fields: FxHashMap<FieldDescrId, Value>,
    },
    /// Fixed-length array with every element tracked.
    Array {
        descr: ArrayDescrId,
        items: Vec<Value>,
    },
    /// String built character by character.
    StrPlain { unicode: bool, chars: Vec<Value> },
    /// Concatenation of two (possibly virtual) strings.
    StrConcat {
        unicode: bool,
        left: Value,
        right: Value,
    },
    /// Substring of a (possibly virtual) string.
    StrSlice {
        unicode: bool,
        source: Value,
        start: Value,
        length: Value,
    },
}

/// One tracked virtual: contents plus the resume info cached for it.
#[derive(Debug)]
pub struct VirtualState {
    pub data: VirtualData,
    pub cached_vinfo: Option<Rc<VirtualInfo>>,
}

impl VirtualState {
    pub fn new(data: VirtualData) -> Self {
        VirtualState {
            data,
            cached_vinfo: None,
        }
    }
}

impl Pipeline<'_> {
    /// Allocations: start tracking a virtual instead of emitting.
    pub(crate) fn opt_new(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let data = match op.kind {
            OpKind::NewWithVtable => {
                let vtable = match op.arg(0).as_const() {
                    Some(ConstValue::Ref(r)) => r,
                    _ => return self.emit(op),
                };
                match self.descrs.type_of_vtable(vtable) {
                    Some(ty) => VirtualData::Struct {
                        ty,
                        has_vtable: true,
                        fields: FxHashMap::default(),
                    },
                    // unknown class: cannot describe it for resume
                    None => return self.emit(op),
                }
            }
            OpKind::New => match op.descr.and_then(|d| match d {
                DescrRef::Type(t) => Some(t),
                _ => None,
            }) {
                Some(ty) => VirtualData::Struct {
                    ty,
                    has_vtable: false,
                    fields: FxHashMap::default(),
                },
                None => return Err(InvalidLoop::MalformedTrace("new without type descriptor")),
            },
            OpKind::NewArray => {
                let descr = match op.descr.and_then(DescrRef::as_array) {
                    Some(d) => d,
                    None => {
                        return Err(InvalidLoop::MalformedTrace("new_array without descriptor"))
                    }
                };
                let length = match op.arg(0).as_const_int() {
                    Some(l) if (0..=u16::MAX as i64).contains(&l) => l as usize,
                    // unknown or oversized length: allocate for real
                    _ => return self.emit(op),
                };
                let default = Value::Const(ConstValue::default_for(
                    self.descrs.arrays[descr].elem_kind,
                ));
                VirtualData::Array {
                    descr,
                    items: vec![default; length],
                }
            }
            _ => unreachable!("not an allocation"),
        };
        self.vals.virtuals.insert(result, VirtualState::new(data));
        Ok(())
    }

    /// `getfield_gc` and the pure variant.
    pub(crate) fn opt_getfield(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let field = match op.descr.and_then(DescrRef::as_field) {
            Some(f) => f,
            None => return Err(InvalidLoop::MalformedTrace("getfield without descriptor")),
        };
        if let Value::Box(base) = op.arg(0) {
            if let Some(state) = self.vals.virtuals.get(&base) {
                let value = match &state.data {
                    VirtualData::Struct { fields, .. } => fields.get(&field).copied(),
                    _ => {
                        return Err(InvalidLoop::MalformedTrace(
                            "field read on non-struct virtual",
                        ))
                    }
                };
                let value = value.unwrap_or(Value::Const(ConstValue::default_for(
                    self.descrs.fields[field].kind,
                )));
                self.vals.make_equal(result, value);
                return Ok(());
            }
        }
        self.heap_getfield(op, field)
    }

    pub(crate) fn opt_setfield(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let field = match op.descr.and_then(DescrRef::as_field) {
            Some(f) => f,
            None => return Err(InvalidLoop::MalformedTrace("setfield without descriptor")),
        };
        let value = op.arg(1);
        if let Value::Box(base) = op.arg(0) {
            if let Some(state) = self.vals.virtuals.get_mut(&base) {
                match &mut state.data {
                    VirtualData::Struct { fields, .. } => {
                        fields.insert(field, value);
                        return Ok(());
                    }
                    _ => {
                        return Err(InvalidLoop::MalformedTrace(
                            "field write on non-struct virtual",
                        ))
                    }
                }
            }
        }
        // the store goes lazy; a virtual value stays virtual until the
        // store is actually flushed
        self.heap_setfield(op.arg(0), field, value)
    }

    pub(crate) fn opt_getarrayitem(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let descr = match op.descr.and_then(DescrRef::as_array) {
            Some(d) => d,
            None => {
                return Err(InvalidLoop::MalformedTrace(
                    "getarrayitem without descriptor",
                ))
            }
        };
        if let (Value::Box(base), Some(index)) = (op.arg(0), op.arg(1).as_const_int()) {
            if let Some(state) = self.vals.virtuals.get(&base) {
                if let VirtualData::Array { items, .. } = &state.data {
                    if let Some(&v) = items.get(index as usize) {
                        self.vals.make_equal(result, v);
                        return Ok(());
                    }
                }
            }
        }
        // variable index on a virtual array: give up tracking it
        let mut op = op;
        op.args[0] = self.force_value(op.arg(0))?;
        self.heap_getarrayitem(op, descr)
    }

    pub(crate) fn opt_setarrayitem(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let descr = match op.descr.and_then(DescrRef::as_array) {
            Some(d) => d,
            None => {
                return Err(InvalidLoop::MalformedTrace(
                    "setarrayitem without descriptor",
                ))
            }
        };
        let value = op.arg(2);
        if let (Value::Box(base), Some(index)) = (op.arg(0), op.arg(1).as_const_int()) {
            if let Some(state) = self.vals.virtuals.get_mut(&base) {
                if let VirtualData::Array { items, .. } = &mut state.data {
                    if let Some(slot) = items.get_mut(index as usize) {
                        *slot = value;
                        return Ok(());
                    }
                }
            }
        }
        let mut op = op;
        op.args[0] = self.force_value(op.arg(0))?;
        op.args[2] = self.force_value(value)?;
        self.heap_setarrayitem(op, descr)
    }

    pub(crate) fn opt_arraylen(&mut self, op: Operation) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        if let Value::Box(base) = op.arg(0) {
            if let Some(state) = self.vals.virtuals.get(&base) {
                if let VirtualData::Array { items, .. } = &state.data {
                    let len = items.len() as i64;
                    self.vals.make_equal(result, Value::int(len));
                    return Ok(());
                }
            }
        }
        self.cse_or_emit(op)
    }

    /// Force a value if it is a tracked virtual; returns the resolved
    /// value, which afterwards denotes a real object.
    pub(crate) fn force_value(&mut self, v: Value) -> Result<Value, InvalidLoop> {
        let v = self.vals.resolve(v);
        if let Value::Box(b) = v {
            if self.vals.is_virtual(b) {
                self.force_virtual(b)?;
            }
        }
        Ok(v)
    }

    /// Emit the allocation and deferred stores of one virtual. The box is
    /// unregistered first, so a cycle through its own fields sees a real
    /// object and terminates.
    pub(crate) fn force_virtual(&mut self, b: BoxId) -> Result<(), InvalidLoop> {
        // numberings memoized so far may still describe this box as a
        // virtual; later guards must re-number it as a plain box
        self.memo.forget_numberings();
        let state = match self.vals.virtuals.remove(&b) {
            Some(s) => s,
            None => return Err(InvalidLoop::DanglingVirtual),
        };
        match state.data {
            VirtualData::Struct {
                ty,
                has_vtable,
                fields,
            } => {
                if has_vtable {
                    let vtable = match self.descrs.types[ty].vtable {
                        Some(vt) => vt,
                        None => return Err(InvalidLoop::DanglingVirtual),
                    };
                    self.push_out(Operation {
                        kind: OpKind::NewWithVtable,
                        args: smallvec![Value::reference(vtable)],
                        result: Some(b),
                        descr: Some(DescrRef::Type(ty)),
                        guard: None,
                    });
                    self.vals.mark_class(b, vtable);
                } else {
                    self.push_out(Operation {
                        kind: OpKind::New,
                        args: smallvec![],
                        result: Some(b),
                        descr: Some(DescrRef::Type(ty)),
                        guard: None,
                    });
                    self.vals.mark_nonnull(b);
                }
                let field_order: Vec<FieldDescrId> = self.descrs.fields_of(ty).to_vec();
                for field in field_order {
                    if let Some(&value) = fields.get(&field) {
                        let value = self.force_value(value)?;
                        self.push_out(Operation {
                            kind: OpKind::SetfieldGc,
                            args: smallvec![Value::Box(b), value],
                            result: None,
                            descr: Some(DescrRef::Field(field)),
                            guard: None,
                        });
                        self.heap_remember_field(b, field, value);
                    }
                }
            }
            VirtualData::Array { descr, items } => {
                let default =
                    Value::Const(ConstValue::default_for(self.descrs.arrays[descr].elem_kind));
                self.push_out(Operation {
                    kind: OpKind::NewArray,
                    args: smallvec![Value::int(items.len() as i64)],
                    result: Some(b),
                    descr: Some(DescrRef::Array(descr)),
                    guard: None,
                });
                self.vals.mark_nonnull(b);
                for (index, item) in items.into_iter().enumerate() {
                    if item.same_value(default) {
                        continue;
                    }
                    let item = self.force_value(item)?;
                    self.push_out(Operation {
                        kind: OpKind::SetarrayitemGc,
                        args: smallvec![Value::Box(b), Value::int(index as i64), item],
                        result: None,
                        descr: Some(DescrRef::Array(descr)),
                        guard: None,
                    });
                }
            }
            data @ (VirtualData::StrPlain { .. }
            | VirtualData::StrConcat { .. }
            | VirtualData::StrSlice { .. }) => {
                self.force_string(b, data)?;
            }
        }
        Ok(())
    }

    /// Force every virtual among an operation's arguments, in place.
    pub(crate) fn force_op_args(&mut self, op: &mut Operation) -> Result<(), InvalidLoop> {
        for i in 0..op.args.len() {
            op.args[i] = self.force_value(op.args[i])?;
        }
        Ok(())
    }
}

/// The optimizer's value knowledge, viewed through the resume encoder's
/// interface.
pub(crate) struct EncodeView<'a> {
    pub vals: &'a mut ValueState,
    pub descrs: &'a DescrTable,
}

impl ResumeEnv for EncodeView<'_> {
    fn resolve(&self, v: Value) -> Value {
        self.vals.resolve(v)
    }

    fn is_virtual(&self, b: BoxId) -> bool {
        self.vals.is_virtual(b)
    }

    fn virtual_parts(&self, b: BoxId) -> (VirtualShape, Vec<Value>) {
        let state = match self.vals.virtuals.get(&b) {
            Some(s) => s,
            None => panic!("virtual contents requested for a non-virtual box"),
        };
        match &state.data {
            VirtualData::Struct {
                ty,
                has_vtable,
                fields,
            } => {
                let mut used = Vec::new();
                let mut values = Vec::new();
                for &f in self.descrs.fields_of(*ty) {
                    if let Some(&v) = fields.get(&f) {
                        used.push(f);
                        values.push(v);
                    }
                }
                let shape = if *has_vtable {
                    VirtualShape::Object {
                        ty: *ty,
                        fields: used,
                    }
                } else {
                    VirtualShape::Struct {
                        ty: *ty,
                        fields: used,
                    }
                };
                (shape, values)
            }
            VirtualData::Array { descr, items } => {
                (VirtualShape::Array { descr: *descr }, items.clone())
            }
            VirtualData::StrPlain { unicode, chars } => (
                VirtualShape::StrPlain { unicode: *unicode },
                chars.clone(),
            ),
            VirtualData::StrConcat {
                unicode,
                left,
                right,
            } => (
                VirtualShape::StrConcat { unicode: *unicode },
                vec![*left, *right],
            ),
            VirtualData::StrSlice {
                unicode,
                source,
                start,
                length,
            } => (
                VirtualShape::StrSlice { unicode: *unicode },
                vec![*source, *start, *length],
            ),
        }
    }

    fn cached_vinfo(&self, b: BoxId) -> Option<Rc<VirtualInfo>> {
        self.vals.virtuals.get(&b).and_then(|s| s.cached_vinfo.clone())
    }

    fn set_cached_vinfo(&mut self, b: BoxId, info: Rc<VirtualInfo>) {
        if let Some(state) = self.vals.virtuals.get_mut(&b) {
            state.cached_vinfo = Some(info);
        }
    }
}
