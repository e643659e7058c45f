//! Recorded traces: operations, guards, and the loop container.

use smallvec::SmallVec;

use super::descr::{ArrayDescrId, CallDescrId, FieldDescrId, TypeDescrId};
use super::ops::OpKind;
use super::snapshot::{FrameInfoId, SnapshotId, SnapshotStore};
use super::value::{BoxId, Value, ValueKind};
use crate::resume::numbering::ResumeData;

/// Descriptor attached to an operation, when the opcode needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescrRef {
    Field(FieldDescrId),
    Array(ArrayDescrId),
    Type(TypeDescrId),
    Call(CallDescrId),
}

impl DescrRef {
    #[inline]
    pub fn as_field(self) -> Option<FieldDescrId> {
        match self {
            DescrRef::Field(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(self) -> Option<ArrayDescrId> {
        match self {
            DescrRef::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn as_call(self) -> Option<CallDescrId> {
        match self {
            DescrRef::Call(c) => Some(c),
            _ => None,
        }
    }
}

/// Deoptimization state attached to a guard.
///
/// `fail_args` and `resume` start empty; the optimizer fills them in when
/// the guard survives into the output trace.
#[derive(Debug)]
pub struct GuardData {
    /// Live values at the guard, innermost frame first.
    pub snapshot: SnapshotId,
    /// Frame positions, innermost frame last when walking `prev`.
    pub frame_info: FrameInfoId,
    /// Boxes the backend must keep alive for this guard, in the order the
    /// resume decoder will read them back. `None` entries are holes left
    /// by cached indices not used at this guard.
    pub fail_args: Vec<Option<BoxId>>,
    /// Encoded resume data; present once the guard is finalized.
    pub resume: Option<ResumeData>,
}

impl GuardData {
    pub fn new(snapshot: SnapshotId, frame_info: FrameInfoId) -> Self {
        GuardData {
            snapshot,
            frame_info,
            fail_args: Vec::new(),
            resume: None,
        }
    }
}

/// One recorded operation.
#[derive(Debug)]
pub struct Operation {
    pub kind: OpKind,
    pub args: SmallVec<[Value; 3]>,
    /// Result box; `None` for void operations (stores, guards, finals).
    pub result: Option<BoxId>,
    pub descr: Option<DescrRef>,
    /// Guard state; present exactly when `kind.is_guard()`.
    pub guard: Option<Box<GuardData>>,
}

impl Operation {
    /// Argument `i`.
    #[inline]
    pub fn arg(&self, i: usize) -> Value {
        self.args[i]
    }

    /// The result as a `Value`. Panics on void operations, which have no
    /// uses to rewrite.
    #[inline]
    pub fn result_value(&self) -> Value {
        match self.result {
            Some(b) => Value::Box(b),
            None => unreachable!("void operation has no result"),
        }
    }
}

/// A recorded loop: input arguments, the operation stream, and the
/// snapshot storage its guards point into.
#[derive(Debug)]
pub struct TraceLoop {
    pub input_args: Vec<BoxId>,
    pub ops: Vec<Operation>,
    pub store: SnapshotStore,
    next_box: u32,
}

impl TraceLoop {
    /// Start a loop with input arguments of the given kinds.
    pub fn new(input_kinds: &[ValueKind]) -> Self {
        let mut tl = TraceLoop {
            input_args: Vec::with_capacity(input_kinds.len()),
            ops: Vec::new(),
            store: SnapshotStore::new(),
            next_box: 0,
        };
        for &kind in input_kinds {
            let b = tl.new_box(kind);
            tl.input_args.push(b);
        }
        tl
    }

    /// Mint a fresh box. Box indices are unique within the loop; the
    /// optimizer also mints boxes through this when materializing values.
    #[inline]
    pub fn new_box(&mut self, kind: ValueKind) -> BoxId {
        let b = BoxId::new(self.next_box, kind);
        self.next_box += 1;
        b
    }

    /// Number of boxes minted so far.
    #[inline]
    pub fn num_boxes(&self) -> u32 {
        self.next_box
    }

    fn check_args(kind: OpKind, args: &[Value]) {
        debug_assert!(
            kind.fixed_arity().map_or(true, |n| n == args.len()),
            "{kind:?} recorded with {} arguments",
            args.len()
        );
    }

    /// Record an operation with a fresh result box of kind `kind`.
    pub fn emit(
        &mut self,
        kind: OpKind,
        args: impl IntoIterator<Item = Value>,
        result_kind: ValueKind,
    ) -> BoxId {
        debug_assert!(kind.fixed_result_kind().map_or(true, |k| k == result_kind));
        let args: SmallVec<[Value; 3]> = args.into_iter().collect();
        Self::check_args(kind, &args);
        let result = self.new_box(result_kind);
        self.ops.push(Operation {
            kind,
            args,
            result: Some(result),
            descr: None,
            guard: None,
        });
        result
    }

    /// Record an operation with a descriptor and a fresh result box.
    pub fn emit_with_descr(
        &mut self,
        kind: OpKind,
        args: impl IntoIterator<Item = Value>,
        descr: DescrRef,
        result_kind: ValueKind,
    ) -> BoxId {
        debug_assert!(kind.fixed_result_kind().map_or(true, |k| k == result_kind));
        let args: SmallVec<[Value; 3]> = args.into_iter().collect();
        Self::check_args(kind, &args);
        let result = self.new_box(result_kind);
        self.ops.push(Operation {
            kind,
            args,
            result: Some(result),
            descr: Some(descr),
            guard: None,
        });
        result
    }

    /// Record a void operation (store, jump, finish).
    pub fn emit_void(
        &mut self,
        kind: OpKind,
        args: impl IntoIterator<Item = Value>,
        descr: Option<DescrRef>,
    ) {
        let args: SmallVec<[Value; 3]> = args.into_iter().collect();
        Self::check_args(kind, &args);
        self.ops.push(Operation {
            kind,
            args,
            result: None,
            descr,
            guard: None,
        });
    }

    /// Record a guard with its captured state.
    pub fn emit_guard(
        &mut self,
        kind: OpKind,
        args: impl IntoIterator<Item = Value>,
        snapshot: SnapshotId,
        frame_info: FrameInfoId,
    ) {
        debug_assert!(kind.is_guard());
        let args: SmallVec<[Value; 3]> = args.into_iter().collect();
        Self::check_args(kind, &args);
        self.ops.push(Operation {
            kind,
            args,
            result: None,
            descr: None,
            guard: Some(Box::new(GuardData::new(snapshot, frame_info))),
        });
    }
}
