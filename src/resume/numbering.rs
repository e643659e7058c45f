//! Encoded resume structures attached to surviving guards.
//!
//! A [`Numbering`] is the compact form of a snapshot chain: one node per
//! frame, each holding the frame's live values as [`TaggedSlot`]s. Nodes
//! are reference-counted and shared between guards whose snapshot chains
//! share a tail, so a deep frame stack costs each guard only its innermost
//! frames.
//!
//! [`VirtualInfo`] describes how to rebuild one escaped-at-guard-failure
//! virtual object. [`ResumeData`] bundles everything a decoder needs.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ir::descr::{ArrayDescrId, FieldDescrId, TypeDescrId};
use crate::ir::snapshot::FrameInfoId;
use crate::ir::value::ConstValue;

use super::tagged::TaggedSlot;

/// One encoded frame; `prev` points one level up the stack.
#[derive(Debug)]
pub struct Numbering {
    pub prev: Option<Rc<Numbering>>,
    pub nums: Box<[TaggedSlot]>,
}

/// Constants table shared by every guard of one compiled loop. Grows
/// during encoding, read-only at decode time.
#[derive(Debug, Clone, Default)]
pub struct ConstTable(Rc<RefCell<Vec<ConstValue>>>);

impl ConstTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant, returning its index.
    pub fn push(&self, c: ConstValue) -> usize {
        let mut v = self.0.borrow_mut();
        v.push(c);
        v.len() - 1
    }

    /// Constant at `index`. Panics on a bad index, which means encoder
    /// and decoder disagree about the table and nothing can be trusted.
    pub fn get(&self, index: usize) -> ConstValue {
        self.0.borrow()[index]
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// The layout of one virtual object, without its contents. The optimizer
/// hands this to the resume encoder, which pairs it with encoded field
/// values to form a [`VirtualInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualShape {
    /// Struct with a vtable; rebuilt with `allocate_with_vtable`.
    Object {
        ty: TypeDescrId,
        fields: Vec<FieldDescrId>,
    },
    /// Struct without a vtable.
    Struct {
        ty: TypeDescrId,
        fields: Vec<FieldDescrId>,
    },
    /// Fixed-length array; one num per element.
    Array { descr: ArrayDescrId },
    /// String built character by character; one num per char.
    StrPlain { unicode: bool },
    /// Concatenation of two strings; nums are [left, right].
    StrConcat { unicode: bool },
    /// Substring; nums are [source, start, length].
    StrSlice { unicode: bool },
}

impl VirtualShape {
    /// Attach encoded contents, producing the decodable description.
    pub fn into_info(self, nums: Vec<TaggedSlot>) -> VirtualInfo {
        match self {
            VirtualShape::Object { ty, fields } => VirtualInfo::Object { ty, fields, nums },
            VirtualShape::Struct { ty, fields } => VirtualInfo::Struct { ty, fields, nums },
            VirtualShape::Array { descr } => VirtualInfo::Array { descr, nums },
            VirtualShape::StrPlain { unicode } => VirtualInfo::StrPlain { unicode, nums },
            VirtualShape::StrConcat { unicode } => VirtualInfo::StrConcat { unicode, nums },
            VirtualShape::StrSlice { unicode } => VirtualInfo::StrSlice { unicode, nums },
        }
    }
}

/// How to rebuild one virtual object at guard failure.
#[derive(Debug)]
pub enum VirtualInfo {
    /// Struct with a vtable.
    Object {
        ty: TypeDescrId,
        fields: Vec<FieldDescrId>,
        nums: Vec<TaggedSlot>,
    },
    /// Struct without a vtable.
    Struct {
        ty: TypeDescrId,
        fields: Vec<FieldDescrId>,
        nums: Vec<TaggedSlot>,
    },
    /// Fixed-length array.
    Array {
        descr: ArrayDescrId,
        nums: Vec<TaggedSlot>,
    },
    /// String built character by character.
    StrPlain {
        unicode: bool,
        nums: Vec<TaggedSlot>,
    },
    /// Concatenation; nums are [left, right].
    StrConcat {
        unicode: bool,
        nums: Vec<TaggedSlot>,
    },
    /// Substring; nums are [source, start, length].
    StrSlice {
        unicode: bool,
        nums: Vec<TaggedSlot>,
    },
}

impl VirtualInfo {
    /// Encoded contents.
    #[inline]
    pub fn nums(&self) -> &[TaggedSlot] {
        match self {
            VirtualInfo::Object { nums, .. }
            | VirtualInfo::Struct { nums, .. }
            | VirtualInfo::Array { nums, .. }
            | VirtualInfo::StrPlain { nums, .. }
            | VirtualInfo::StrConcat { nums, .. }
            | VirtualInfo::StrSlice { nums, .. } => nums,
        }
    }

    /// Check whether a previously built info can stand in for one that
    /// would be built with `nums`. Used to share infos between guards
    /// when the virtual's contents have not changed.
    pub fn matches_nums(&self, nums: &[TaggedSlot]) -> bool {
        self.nums() == nums
    }
}

/// A deferred heap store that must be replayed on resume.
#[derive(Debug, Clone, Copy)]
pub enum PendingKind {
    /// Store into a struct field.
    Field(FieldDescrId),
    /// Store into an array element at a known index.
    ArrayItem(ArrayDescrId, usize),
}

/// One deferred store: write `value` into `target` before handing frames
/// back to the interpreter. Replayed in recorded order.
#[derive(Debug, Clone, Copy)]
pub struct PendingField {
    pub kind: PendingKind,
    pub target: TaggedSlot,
    pub value: TaggedSlot,
}

/// Everything a decoder needs to reconstruct interpreter state at one
/// guard. Immutable once built.
#[derive(Debug)]
pub struct ResumeData {
    /// Innermost frame of the encoded chain.
    pub numbering: Rc<Numbering>,
    /// Innermost node of the frame-position chain.
    pub frame_info: FrameInfoId,
    /// Shared constants table.
    pub consts: ConstTable,
    /// Virtuals table; slots not reachable from this guard stay empty.
    pub virtuals: Vec<Option<Rc<VirtualInfo>>>,
    /// Deferred heap stores, in recorded order.
    pub pending: Vec<PendingField>,
    /// Length of the guard's fail-args list; negative box payloads wrap
    /// modulo this count.
    pub num_boxes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::tagged::Tag;

    fn slot(p: i32, t: Tag) -> TaggedSlot {
        TaggedSlot::new(p, t).unwrap()
    }

    #[test]
    fn test_numbering_tail_sharing() {
        let tail = Rc::new(Numbering {
            prev: None,
            nums: vec![slot(0, Tag::Box)].into_boxed_slice(),
        });
        let a = Numbering {
            prev: Some(Rc::clone(&tail)),
            nums: vec![slot(1, Tag::Box)].into_boxed_slice(),
        };
        let b = Numbering {
            prev: Some(Rc::clone(&tail)),
            nums: vec![slot(7, Tag::SmallInt)].into_boxed_slice(),
        };
        assert!(Rc::ptr_eq(a.prev.as_ref().unwrap(), b.prev.as_ref().unwrap()));
    }

    #[test]
    fn test_vinfo_reuse_check() {
        let nums = vec![slot(3, Tag::SmallInt), slot(0, Tag::Box)];
        let info = VirtualShape::Array {
            descr: crate::ir::arena::Id::new(0),
        }
        .into_info(nums.clone());
        assert!(info.matches_nums(&nums));
        assert!(!info.matches_nums(&[slot(4, Tag::SmallInt), slot(0, Tag::Box)]));
    }

    #[test]
    fn test_const_table_shared() {
        let t1 = ConstTable::new();
        let t2 = t1.clone();
        let i = t1.push(ConstValue::Int(100_000));
        assert_eq!(t2.get(i), ConstValue::Int(100_000));
        assert_eq!(t2.len(), 1);
    }
}
