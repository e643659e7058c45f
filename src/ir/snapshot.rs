//! Guard snapshots and frame-info chains.
//!
//! While tracing, the front-end maintains a stack of interpreter frames.
//! Each guard captures that stack as two singly linked chains:
//! - a [`Snapshot`] chain, innermost frame first, listing the live boxes
//!   of each frame at guard time;
//! - a [`FrameInfo`] chain, outermost frame first, recording the static
//!   position (code object and pc) of each frame.
//!
//! Consecutive guards in the same frame share the tail of both chains.
//! That sharing is the whole point: resume-data encoding memoizes on
//! snapshot *identity*, so the cost of encoding a guard is proportional to
//! what changed since the previous guard, not to the depth of the stack.

use super::arena::{Arena, Id};
use super::value::Value;

/// Identifies a code object of the traced interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(pub u32);

/// Id of a snapshot chain node.
pub type SnapshotId = Id<Snapshot>;
/// Id of a frame-info chain node.
pub type FrameInfoId = Id<FrameInfo>;

/// One frame's live values at guard time. `prev` links to the frame one
/// level up the stack (`None` at the outermost frame).
#[derive(Debug)]
pub struct Snapshot {
    pub prev: Option<SnapshotId>,
    pub boxes: Vec<Value>,
}

/// Static position of one frame. `prev` links to the *caller's* position,
/// so walking `prev` goes outward while the list reads innermost-last.
#[derive(Debug)]
pub struct FrameInfo {
    pub prev: Option<FrameInfoId>,
    pub code: CodeId,
    pub pc: u32,
}

/// Storage for all snapshot and frame-info nodes of one trace.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    pub snapshots: Arena<Snapshot>,
    pub frame_infos: Arena<FrameInfo>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame's live boxes on top of `prev`.
    pub fn push_snapshot(&mut self, prev: Option<SnapshotId>, boxes: Vec<Value>) -> SnapshotId {
        self.snapshots.alloc(Snapshot { prev, boxes })
    }

    /// Record a frame position on top of `prev`.
    pub fn push_frame_info(
        &mut self,
        prev: Option<FrameInfoId>,
        code: CodeId,
        pc: u32,
    ) -> FrameInfoId {
        self.frame_infos.alloc(FrameInfo { prev, code, pc })
    }

    /// Number of frames in a snapshot chain.
    pub fn snapshot_depth(&self, mut id: SnapshotId) -> usize {
        let mut depth = 1;
        while let Some(prev) = self.snapshots[id].prev {
            depth += 1;
            id = prev;
        }
        depth
    }

    /// All boxes of a snapshot chain, innermost frame first. Used by the
    /// optimizer to find values kept alive only by guards.
    pub fn iter_boxes(&self, id: SnapshotId) -> SnapshotBoxIter<'_> {
        SnapshotBoxIter {
            store: self,
            frame: Some(id),
            index: 0,
        }
    }
}

/// Iterator over every value in a snapshot chain.
pub struct SnapshotBoxIter<'a> {
    store: &'a SnapshotStore,
    frame: Option<SnapshotId>,
    index: usize,
}

impl<'a> Iterator for SnapshotBoxIter<'a> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let frame = self.frame?;
            let snap = &self.store.snapshots[frame];
            if self.index < snap.boxes.len() {
                let v = snap.boxes[self.index];
                self.index += 1;
                return Some(v);
            }
            self.frame = snap.prev;
            self.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::{BoxId, ValueKind};

    fn ibox(i: u32) -> Value {
        Value::Box(BoxId::new(i, ValueKind::Int))
    }

    #[test]
    fn test_chain_sharing() {
        let mut store = SnapshotStore::new();
        let outer = store.push_snapshot(None, vec![ibox(0), ibox(1)]);
        let a = store.push_snapshot(Some(outer), vec![ibox(2)]);
        let b = store.push_snapshot(Some(outer), vec![ibox(3)]);
        assert_eq!(store.snapshots[a].prev, store.snapshots[b].prev);
        assert_eq!(store.snapshot_depth(a), 2);
    }

    #[test]
    fn test_iter_boxes_innermost_first() {
        let mut store = SnapshotStore::new();
        let outer = store.push_snapshot(None, vec![ibox(0), ibox(1)]);
        let inner = store.push_snapshot(Some(outer), vec![ibox(2)]);
        let boxes: Vec<Value> = store.iter_boxes(inner).collect();
        assert_eq!(boxes, vec![ibox(2), ibox(0), ibox(1)]);
    }
}
