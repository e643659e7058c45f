//! Resume-data encoding.
//!
//! Encoding runs once per surviving guard, at the end of optimization.
//! It turns the guard's snapshot chain into a [`Numbering`], assigns every
//! live box a fail-args index, and builds a [`VirtualInfo`] table for every
//! virtual reachable from the live set.
//!
//! Two layers share the work:
//! - [`ResumeMemo`] persists across all guards of one loop. It memoizes
//!   numberings by snapshot identity, dedupes constants, and remembers
//!   the negative indices handed out to boxes and virtuals so that a box
//!   appearing in many guards keeps one index everywhere.
//! - [`ResumeEncoder`] is per-guard scratch state: which boxes are live,
//!   which virtuals were reached, and the pending stores to attach.
//!
//! Box indices come in two flavors. Boxes found while numbering the
//! snapshot chain get non-negative indices, assigned top-down and shared
//! by every guard that reuses the chain tail. Boxes reachable only
//! through virtual contents get negative indices from the memo's cache;
//! the decoder resolves them modulo the fail-args length, so they address
//! the tail of the list where those boxes are appended (newest last).

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ir::snapshot::{FrameInfoId, SnapshotId, SnapshotStore};
use crate::ir::value::{BoxId, ConstValue, Value};

use super::numbering::{
    ConstTable, Numbering, PendingField, PendingKind, ResumeData, VirtualInfo, VirtualShape,
};
use super::tagged::{Tag, TagOverflow, TaggedSlot};

/// What the encoder needs to know from the optimizer about current values.
pub trait ResumeEnv {
    /// Final replacement of a value: constants folded, equalities applied.
    fn resolve(&self, v: Value) -> Value;

    /// Check whether `b` currently denotes an unforced virtual.
    fn is_virtual(&self, b: BoxId) -> bool;

    /// Shape and current contents of an unforced virtual, contents in the
    /// order the decoder will replay them.
    fn virtual_parts(&self, b: BoxId) -> (VirtualShape, Vec<Value>);

    /// Info built for this virtual by an earlier guard, if any.
    fn cached_vinfo(&self, b: BoxId) -> Option<Rc<VirtualInfo>>;

    /// Remember the info built for this virtual.
    fn set_cached_vinfo(&mut self, b: BoxId, info: Rc<VirtualInfo>);
}

/// A store the heap pass deferred past this guard; must be replayed by
/// the decoder.
#[derive(Debug, Clone, Copy)]
pub struct PendingStore {
    pub kind: PendingKind,
    pub target: Value,
    pub value: Value,
}

struct NumberingEntry {
    numb: Rc<Numbering>,
    liveboxes: FxHashMap<BoxId, TaggedSlot>,
    num_virtuals: u32,
}

/// Per-loop encoding state, shared by all guards.
pub struct ResumeMemo {
    consts: ConstTable,
    const_index: FxHashMap<ConstValue, usize>,
    numberings: FxHashMap<SnapshotId, NumberingEntry>,
    cached_boxes: FxHashMap<BoxId, i32>,
    cached_virtuals: FxHashMap<BoxId, i32>,
    /// Backend limit on fail-args length; drives the cache-clearing
    /// heuristic, not a hard cap.
    pub failargs_limit: usize,
    /// Total virtuals-table entries written, across guards.
    pub nvirtuals: usize,
    /// Total fail-args holes produced by cached indices unused at a guard.
    pub nvholes: usize,
    /// Times a cached `VirtualInfo` was reused unchanged.
    pub nvreused: usize,
}

impl ResumeMemo {
    pub fn new(failargs_limit: usize) -> Self {
        ResumeMemo {
            consts: ConstTable::new(),
            const_index: FxHashMap::default(),
            numberings: FxHashMap::default(),
            cached_boxes: FxHashMap::default(),
            cached_virtuals: FxHashMap::default(),
            failargs_limit,
            nvirtuals: 0,
            nvholes: 0,
            nvreused: 0,
        }
    }

    /// Shared constants table handle.
    pub fn consts(&self) -> ConstTable {
        self.consts.clone()
    }

    /// Encode a constant: small integers inline, everything else through
    /// the deduplicated constants table.
    fn get_const(&mut self, c: ConstValue) -> Result<TaggedSlot, TagOverflow> {
        if let ConstValue::Int(v) = c {
            if v >= TaggedSlot::MIN_PAYLOAD as i64 && v <= TaggedSlot::MAX_PAYLOAD as i64 {
                return TaggedSlot::new(v as i32, Tag::SmallInt);
            }
        }
        if c == ConstValue::NULL {
            return Ok(TaggedSlot::NULLREF);
        }
        let index = match self.const_index.get(&c) {
            Some(&i) => i,
            None => {
                let i = self.consts.push(c);
                self.const_index.insert(c, i);
                i
            }
        };
        TaggedSlot::new(index as i32, Tag::Const)
    }

    /// Number a snapshot chain, memoized by snapshot identity. Returns the
    /// numbering, the box-to-slot map accumulated over the whole chain, and
    /// the count of virtuals found in it.
    pub fn number<E: ResumeEnv>(
        &mut self,
        env: &E,
        store: &SnapshotStore,
        snapshot: SnapshotId,
    ) -> Result<(Rc<Numbering>, FxHashMap<BoxId, TaggedSlot>, u32), TagOverflow> {
        if let Some(entry) = self.numberings.get(&snapshot) {
            return Ok((
                Rc::clone(&entry.numb),
                entry.liveboxes.clone(),
                entry.num_virtuals,
            ));
        }
        let (prev_numb, mut liveboxes, mut v) = match store.snapshots[snapshot].prev {
            Some(prev) => {
                let (numb, liveboxes, v) = self.number(env, store, prev)?;
                (Some(numb), liveboxes, v)
            }
            None => (None, FxHashMap::default(), 0),
        };
        let mut n = liveboxes.len() as i32 - v as i32;
        let boxes = &store.snapshots[snapshot].boxes;
        let mut nums = Vec::with_capacity(boxes.len());
        for &raw in boxes {
            let tagged = match env.resolve(raw) {
                Value::Const(c) => self.get_const(c)?,
                Value::Box(b) => match liveboxes.get(&b) {
                    Some(&t) => t,
                    None => {
                        let t = if env.is_virtual(b) {
                            let t = TaggedSlot::new(v as i32, Tag::Virtual)?;
                            v += 1;
                            t
                        } else {
                            let t = TaggedSlot::new(n, Tag::Box)?;
                            n += 1;
                            t
                        };
                        liveboxes.insert(b, t);
                        t
                    }
                },
            };
            nums.push(tagged);
        }
        let numb = Rc::new(Numbering {
            prev: prev_numb,
            nums: nums.into_boxed_slice(),
        });
        self.numberings.insert(
            snapshot,
            NumberingEntry {
                numb: Rc::clone(&numb),
                liveboxes: liveboxes.clone(),
                num_virtuals: v,
            },
        );
        Ok((numb, liveboxes, v))
    }

    /// Give `b` its stable negative fail-args index, filling its position
    /// in `new_boxes` (position `-num - 1`, reversed before appending).
    fn assign_number_to_box(&mut self, b: BoxId, new_boxes: &mut Vec<Option<BoxId>>) -> i32 {
        match self.cached_boxes.get(&b) {
            Some(&num) => {
                new_boxes[(-num - 1) as usize] = Some(b);
                num
            }
            None => {
                new_boxes.push(Some(b));
                let num = -(self.cached_boxes.len() as i32) - 1;
                self.cached_boxes.insert(b, num);
                num
            }
        }
    }

    /// Give a virtual its stable negative virtuals-table index.
    fn assign_number_to_virtual(&mut self, b: BoxId) -> i32 {
        match self.cached_virtuals.get(&b) {
            Some(&num) => num,
            None => {
                let num = -(self.cached_virtuals.len() as i32) - 1;
                self.cached_virtuals.insert(b, num);
                num
            }
        }
    }

    fn num_cached_boxes(&self) -> usize {
        self.cached_boxes.len()
    }

    fn num_cached_virtuals(&self) -> usize {
        self.cached_virtuals.len()
    }

    /// Drop the negative-index caches. Called when a guard's fail-args
    /// list came out mostly holes; future guards then restart from dense
    /// indices. Purely a size heuristic.
    pub fn clear_box_virtual_numbers(&mut self) {
        self.cached_boxes.clear();
        self.cached_virtuals.clear();
    }

    /// Drop the memoized numberings and the index caches. Required when
    /// a virtual is forced: memoized chain tails may still tag its box
    /// `Virtual`, and a later guard reusing such a tail would ask the
    /// optimizer for contents that no longer exist.
    pub fn forget_numberings(&mut self) {
        self.numberings.clear();
        self.clear_box_virtual_numbers();
    }
}

/// Result of encoding one guard.
pub struct EncodedGuard {
    pub resume: ResumeData,
    /// Boxes the backend must keep live, by decode index. `None` entries
    /// are holes from cached indices unused at this guard.
    pub fail_args: Vec<Option<BoxId>>,
}

/// Per-guard encoder.
pub struct ResumeEncoder<'a, E: ResumeEnv> {
    memo: &'a mut ResumeMemo,
    env: &'a mut E,
    liveboxes_from_env: FxHashMap<BoxId, TaggedSlot>,
    liveboxes: FxHashMap<BoxId, TaggedSlot>,
    vfield_boxes: FxHashMap<BoxId, Vec<Value>>,
}

impl<'a, E: ResumeEnv> ResumeEncoder<'a, E> {
    pub fn new(memo: &'a mut ResumeMemo, env: &'a mut E) -> Self {
        ResumeEncoder {
            memo,
            env,
            liveboxes_from_env: FxHashMap::default(),
            liveboxes: FxHashMap::default(),
            vfield_boxes: FxHashMap::default(),
        }
    }

    /// Encode one guard's resume data.
    pub fn finish(
        mut self,
        store: &SnapshotStore,
        snapshot: SnapshotId,
        frame_info: FrameInfoId,
        pending: &[PendingStore],
    ) -> Result<EncodedGuard, TagOverflow> {
        let (numbering, liveboxes_from_env, num_env_virtuals) =
            self.memo.number(self.env, store, snapshot)?;
        self.liveboxes_from_env = liveboxes_from_env;

        let n = self.liveboxes_from_env.len() - num_env_virtuals as usize;
        let mut fail_args: Vec<Option<BoxId>> = vec![None; n];
        let env_entries: Vec<(BoxId, TaggedSlot)> = self
            .liveboxes_from_env
            .iter()
            .map(|(&b, &t)| (b, t))
            .collect();
        for (b, tagged) in env_entries {
            let (index, tag) = tagged.untag();
            match tag {
                Tag::Box => fail_args[index as usize] = Some(b),
                Tag::Virtual => self.collect_virtual(b),
                Tag::Const | Tag::SmallInt => {
                    unreachable!("constant in live-box map")
                }
            }
        }
        for p in pending {
            self.register_value(p.target);
            self.register_value(p.value);
        }
        self.number_new_boxes(&mut fail_args)?;
        let virtuals = self.build_virtuals_table(num_env_virtuals as usize)?;
        let pending = pending
            .iter()
            .map(|p| {
                Ok(PendingField {
                    kind: p.kind,
                    target: self.get_tagged(p.target)?,
                    value: self.get_tagged(p.value)?,
                })
            })
            .collect::<Result<Vec<_>, TagOverflow>>()?;

        let num_boxes = fail_args.len();
        Ok(EncodedGuard {
            resume: ResumeData {
                numbering,
                frame_info,
                consts: self.memo.consts(),
                virtuals,
                pending,
                num_boxes,
            },
            fail_args,
        })
    }

    /// Mark a virtual as reachable and pull in its contents. Registers
    /// the virtual before walking its contents, so cyclic graphs settle.
    fn collect_virtual(&mut self, b: BoxId) {
        if self.vfield_boxes.contains_key(&b) {
            return;
        }
        let tagged = self
            .liveboxes_from_env
            .get(&b)
            .copied()
            .unwrap_or(TaggedSlot::UNASSIGNED_VIRTUAL);
        self.liveboxes.insert(b, tagged);
        let (_, contents) = self.env.virtual_parts(b);
        self.vfield_boxes.insert(b, contents.clone());
        for value in contents {
            self.register_value(value);
        }
    }

    fn register_value(&mut self, v: Value) {
        if let Value::Box(b) = self.env.resolve(v) {
            if self.env.is_virtual(b) {
                self.collect_virtual(b);
            } else if !self.liveboxes_from_env.contains_key(&b)
                && !self.liveboxes.contains_key(&b)
            {
                self.liveboxes.insert(b, TaggedSlot::UNASSIGNED);
            }
        }
    }

    /// Second assignment phase: boxes and virtuals reachable only through
    /// virtual contents get their stable negative indices. New boxes are
    /// appended (reversed, so the wraparound math lands on them) after the
    /// chain-numbered boxes.
    fn number_new_boxes(&mut self, fail_args: &mut Vec<Option<BoxId>>) -> Result<(), TagOverflow> {
        let mut new_boxes: Vec<Option<BoxId>> = vec![None; self.memo.num_cached_boxes()];
        let mut count = 0usize;
        let entries: Vec<(BoxId, TaggedSlot)> =
            self.liveboxes.iter().map(|(&b, &t)| (b, t)).collect();
        for (b, tagged) in entries {
            match tagged.tag() {
                Tag::Box => {
                    debug_assert_eq!(tagged, TaggedSlot::UNASSIGNED);
                    let num = self.memo.assign_number_to_box(b, &mut new_boxes);
                    self.liveboxes.insert(b, TaggedSlot::new(num, Tag::Box)?);
                    count += 1;
                }
                Tag::Virtual => {
                    if tagged == TaggedSlot::UNASSIGNED_VIRTUAL {
                        let num = self.memo.assign_number_to_virtual(b);
                        self.liveboxes
                            .insert(b, TaggedSlot::new(num, Tag::Virtual)?);
                    }
                }
                Tag::Const | Tag::SmallInt => unreachable!("constant in live-box map"),
            }
        }
        new_boxes.reverse();
        let nholes = new_boxes.len() - count;
        fail_args.extend(new_boxes);
        self.memo.nvholes += nholes;
        if nholes > fail_args.len() / 3 && fail_args.len() > self.memo.failargs_limit / 2 {
            self.memo.clear_box_virtual_numbers();
        }
        Ok(())
    }

    fn build_virtuals_table(
        &mut self,
        num_env_virtuals: usize,
    ) -> Result<Vec<Option<Rc<VirtualInfo>>>, TagOverflow> {
        if self.vfield_boxes.is_empty() {
            return Ok(Vec::new());
        }
        let length = num_env_virtuals + self.memo.num_cached_virtuals();
        let mut virtuals: Vec<Option<Rc<VirtualInfo>>> = vec![None; length];
        let entries: Vec<(BoxId, Vec<Value>)> = std::mem::take(&mut self.vfield_boxes)
            .into_iter()
            .collect();
        for (b, contents) in entries {
            let mut nums = Vec::with_capacity(contents.len());
            for value in contents {
                nums.push(self.get_tagged(value)?);
            }
            let info = match self.env.cached_vinfo(b) {
                Some(cached) if cached.matches_nums(&nums) => {
                    self.memo.nvreused += 1;
                    cached
                }
                _ => {
                    let (shape, _) = self.env.virtual_parts(b);
                    let info = Rc::new(shape.into_info(nums));
                    self.env.set_cached_vinfo(b, Rc::clone(&info));
                    info
                }
            };
            let (num, tag) = self.liveboxes[&b].untag();
            debug_assert_eq!(tag, Tag::Virtual);
            let index = if num < 0 {
                (length as i32 + num) as usize
            } else {
                num as usize
            };
            virtuals[index] = Some(info);
            self.memo.nvirtuals += 1;
        }
        Ok(virtuals)
    }

    fn get_tagged(&mut self, v: Value) -> Result<TaggedSlot, TagOverflow> {
        match self.env.resolve(v) {
            Value::Const(c) => self.memo.get_const(c),
            Value::Box(b) => match self.liveboxes_from_env.get(&b) {
                Some(&t) => Ok(t),
                None => Ok(self.liveboxes[&b]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::ValueKind;

    struct PlainEnv;

    impl ResumeEnv for PlainEnv {
        fn resolve(&self, v: Value) -> Value {
            v
        }
        fn is_virtual(&self, _b: BoxId) -> bool {
            false
        }
        fn virtual_parts(&self, _b: BoxId) -> (VirtualShape, Vec<Value>) {
            unreachable!()
        }
        fn cached_vinfo(&self, _b: BoxId) -> Option<Rc<VirtualInfo>> {
            None
        }
        fn set_cached_vinfo(&mut self, _b: BoxId, _info: Rc<VirtualInfo>) {}
    }

    fn ibox(i: u32) -> Value {
        Value::Box(BoxId::new(i, ValueKind::Int))
    }

    #[test]
    fn test_number_tags() {
        let mut store = SnapshotStore::new();
        let snap = store.push_snapshot(
            None,
            vec![ibox(0), Value::int(1), ibox(1), Value::int(100_000), ibox(0)],
        );
        let mut memo = ResumeMemo::new(1000);
        let (numb, liveboxes, v) = memo.number(&PlainEnv, &store, snap).unwrap();
        assert_eq!(v, 0);
        assert_eq!(liveboxes.len(), 2);
        let nums = &numb.nums;
        assert_eq!(nums[0], TaggedSlot::new(0, Tag::Box).unwrap());
        assert_eq!(nums[1], TaggedSlot::new(1, Tag::SmallInt).unwrap());
        assert_eq!(nums[2], TaggedSlot::new(1, Tag::Box).unwrap());
        // too large to inline; goes through the consts table
        assert_eq!(nums[3], TaggedSlot::new(0, Tag::Const).unwrap());
        // repeated box keeps its slot
        assert_eq!(nums[4], nums[0]);
        assert_eq!(memo.consts().get(0), ConstValue::Int(100_000));
    }

    #[test]
    fn test_number_shares_tails() {
        let mut store = SnapshotStore::new();
        let outer = store.push_snapshot(None, vec![ibox(0), ibox(1)]);
        let a = store.push_snapshot(Some(outer), vec![ibox(2)]);
        let b = store.push_snapshot(Some(outer), vec![ibox(2), ibox(0)]);
        let mut memo = ResumeMemo::new(1000);
        let (numb_a, _, _) = memo.number(&PlainEnv, &store, a).unwrap();
        let (numb_b, liveboxes_b, _) = memo.number(&PlainEnv, &store, b).unwrap();
        assert!(Rc::ptr_eq(
            numb_a.prev.as_ref().unwrap(),
            numb_b.prev.as_ref().unwrap()
        ));
        // box 0 keeps the index assigned while numbering the shared tail
        assert_eq!(
            numb_b.nums[1],
            liveboxes_b[&BoxId::new(0, ValueKind::Int)]
        );
        assert_eq!(numb_b.nums[1], TaggedSlot::new(0, Tag::Box).unwrap());
    }

    #[test]
    fn test_const_dedup() {
        let mut memo = ResumeMemo::new(1000);
        let big = ConstValue::Int(1 << 40);
        let a = memo.get_const(big).unwrap();
        let b = memo.get_const(big).unwrap();
        assert_eq!(a, b);
        assert_eq!(memo.consts().len(), 1);
        assert_eq!(memo.get_const(ConstValue::NULL).unwrap(), TaggedSlot::NULLREF);
    }

    #[test]
    fn test_finish_plain_guard() {
        let mut store = SnapshotStore::new();
        let snap = store.push_snapshot(None, vec![ibox(0), ibox(1), Value::int(3)]);
        let fi = store.push_frame_info(None, crate::ir::snapshot::CodeId(9), 4);
        let mut memo = ResumeMemo::new(1000);
        let mut env = PlainEnv;
        let encoded = ResumeEncoder::new(&mut memo, &mut env)
            .finish(&store, snap, fi, &[])
            .unwrap();
        assert_eq!(encoded.fail_args.len(), 2);
        assert_eq!(encoded.fail_args[0], BoxId::new(0, ValueKind::Int).into());
        assert_eq!(encoded.resume.num_boxes, 2);
        assert!(encoded.resume.virtuals.is_empty());
    }
}
