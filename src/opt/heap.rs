//! Redundant heap access elimination.
//!
//! Per field descriptor the pass caches what is known to sit in that field
//! of each tracked object, so a second `getfield_gc` on the same object
//! folds to the first result. Stores are held back as *lazy* stores: a
//! `setfield_gc` only updates the cache, and the real store is emitted at
//! the latest point where memory must be up to date. A store overwritten
//! before anything could observe it is never emitted at all.
//!
//! Lazy stores whose value is a virtual survive even guards: the guard
//! records them as pending stores in its resume data, and the decoder
//! replays them after rebuilding the virtuals. Lazy stores of real values
//! are flushed in front of each guard instead.
//!
//! Calls invalidate caches according to their effect descriptors; an
//! opaque call drops everything.

use rustc_hash::FxHashMap;
use smallvec::smallvec;

use crate::ir::descr::{ArrayDescrId, CallDescrId, EffectLevel, FieldDescrId};
use crate::ir::ops::OpKind;
use crate::ir::trace::{DescrRef, Operation};
use crate::ir::value::{BoxId, Value};
use crate::resume::encode::PendingStore;
use crate::resume::numbering::PendingKind;

use super::pipeline::Pipeline;
use super::InvalidLoop;

/// A store known to the cache but not yet present in the output.
struct LazyStore {
    base: Value,
    value: Value,
}

#[derive(Default)]
struct FieldCache {
    /// What each object is known to hold in this field.
    known: FxHashMap<Value, Value>,
    /// At most one deferred store per field descriptor. A second store to
    /// a different object flushes the first.
    lazy: Option<LazyStore>,
}

#[derive(Default)]
struct ArrayCache {
    /// Known contents at constant indices.
    known: FxHashMap<(Value, i64), Value>,
}

/// All heap knowledge of one optimization run.
#[derive(Default)]
pub struct HeapState {
    fields: FxHashMap<FieldDescrId, FieldCache>,
    arrays: FxHashMap<ArrayDescrId, ArrayCache>,
}

impl HeapState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pipeline<'_> {
    /// Reads on real objects. Virtual bases were already answered by the
    /// escape analysis.
    pub(crate) fn heap_getfield(
        &mut self,
        mut op: Operation,
        field: FieldDescrId,
    ) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let base = self.vals.resolve(op.arg(0));
        let cache = self.heap.fields.entry(field).or_default();
        if let Some(lazy) = &cache.lazy {
            if lazy.base == base {
                let value = lazy.value;
                self.vals.make_equal(result, value);
                return Ok(());
            }
            // unknown aliasing between the two objects: the deferred
            // store must land before this read
            self.heap_flush_field(field)?;
        }
        let cache = self.heap.fields.entry(field).or_default();
        if let Some(&value) = cache.known.get(&base) {
            self.vals.make_equal(result, value);
            return Ok(());
        }
        op.args[0] = base;
        self.push_out(op);
        self.heap
            .fields
            .entry(field)
            .or_default()
            .known
            .insert(base, Value::Box(result));
        Ok(())
    }

    /// Stores on real objects become lazy: only the cache changes here.
    pub(crate) fn heap_setfield(
        &mut self,
        base: Value,
        field: FieldDescrId,
        value: Value,
    ) -> Result<(), InvalidLoop> {
        let base = self.vals.resolve(base);
        let cache = self.heap.fields.entry(field).or_default();
        if cache.known.get(&base) == Some(&value) && cache.lazy.is_none() {
            // the field already holds this value
            return Ok(());
        }
        match &mut cache.lazy {
            Some(lazy) if lazy.base == base => {
                // overwritten before anything read it
                lazy.value = value;
            }
            Some(_) => {
                self.heap_flush_field(field)?;
                let cache = self.heap.fields.entry(field).or_default();
                cache.lazy = Some(LazyStore { base, value });
            }
            None => {
                cache.lazy = Some(LazyStore { base, value });
            }
        }
        let cache = self.heap.fields.entry(field).or_default();
        // other objects of unknown identity may alias this one
        cache.known.retain(|k, _| *k == base);
        cache.known.insert(base, value);
        Ok(())
    }

    /// Record what a field holds without deferring anything; used right
    /// after a forced virtual emitted its stores.
    pub(crate) fn heap_remember_field(&mut self, base: BoxId, field: FieldDescrId, value: Value) {
        let cache = self.heap.fields.entry(field).or_default();
        cache.known.insert(Value::Box(base), value);
    }

    pub(crate) fn heap_getarrayitem(
        &mut self,
        mut op: Operation,
        descr: ArrayDescrId,
    ) -> Result<(), InvalidLoop> {
        let result = self.op_result(&op)?;
        let base = self.vals.resolve(op.arg(0));
        let index = match op.arg(1).as_const_int() {
            Some(i) => i,
            None => {
                op.args[0] = base;
                return self.cse_or_emit(op);
            }
        };
        let cache = self.heap.arrays.entry(descr).or_default();
        if let Some(&value) = cache.known.get(&(base, index)) {
            self.vals.make_equal(result, value);
            return Ok(());
        }
        op.args[0] = base;
        self.push_out(op);
        self.heap
            .arrays
            .entry(descr)
            .or_default()
            .known
            .insert((base, index), Value::Box(result));
        Ok(())
    }

    pub(crate) fn heap_setarrayitem(
        &mut self,
        mut op: Operation,
        descr: ArrayDescrId,
    ) -> Result<(), InvalidLoop> {
        let base = self.vals.resolve(op.arg(0));
        let value = op.arg(2);
        op.args[0] = base;
        let cache = self.heap.arrays.entry(descr).or_default();
        match op.arg(1).as_const_int() {
            Some(index) => {
                if cache.known.get(&(base, index)) == Some(&value) {
                    return Ok(());
                }
                // a store at index i may alias the same index of any
                // other object of this array type
                cache.known.retain(|(b, i), _| *i != index || *b == base);
                cache.known.insert((base, index), value);
            }
            None => {
                // unknown index: everything of this array type is suspect
                cache.known.clear();
            }
        }
        self.push_out(op);
        Ok(())
    }

    /// Emit the deferred store of one field, if any.
    fn heap_flush_field(&mut self, field: FieldDescrId) -> Result<(), InvalidLoop> {
        let lazy = match self.heap.fields.get_mut(&field).and_then(|c| c.lazy.take()) {
            Some(l) => l,
            None => return Ok(()),
        };
        let value = self.force_value(lazy.value)?;
        self.push_out(Operation {
            kind: OpKind::SetfieldGc,
            args: smallvec![lazy.base, value],
            result: None,
            descr: Some(DescrRef::Field(field)),
            guard: None,
        });
        Ok(())
    }

    /// Emit every deferred store. Memory is fully up to date afterwards.
    pub(crate) fn heap_flush_deferred(&mut self) -> Result<(), InvalidLoop> {
        let fields: Vec<FieldDescrId> = self
            .heap
            .fields
            .iter()
            .filter(|(_, c)| c.lazy.is_some())
            .map(|(&f, _)| f)
            .collect();
        for field in fields {
            self.heap_flush_field(field)?;
        }
        Ok(())
    }

    /// Drop all heap knowledge.
    pub(crate) fn heap_forget_all(&mut self) {
        self.heap.fields.clear();
        self.heap.arrays.clear();
    }

    /// Prepare the heap for a guard: deferred stores of virtual values
    /// stay deferred and are reported as pending stores for the resume
    /// data; deferred stores of real values are emitted in front of the
    /// guard.
    pub(crate) fn heap_stores_for_guard(&mut self) -> Result<Vec<PendingStore>, InvalidLoop> {
        let mut pending = Vec::new();
        let fields: Vec<FieldDescrId> = self
            .heap
            .fields
            .iter()
            .filter(|(_, c)| c.lazy.is_some())
            .map(|(&f, _)| f)
            .collect();
        for field in fields {
            let (base, value) = match &self.heap.fields[&field].lazy {
                Some(l) => (l.base, l.value),
                None => continue,
            };
            let value = self.vals.resolve(value);
            let is_virtual = matches!(value, Value::Box(b) if self.vals.is_virtual(b));
            if is_virtual {
                pending.push(PendingStore {
                    kind: PendingKind::Field(field),
                    target: base,
                    value,
                });
            } else {
                self.heap_flush_field(field)?;
            }
        }
        Ok(pending)
    }

    /// Apply a call's effect descriptor to the caches.
    pub(crate) fn heap_effects_of_call(&mut self, call: CallDescrId) -> Result<(), InvalidLoop> {
        let effect = &self.descrs.calls[call].effect;
        match effect.level {
            EffectLevel::Elidable => Ok(()),
            EffectLevel::CannotRaise | EffectLevel::CanRaise => {
                let write_fields = effect.write_fields.clone();
                let write_arrays = effect.write_arrays.clone();
                for field in write_fields {
                    self.heap_flush_field(field)?;
                    self.heap.fields.remove(&field);
                }
                for array in write_arrays {
                    self.heap.arrays.remove(&array);
                }
                Ok(())
            }
            EffectLevel::ForcesVirtuals | EffectLevel::RandomEffects => {
                self.heap_flush_deferred()?;
                self.heap_forget_all();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_cache_defaults() {
        let mut state = HeapState::new();
        let f: FieldDescrId = crate::ir::arena::Id::new(0);
        assert!(state.fields.entry(f).or_default().lazy.is_none());
        assert!(state.fields[&f].known.is_empty());
    }
}
