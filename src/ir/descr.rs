//! Descriptors: front-end metadata attached to heap and call operations.
//!
//! The optimizer never sees real type layouts. Instead every heap or call
//! operation carries a descriptor id into a [`DescrTable`] built by the
//! front-end:
//! - [`TypeDescr`]: a struct type and its fields
//! - [`FieldDescr`]: one field of a struct type
//! - [`ArrayDescr`]: an array type (element kind)
//! - [`CallDescr`]: result kind plus effect/purity information
//!
//! Field ordering inside a type is canonical: forcing a virtual emits its
//! stores in ascending field-descriptor order so that identical virtuals
//! produce identical code.

use rustc_hash::FxHashMap;

use super::arena::{Arena, Id};
use super::value::{RefConst, ValueKind};

/// Id of a struct type descriptor.
pub type TypeDescrId = Id<TypeDescr>;
/// Id of a field descriptor.
pub type FieldDescrId = Id<FieldDescr>;
/// Id of an array type descriptor.
pub type ArrayDescrId = Id<ArrayDescr>;
/// Id of a call descriptor.
pub type CallDescrId = Id<CallDescr>;

/// A struct type known to the front-end.
#[derive(Debug)]
pub struct TypeDescr {
    /// Debug name of the type.
    pub name: String,
    /// The vtable constant, if the type has one (guard_class compares it).
    pub vtable: Option<RefConst>,
    /// Fields of this type, in canonical order.
    pub fields: Vec<FieldDescrId>,
}

/// One field of a struct type.
#[derive(Debug)]
pub struct FieldDescr {
    /// Debug name of the field.
    pub name: String,
    /// Owning type.
    pub owner: TypeDescrId,
    /// Kind of the stored value.
    pub kind: ValueKind,
    /// Immutable fields make `getfield_gc_pure` legal on them.
    pub immutable: bool,
}

/// An array type.
#[derive(Debug)]
pub struct ArrayDescr {
    /// Debug name of the array type.
    pub name: String,
    /// Kind of the element values.
    pub elem_kind: ValueKind,
}

/// How much a call can affect optimizer-visible state.
///
/// Ordered from least to most disruptive. Everything at
/// [`EffectLevel::ForcesVirtuals`] or above forces escaped virtuals and
/// flushes heap caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EffectLevel {
    /// Pure: no side effects, cannot raise. Foldable on constant arguments.
    Elidable = 0,
    /// Has side effects described by the read/write sets; cannot raise.
    CannotRaise = 1,
    /// Side effects and may raise an exception.
    CanRaise = 2,
    /// May capture or inspect frames; all virtuals must be forced first.
    ForcesVirtuals = 3,
    /// Unknown effects; invalidates every cache.
    RandomEffects = 4,
}

/// Recognized string builtins; the string pass handles these specially
/// instead of treating the call as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OopSpec {
    /// Not a recognized builtin.
    None,
    /// Concatenation of two byte strings.
    StrConcat,
    /// Substring of a byte string (string, start, length).
    StrSlice,
    /// Byte string equality.
    StrEq,
    /// Concatenation of two unicode strings.
    UniConcat,
    /// Substring of a unicode string.
    UniSlice,
    /// Unicode string equality.
    UniEq,
}

/// Effect description of a call target.
#[derive(Debug)]
pub struct EffectInfo {
    /// Disruption level.
    pub level: EffectLevel,
    /// Fields the call may write. Empty with level >= CanRaise means
    /// "may write anything".
    pub write_fields: Vec<FieldDescrId>,
    /// Array types the call may write into.
    pub write_arrays: Vec<ArrayDescrId>,
    /// Recognized builtin, if any.
    pub oopspec: OopSpec,
}

impl EffectInfo {
    /// An opaque call: unknown effects.
    pub fn opaque() -> Self {
        EffectInfo {
            level: EffectLevel::RandomEffects,
            write_fields: Vec::new(),
            write_arrays: Vec::new(),
            oopspec: OopSpec::None,
        }
    }

    /// A pure call.
    pub fn elidable() -> Self {
        EffectInfo {
            level: EffectLevel::Elidable,
            write_fields: Vec::new(),
            write_arrays: Vec::new(),
            oopspec: OopSpec::None,
        }
    }

    /// A recognized string builtin (these are all elidable).
    pub fn oopspec(spec: OopSpec) -> Self {
        EffectInfo {
            level: EffectLevel::Elidable,
            write_fields: Vec::new(),
            write_arrays: Vec::new(),
            oopspec: spec,
        }
    }

    /// Check whether the write sets are exhaustive, i.e. a field not listed
    /// is guaranteed untouched.
    #[inline]
    pub fn has_exact_write_sets(&self) -> bool {
        self.level <= EffectLevel::CanRaise
    }
}

/// Descriptor of a call target.
#[derive(Debug)]
pub struct CallDescr {
    /// Debug name of the target.
    pub name: String,
    /// Kind of the result; `None` for void calls.
    pub result_kind: Option<ValueKind>,
    /// Effects of the target.
    pub effect: EffectInfo,
}

/// All descriptors of a compilation unit.
///
/// Built once by the front-end and read-only during optimization and
/// resume decoding.
#[derive(Debug, Default)]
pub struct DescrTable {
    pub types: Arena<TypeDescr>,
    pub fields: Arena<FieldDescr>,
    pub arrays: Arena<ArrayDescr>,
    pub calls: Arena<CallDescr>,
    vtable_index: FxHashMap<RefConst, TypeDescrId>,
}

impl DescrTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct type and its fields. Field kinds are given in
    /// canonical order; the returned type owns field descriptors in the
    /// same order.
    pub fn add_type(
        &mut self,
        name: &str,
        vtable: Option<RefConst>,
        field_specs: &[(&str, ValueKind)],
    ) -> TypeDescrId {
        let type_id = self.types.alloc(TypeDescr {
            name: name.to_owned(),
            vtable,
            fields: Vec::new(),
        });
        let mut fields = Vec::with_capacity(field_specs.len());
        for &(fname, kind) in field_specs {
            fields.push(self.fields.alloc(FieldDescr {
                name: fname.to_owned(),
                owner: type_id,
                kind,
                immutable: false,
            }));
        }
        self.types.get_mut(type_id).fields = fields;
        if let Some(vt) = vtable {
            self.vtable_index.insert(vt, type_id);
        }
        type_id
    }

    /// Register an array type.
    pub fn add_array(&mut self, name: &str, elem_kind: ValueKind) -> ArrayDescrId {
        self.arrays.alloc(ArrayDescr {
            name: name.to_owned(),
            elem_kind,
        })
    }

    /// Register a call target.
    pub fn add_call(
        &mut self,
        name: &str,
        result_kind: Option<ValueKind>,
        effect: EffectInfo,
    ) -> CallDescrId {
        self.calls.alloc(CallDescr {
            name: name.to_owned(),
            result_kind,
            effect,
        })
    }

    /// Mark a field immutable.
    pub fn set_immutable(&mut self, field: FieldDescrId) {
        self.fields.get_mut(field).immutable = true;
    }

    /// Look up a type by its vtable constant.
    #[inline]
    pub fn type_of_vtable(&self, vtable: RefConst) -> Option<TypeDescrId> {
        self.vtable_index.get(&vtable).copied()
    }

    /// Fields of a type, in canonical order.
    #[inline]
    pub fn fields_of(&self, ty: TypeDescrId) -> &[FieldDescrId] {
        &self.types[ty].fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_registration() {
        let mut descrs = DescrTable::new();
        let vt = RefConst(0x1000);
        let node = descrs.add_type(
            "Node",
            Some(vt),
            &[("value", ValueKind::Int), ("next", ValueKind::Ref)],
        );
        assert_eq!(descrs.fields_of(node).len(), 2);
        assert_eq!(descrs.type_of_vtable(vt), Some(node));
        let value_field = descrs.fields_of(node)[0];
        assert_eq!(descrs.fields[value_field].kind, ValueKind::Int);
        assert_eq!(descrs.fields[value_field].owner, node);
    }

    #[test]
    fn test_effect_levels_ordered() {
        assert!(EffectLevel::Elidable < EffectLevel::CannotRaise);
        assert!(EffectLevel::CanRaise < EffectLevel::ForcesVirtuals);
        assert!(EffectLevel::ForcesVirtuals < EffectLevel::RandomEffects);
    }

    #[test]
    fn test_exact_write_sets() {
        assert!(!EffectInfo::opaque().has_exact_write_sets());
        assert!(EffectInfo::elidable().has_exact_write_sets());
        let mut e = EffectInfo::elidable();
        e.level = EffectLevel::CannotRaise;
        e.write_fields.push(Id::new(0));
        assert!(e.has_exact_write_sets());
    }
}
