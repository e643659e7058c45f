//! Trace operation kinds.
//!
//! Operations are organized by category:
//! - **Integer/float arithmetic** and comparisons
//! - **Pointer** comparisons and casts
//! - **Heap**: field/array loads and stores, allocation
//! - **Strings**: byte and unicode string primitives
//! - **Calls**: plain, pure, and may-force variants
//! - **Guards**: conditional deoptimization points
//! - **Control**: `jump` (back-edge) and `finish`
//!
//! Each opcode carries classification flags used by the optimizer: whether
//! it is pure (safe to fold/CSE), whether it can overflow, whether it is a
//! guard, and so on. Flags are computed from the opcode alone; descriptors
//! refine call effects separately (see [`crate::ir::descr::EffectInfo`]).

use super::value::ValueKind;

bitflags::bitflags! {
    /// Static properties of an opcode.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpProps: u8 {
        /// Depends only on its arguments; safe to constant-fold and CSE.
        const PURE = 0b0000_0001;
        /// A guard operation (carries resume data when emitted).
        const GUARD = 0b0000_0010;
        /// Writes to the heap.
        const HEAP_WRITE = 0b0000_0100;
        /// Reads from the heap.
        const HEAP_READ = 0b0000_1000;
        /// A call (effects described by the call descriptor).
        const CALL = 0b0001_0000;
        /// Overflow-checked arithmetic; must be followed by an overflow guard.
        const OVF = 0b0010_0000;
        /// Produces a boolean (0 or 1) integer result.
        const BOOL_RESULT = 0b0100_0000;
        /// Terminates the trace (`jump` or `finish`).
        const FINAL = 0b1000_0000;
    }
}

/// Opcode of a trace operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpKind {
    // ------------------------------------------------------------------
    // Integer arithmetic
    // ------------------------------------------------------------------
    IntAdd,
    IntSub,
    IntMul,
    IntFloorDiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    UintRshift,
    IntNeg,
    IntInvert,
    IntForceGeZero,
    IntSignext,
    // Overflow-checked variants; each must be followed by guard_no_overflow
    // or guard_overflow.
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    // ------------------------------------------------------------------
    // Integer comparisons (boolean results)
    // ------------------------------------------------------------------
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    IntIsZero,
    IntIsTrue,

    // ------------------------------------------------------------------
    // Float arithmetic and comparisons
    // ------------------------------------------------------------------
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatTruediv,
    FloatNeg,
    FloatAbs,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    CastFloatToInt,
    CastIntToFloat,

    // ------------------------------------------------------------------
    // Pointer operations
    // ------------------------------------------------------------------
    PtrEq,
    PtrNe,
    InstancePtrEq,
    InstancePtrNe,

    /// Identity copy; used when the front-end needs a distinct box.
    SameAs,

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------
    /// Allocate a struct with a vtable; argument 0 is the class constant.
    NewWithVtable,
    /// Allocate a struct without a vtable; descriptor names the type.
    New,
    /// Allocate an array; argument 0 is the length.
    NewArray,
    /// Allocate a byte string; argument 0 is the length.
    NewStr,
    /// Allocate a unicode string; argument 0 is the length.
    NewUnicode,

    // ------------------------------------------------------------------
    // Heap accesses
    // ------------------------------------------------------------------
    GetfieldGc,
    /// Load from an immutable field; foldable when the base is constant.
    GetfieldGcPure,
    SetfieldGc,
    GetarrayitemGc,
    GetarrayitemGcPure,
    SetarrayitemGc,
    ArraylenGc,

    // ------------------------------------------------------------------
    // String primitives
    // ------------------------------------------------------------------
    StrLen,
    StrGetItem,
    StrSetItem,
    CopyStrContent,
    UnicodeLen,
    UnicodeGetItem,
    UnicodeSetItem,
    CopyUnicodeContent,

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------
    /// Plain call; effects come from the call descriptor.
    Call,
    /// Call known to be pure; may be folded if all arguments are constant.
    CallPure,
    /// Call that may force virtualizables/virtual refs.
    CallMayForce,

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    GuardNonnullClass,
    GuardNoOverflow,
    GuardOverflow,
    GuardNotForced,
    GuardNotInvalidated,
    GuardNoException,

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------
    /// Loop back-edge; argument count must match the loop input arguments.
    Jump,
    /// Leave the traced region.
    Finish,
}

impl OpKind {
    /// Static property flags for this opcode.
    pub const fn props(self) -> OpProps {
        use OpKind::*;
        match self {
            IntAdd | IntSub | IntMul | IntFloorDiv | IntMod | IntAnd | IntOr | IntXor
            | IntLshift | IntRshift | UintRshift | IntNeg | IntInvert | IntForceGeZero
            | IntSignext | SameAs => OpProps::PURE,

            IntAddOvf | IntSubOvf | IntMulOvf => OpProps::PURE.union(OpProps::OVF),

            IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt | UintLe | UintGt
            | UintGe | IntIsZero | IntIsTrue => OpProps::PURE.union(OpProps::BOOL_RESULT),

            FloatAdd | FloatSub | FloatMul | FloatTruediv | FloatNeg | FloatAbs
            | CastFloatToInt | CastIntToFloat => OpProps::PURE,

            FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe | PtrEq | PtrNe
            | InstancePtrEq | InstancePtrNe => OpProps::PURE.union(OpProps::BOOL_RESULT),

            NewWithVtable | New | NewArray | NewStr | NewUnicode => OpProps::HEAP_WRITE,

            GetfieldGc | GetarrayitemGc => OpProps::HEAP_READ,
            // Reads that are pure because the location is immutable.
            GetfieldGcPure | GetarrayitemGcPure => OpProps::PURE.union(OpProps::HEAP_READ),
            SetfieldGc | SetarrayitemGc => OpProps::HEAP_WRITE,
            ArraylenGc | StrLen | UnicodeLen => OpProps::PURE,
            StrGetItem | UnicodeGetItem => OpProps::HEAP_READ,
            StrSetItem | UnicodeSetItem => OpProps::HEAP_WRITE,
            CopyStrContent | CopyUnicodeContent => {
                OpProps::HEAP_READ.union(OpProps::HEAP_WRITE)
            }

            Call | CallMayForce => OpProps::CALL
                .union(OpProps::HEAP_READ)
                .union(OpProps::HEAP_WRITE),
            CallPure => OpProps::CALL.union(OpProps::PURE),

            GuardTrue | GuardFalse | GuardValue | GuardClass | GuardNonnull | GuardIsnull
            | GuardNonnullClass | GuardNoOverflow | GuardOverflow | GuardNotForced
            | GuardNotInvalidated | GuardNoException => OpProps::GUARD,

            Jump | Finish => OpProps::FINAL,
        }
    }

    /// Check if this is a guard.
    #[inline]
    pub const fn is_guard(self) -> bool {
        self.props().contains(OpProps::GUARD)
    }

    /// Check if this operation depends only on its arguments.
    #[inline]
    pub const fn is_pure(self) -> bool {
        self.props().contains(OpProps::PURE)
    }

    /// Pure and never raises; foldable and CSE-able without restriction.
    /// Overflow-checked ops are excluded: they must keep their guard paired.
    #[inline]
    pub const fn is_always_pure(self) -> bool {
        self.props().contains(OpProps::PURE) && !self.props().contains(OpProps::OVF)
    }

    /// Check if this operation writes to the heap.
    #[inline]
    pub const fn has_heap_effect(self) -> bool {
        self.props().contains(OpProps::HEAP_WRITE)
    }

    /// Check if this is a call.
    #[inline]
    pub const fn is_call(self) -> bool {
        self.props().contains(OpProps::CALL)
    }

    /// Check if this is overflow-checked arithmetic.
    #[inline]
    pub const fn is_ovf(self) -> bool {
        self.props().contains(OpProps::OVF)
    }

    /// Check if this produces a boolean (0/1) integer.
    #[inline]
    pub const fn has_bool_result(self) -> bool {
        self.props().contains(OpProps::BOOL_RESULT)
    }

    /// Check if this terminates the trace.
    #[inline]
    pub const fn is_final(self) -> bool {
        self.props().contains(OpProps::FINAL)
    }

    /// Check if this is `guard_no_overflow` or `guard_overflow`.
    #[inline]
    pub const fn is_overflow_guard(self) -> bool {
        matches!(self, OpKind::GuardNoOverflow | OpKind::GuardOverflow)
    }

    /// Result kind, when it does not depend on the descriptor.
    /// Heap loads and calls take their result kind from their descriptor.
    pub const fn fixed_result_kind(self) -> Option<ValueKind> {
        use OpKind::*;
        match self {
            IntAdd | IntSub | IntMul | IntFloorDiv | IntMod | IntAnd | IntOr | IntXor
            | IntLshift | IntRshift | UintRshift | IntNeg | IntInvert | IntForceGeZero
            | IntSignext | IntAddOvf | IntSubOvf | IntMulOvf | IntLt | IntLe | IntEq
            | IntNe | IntGt | IntGe | UintLt | UintLe | UintGt | UintGe | IntIsZero
            | IntIsTrue | FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe
            | PtrEq | PtrNe | InstancePtrEq | InstancePtrNe | CastFloatToInt
            | ArraylenGc | StrLen | UnicodeLen | StrGetItem | UnicodeGetItem => {
                Some(ValueKind::Int)
            }
            FloatAdd | FloatSub | FloatMul | FloatTruediv | FloatNeg | FloatAbs
            | CastIntToFloat => Some(ValueKind::Float),
            NewWithVtable | New | NewArray | NewStr | NewUnicode => Some(ValueKind::Ref),
            _ => None,
        }
    }

    /// Number of arguments, when fixed by the opcode.
    pub const fn fixed_arity(self) -> Option<usize> {
        use OpKind::*;
        match self {
            New | GuardNoOverflow | GuardOverflow | GuardNotForced | GuardNotInvalidated
            | GuardNoException => Some(0),
            IntNeg | IntInvert | IntForceGeZero | IntIsZero | IntIsTrue | FloatNeg
            | FloatAbs | CastFloatToInt | CastIntToFloat | SameAs | NewWithVtable
            | NewArray | NewStr | NewUnicode | ArraylenGc | StrLen | UnicodeLen
            | GuardTrue | GuardFalse | GuardNonnull | GuardIsnull => Some(1),
            IntAdd | IntSub | IntMul | IntFloorDiv | IntMod | IntAnd | IntOr | IntXor
            | IntLshift | IntRshift | UintRshift | IntSignext | IntAddOvf | IntSubOvf
            | IntMulOvf | IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt
            | UintLe | UintGt | UintGe | FloatAdd | FloatSub | FloatMul | FloatTruediv
            | FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe | PtrEq | PtrNe
            | InstancePtrEq | InstancePtrNe | GuardValue | GuardClass | GuardNonnullClass
            | StrGetItem | UnicodeGetItem | GetarrayitemGc | GetarrayitemGcPure => Some(2),
            GetfieldGc | GetfieldGcPure => Some(1),
            SetfieldGc => Some(2),
            SetarrayitemGc | StrSetItem | UnicodeSetItem => Some(3),
            CopyStrContent | CopyUnicodeContent => Some(5),
            Call | CallPure | CallMayForce | Jump | Finish => None,
        }
    }

    /// Check if this guard opcode takes a boolean condition argument.
    #[inline]
    pub const fn is_bool_guard(self) -> bool {
        matches!(self, OpKind::GuardTrue | OpKind::GuardFalse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_classification() {
        assert!(OpKind::GuardTrue.is_guard());
        assert!(OpKind::GuardNonnullClass.is_guard());
        assert!(!OpKind::IntAdd.is_guard());
        assert!(OpKind::GuardNoOverflow.is_overflow_guard());
        assert!(!OpKind::GuardTrue.is_overflow_guard());
    }

    #[test]
    fn test_purity() {
        assert!(OpKind::IntAdd.is_always_pure());
        assert!(OpKind::IntLt.is_always_pure());
        assert!(OpKind::IntAddOvf.is_pure());
        assert!(!OpKind::IntAddOvf.is_always_pure());
        assert!(!OpKind::SetfieldGc.is_pure());
        assert!(!OpKind::Call.is_pure());
        assert!(OpKind::CallPure.is_pure());
    }

    #[test]
    fn test_bool_results() {
        assert!(OpKind::IntIsTrue.has_bool_result());
        assert!(OpKind::PtrEq.has_bool_result());
        assert!(!OpKind::IntAdd.has_bool_result());
    }

    #[test]
    fn test_result_kinds() {
        assert_eq!(OpKind::IntAdd.fixed_result_kind(), Some(ValueKind::Int));
        assert_eq!(OpKind::FloatAdd.fixed_result_kind(), Some(ValueKind::Float));
        assert_eq!(OpKind::NewArray.fixed_result_kind(), Some(ValueKind::Ref));
        assert_eq!(OpKind::GetfieldGc.fixed_result_kind(), None);
    }

    #[test]
    fn test_final_ops() {
        assert!(OpKind::Jump.is_final());
        assert!(OpKind::Finish.is_final());
        assert!(!OpKind::GuardTrue.is_final());
    }
}
