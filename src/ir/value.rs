//! Boxes, constants and value references.
//!
//! A *box* is an SSA value produced by tracing: either a loop input argument
//! or the result of a recorded operation. Boxes compare by identity (their
//! index), never by value. Constants compare by value. An operation argument
//! is a [`Value`]: either a box reference or an inline constant.

/// The machine-level kind of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Word-sized signed integer (also used for booleans and characters).
    Int = 0,
    /// GC pointer.
    Ref = 1,
    /// Double-precision float.
    Float = 2,
}

/// An opaque run-time reference constant (a GC pointer known at trace time,
/// e.g. a vtable or a prebuilt object). Zero is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefConst(pub u64);

impl RefConst {
    /// The null reference.
    pub const NULL: RefConst = RefConst(0);

    /// Check whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A compile-time constant of any kind.
///
/// Floats are stored as bits so that constants are `Eq + Hash` and can key
/// deduplication tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstValue {
    /// Integer constant.
    Int(i64),
    /// Reference constant.
    Ref(RefConst),
    /// Float constant, stored as bits.
    Float(u64),
}

impl ConstValue {
    /// The null pointer constant.
    pub const NULL: ConstValue = ConstValue::Ref(RefConst::NULL);

    /// Build a float constant.
    #[inline]
    pub fn float(v: f64) -> Self {
        ConstValue::Float(v.to_bits())
    }

    /// Kind of this constant.
    #[inline]
    pub const fn kind(self) -> ValueKind {
        match self {
            ConstValue::Int(_) => ValueKind::Int,
            ConstValue::Ref(_) => ValueKind::Ref,
            ConstValue::Float(_) => ValueKind::Float,
        }
    }

    /// Get as integer, if integer-kinded.
    #[inline]
    pub const fn as_int(self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Get as reference, if ref-kinded.
    #[inline]
    pub const fn as_ref(self) -> Option<RefConst> {
        match self {
            ConstValue::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Get as float, if float-kinded.
    #[inline]
    pub fn as_float(self) -> Option<f64> {
        match self {
            ConstValue::Float(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    /// True for the integer 0, the null ref, or float +0.0.
    #[inline]
    pub fn is_zero_like(self) -> bool {
        match self {
            ConstValue::Int(v) => v == 0,
            ConstValue::Ref(r) => r.is_null(),
            ConstValue::Float(bits) => f64::from_bits(bits) == 0.0,
        }
    }

    /// The default value for a freshly allocated field of the given kind.
    #[inline]
    pub const fn default_for(kind: ValueKind) -> ConstValue {
        match kind {
            ValueKind::Int => ConstValue::Int(0),
            ValueKind::Ref => ConstValue::NULL,
            ValueKind::Float => ConstValue::Float(0),
        }
    }
}

/// An SSA box: identity-compared handle to a traced value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxId {
    index: u32,
    kind: ValueKind,
}

impl BoxId {
    /// Create a box handle. Only the trace/loop should mint fresh indices.
    #[inline]
    pub const fn new(index: u32, kind: ValueKind) -> Self {
        BoxId { index, kind }
    }

    /// Raw index of this box.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Kind of this box.
    #[inline]
    pub const fn kind(self) -> ValueKind {
        self.kind
    }
}

impl std::fmt::Debug for BoxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.kind {
            ValueKind::Int => "i",
            ValueKind::Ref => "p",
            ValueKind::Float => "f",
        };
        write!(f, "{}{}", prefix, self.index)
    }
}

/// An operation argument or result reference: a box or an inline constant.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Reference to a previously produced box.
    Box(BoxId),
    /// Compile-time constant.
    Const(ConstValue),
}

impl Value {
    /// Integer constant shorthand.
    #[inline]
    pub const fn int(v: i64) -> Value {
        Value::Const(ConstValue::Int(v))
    }

    /// Reference constant shorthand.
    #[inline]
    pub const fn reference(r: RefConst) -> Value {
        Value::Const(ConstValue::Ref(r))
    }

    /// The null pointer constant.
    pub const NULL: Value = Value::Const(ConstValue::NULL);

    /// Kind of the referenced value.
    #[inline]
    pub const fn kind(self) -> ValueKind {
        match self {
            Value::Box(b) => b.kind(),
            Value::Const(c) => c.kind(),
        }
    }

    /// Check if this is a constant.
    #[inline]
    pub const fn is_const(self) -> bool {
        matches!(self, Value::Const(_))
    }

    /// Get the constant, if any.
    #[inline]
    pub const fn as_const(self) -> Option<ConstValue> {
        match self {
            Value::Const(c) => Some(c),
            Value::Box(_) => None,
        }
    }

    /// Get the box, if any.
    #[inline]
    pub const fn as_box(self) -> Option<BoxId> {
        match self {
            Value::Box(b) => Some(b),
            Value::Const(_) => None,
        }
    }

    /// Get as a constant integer, if this is one.
    #[inline]
    pub const fn as_const_int(self) -> Option<i64> {
        match self {
            Value::Const(ConstValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    /// Check if this is the null constant.
    #[inline]
    pub fn is_null_const(self) -> bool {
        matches!(self, Value::Const(ConstValue::Ref(r)) if r.is_null())
    }

    /// Identity/value sameness: boxes by identity, constants by value.
    #[inline]
    pub fn same_value(self, other: Value) -> bool {
        self == other
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Box(b) => write!(f, "{:?}", b),
            Value::Const(ConstValue::Int(v)) => write!(f, "{}", v),
            Value::Const(ConstValue::Ref(r)) if r.is_null() => write!(f, "NULL"),
            Value::Const(ConstValue::Ref(r)) => write!(f, "ref({:#x})", r.0),
            Value::Const(ConstValue::Float(bits)) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}
