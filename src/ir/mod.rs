//! Trace intermediate representation.
//!
//! The tracing front-end records a linear stream of [`trace::Operation`]s
//! over SSA-style [`value::BoxId`]s. Guards embed snapshots of the
//! interpreter frame stack; heap and call operations carry descriptors
//! from a [`descr::DescrTable`].

pub mod arena;
pub mod descr;
pub mod ops;
pub mod snapshot;
pub mod trace;
pub mod value;

pub use ops::OpKind;
pub use trace::{DescrRef, GuardData, Operation, TraceLoop};
pub use value::{BoxId, ConstValue, RefConst, Value, ValueKind};
