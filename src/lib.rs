//! Trace optimizer and guard-resume engine for the Ember meta-tracing JIT.
//!
//! This crate takes a linear recorded trace (a "loop") produced by the
//! tracing front-end and rewrites it into an equivalent but shorter trace:
//! - Integer bounds propagation and guard elimination
//! - Constant folding, CSE and algebraic simplification of pure operations
//! - Escape analysis of not-yet-allocated ("virtual") structs, arrays and
//!   strings, with lazy forcing
//! - Redundant heap access elimination with alias tracking
//!
//! For every guard that survives optimization it attaches *resume data*:
//! a compact, structurally shared encoding of the interpreter state live at
//! that guard, sufficient to reconstruct the full frame stack (including
//! virtual object graphs, cycles included) when the guard fails at run time.
#![deny(unsafe_op_in_unsafe_fn)]
pub mod ir;
pub mod opt;
pub mod resume;
