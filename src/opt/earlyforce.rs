//! Early forcing at escape points.
//!
//! Some operations hand pointers to code the optimizer cannot see into:
//! residual calls, raw-memory stores, bulk string copies. Their arguments
//! must be real objects before the operation runs, and any store the heap
//! pass is still holding back must be in memory. This pass runs before
//! the heap pass looks at the operation, so the forced allocations land
//! ahead of it in the output.

use crate::ir::trace::Operation;

use super::pipeline::Pipeline;
use super::InvalidLoop;

impl Pipeline<'_> {
    /// Calls that may reenter the tracing interpreter. Everything escapes:
    /// arguments are forced, deferred stores hit memory, and all heap
    /// knowledge is dropped. The `guard_not_forced` that follows such a
    /// call is handled like any other guard.
    pub(crate) fn opt_call_may_force(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        self.force_op_args(&mut op)?;
        self.heap_flush_deferred()?;
        self.heap_forget_all();
        self.emit(op)
    }

    /// Fallback for side-effecting operations without a dedicated handler.
    /// Whatever object they touch must be real.
    pub(crate) fn opt_escape(&mut self, mut op: Operation) -> Result<(), InvalidLoop> {
        self.force_op_args(&mut op)?;
        self.emit(op)
    }
}
