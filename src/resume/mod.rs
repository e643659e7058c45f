//! Guard resume data: encoding at compile time, decoding at guard failure.
//!
//! - [`tagged`]: the 16-bit tagged-slot packing
//! - [`numbering`]: encoded structures attached to guards
//! - [`encode`]: snapshot-chain numbering and virtuals-table construction
//! - [`decode`]: the two decoder variants (box-rebuilding and direct)

pub mod decode;
pub mod encode;
pub mod numbering;
pub mod tagged;

pub use decode::{
    BoxRebuilder, DirectRebuilder, LowLevelVm, MachineValue, RebuildStep, RebuiltFrame,
    ResumeReader, ResumeTarget,
};
pub use encode::{EncodedGuard, PendingStore, ResumeEncoder, ResumeEnv, ResumeMemo};
pub use numbering::{ConstTable, Numbering, ResumeData, VirtualInfo, VirtualShape};
pub use tagged::{Tag, TagOverflow, TaggedSlot};
