//! Consumer contract for data leaving a source.
//!
//! A consumer is split the same way a source is. The control half is shared
//! and only ever held weakly by the source. The stream half is moved to the
//! realtime thread on attach and owned there until it is detached.

use crate::chunk::MemChunk;

/// Control-plane view of an attached consumer.
pub trait OutputControl: Send + Sync {
    fn index(&self) -> u32;

    /// The source is about to suspend (`true`) or resume (`false`).
    fn suspend(&self, _suspending: bool) {}

    /// The source is going away; the consumer should stop using it.
    fn kill(&self) {}
}

/// Realtime view of an attached consumer. Every method runs on the realtime
/// thread and must not block.
pub trait OutputStream: Send {
    fn index(&self) -> u32;

    fn attach(&mut self) {}

    fn detach(&mut self) {}

    /// Per-cycle work. A non-zero result ends the cycle early.
    fn process(&mut self) -> i32 {
        0
    }

    fn push(&mut self, chunk: &MemChunk);
}
