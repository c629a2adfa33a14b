//! Boundary between the dispatcher and a native simulation engine.

use std::time::Duration;

use batch::{BufferGroup, SlotId};
use thiserror::Error;

/// One slot the engine has filled and handed to the host.
///
/// The token is consumed by [`Engine::step`], so a slot can be released
/// exactly once per wait.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a ready slot must be stepped to hand it back to the engine"]
pub struct ReadySlot {
    slot: SlotId,
    size: usize,
}

impl ReadySlot {
    pub fn new(slot: SlotId, size: usize) -> Self {
        Self { slot, size }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Effective size: valid rows written for this cycle.
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not running")]
    NotRunning,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),

    #[error("slot {0} is not awaiting a step")]
    NotReady(SlotId),

    #[error("buffer group for slot {slot} rejected: {reason}")]
    Rejected { slot: SlotId, reason: String },

    #[error("engine failure: {0}")]
    Failed(String),
}

/// Narrow interface the dispatcher drives.
///
/// Engines own the producer threads and decide when a slot is ready. Between
/// a `wait` returning a slot and the matching `step`, the host owns that
/// slot's buffers and the engine must not touch them.
pub trait Engine {
    /// Registers the descriptors of one slot. Called once per slot before
    /// `start`.
    fn allocate_buffer_group(&mut self, group: &BufferGroup) -> Result<(), EngineError>;

    fn start(&mut self) -> Result<(), EngineError>;

    /// Blocks until a slot is ready or `timeout` elapses (`None` blocks
    /// indefinitely). `Ok(None)` means the wait timed out.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<ReadySlot>, EngineError>;

    /// Releases a slot back to the engine after its replies are written.
    fn step(&mut self, ready: ReadySlot) -> Result<(), EngineError>;

    fn stop(&mut self) -> Result<(), EngineError>;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn allocate_buffer_group(&mut self, group: &BufferGroup) -> Result<(), EngineError> {
        (**self).allocate_buffer_group(group)
    }

    fn start(&mut self) -> Result<(), EngineError> {
        (**self).start()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<ReadySlot>, EngineError> {
        (**self).wait(timeout)
    }

    fn step(&mut self, ready: ReadySlot) -> Result<(), EngineError> {
        (**self).step(ready)
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        (**self).stop()
    }
}
