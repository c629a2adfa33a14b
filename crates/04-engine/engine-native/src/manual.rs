//! Deterministic engine driven by hand from tests and demos.

use std::collections::VecDeque;
use std::time::Duration;

use batch::{BufferGroup, SlotId};
use dispatch::{Engine, EngineError, ReadySlot};
use smem::{Element, FieldDescriptor, ForeignBuffer};

use crate::error::NativeError;

#[derive(Debug)]
struct ManualSlot {
    group: BufferGroup,
    outstanding: bool,
    steps: usize,
}

/// Engine whose ready queue is filled explicitly with [`ManualEngine::mark_ready`].
///
/// `wait` never blocks: it pops the next scripted slot or times out at once.
/// Registered groups share ownership of their buffers, so rows stay
/// addressable after the allocator that created them is dropped.
#[derive(Debug, Default)]
pub struct ManualEngine {
    slots: Vec<Option<ManualSlot>>,
    queue: VecDeque<(SlotId, usize)>,
    running: bool,
    stopped: bool,
}

impl ManualEngine {
    /// Creates an engine with no slots.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: SlotId) -> Result<&ManualSlot, NativeError> {
        self.slots
            .get(slot.index())
            .and_then(Option::as_ref)
            .ok_or(NativeError::UnknownSlot(slot))
    }

    fn buffer(
        &self,
        slot: SlotId,
        key: &str,
        pick: fn(&BufferGroup) -> &[FieldDescriptor],
    ) -> Result<ForeignBuffer, NativeError> {
        let state = self.slot(slot)?;
        let desc = pick(&state.group)
            .iter()
            .find(|desc| desc.name == key)
            .cloned()
            .ok_or_else(|| NativeError::UnknownField {
                channel: state.group.channel.clone(),
                field: key.to_owned(),
            })?;
        // SAFETY: the handle is dropped before the calling method returns.
        // Writers take `&mut self`, so behind a dispatcher they cannot run
        // while a batch borrowed from its allocator is alive.
        Ok(unsafe { ForeignBuffer::new(desc) }?)
    }

    /// Writes `values` into `row` of input field `key` of `slot`.
    pub fn write_row<T: Element>(
        &mut self,
        slot: SlotId,
        key: &str,
        row: usize,
        values: &[T],
    ) -> Result<(), NativeError> {
        let mut buffer = self.buffer(slot, key, |group| group.inputs.as_slice())?;
        buffer.write_row(row, values)?;
        Ok(())
    }

    /// Writes consecutive rows starting at row 0.
    pub fn write_rows<T: Element>(
        &mut self,
        slot: SlotId,
        key: &str,
        rows: &[&[T]],
    ) -> Result<(), NativeError> {
        let mut buffer = self.buffer(slot, key, |group| group.inputs.as_slice())?;
        for (row, values) in rows.iter().enumerate() {
            buffer.write_row(row, values)?;
        }
        Ok(())
    }

    /// Reads `row` of reply field `key` of `slot`.
    pub fn read_row<T: Element>(
        &self,
        slot: SlotId,
        key: &str,
        row: usize,
    ) -> Result<Vec<T>, NativeError> {
        Ok(self.buffer(slot, key, |group| group.replies.as_slice())?.read_row(row)?)
    }

    /// Reads the first `rows` rows of reply field `key`, flattened.
    pub fn read_rows<T: Element>(
        &self,
        slot: SlotId,
        key: &str,
        rows: usize,
    ) -> Result<Vec<T>, NativeError> {
        let buffer = self.buffer(slot, key, |group| group.replies.as_slice())?;
        let mut out = Vec::new();
        for row in 0..rows {
            out.extend(buffer.read_row::<T>(row)?);
        }
        Ok(out)
    }

    /// Queues `slot` with effective size `size` for the next `wait`.
    pub fn mark_ready(&mut self, slot: SlotId, size: usize) -> Result<(), NativeError> {
        self.slot(slot)?;
        self.queue.push_back((slot, size));
        Ok(())
    }

    /// Times `slot` has been stepped.
    pub fn steps(&self, slot: SlotId) -> usize {
        self.slot(slot).map_or(0, |state| state.steps)
    }

    /// Steps across all slots.
    pub fn total_steps(&self) -> usize {
        self.slots.iter().flatten().map(|state| state.steps).sum()
    }

    /// Scripted slots not yet handed out.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Buffer groups registered so far, in slot order.
    pub fn groups(&self) -> impl Iterator<Item = &BufferGroup> {
        self.slots.iter().flatten().map(|state| &state.group)
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Engine for ManualEngine {
    fn allocate_buffer_group(&mut self, group: &BufferGroup) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::AlreadyStarted);
        }
        let idx = group.slot.index();
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(ManualSlot {
            group: group.clone(),
            outstanding: false,
            steps: 0,
        });
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.running || self.stopped {
            return Err(EngineError::AlreadyStarted);
        }
        self.running = true;
        Ok(())
    }

    fn wait(&mut self, _timeout: Option<Duration>) -> Result<Option<ReadySlot>, EngineError> {
        if !self.running {
            return Err(EngineError::NotRunning);
        }
        let Some((slot, size)) = self.queue.pop_front() else {
            return Ok(None);
        };
        if let Some(state) = self.slots.get_mut(slot.index()).and_then(Option::as_mut) {
            state.outstanding = true;
        }
        Ok(Some(ReadySlot::new(slot, size)))
    }

    fn step(&mut self, ready: ReadySlot) -> Result<(), EngineError> {
        let slot = ready.slot();
        let state = self
            .slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnknownSlot(slot))?;
        if !state.outstanding {
            return Err(EngineError::NotReady(slot));
        }
        state.outstanding = false;
        state.steps += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        self.running = false;
        self.stopped = true;
        Ok(())
    }
}
