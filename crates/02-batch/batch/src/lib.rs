//! Channel specifications, buffer allocation, and batch views.
//!
//! * [`FieldDict`] / [`ChannelSpec`] – what each channel exchanges.
//! * [`ExchangeConfig`] / [`AllocConfig`] – serialized declarations and defaults.
//! * [`Allocator`] – owns every slot's buffers and the channel/slot index.
//! * [`Batch`] – bounded zero-copy view over one slot for one cycle.
//! * [`Reply`] – callback output, reconciled with [`Batch::copy_from`].

mod allocator;
mod batch;
mod config;
mod error;
mod reply;
mod spec;

pub use allocator::{Allocator, BufferGroup, Slot, SlotId};
pub use batch::{Batch, FieldView};
pub use config::{AllocConfig, ChannelEntry, ExchangeConfig, FieldEntry};
pub use error::{BatchError, BatchResult, ConfigError, ConfigResult};
pub use reply::{CopyReport, Reply, ReplyValue};
pub use spec::{ChannelSpec, FieldDict, FieldId, FieldSpec};

#[cfg(test)]
mod tests;
