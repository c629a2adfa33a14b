//! Shared-memory primitives for exchanging batches with native engines.
//!
//! This crate exposes the foundational pieces the batch layer builds on:
//! * [`ElementType`] / [`Element`] – the closed element set and its host-side names.
//! * [`FieldBuffer`] – aligned, zeroed, never-relocated storage for one field of one slot.
//! * [`FieldDescriptor`] / [`ForeignBuffer`] – the address-level view handed to engines.
//! * [`Array`] – owned typed arrays used for replies and device copies.
//! * [`wait::HandOff`] – the phase word gating native and host access to a slot.

mod array;
mod buffer;
mod device;
mod element;
mod error;
pub mod foreign;
mod layout;
mod region;
pub mod wait;

pub use array::{Array, ArrayData, Scalar};
pub use buffer::FieldBuffer;
pub use device::Device;
pub use element::{Element, ElementType, ALL_ELEMENT_TYPES};
pub use error::{SmemError, SmemResult, TypeError};
pub use foreign::ForeignBuffer;
pub use layout::{
    batch_shape, byte_strides, numel, squeezed, FieldDescriptor, Shape, Strides, FIELD_ALIGNMENT,
};
pub use region::{RegionInit, SharedRegion};
