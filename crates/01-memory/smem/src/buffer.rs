//! Owned, fixed-size buffer for one named field of one slot.

use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::element::{Element, ElementType};
use crate::error::{SmemError, SmemResult};
use crate::foreign::{cast_slice, cast_slice_mut};
use crate::layout::{batch_shape, numel, FieldDescriptor, Shape, FIELD_ALIGNMENT};
use crate::region::{RegionInit, SharedRegion};

/// Zero-initialised, non-relocatable storage of `capacity x row_shape`
/// elements.
///
/// Created once and never resized. Buffers destined for an accelerator are
/// allocated in host memory and pinned where the platform allows it; the copy
/// to the device happens at an explicit transfer boundary. Descriptors share
/// ownership of the region, so it outlives the buffer while any of them does.
pub struct FieldBuffer {
    name: String,
    elem: ElementType,
    shape: Shape,
    device: Device,
    region: Arc<SharedRegion>,
}

impl FieldBuffer {
    pub fn new(
        name: impl Into<String>,
        elem: ElementType,
        capacity: usize,
        row_shape: &[usize],
        device: Device,
    ) -> SmemResult<Self> {
        let shape = batch_shape(capacity, row_shape);
        let elems = numel(&shape);
        if elems == 0 {
            return Err(SmemError::InvalidCapacity {
                requested: 0,
                minimum: 1,
            });
        }
        let len = elems
            .checked_mul(elem.size_of())
            .ok_or(SmemError::InvalidCapacity {
                requested: usize::MAX,
                minimum: elem.size_of(),
            })?;
        let mut region = SharedRegion::new_aligned(len, FIELD_ALIGNMENT, RegionInit::Zeroed)?;
        if !device.is_host() {
            region.pin();
        }
        Ok(Self {
            name: name.into(),
            elem,
            shape,
            device,
            region: Arc::new(region),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elem(&self) -> ElementType {
        self.elem
    }

    /// Full shape; the leading dimension is the capacity.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn row_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    pub fn capacity(&self) -> usize {
        self.shape[0]
    }

    pub fn row_bytes(&self) -> usize {
        numel(self.row_shape()) * self.elem.size_of()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_pinned(&self) -> bool {
        self.region.is_pinned()
    }

    /// Address-level description handed to native engines.
    pub fn descriptor(&self) -> FieldDescriptor {
        FieldDescriptor::for_region(
            self.name.clone(),
            self.elem,
            self.shape.clone(),
            Arc::clone(&self.region),
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_slice()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `&mut self` rules out other host slices; descriptor holders
        // only touch the bytes in the native phase (see `ForeignBuffer::new`).
        unsafe { self.region.shared_mut_slice() }
    }

    /// Typed view over every element.
    pub fn as_slice<T: Element>(&self) -> SmemResult<&[T]> {
        self.check_type::<T>()?;
        cast_slice(self.as_bytes())
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> SmemResult<&mut [T]> {
        self.check_type::<T>()?;
        cast_slice_mut(self.as_bytes_mut())
    }

    fn check_type<T: Element>(&self) -> SmemResult<()> {
        if T::TYPE != self.elem {
            return Err(crate::error::TypeError::mismatch(self.elem, T::TYPE)
                .for_field(&self.name)
                .into());
        }
        Ok(())
    }

    pub fn fill_zero(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    /// Summary line used in allocation logs.
    pub fn info(&self) -> String {
        format!(
            "key: {}, type: {}, shape: {:?}, device: {}{}",
            self.name,
            self.elem.c_name(),
            self.shape.as_slice(),
            self.device,
            if self.is_pinned() { ", pinned" } else { "" }
        )
    }
}

impl fmt::Debug for FieldBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldBuffer")
            .field("name", &self.name)
            .field("elem", &self.elem)
            .field("shape", &self.shape.as_slice())
            .field("device", &self.device)
            .field("addr", &self.region.as_ptr())
            .finish()
    }
}
