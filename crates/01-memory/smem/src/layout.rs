//! Shapes, byte strides, and the address-level descriptor handed to engines.
//!
//! A [`FieldDescriptor`] is the only thing a native engine ever receives for a
//! buffer: base address, byte length, element type, shape, and per-dimension
//! byte strides. Buffers are always dense and row-major with the batch
//! dimension first.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::element::ElementType;
use crate::error::{SmemError, SmemResult};
use crate::region::SharedRegion;

/// Alignment enforced for the base address of every field buffer.
pub const FIELD_ALIGNMENT: usize = 64;

/// Extents of a buffer, leading dimension first.
pub type Shape = SmallVec<[usize; 4]>;
/// Per-dimension byte strides matching a [`Shape`].
pub type Strides = SmallVec<[usize; 4]>;

/// Number of elements covered by `shape` (1 for a scalar shape).
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Dense row-major byte strides for `shape`.
pub fn byte_strides(shape: &[usize], elem: ElementType) -> Strides {
    let mut strides: Strides = SmallVec::from_elem(0, shape.len());
    let mut acc = elem.size_of();
    for (dim, extent) in shape.iter().enumerate().rev() {
        strides[dim] = acc;
        acc *= *extent;
    }
    strides
}

/// `shape` with every extent of 1 removed.
pub fn squeezed(shape: &[usize]) -> Shape {
    shape.iter().copied().filter(|&extent| extent != 1).collect()
}

/// Prepends the batch dimension to a per-row shape.
pub fn batch_shape(rows: usize, row_shape: &[usize]) -> Shape {
    let mut shape = Shape::with_capacity(row_shape.len() + 1);
    shape.push(rows);
    shape.extend_from_slice(row_shape);
    shape
}

/// Shared ownership of the region a descriptor points into.
///
/// Two descriptors compare equal only when they share the same region.
#[derive(Clone)]
pub(crate) struct RegionRef(Arc<SharedRegion>);

impl PartialEq for RegionRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RegionRef {}

impl fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}+{}", self.0.as_ptr(), self.0.len())
    }
}

/// Address-level description of one field buffer.
///
/// Only [`crate::FieldBuffer`] hands these out. Every descriptor keeps the
/// buffer's region alive, so the memory it names cannot be freed while an
/// engine still holds it, and [`FieldDescriptor::validate`] confines the
/// addressed bytes to that region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name, used for diagnostics only.
    pub name: String,
    /// Element type stored in the buffer.
    pub elem: ElementType,
    /// Full buffer shape; `shape[0]` is the channel capacity.
    pub shape: Shape,
    /// Byte strides per dimension.
    pub strides: Strides,
    /// Base address of the first element.
    pub addr: usize,
    /// Total byte length covered by the descriptor.
    pub len_bytes: usize,
    region: RegionRef,
}

impl FieldDescriptor {
    /// Dense descriptor covering the whole of `region`.
    pub(crate) fn for_region(
        name: impl Into<String>,
        elem: ElementType,
        shape: Shape,
        region: Arc<SharedRegion>,
    ) -> Self {
        Self {
            name: name.into(),
            elem,
            strides: byte_strides(&shape, elem),
            shape,
            addr: region.as_ptr() as usize,
            len_bytes: region.len(),
            region: RegionRef(region),
        }
    }

    /// Number of rows (the leading dimension).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per row.
    pub fn row_elems(&self) -> usize {
        self.shape.get(1..).map_or(0, numel)
    }

    /// Bytes per row.
    pub fn row_bytes(&self) -> usize {
        self.row_elems() * self.elem.size_of()
    }

    /// Byte offset of the element at `index`, honoring the recorded strides.
    pub fn offset_of(&self, index: &[usize]) -> SmemResult<usize> {
        if index.len() != self.shape.len()
            || index.iter().zip(&self.shape).any(|(&i, &extent)| i >= extent)
        {
            return Err(SmemError::IndexOutOfRange {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        Ok(index
            .iter()
            .zip(&self.strides)
            .map(|(&i, &stride)| i * stride)
            .sum())
    }

    /// Checks that the descriptor covers a dense, aligned, non-empty buffer.
    pub fn validate(&self) -> SmemResult<()> {
        let invalid = |reason| SmemError::InvalidDescriptor {
            field: self.name.clone(),
            reason,
        };
        if self.addr == 0 {
            return Err(invalid("null base address"));
        }
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(invalid("shape must have a positive leading dimension"));
        }
        if self.strides.len() != self.shape.len() {
            return Err(invalid("stride count does not match shape rank"));
        }
        if self.strides != byte_strides(&self.shape, self.elem) {
            return Err(invalid("strides are not dense row-major"));
        }
        if self.len_bytes != numel(&self.shape) * self.elem.size_of() {
            return Err(invalid("byte length does not match shape"));
        }
        if self.addr % self.elem.size_of() != 0 {
            return Err(invalid("base address is misaligned for the element type"));
        }
        if !self.region.0.contains(self.addr, self.len_bytes) {
            return Err(invalid("addressed bytes lie outside the owning region"));
        }
        Ok(())
    }

    /// One-line human readable summary.
    pub fn info(&self) -> String {
        format!(
            "key: {}, type: {}, shape: {:?}, strides: {:?}",
            self.name,
            self.elem.c_name(),
            self.shape.as_slice(),
            self.strides.as_slice()
        )
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionInit;
    use smallvec::smallvec;

    fn descriptor(shape: &[usize], elem: ElementType) -> FieldDescriptor {
        let len = numel(shape) * elem.size_of();
        let region = SharedRegion::new_aligned(len, FIELD_ALIGNMENT, RegionInit::Zeroed)
            .expect("region");
        FieldDescriptor::for_region("obs", elem, shape.iter().copied().collect(), Arc::new(region))
    }

    #[test]
    fn strides_are_dense_row_major() {
        let strides = byte_strides(&[4, 3, 2], ElementType::Float32);
        assert_eq!(strides.as_slice(), &[24, 8, 4]);
        let strides = byte_strides(&[5], ElementType::UInt8);
        assert_eq!(strides.as_slice(), &[1]);
    }

    #[test]
    fn squeeze_drops_unit_extents() {
        let shape: Shape = smallvec![3, 1, 2, 1];
        assert_eq!(squeezed(&shape).as_slice(), &[3, 2]);
        assert!(squeezed(&[1, 1]).is_empty());
    }

    #[test]
    fn offsets_follow_strides() {
        let desc = descriptor(&[4, 3], ElementType::Int64);
        assert_eq!(desc.offset_of(&[0, 0]), Ok(0));
        assert_eq!(desc.offset_of(&[2, 1]), Ok(2 * 24 + 8));
        assert!(matches!(
            desc.offset_of(&[4, 0]),
            Err(SmemError::IndexOutOfRange { .. })
        ));
        assert!(desc.offset_of(&[1]).is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_descriptors() {
        let desc = descriptor(&[4, 1], ElementType::Int32);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.row_elems(), 1);
        assert_eq!(desc.row_bytes(), 4);

        let mut bad = desc.clone();
        bad.len_bytes += 4;
        assert!(bad.validate().is_err());

        let mut bad = desc.clone();
        bad.addr = 0;
        assert!(bad.validate().is_err());

        let mut bad = desc.clone();
        bad.strides[0] = 8;
        assert!(bad.validate().is_err());

        let mut bad = desc.clone();
        bad.addr += FIELD_ALIGNMENT;
        assert!(matches!(
            bad.validate(),
            Err(SmemError::InvalidDescriptor { reason, .. }) if reason.contains("outside")
        ));
    }

    #[test]
    fn descriptors_are_equal_only_over_the_same_region() {
        let a = descriptor(&[2, 1], ElementType::Int32);
        let b = descriptor(&[2, 1], ElementType::Int32);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
