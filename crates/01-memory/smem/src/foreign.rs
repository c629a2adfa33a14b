//! Bounds-checked access to memory described by a [`FieldDescriptor`].
//!
//! This is the only module that turns raw addresses into reads and writes.
//! A native engine receives descriptors from the allocator and writes rows
//! through a [`ForeignBuffer`]; everything above this layer works with
//! slices.

use std::mem::{align_of, size_of_val};
use std::ptr::{self, NonNull};

use crate::element::Element;
use crate::error::{SmemError, SmemResult, TypeError};
use crate::layout::FieldDescriptor;

/// Byte view of a typed slice.
pub fn bytes_of<T: Element>(values: &[T]) -> &[u8] {
    // SAFETY: every `Element` is a primitive without padding, so all of its
    // bytes are initialised.
    unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), size_of_val(values)) }
}

/// Mutable byte view of a typed slice.
pub fn bytes_of_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    let len = size_of_val(values);
    // SAFETY: as for `bytes_of`; additionally any byte pattern is a valid
    // value for every `Element`, so arbitrary writes cannot create invalid
    // values.
    unsafe { std::slice::from_raw_parts_mut(values.as_mut_ptr().cast::<u8>(), len) }
}

fn check_cast<T: Element>(bytes: &[u8]) -> SmemResult<usize> {
    let size = T::TYPE.size_of();
    let addr = bytes.as_ptr() as usize;
    if addr % align_of::<T>() != 0 {
        return Err(SmemError::Misaligned {
            addr,
            alignment: align_of::<T>(),
        });
    }
    if bytes.len() % size != 0 {
        return Err(SmemError::LengthMismatch {
            expected: bytes.len().next_multiple_of(size),
            found: bytes.len(),
        });
    }
    Ok(bytes.len() / size)
}

/// Reinterprets an aligned byte slice as elements of `T`.
pub fn cast_slice<T: Element>(bytes: &[u8]) -> SmemResult<&[T]> {
    let len = check_cast::<T>(bytes)?;
    // SAFETY: alignment and length were checked and every bit pattern is a
    // valid `T`.
    Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), len) })
}

/// Mutable counterpart of [`cast_slice`].
pub fn cast_slice_mut<T: Element>(bytes: &mut [u8]) -> SmemResult<&mut [T]> {
    let len = check_cast::<T>(bytes)?;
    // SAFETY: as for `cast_slice`, with exclusivity inherited from `bytes`.
    Ok(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), len) })
}

/// Validated handle on a buffer owned by someone else.
///
/// Holds a copy of the descriptor and the checked base pointer. Every access
/// is bounds-checked against the descriptor's shape and element type.
#[derive(Debug)]
pub struct ForeignBuffer {
    desc: FieldDescriptor,
    base: NonNull<u8>,
}

// SAFETY: the descriptor owns a share of the region; callers of `new` promise
// exclusive access for the phases in which this handle is used.
unsafe impl Send for ForeignBuffer {}

impl ForeignBuffer {
    /// Wraps a descriptor after validating it.
    ///
    /// The handle keeps the descriptor's region allocated for as long as it
    /// lives, and validation confines it to that region.
    ///
    /// # Safety
    ///
    /// Reads and writes through the handle must not overlap in time with any
    /// other access to the same bytes.
    pub unsafe fn new(desc: FieldDescriptor) -> SmemResult<Self> {
        desc.validate()?;
        let base = NonNull::new(desc.addr as *mut u8).ok_or(SmemError::InvalidDescriptor {
            field: desc.name.clone(),
            reason: "null base address",
        })?;
        Ok(Self { desc, base })
    }

    pub fn descriptor(&self) -> &FieldDescriptor {
        &self.desc
    }

    pub fn rows(&self) -> usize {
        self.desc.rows()
    }

    fn check_type<T: Element>(&self) -> SmemResult<()> {
        if T::TYPE != self.desc.elem {
            return Err(TypeError::mismatch(self.desc.elem, T::TYPE)
                .for_field(&self.desc.name)
                .into());
        }
        Ok(())
    }

    fn row_offset(&self, row: usize) -> SmemResult<usize> {
        let rows = self.rows();
        if row >= rows {
            return Err(SmemError::RowOutOfRange { row, rows });
        }
        Ok(row * self.desc.strides[0])
    }

    /// Copies raw bytes into one row; `bytes` must be exactly one row long.
    pub fn write_row_bytes(&mut self, row: usize, bytes: &[u8]) -> SmemResult<()> {
        let offset = self.row_offset(row)?;
        let row_bytes = self.desc.row_bytes();
        if bytes.len() != row_bytes {
            return Err(SmemError::LengthMismatch {
                expected: row_bytes,
                found: bytes.len(),
            });
        }
        // SAFETY: `offset + row_bytes <= len_bytes` because the row index is in
        // range and the descriptor is dense; `new` guarantees exclusivity.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(offset), row_bytes);
        }
        Ok(())
    }

    pub fn read_row_bytes(&self, row: usize) -> SmemResult<Vec<u8>> {
        let offset = self.row_offset(row)?;
        let mut out = vec![0u8; self.desc.row_bytes()];
        // SAFETY: see `write_row_bytes`.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }

    /// Writes one row of typed values.
    pub fn write_row<T: Element>(&mut self, row: usize, values: &[T]) -> SmemResult<()> {
        self.check_type::<T>()?;
        let expected = self.desc.row_elems();
        if values.len() != expected {
            return Err(SmemError::LengthMismatch {
                expected,
                found: values.len(),
            });
        }
        self.write_row_bytes(row, bytes_of(values))
    }

    /// Reads one row of typed values.
    pub fn read_row<T: Element>(&self, row: usize) -> SmemResult<Vec<T>> {
        self.check_type::<T>()?;
        let offset = self.row_offset(row)?;
        let len = self.desc.row_elems();
        let mut out = vec![T::default(); len];
        // SAFETY: the row lies inside the buffer and `out` holds exactly
        // `row_bytes` bytes; unaligned source is tolerated by byte copy.
        unsafe {
            ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                out.as_mut_ptr().cast::<u8>(),
                self.desc.row_bytes(),
            );
        }
        Ok(out)
    }

    /// Writes a single element addressed by a full index.
    pub fn write_value<T: Element>(&mut self, index: &[usize], value: T) -> SmemResult<()> {
        self.check_type::<T>()?;
        let offset = self.desc.offset_of(index)?;
        // SAFETY: `offset_of` bounds-checks the index against the shape.
        unsafe { ptr::write_unaligned(self.base.as_ptr().add(offset).cast::<T>(), value) };
        Ok(())
    }

    pub fn read_value<T: Element>(&self, index: &[usize]) -> SmemResult<T> {
        self.check_type::<T>()?;
        let offset = self.desc.offset_of(index)?;
        // SAFETY: see `write_value`.
        Ok(unsafe { ptr::read_unaligned(self.base.as_ptr().add(offset).cast::<T>()) })
    }

    /// Zeroes the whole buffer.
    pub fn fill_zero(&mut self) {
        // SAFETY: the descriptor covers exactly `len_bytes` bytes.
        unsafe { ptr::write_bytes(self.base.as_ptr(), 0, self.desc.len_bytes) };
    }
}
