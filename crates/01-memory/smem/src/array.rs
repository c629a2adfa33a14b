//! Owned, typed host arrays.
//!
//! [`Array`] is what callbacks build replies from and what device copies and
//! `to_arrays` snapshots hand back. It is a tagged union over the closed
//! element set plus a shape, so a value can never silently change type.

use crate::element::{Element, ElementType};
use crate::error::{SmemError, SmemResult, TypeError};
use crate::foreign::{bytes_of, bytes_of_mut};
use crate::layout::{numel, Shape};

/// Element storage for an [`Array`].
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    UInt8(Vec<u8>),
}

impl ArrayData {
    pub fn elem(&self) -> ElementType {
        match self {
            ArrayData::Int32(_) => ElementType::Int32,
            ArrayData::Int64(_) => ElementType::Int64,
            ArrayData::Float32(_) => ElementType::Float32,
            ArrayData::UInt8(_) => ElementType::UInt8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Int32(v) => v.len(),
            ArrayData::Int64(v) => v.len(),
            ArrayData::Float32(v) => v.len(),
            ArrayData::UInt8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native-endian byte view of the elements.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ArrayData::Int32(v) => bytes_of(v),
            ArrayData::Int64(v) => bytes_of(v),
            ArrayData::Float32(v) => bytes_of(v),
            ArrayData::UInt8(v) => v,
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            ArrayData::Int32(v) => bytes_of_mut(v),
            ArrayData::Int64(v) => bytes_of_mut(v),
            ArrayData::Float32(v) => bytes_of_mut(v),
            ArrayData::UInt8(v) => v,
        }
    }

    /// Decodes native-endian bytes into elements of `elem`.
    pub fn from_bytes(elem: ElementType, bytes: &[u8]) -> SmemResult<Self> {
        let size = elem.size_of();
        if bytes.len() % size != 0 {
            return Err(SmemError::LengthMismatch {
                expected: bytes.len().next_multiple_of(size),
                found: bytes.len(),
            });
        }
        let chunks = bytes.chunks_exact(size);
        Ok(match elem {
            ElementType::Int32 => ArrayData::Int32(
                chunks
                    .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::Int64 => ArrayData::Int64(
                chunks
                    .map(|c| i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            ElementType::Float32 => ArrayData::Float32(
                chunks
                    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::UInt8 => ArrayData::UInt8(bytes.to_vec()),
        })
    }
}

/// A single element of any supported type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    UInt8(u8),
}

impl Scalar {
    pub fn elem(self) -> ElementType {
        match self {
            Scalar::Int32(_) => ElementType::Int32,
            Scalar::Int64(_) => ElementType::Int64,
            Scalar::Float32(_) => ElementType::Float32,
            Scalar::UInt8(_) => ElementType::UInt8,
        }
    }

    /// Extracts the value as `T`, failing on a type mismatch.
    pub fn get<T: Element>(self) -> Result<T, TypeError> {
        let found = self.elem();
        T::from_scalar(self).ok_or_else(|| TypeError::mismatch(T::TYPE, found))
    }

    /// Repeats the scalar `len` times.
    pub fn splat(self, len: usize) -> ArrayData {
        match self {
            Scalar::Int32(v) => ArrayData::Int32(vec![v; len]),
            Scalar::Int64(v) => ArrayData::Int64(vec![v; len]),
            Scalar::Float32(v) => ArrayData::Float32(vec![v; len]),
            Scalar::UInt8(v) => ArrayData::UInt8(vec![v; len]),
        }
    }
}

impl<T: Element> From<T> for Scalar {
    fn from(value: T) -> Self {
        value.into_scalar()
    }
}

/// Owned dense array with a row-major shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    data: ArrayData,
    shape: Shape,
}

impl Array {
    /// Builds an array, checking that `values` fills `shape` exactly.
    pub fn new<T: Element>(values: Vec<T>, shape: &[usize]) -> SmemResult<Self> {
        Self::from_data(T::into_data(values), shape)
    }

    /// One-dimensional array over `values`.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let shape = Shape::from_slice(&[values.len()]);
        Self {
            data: T::into_data(values),
            shape,
        }
    }

    pub fn from_data(data: ArrayData, shape: &[usize]) -> SmemResult<Self> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(SmemError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            data,
            shape: Shape::from_slice(shape),
        })
    }

    pub fn zeros(elem: ElementType, shape: &[usize]) -> Self {
        Self {
            data: elem.host_buffer(numel(shape)),
            shape: Shape::from_slice(shape),
        }
    }

    /// Decodes a native-endian byte image with the given type and shape.
    pub fn from_bytes(elem: ElementType, shape: &[usize], bytes: &[u8]) -> SmemResult<Self> {
        Self::from_data(ArrayData::from_bytes(elem, bytes)?, shape)
    }

    pub fn elem(&self) -> ElementType {
        self.data.elem()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    pub fn into_data(self) -> ArrayData {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_bytes_mut()
    }

    /// Typed view of the elements.
    pub fn as_slice<T: Element>(&self) -> Result<&[T], TypeError> {
        T::data_slice(&self.data).ok_or_else(|| TypeError::mismatch(T::TYPE, self.elem()))
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], TypeError> {
        let found = self.elem();
        T::data_slice_mut(&mut self.data).ok_or_else(|| TypeError::mismatch(T::TYPE, found))
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TypeError> {
        self.as_slice().map(<[T]>::to_vec)
    }

    /// Element-wise transform keeping the shape; the output type may differ.
    pub fn map<T: Element, U: Element>(&self, f: impl FnMut(T) -> U) -> Result<Array, TypeError> {
        let values = self.as_slice::<T>()?.iter().copied().map(f).collect();
        Ok(Array {
            data: U::into_data(values),
            shape: self.shape.clone(),
        })
    }

    /// Same elements under a new shape with the same element count.
    pub fn reshape(self, shape: &[usize]) -> SmemResult<Self> {
        Self::from_data(self.data, shape)
    }
}
