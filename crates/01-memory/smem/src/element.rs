//! Closed set of element types that may back a field buffer.
//!
//! Every buffer exchanged with a native engine holds one of four primitive
//! element types. The mapping to host-side names (C type names used by the
//! engine, numpy-style dtype codes, and Rust scalar types) is total over this
//! set; anything else is rejected with [`TypeError::UnknownType`].

use std::fmt;
use std::str::FromStr;

use crate::array::{ArrayData, Scalar};
use crate::error::TypeError;

/// Primitive element type of a field buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementType {
    Int32,
    Int64,
    Float32,
    UInt8,
}

/// Every supported element type, in declaration order.
pub const ALL_ELEMENT_TYPES: [ElementType; 4] = [
    ElementType::Int32,
    ElementType::Int64,
    ElementType::Float32,
    ElementType::UInt8,
];

impl ElementType {
    /// Size in bytes of one element.
    pub const fn size_of(self) -> usize {
        match self {
            ElementType::Int32 => 4,
            ElementType::Int64 => 8,
            ElementType::Float32 => 4,
            ElementType::UInt8 => 1,
        }
    }

    /// Canonical lowercase name (`int32`, `int64`, `float32`, `uint8`).
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Int32 => "int32",
            ElementType::Int64 => "int64",
            ElementType::Float32 => "float32",
            ElementType::UInt8 => "uint8",
        }
    }

    /// C type name reported by native engines.
    pub const fn c_name(self) -> &'static str {
        match self {
            ElementType::Int32 => "int32_t",
            ElementType::Int64 => "int64_t",
            ElementType::Float32 => "float",
            ElementType::UInt8 => "unsigned char",
        }
    }

    /// numpy-style dtype code.
    pub const fn dtype(self) -> &'static str {
        match self {
            ElementType::Int32 => "i4",
            ElementType::Int64 => "i8",
            ElementType::Float32 => "f4",
            ElementType::UInt8 => "u1",
        }
    }

    /// Resolves any of the accepted spellings into an element type.
    ///
    /// Accepts canonical names, C type names (`char` maps to `UInt8` the way
    /// engines store byte planes) and dtype codes.
    pub fn from_name(name: &str) -> Result<Self, TypeError> {
        match name.trim() {
            "int32" | "int32_t" | "int" | "i4" => Ok(ElementType::Int32),
            "int64" | "int64_t" | "long" | "i8" => Ok(ElementType::Int64),
            "float32" | "float" | "f4" => Ok(ElementType::Float32),
            "uint8" | "unsigned char" | "char" | "byte" | "u1" => Ok(ElementType::UInt8),
            other => Err(TypeError::UnknownType {
                name: other.to_owned(),
            }),
        }
    }

    /// Element type of a Rust scalar.
    pub fn of<T: Element>() -> Self {
        T::TYPE
    }

    /// Constructs a zero-filled host buffer of `len` elements of this type.
    pub fn host_buffer(self, len: usize) -> ArrayData {
        match self {
            ElementType::Int32 => ArrayData::Int32(vec![0; len]),
            ElementType::Int64 => ArrayData::Int64(vec![0; len]),
            ElementType::Float32 => ArrayData::Float32(vec![0.0; len]),
            ElementType::UInt8 => ArrayData::UInt8(vec![0; len]),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f32 {}
    impl Sealed for u8 {}
}

/// Rust scalar types that map onto an [`ElementType`].
///
/// The trait is sealed: the element set is closed and never extended outside
/// this crate.
pub trait Element:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static + sealed::Sealed
{
    /// Element type tag for this scalar.
    const TYPE: ElementType;

    #[doc(hidden)]
    fn into_data(values: Vec<Self>) -> ArrayData;
    #[doc(hidden)]
    fn data_slice(data: &ArrayData) -> Option<&[Self]>;
    #[doc(hidden)]
    fn data_slice_mut(data: &mut ArrayData) -> Option<&mut [Self]>;
    #[doc(hidden)]
    fn into_scalar(self) -> Scalar;
    #[doc(hidden)]
    fn from_scalar(scalar: Scalar) -> Option<Self>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn into_data(values: Vec<Self>) -> ArrayData {
                ArrayData::$variant(values)
            }

            fn data_slice(data: &ArrayData) -> Option<&[Self]> {
                match data {
                    ArrayData::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn data_slice_mut(data: &mut ArrayData) -> Option<&mut [Self]> {
                match data {
                    ArrayData::$variant(values) => Some(values),
                    _ => None,
                }
            }

            fn into_scalar(self) -> Scalar {
                Scalar::$variant(self)
            }

            fn from_scalar(scalar: Scalar) -> Option<Self> {
                match scalar {
                    Scalar::$variant(value) => Some(value),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(i32, Int32);
impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(u8, UInt8);
