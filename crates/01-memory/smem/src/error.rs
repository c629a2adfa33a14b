//! Error handling helpers for the shared-memory crate.
//!
//! The memory layer keeps its error surface small: allocation failures,
//! descriptor validation, bounds checks, and element type mismatches. Higher
//! layers wrap these into their own taxonomies.

use std::fmt;

use crate::element::ElementType;
use crate::layout::Shape;

/// Convenience result alias for fallible shared-memory operations.
pub type SmemResult<T, E = SmemError> = Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Errors surfaced by the shared-memory helpers.
pub enum SmemError {
    /// Requested buffer size is zero or overflows the address space.
    InvalidCapacity { requested: usize, minimum: usize },
    /// Allocation of a shared region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
    /// A foreign descriptor does not describe a usable contiguous buffer.
    InvalidDescriptor { field: String, reason: &'static str },
    /// Row index outside of the buffer's leading dimension.
    RowOutOfRange { row: usize, rows: usize },
    /// Element index outside of the buffer's shape.
    IndexOutOfRange { index: Vec<usize>, shape: Shape },
    /// Supplied value count does not match the destination.
    LengthMismatch { expected: usize, found: usize },
    /// Byte slice is not aligned for the requested element type.
    Misaligned { addr: usize, alignment: usize },
    /// Device string could not be parsed.
    InvalidDevice { spec: String },
    /// Element type or shape mismatch.
    Type(TypeError),
}

impl fmt::Display for SmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmemError::InvalidCapacity { requested, minimum } => {
                write!(
                    f,
                    "buffer size {requested} must be at least {minimum} bytes"
                )
            }
            SmemError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate shared region of {size} bytes aligned to {alignment}"
                )
            }
            SmemError::InvalidDescriptor { field, reason } => {
                write!(f, "invalid descriptor for field `{field}`: {reason}")
            }
            SmemError::RowOutOfRange { row, rows } => {
                write!(f, "row {row} out of range for {rows} rows")
            }
            SmemError::IndexOutOfRange { index, shape } => {
                write!(f, "index {index:?} out of range for shape {shape:?}")
            }
            SmemError::LengthMismatch { expected, found } => {
                write!(f, "expected {expected} elements, found {found}")
            }
            SmemError::Misaligned { addr, alignment } => {
                write!(f, "address {addr:#x} is not aligned to {alignment} bytes")
            }
            SmemError::InvalidDevice { spec } => write!(f, "invalid device `{spec}`"),
            SmemError::Type(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for SmemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SmemError::Type(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TypeError> for SmemError {
    fn from(err: TypeError) -> Self {
        SmemError::Type(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Element type or shape contract violations.
///
/// `field` is empty when the error originates below the level that knows the
/// field name; callers attach it through [`TypeError::for_field`].
pub enum TypeError {
    /// A type name that does not map onto the closed [`ElementType`] set.
    UnknownType { name: String },
    /// Element types differ between a value and its destination.
    Mismatch {
        field: String,
        expected: ElementType,
        found: ElementType,
    },
    /// Shapes differ between a value and its destination.
    ShapeMismatch {
        field: String,
        expected: Shape,
        found: Shape,
    },
}

impl TypeError {
    /// Attaches a field name to the error if none was recorded yet.
    pub fn for_field(self, name: &str) -> Self {
        match self {
            TypeError::Mismatch {
                field,
                expected,
                found,
            } if field.is_empty() => TypeError::Mismatch {
                field: name.to_owned(),
                expected,
                found,
            },
            TypeError::ShapeMismatch {
                field,
                expected,
                found,
            } if field.is_empty() => TypeError::ShapeMismatch {
                field: name.to_owned(),
                expected,
                found,
            },
            other => other,
        }
    }

    pub(crate) fn mismatch(expected: ElementType, found: ElementType) -> Self {
        TypeError::Mismatch {
            field: String::new(),
            expected,
            found,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::UnknownType { name } => write!(f, "unsupported element type `{name}`"),
            TypeError::Mismatch {
                field,
                expected,
                found,
            } => {
                if field.is_empty() {
                    write!(f, "element type mismatch: expected {expected}, found {found}")
                } else {
                    write!(
                        f,
                        "field `{field}`: element type mismatch: expected {expected}, found {found}"
                    )
                }
            }
            TypeError::ShapeMismatch {
                field,
                expected,
                found,
            } => {
                if field.is_empty() {
                    write!(f, "shape mismatch: expected {expected:?}, found {found:?}")
                } else {
                    write!(
                        f,
                        "field `{field}`: shape mismatch: expected {expected:?}, found {found:?}"
                    )
                }
            }
        }
    }
}

impl std::error::Error for TypeError {}
