use std::path::PathBuf;

use smem::{SmemError, TypeError};
use thiserror::Error;

use crate::allocator::SlotId;

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type BatchResult<T> = Result<T, BatchError>;

/// Construction-time errors: bad channel or field specifications.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("channel `{channel}` references unknown field `{field}`")]
    UnknownField { channel: String, field: String },

    #[error("channel `{channel}`: capacity must be positive")]
    InvalidCapacity { channel: String },

    #[error("duplicate channel `{0}`")]
    DuplicateChannel(String),

    #[error("channel `{channel}`: field `{field}` listed twice in {list} fields")]
    DuplicateField {
        channel: String,
        field: String,
        list: &'static str,
    },

    #[error("field `{0}` defined twice")]
    DuplicateDefinition(String),

    #[error("channel `{channel}`: num_slots must be at least 1")]
    ZeroSlots { channel: String },

    #[error("channel `{channel}`: min_batchsize {min} exceeds capacity {capacity}")]
    InvalidMinBatch {
        channel: String,
        min: usize,
        capacity: usize,
    },

    #[error("channel `{channel}`: invalid device `{spec}`")]
    InvalidDevice { channel: String, spec: String },

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("field `{field}`: {source}")]
    Type {
        field: String,
        #[source]
        source: TypeError,
    },

    #[error("buffer allocation failed: {0}")]
    Memory(#[from] SmemError),

    #[error("malformed config: {0}")]
    Parse(String),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while building, slicing, or writing batches.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),

    #[error("requested {requested} rows but only {available} are available")]
    SizeOutOfRange { requested: usize, available: usize },

    #[error("batch has no field `{0}`")]
    MissingField(String),

    #[error("field `{field}`: index {index} out of range for extent {extent}")]
    IndexOutOfRange {
        field: String,
        index: usize,
        extent: usize,
    },

    #[error("field `{0}` is read-only in this batch")]
    ReadOnly(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Memory(SmemError),
}

impl From<SmemError> for BatchError {
    fn from(err: SmemError) -> Self {
        match err {
            SmemError::Type(err) => BatchError::Type(err),
            other => BatchError::Memory(other),
        }
    }
}
