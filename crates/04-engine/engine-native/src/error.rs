use batch::SlotId;
use smem::{ElementType, SmemError};
use thiserror::Error;

/// Errors raised on the producer side of the reference engines.
#[derive(Debug, Error)]
pub enum NativeError {
    /// No slot of that channel was registered with the engine.
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// The slot id was never registered with the engine.
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),

    /// A row names a field the channel does not take as input.
    #[error("channel `{channel}` has no input field `{field}`")]
    UnknownField {
        /// Channel the row was submitted to.
        channel: String,
        /// Offending key.
        field: String,
    },

    /// A row left out one of the channel's input fields.
    #[error("channel `{channel}`: row is missing input field `{field}`")]
    MissingField {
        /// Channel the row was submitted to.
        channel: String,
        /// Field without a value.
        field: String,
    },

    /// A row value has the wrong element type.
    #[error("channel `{channel}` field `{field}`: expected {expected}, found {found}")]
    Type {
        /// Channel the row was submitted to.
        channel: String,
        /// Offending field.
        field: String,
        /// Declared element type.
        expected: ElementType,
        /// Element type of the submitted value.
        found: ElementType,
    },

    /// A row value does not hold exactly one row of elements.
    #[error("channel `{channel}` field `{field}`: expected {expected} elements per row, found {found}")]
    Length {
        /// Channel the row was submitted to.
        channel: String,
        /// Offending field.
        field: String,
        /// Elements per row.
        expected: usize,
        /// Elements submitted.
        found: usize,
    },

    /// The engine stopped before the row was answered.
    #[error("channel `{channel}` is closed")]
    Closed {
        /// Channel the row was submitted to.
        channel: String,
    },

    /// Descriptor access failed.
    #[error(transparent)]
    Memory(#[from] SmemError),
}
