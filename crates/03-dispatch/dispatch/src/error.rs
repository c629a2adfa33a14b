use std::fmt;

use batch::{BatchError, ConfigError, SlotId};
use smem::TypeError;
use thiserror::Error;

use crate::engine::EngineError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lifecycle state of a [`Dispatcher`](crate::Dispatcher).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Running,
    Stopped,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Unstarted => "unstarted",
            State::Running => "running",
            State::Stopped => "stopped",
        })
    }
}

/// Slots left without a callback when the loop was about to start.
#[derive(Debug, Error)]
#[error("no callback registered for {}", describe_missing(.missing))]
pub struct CoverageError {
    /// `(slot, channel)` for every uncovered slot.
    pub missing: Vec<(SlotId, String)>,
}

fn describe_missing(missing: &[(SlotId, String)]) -> String {
    missing
        .iter()
        .map(|(slot, channel)| format!("slot {slot} (channel `{channel}`)"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-cycle contract violations.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("slot {0} does not belong to any channel")]
    UnknownSlot(SlotId),

    #[error("channel `{channel}`: no callback for slot {slot}")]
    NoCallback { slot: SlotId, channel: String },

    #[error("channel `{channel}` declares no reply fields but the callback returned {keys:?}")]
    UnexpectedReply { channel: String, keys: Vec<String> },

    #[error("channel `{channel}` expects reply fields {expected:?} but the callback returned none")]
    MissingReply {
        channel: String,
        expected: Vec<String>,
    },

    #[error("channel `{channel}`: effective size {size} outside 1..={capacity}")]
    InvalidSize {
        channel: String,
        size: usize,
        capacity: usize,
    },

    #[error("channel `{channel}`: callback failed: {source:#}")]
    Callback {
        channel: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("channel `{channel}`: {source}")]
    Batch {
        channel: String,
        #[source]
        source: BatchError,
    },

    #[error("cannot {action} a {state} dispatcher")]
    Lifecycle { state: State, action: &'static str },
}

/// A reply for a reply channel left required keys unset.
#[derive(Debug, Error)]
#[error("channel `{channel}`: reply is missing keys {missing:?}")]
pub struct ReconciliationError {
    pub channel: String,
    pub missing: Vec<String>,
}

/// Everything that can escape [`Dispatcher::run`](crate::Dispatcher::run)
/// or dispatcher construction.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("channel `{channel}`: {source}")]
    Type {
        channel: String,
        #[source]
        source: TypeError,
    },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl Error {
    /// Splits batch errors into type errors and other dispatch failures.
    pub(crate) fn from_batch(channel: &str, err: BatchError) -> Self {
        match err {
            BatchError::Type(source) => Error::Type {
                channel: channel.to_owned(),
                source,
            },
            source => DispatchError::Batch {
                channel: channel.to_owned(),
                source,
            }
            .into(),
        }
    }
}
