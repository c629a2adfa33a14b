//! Host-side dispatch loop over an [`Engine`].
//!
//! Every cycle waits for one ready slot, hands a zero-copy input [`Batch`]
//! to the callback registered for that slot, reconciles the returned
//! [`Reply`] into the slot's reply buffers and releases the slot.
//!
//! [`Batch`]: batch::Batch
//! [`Reply`]: batch::Reply

mod callback;
mod dispatcher;
mod engine;
mod error;
mod stats;

pub use callback::Callback;
pub use dispatcher::{Cycle, Dispatcher, DispatcherBuilder, DispatcherConfig, StopHandle};
pub use engine::{Engine, EngineError, ReadySlot};
pub use error::{CoverageError, DispatchError, Error, ReconciliationError, Result, State};
pub use stats::DispatchStats;

#[cfg(test)]
mod tests;
