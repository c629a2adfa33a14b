#![deny(missing_docs)]
//! Native reference engines shared by integration tests and demos.
//!
//! * [`ThreadedEngine`] – one collector thread per slot batches rows that
//!   game threads submit through a [`Client`], hands the slot to the host and
//!   scatters the reply rows back once the host steps it.
//! * [`ManualEngine`] – a scripted engine for deterministic tests.

mod client;
mod collector;
mod error;
mod manual;
mod threaded;

pub use client::{Client, PendingReply, Row, RowReply, WaitError};
pub use error::NativeError;
pub use manual::ManualEngine;
pub use threaded::{NativeStats, ThreadedEngine};
