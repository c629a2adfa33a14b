//! Producer-side handles: games submit one row and wait for its reply row.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use smem::{Array, ArrayData, Element, ElementType, FieldDescriptor};

use crate::error::NativeError;

/// One environment's inputs for a single cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: Vec<(String, ArrayData)>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to one row's worth of elements.
    pub fn with<T: Element>(mut self, key: impl Into<String>, values: Vec<T>) -> Self {
        self.set(key.into(), Array::from_vec(values).into_data());
        self
    }

    /// Sets a single-element field.
    pub fn scalar<T: Element>(self, key: impl Into<String>, value: T) -> Self {
        self.with(key, vec![value])
    }

    fn set(&mut self, key: String, data: ArrayData) {
        match self.values.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = data,
            None => self.values.push((key, data)),
        }
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&ArrayData> {
        self.values
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }
}

/// Reply row read back after the host released the slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowReply {
    values: Vec<(String, Array)>,
}

impl RowReply {
    pub(crate) fn push(&mut self, key: String, value: Array) {
        self.values.push((key, value));
    }

    /// Reply value for `key`, shaped like one row of the field.
    pub fn get(&self, key: &str) -> Option<&Array> {
        self.values
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    /// Typed elements for `key`; `None` if absent or of another type.
    pub fn value<T: Element>(&self, key: &str) -> Option<&[T]> {
        self.get(key)?.as_slice::<T>().ok()
    }

    /// Keys in the channel's reply order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }

    /// True for channels without reply fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-field layout a client validates rows against.
#[derive(Clone, Debug)]
pub(crate) struct InputLayout {
    pub(crate) name: String,
    pub(crate) elem: ElementType,
    pub(crate) row_elems: usize,
}

impl From<&FieldDescriptor> for InputLayout {
    fn from(desc: &FieldDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            elem: desc.elem,
            row_elems: desc.row_elems(),
        }
    }
}

/// A validated row on its way to a collector.
pub(crate) struct Request {
    /// Row bytes in the channel's input order.
    pub(crate) inputs: Vec<Vec<u8>>,
    pub(crate) reply: Sender<RowReply>,
}

/// Cloneable handle for submitting rows to one channel.
#[derive(Clone)]
pub struct Client {
    channel: Arc<str>,
    layout: Arc<[InputLayout]>,
    requests: Sender<Request>,
}

impl Client {
    pub(crate) fn new(channel: Arc<str>, layout: Arc<[InputLayout]>, requests: Sender<Request>) -> Self {
        Self {
            channel,
            layout,
            requests,
        }
    }

    /// Channel this client feeds.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Input field names in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.layout.iter().map(|field| field.name.as_str())
    }

    fn encode(&self, row: &Row) -> Result<Vec<Vec<u8>>, NativeError> {
        if let Some(extra) = row
            .keys()
            .find(|key| !self.layout.iter().any(|field| field.name == *key))
        {
            return Err(NativeError::UnknownField {
                channel: self.channel.to_string(),
                field: extra.to_owned(),
            });
        }
        self.layout
            .iter()
            .map(|field| {
                let data = row.get(&field.name).ok_or_else(|| NativeError::MissingField {
                    channel: self.channel.to_string(),
                    field: field.name.clone(),
                })?;
                if data.elem() != field.elem {
                    return Err(NativeError::Type {
                        channel: self.channel.to_string(),
                        field: field.name.clone(),
                        expected: field.elem,
                        found: data.elem(),
                    });
                }
                if data.len() != field.row_elems {
                    return Err(NativeError::Length {
                        channel: self.channel.to_string(),
                        field: field.name.clone(),
                        expected: field.row_elems,
                        found: data.len(),
                    });
                }
                Ok(data.as_bytes().to_vec())
            })
            .collect()
    }

    /// Queues `row` for the next batch of this channel.
    pub fn submit(&self, row: &Row) -> Result<PendingReply, NativeError> {
        let inputs = self.encode(row)?;
        let (reply, rx) = bounded(1);
        self.requests
            .send(Request { inputs, reply })
            .map_err(|_| self.closed())?;
        Ok(PendingReply {
            channel: Arc::clone(&self.channel),
            rx,
        })
    }

    /// Submits `row` and blocks until the host has answered it.
    pub fn call(&self, row: &Row) -> Result<RowReply, NativeError> {
        self.submit(row)?.wait()
    }

    fn closed(&self) -> NativeError {
        NativeError::Closed {
            channel: self.channel.to_string(),
        }
    }
}

/// Reply for one submitted row.
#[must_use = "the reply only arrives once the slot is stepped"]
pub struct PendingReply {
    channel: Arc<str>,
    rx: Receiver<RowReply>,
}

impl PendingReply {
    /// Blocks until the reply arrives or the engine stops.
    pub fn wait(self) -> Result<RowReply, NativeError> {
        self.rx.recv().map_err(|_| NativeError::Closed {
            channel: self.channel.to_string(),
        })
    }

    /// Like [`PendingReply::wait`] but gives the handle back on timeout.
    pub fn wait_timeout(self, timeout: Duration) -> Result<RowReply, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::Timeout(self)),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Closed(NativeError::Closed {
                channel: self.channel.to_string(),
            })),
        }
    }
}

/// Failure of [`PendingReply::wait_timeout`].
pub enum WaitError {
    /// Nothing arrived yet; the pending reply can be waited on again.
    Timeout(PendingReply),
    /// The engine stopped.
    Closed(NativeError),
}

impl std::fmt::Debug for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout(pending) => write!(f, "Timeout({})", pending.channel),
            WaitError::Closed(err) => write!(f, "Closed({err})"),
        }
    }
}
