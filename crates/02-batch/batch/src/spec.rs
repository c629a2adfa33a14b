//! Field dictionary and channel specifications.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use smem::{Device, ElementType, Shape};

use crate::error::{ConfigError, ConfigResult};

/// Interned field name. Ids are dense and stable for the dictionary's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u32);

impl FieldId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Element type and per-row shape of a field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub elem: ElementType,
    /// Shape of one row, without the batch dimension.
    pub shape: Shape,
}

impl FieldSpec {
    pub fn new(elem: ElementType, shape: &[usize]) -> Self {
        Self {
            elem,
            shape: Shape::from_slice(shape),
        }
    }
}

/// Name -> (type, row shape) dictionary shared by every channel.
#[derive(Clone, Debug, Default)]
pub struct FieldDict {
    entries: Vec<(Arc<str>, FieldSpec)>,
    index: HashMap<Arc<str>, FieldId>,
}

impl FieldDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field definition; names must be unique.
    pub fn insert(&mut self, name: &str, spec: FieldSpec) -> ConfigResult<FieldId> {
        if self.index.contains_key(name) {
            return Err(ConfigError::DuplicateDefinition(name.to_owned()));
        }
        let id = FieldId(self.entries.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.index.insert(Arc::clone(&name), id);
        self.entries.push((name, spec));
        Ok(id)
    }

    /// Builder form of [`FieldDict::insert`].
    pub fn define(mut self, name: &str, elem: ElementType, shape: &[usize]) -> ConfigResult<Self> {
        self.insert(name, FieldSpec::new(elem, shape))?;
        Ok(self)
    }

    pub fn id(&self, name: &str) -> Option<FieldId> {
        self.index.get(name).copied()
    }

    /// Name of `id`, or `None` for an id from another dictionary.
    pub fn name(&self, id: FieldId) -> Option<&str> {
        self.entries.get(id.index()).map(|(name, _)| name.as_ref())
    }

    /// Only for ids this dictionary handed out.
    pub(crate) fn shared_name(&self, id: FieldId) -> Arc<str> {
        Arc::clone(&self.entries[id.index()].0)
    }

    pub fn spec(&self, id: FieldId) -> Option<&FieldSpec> {
        self.entries.get(id.index()).map(|(_, spec)| spec)
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.id(name).and_then(|id| self.spec(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &str, &FieldSpec)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, (name, spec))| (FieldId(i as u32), &**name, spec))
    }
}

/// Declarative description of one named channel.
///
/// `None` for capacity, device, or slot count defers to the allocator's
/// [`AllocConfig`](crate::AllocConfig).
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub input: Vec<String>,
    pub reply: Vec<String>,
    pub capacity: Option<usize>,
    /// How long the engine may wait to fill a batch; zero blocks for a full one.
    pub timeout: Duration,
    pub device: Option<Device>,
    pub num_slots: Option<usize>,
    /// Smallest partial batch the engine may release.
    pub min_batchsize: usize,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: Vec::new(),
            reply: Vec::new(),
            capacity: None,
            timeout: Duration::ZERO,
            device: None,
            num_slots: None,
            min_batchsize: 1,
        }
    }

    pub fn input<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn reply<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn num_slots(mut self, slots: usize) -> Self {
        self.num_slots = Some(slots);
        self
    }

    pub fn min_batchsize(mut self, min: usize) -> Self {
        self.min_batchsize = min;
        self
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} input={:?} reply={:?}",
            self.name, self.input, self.reply
        )
    }
}
