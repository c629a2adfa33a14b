//! Buffer allocation for every slot of every channel, and the slot index.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use smem::{Device, FieldBuffer, FieldDescriptor};

use crate::batch::{Batch, BatchMeta, FieldView, ViewData};
use crate::config::{AllocConfig, ExchangeConfig};
use crate::error::{BatchError, BatchResult, ConfigError, ConfigResult};
use crate::spec::{ChannelSpec, FieldDict, FieldId};

/// Globally unique identifier of one buffer instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One concrete buffer instance backing a channel.
#[derive(Debug)]
pub struct Slot {
    meta: BatchMeta,
    /// Position among the channel's duplicates.
    replica: usize,
    timeout: Duration,
    min_batchsize: usize,
    buffers: Vec<(FieldId, FieldBuffer)>,
    input: SmallVec<[usize; 8]>,
    reply: SmallVec<[usize; 8]>,
}

impl Slot {
    pub fn id(&self) -> SlotId {
        self.meta.slot
    }

    pub fn channel(&self) -> &str {
        &self.meta.channel
    }

    pub fn label_idx(&self) -> usize {
        self.meta.label_idx
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub fn capacity(&self) -> usize {
        self.meta.capacity
    }

    pub fn device(&self) -> Device {
        self.meta.device
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn min_batchsize(&self) -> usize {
        self.min_batchsize
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    pub fn input_keys(&self) -> impl Iterator<Item = &str> {
        self.input.iter().map(|&i| self.buffers[i].1.name())
    }

    pub fn reply_keys(&self) -> impl Iterator<Item = &str> {
        self.reply.iter().map(|&i| self.buffers[i].1.name())
    }

    pub fn buffer(&self, key: &str) -> Option<&FieldBuffer> {
        self.buffers
            .iter()
            .map(|(_, buffer)| buffer)
            .find(|buffer| buffer.name() == key)
    }

    /// Descriptors and scheduling parameters handed to the engine.
    pub fn buffer_group(&self) -> BufferGroup {
        let describe = |indices: &SmallVec<[usize; 8]>| {
            indices
                .iter()
                .map(|&i| self.buffers[i].1.descriptor())
                .collect::<Vec<_>>()
        };
        BufferGroup {
            slot: self.id(),
            channel: self.channel().to_owned(),
            label_idx: self.label_idx(),
            capacity: self.capacity(),
            timeout: self.timeout,
            min_batchsize: self.min_batchsize,
            inputs: describe(&self.input),
            replies: describe(&self.reply),
        }
    }

    pub fn info(&self) -> String {
        let mut out = format!(
            "label: {}, idx: {}, replica: {}, batchsize: {}, timeout_us: {}, device: {}",
            self.channel(),
            self.id(),
            self.replica,
            self.capacity(),
            self.timeout.as_micros(),
            self.device()
        );
        for (_, buffer) in &self.buffers {
            out.push_str("\n  ");
            out.push_str(&buffer.info());
        }
        out
    }

    fn check_rows(&self, n: usize) -> BatchResult<()> {
        if n > self.capacity() {
            return Err(BatchError::SizeOutOfRange {
                requested: n,
                available: self.capacity(),
            });
        }
        Ok(())
    }
}

/// Allocation request for one slot, as seen by a native engine.
#[derive(Clone, Debug)]
pub struct BufferGroup {
    pub slot: SlotId,
    pub channel: String,
    pub label_idx: usize,
    pub capacity: usize,
    pub timeout: Duration,
    pub min_batchsize: usize,
    pub inputs: Vec<FieldDescriptor>,
    pub replies: Vec<FieldDescriptor>,
}

impl BufferGroup {
    pub fn has_reply(&self) -> bool {
        !self.replies.is_empty()
    }
}

#[derive(Debug)]
struct Channel {
    name: Arc<str>,
    slots: Vec<SlotId>,
}

/// Owns every field buffer and the channel/slot index.
#[derive(Debug)]
pub struct Allocator {
    fields: FieldDict,
    channels: Vec<Channel>,
    by_name: HashMap<Arc<str>, usize>,
    slots: Vec<Slot>,
}

impl Allocator {
    /// Allocates zeroed buffers for every field of every slot.
    ///
    /// Each channel gets `num_slots` independent slots; the field set of a
    /// slot is the union of the channel's input and reply lists, so a field
    /// named in both shares one buffer.
    pub fn new(specs: Vec<ChannelSpec>, fields: FieldDict, config: AllocConfig) -> ConfigResult<Self> {
        let mut allocator = Self {
            fields,
            channels: Vec::with_capacity(specs.len()),
            by_name: HashMap::with_capacity(specs.len()),
            slots: Vec::new(),
        };
        for spec in &specs {
            allocator.add_channel(spec, &config)?;
        }
        tracing::debug!(
            channels = allocator.channels.len(),
            slots = allocator.slots.len(),
            "allocated exchange buffers"
        );
        Ok(allocator)
    }

    /// Resolves a serialized config and allocates it.
    pub fn from_config(config: &ExchangeConfig) -> ConfigResult<Self> {
        Self::new(
            config.channel_specs()?,
            config.field_dict()?,
            config.alloc.clone(),
        )
    }

    fn resolve_list(
        &self,
        spec: &ChannelSpec,
        names: &[String],
        list: &'static str,
    ) -> ConfigResult<SmallVec<[FieldId; 8]>> {
        let mut ids = SmallVec::<[FieldId; 8]>::new();
        for name in names {
            let id = self.fields.id(name).ok_or_else(|| ConfigError::UnknownField {
                channel: spec.name.clone(),
                field: name.clone(),
            })?;
            if ids.contains(&id) {
                return Err(ConfigError::DuplicateField {
                    channel: spec.name.clone(),
                    field: name.clone(),
                    list,
                });
            }
            ids.push(id);
        }
        Ok(ids)
    }

    fn add_channel(&mut self, spec: &ChannelSpec, config: &AllocConfig) -> ConfigResult<()> {
        if self.by_name.contains_key(spec.name.as_str()) {
            return Err(ConfigError::DuplicateChannel(spec.name.clone()));
        }
        let capacity = spec.capacity.unwrap_or(config.default_capacity);
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity {
                channel: spec.name.clone(),
            });
        }
        let num_slots = spec.num_slots.unwrap_or(config.default_slots);
        if num_slots == 0 {
            return Err(ConfigError::ZeroSlots {
                channel: spec.name.clone(),
            });
        }
        let min_batchsize = spec.min_batchsize.max(1);
        if min_batchsize > capacity {
            return Err(ConfigError::InvalidMinBatch {
                channel: spec.name.clone(),
                min: min_batchsize,
                capacity,
            });
        }
        let device = spec.device.unwrap_or(config.default_device);
        let input = self.resolve_list(spec, &spec.input, "input")?;
        let reply = self.resolve_list(spec, &spec.reply, "reply")?;

        let mut union = input.clone();
        union.extend(reply.iter().copied().filter(|id| !input.contains(id)));
        let position = |id: &FieldId| union.iter().position(|u| u == id).unwrap_or_default();
        let input_idx: SmallVec<[usize; 8]> = input.iter().map(position).collect();
        let reply_idx: SmallVec<[usize; 8]> = reply.iter().map(position).collect();

        let label_idx = self.channels.len();
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let mut slot_ids = Vec::with_capacity(num_slots);
        for replica in 0..num_slots {
            let id = SlotId(self.slots.len() as u32);
            let buffers = union
                .iter()
                .map(|&field| -> ConfigResult<(FieldId, FieldBuffer)> {
                    let (Some(field_name), Some(field_spec)) =
                        (self.fields.name(field), self.fields.spec(field))
                    else {
                        return Err(ConfigError::UnknownField {
                            channel: spec.name.clone(),
                            field: format!("#{}", field.index()),
                        });
                    };
                    let buffer = FieldBuffer::new(
                        field_name,
                        field_spec.elem,
                        capacity,
                        &field_spec.shape,
                        device,
                    )?;
                    Ok((field, buffer))
                })
                .collect::<ConfigResult<Vec<_>>>()?;
            let slot = Slot {
                meta: BatchMeta {
                    slot: id,
                    channel: Arc::clone(&name),
                    label_idx,
                    capacity,
                    device,
                },
                replica,
                timeout: spec.timeout,
                min_batchsize,
                buffers,
                input: input_idx.clone(),
                reply: reply_idx.clone(),
            };
            tracing::debug!("{}", slot.info());
            self.slots.push(slot);
            slot_ids.push(id);
        }
        self.by_name.insert(Arc::clone(&name), self.channels.len());
        self.channels.push(Channel {
            name,
            slots: slot_ids,
        });
        Ok(())
    }

    pub fn fields(&self) -> &FieldDict {
        &self.fields
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(id.index())
    }

    /// Channel owning `id`; total over allocated slots.
    pub fn channel_of(&self, id: SlotId) -> Option<&str> {
        self.slot(id).map(Slot::channel)
    }

    /// Slots of a channel in replica order.
    pub fn slots_of(&self, channel: &str) -> Option<&[SlotId]> {
        self.by_name
            .get(channel)
            .map(|&idx| self.channels[idx].slots.as_slice())
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.by_name.contains_key(channel)
    }

    /// Channel names in declaration order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|channel| &*channel.name)
    }

    pub fn buffer_groups(&self) -> Vec<BufferGroup> {
        self.slots.iter().map(Slot::buffer_group).collect()
    }

    fn require(&self, id: SlotId) -> BatchResult<&Slot> {
        self.slot(id).ok_or(BatchError::UnknownSlot(id))
    }

    /// Read-only view of the first `n` rows of a slot's input fields.
    pub fn input_batch(&self, id: SlotId, n: usize) -> BatchResult<Batch<'_>> {
        let slot = self.require(id)?;
        slot.check_rows(n)?;
        let fields = slot
            .input
            .iter()
            .map(|&i| {
                let (field, buffer) = &slot.buffers[i];
                FieldView::new(
                    *field,
                    self.fields.shared_name(*field),
                    buffer.elem(),
                    buffer.row_shape(),
                    ViewData::Shared(&buffer.as_bytes()[..n * buffer.row_bytes()]),
                )
            })
            .collect();
        Ok(Batch::from_parts(&slot.meta, n, fields))
    }

    /// Writable view of the first `n` rows of a slot's reply fields, or
    /// `None` when the channel declares no reply fields.
    pub fn reply_batch(&mut self, id: SlotId, n: usize) -> BatchResult<Option<Batch<'_>>> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(BatchError::UnknownSlot(id))?;
        slot.check_rows(n)?;
        if slot.reply.is_empty() {
            return Ok(None);
        }
        let fields_dict = &self.fields;
        let reply = &slot.reply;
        let mut fields = Vec::with_capacity(reply.len());
        for (i, (field, buffer)) in slot.buffers.iter_mut().enumerate() {
            if !reply.contains(&i) {
                continue;
            }
            let row_bytes = buffer.row_bytes();
            let elem = buffer.elem();
            let row_shape = smem::Shape::from_slice(buffer.row_shape());
            fields.push(FieldView::new(
                *field,
                fields_dict.shared_name(*field),
                elem,
                &row_shape,
                ViewData::Exclusive(&mut buffer.as_bytes_mut()[..n * row_bytes]),
            ));
        }
        Ok(Some(Batch::from_parts(&slot.meta, n, fields)))
    }

    pub fn info(&self) -> String {
        self.slots
            .iter()
            .map(Slot::info)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
