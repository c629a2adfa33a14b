//! Zero-copy batch views over a slot's field buffers.
//!
//! A [`Batch`] borrows the first `len()` rows of each field for one dispatch
//! cycle. Input batches are read-only views, reply batches are exclusive
//! views, and [`Batch::to_device`] produces an owned copy.

use std::fmt;
use std::sync::Arc;

use smem::foreign::{cast_slice, cast_slice_mut};
use smem::{batch_shape, numel, Array, Device, Element, ElementType, Shape, TypeError};

use crate::allocator::SlotId;
use crate::error::{BatchError, BatchResult};
use crate::spec::FieldId;

pub(crate) enum ViewData<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
    Owned(Array),
}

impl ViewData<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            ViewData::Shared(bytes) => *bytes,
            ViewData::Exclusive(bytes) => &**bytes,
            ViewData::Owned(array) => array.as_bytes(),
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            ViewData::Shared(_) => None,
            ViewData::Exclusive(bytes) => Some(&mut **bytes),
            ViewData::Owned(array) => Some(array.as_bytes_mut()),
        }
    }
}

/// One field of a batch: its identity, type, and the rows in view.
pub struct FieldView<'a> {
    id: FieldId,
    name: Arc<str>,
    elem: ElementType,
    row_shape: Shape,
    data: ViewData<'a>,
}

impl<'a> FieldView<'a> {
    pub(crate) fn new(
        id: FieldId,
        name: Arc<str>,
        elem: ElementType,
        row_shape: &[usize],
        data: ViewData<'a>,
    ) -> Self {
        Self {
            id,
            name,
            elem,
            row_shape: Shape::from_slice(row_shape),
            data,
        }
    }

    pub fn id(&self) -> FieldId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elem(&self) -> ElementType {
        self.elem
    }

    pub fn row_shape(&self) -> &[usize] {
        &self.row_shape
    }

    pub fn row_bytes(&self) -> usize {
        numel(&self.row_shape) * self.elem.size_of()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.data, ViewData::Shared(_))
    }

    pub(crate) fn bytes_mut(&mut self) -> BatchResult<&mut [u8]> {
        let name = &self.name;
        self.data
            .bytes_mut()
            .ok_or_else(|| BatchError::ReadOnly(name.to_string()))
    }

    fn check_type<T: Element>(&self) -> Result<(), TypeError> {
        if T::TYPE != self.elem {
            return Err(TypeError::Mismatch {
                field: self.name.to_string(),
                expected: self.elem,
                found: T::TYPE,
            });
        }
        Ok(())
    }

    fn range(&self, start: usize, end: usize) -> FieldView<'_> {
        let row = self.row_bytes();
        FieldView {
            id: self.id,
            name: Arc::clone(&self.name),
            elem: self.elem,
            row_shape: self.row_shape.clone(),
            data: ViewData::Shared(&self.as_bytes()[start * row..end * row]),
        }
    }
}

/// Bounded view over a slot's buffers for one dispatch cycle.
pub struct Batch<'a> {
    slot: SlotId,
    channel: Arc<str>,
    label_idx: usize,
    capacity: usize,
    rows: usize,
    device: Device,
    fields: Vec<FieldView<'a>>,
}

/// Slot-level metadata shared by every batch built for it.
#[derive(Clone, Debug)]
pub(crate) struct BatchMeta {
    pub slot: SlotId,
    pub channel: Arc<str>,
    pub label_idx: usize,
    pub capacity: usize,
    pub device: Device,
}

impl<'a> Batch<'a> {
    pub(crate) fn from_parts(
        meta: &BatchMeta,
        rows: usize,
        fields: Vec<FieldView<'a>>,
    ) -> Self {
        Self {
            slot: meta.slot,
            channel: Arc::clone(&meta.channel),
            label_idx: meta.label_idx,
            capacity: meta.capacity,
            rows,
            device: meta.device,
            fields,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Position of the channel in declaration order.
    pub fn label_idx(&self) -> usize {
        self.label_idx
    }

    /// Declared capacity of the underlying buffers.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Effective size: number of valid rows.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(FieldView::name)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.field(key).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldView<'a>> {
        self.fields.iter()
    }

    pub fn field(&self, key: &str) -> Option<&FieldView<'a>> {
        self.fields.iter().find(|view| view.name() == key)
    }

    pub(crate) fn fields_mut(&mut self) -> impl Iterator<Item = &mut FieldView<'a>> {
        self.fields.iter_mut()
    }

    fn require(&self, key: &str) -> BatchResult<&FieldView<'a>> {
        self.field(key)
            .ok_or_else(|| BatchError::MissingField(key.to_owned()))
    }

    /// Shape of a field as seen through this batch (`[len, row_shape..]`).
    pub fn shape(&self, key: &str) -> Option<Shape> {
        self.field(key)
            .map(|view| batch_shape(self.rows, view.row_shape()))
    }

    /// Typed read access to a field's rows.
    pub fn get<T: Element>(&self, key: &str) -> BatchResult<&[T]> {
        let view = self.require(key)?;
        view.check_type::<T>()?;
        Ok(cast_slice(view.as_bytes())?)
    }

    /// Typed write access; fails on read-only input views.
    pub fn get_mut<T: Element>(&mut self, key: &str) -> BatchResult<&mut [T]> {
        let view = self
            .fields
            .iter_mut()
            .find(|view| view.name() == key)
            .ok_or_else(|| BatchError::MissingField(key.to_owned()))?;
        view.check_type::<T>()?;
        Ok(cast_slice_mut(view.bytes_mut()?)?)
    }

    /// Owned copy of one field.
    pub fn array(&self, key: &str) -> BatchResult<Array> {
        let view = self.require(key)?;
        Ok(Array::from_bytes(
            view.elem(),
            &batch_shape(self.rows, view.row_shape()),
            view.as_bytes(),
        )?)
    }

    /// Owned copies of every field, in field order.
    pub fn to_arrays(&self) -> BatchResult<Vec<(String, Array)>> {
        self.keys()
            .map(|key| -> BatchResult<(String, Array)> { Ok((key.to_owned(), self.array(key)?)) })
            .collect()
    }

    fn range(&self, start: usize, end: usize) -> Batch<'_> {
        Batch {
            slot: self.slot,
            channel: Arc::clone(&self.channel),
            label_idx: self.label_idx,
            capacity: self.capacity,
            rows: end - start,
            device: self.device,
            fields: self.fields.iter().map(|view| view.range(start, end)).collect(),
        }
    }

    /// Read-only view of the first `n` rows. No data is copied.
    pub fn slice(&self, n: usize) -> BatchResult<Batch<'_>> {
        if n > self.rows {
            return Err(BatchError::SizeOutOfRange {
                requested: n,
                available: self.rows,
            });
        }
        Ok(self.range(0, n))
    }

    /// Read-only single-row view at `index`.
    pub fn row(&self, index: usize) -> BatchResult<Batch<'_>> {
        if index >= self.rows {
            return Err(BatchError::SizeOutOfRange {
                requested: index + 1,
                available: self.rows,
            });
        }
        Ok(self.range(index, index + 1))
    }

    /// Physically copies every field into a fresh allocation on `device`.
    ///
    /// The source batch is untouched and stays valid.
    pub fn to_device(&self, device: Device) -> BatchResult<Batch<'static>> {
        let fields = self
            .fields
            .iter()
            .map(|view| -> BatchResult<FieldView<'static>> {
                let array = Array::from_bytes(
                    view.elem(),
                    &batch_shape(self.rows, view.row_shape()),
                    view.as_bytes(),
                )?;
                Ok(FieldView {
                    id: view.id,
                    name: Arc::clone(&view.name),
                    elem: view.elem,
                    row_shape: view.row_shape.clone(),
                    data: ViewData::Owned(array),
                })
            })
            .collect::<BatchResult<Vec<_>>>()?;
        tracing::trace!(slot = %self.slot, %device, rows = self.rows, "batch copied to device");
        Ok(Batch {
            slot: self.slot,
            channel: Arc::clone(&self.channel),
            label_idx: self.label_idx,
            capacity: self.capacity,
            rows: self.rows,
            device,
            fields,
        })
    }

    /// Zeroes every field in view.
    pub fn fill_zero(&mut self) -> BatchResult<()> {
        for view in &mut self.fields {
            view.bytes_mut()?.fill(0);
        }
        Ok(())
    }

    /// Selects index `t` along the first per-row dimension of `key`.
    ///
    /// For a field of shape `[len, T, rest..]` this returns an owned array of
    /// shape `[len, rest..]`.
    pub fn hist(&self, t: usize, key: &str) -> BatchResult<Array> {
        let view = self.require(key)?;
        let extent = view.row_shape().first().copied().unwrap_or(0);
        if t >= extent {
            return Err(BatchError::IndexOutOfRange {
                field: key.to_owned(),
                index: t,
                extent,
            });
        }
        let inner = &view.row_shape()[1..];
        let step = numel(inner) * view.elem().size_of();
        let row_bytes = view.row_bytes();
        let mut out = Vec::with_capacity(self.rows * step);
        for row in view.as_bytes().chunks_exact(row_bytes) {
            out.extend_from_slice(&row[t * step..(t + 1) * step]);
        }
        Ok(Array::from_bytes(
            view.elem(),
            &batch_shape(self.rows, inner),
            &out,
        )?)
    }

    pub fn info(&self) -> String {
        let mut out = format!(
            "slot {} channel {} [{}/{}] on {}",
            self.slot, self.channel, self.rows, self.capacity, self.device
        );
        for view in &self.fields {
            out.push_str(&format!(
                "\n  {}: {} {:?}",
                view.name(),
                view.elem().c_name(),
                batch_shape(self.rows, view.row_shape()).as_slice()
            ));
        }
        out
    }
}

impl fmt::Debug for Batch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("slot", &self.slot)
            .field("channel", &self.channel)
            .field("len", &self.rows)
            .field("capacity", &self.capacity)
            .field("device", &self.device)
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}
