//! Reply mappings returned by callbacks and their reconciliation into
//! reply buffers.

use smem::{batch_shape, numel, squeezed, Array, ArrayData, ElementType, Scalar, TypeError};

use crate::batch::{Batch, FieldView};
use crate::error::BatchResult;

/// One value of a reply mapping.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyValue {
    /// Broadcast to every element of the target.
    Scalar(Scalar),
    /// Copied element-wise; shapes must agree after squeezing unit extents.
    Array(Array),
    /// Flat values copied element-wise; the length must equal the target's
    /// element count.
    List(ArrayData),
}

impl ReplyValue {
    pub fn elem(&self) -> ElementType {
        match self {
            ReplyValue::Scalar(scalar) => scalar.elem(),
            ReplyValue::Array(array) => array.elem(),
            ReplyValue::List(data) => data.elem(),
        }
    }
}

impl From<Array> for ReplyValue {
    fn from(array: Array) -> Self {
        ReplyValue::Array(array)
    }
}

impl From<Scalar> for ReplyValue {
    fn from(scalar: Scalar) -> Self {
        ReplyValue::Scalar(scalar)
    }
}

impl From<ArrayData> for ReplyValue {
    fn from(data: ArrayData) -> Self {
        ReplyValue::List(data)
    }
}

macro_rules! reply_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ReplyValue {
                fn from(value: $ty) -> Self {
                    ReplyValue::Scalar(Scalar::from(value))
                }
            }

            impl From<Vec<$ty>> for ReplyValue {
                fn from(values: Vec<$ty>) -> Self {
                    ReplyValue::List(Array::from_vec(values).into_data())
                }
            }
        )*
    };
}

reply_value_from!(i32, i64, f32, u8);

/// Ordered key -> value mapping returned by a callback.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reply {
    entries: Vec<(String, ReplyValue)>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Reply::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ReplyValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<ReplyValue>,
    ) -> Option<ReplyValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ReplyValue> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<ReplyValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReplyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Reply
where
    K: Into<String>,
    V: Into<ReplyValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut reply = Reply::new();
        for (key, value) in iter {
            reply.insert(key, value);
        }
        reply
    }
}

/// Outcome of [`Batch::copy_from`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Keys in the reply that the batch does not have.
    pub extra_keys: Vec<String>,
    /// Batch keys the reply did not provide.
    pub missing_keys: Vec<String>,
}

impl CopyReport {
    pub fn is_complete(&self) -> bool {
        self.missing_keys.is_empty()
    }
}

fn write_value(view: &mut FieldView<'_>, rows: usize, value: &ReplyValue) -> BatchResult<()> {
    let elem = view.elem();
    if value.elem() != elem {
        return Err(TypeError::Mismatch {
            field: view.name().to_owned(),
            expected: elem,
            found: value.elem(),
        }
        .into());
    }
    let target = batch_shape(rows, view.row_shape());
    let count = numel(&target);
    let shape_error = |found: &[usize]| TypeError::ShapeMismatch {
        field: view.name().to_owned(),
        expected: target.clone(),
        found: found.iter().copied().collect(),
    };
    let source = match value {
        ReplyValue::Scalar(scalar) => std::borrow::Cow::Owned(scalar.splat(count)),
        ReplyValue::Array(array) => {
            if squeezed(array.shape()) != squeezed(&target) {
                return Err(shape_error(array.shape()).into());
            }
            std::borrow::Cow::Borrowed(array.data())
        }
        ReplyValue::List(data) => {
            if data.len() != count {
                return Err(shape_error(&[data.len()]).into());
            }
            std::borrow::Cow::Borrowed(data)
        }
    };
    view.bytes_mut()?.copy_from_slice(source.as_bytes());
    Ok(())
}

impl Batch<'_> {
    /// Copies every reply value whose key names a field of this batch.
    ///
    /// Scalars broadcast; arrays must match the field's shape up to unit
    /// extents; lists must match its element count. Element types must match
    /// exactly. Keys are reported back rather than treated as errors: extras
    /// are harmless, missing ones are for the caller to judge. Copying the
    /// same reply twice leaves the buffers unchanged.
    pub fn copy_from(&mut self, reply: &Reply) -> BatchResult<CopyReport> {
        let rows = self.len();
        let mut report = CopyReport::default();
        for view in self.fields_mut() {
            match reply.get(view.name()) {
                Some(value) => write_value(view, rows, value)?,
                None => report.missing_keys.push(view.name().to_owned()),
            }
        }
        report.extra_keys = reply
            .keys()
            .filter(|key| !self.contains(key))
            .map(str::to_owned)
            .collect();
        Ok(report)
    }
}
