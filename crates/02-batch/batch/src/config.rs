//! Serialized exchange configuration and allocation defaults.
//!
//! A config file declares the field dictionary and the channel list:
//!
//! ```toml
//! [fields]
//! s = { type = "float", shape = [4] }
//! a = { type = "int64_t", shape = [1] }
//!
//! [[channels]]
//! name = "actor"
//! input = ["s"]
//! reply = ["a"]
//! batchsize = 16
//! timeout_us = 500
//! num_slots = 2
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smem::{Device, ElementType};

use crate::error::{ConfigError, ConfigResult};
use crate::spec::{ChannelSpec, FieldDict, FieldSpec};

/// Defaults applied to channels that leave a setting unspecified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    pub default_capacity: usize,
    #[serde(with = "device_str")]
    pub default_device: Device,
    pub default_slots: usize,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            default_capacity: 32,
            default_device: Device::Cpu,
            default_slots: 1,
        }
    }
}

/// One entry of the field dictionary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEntry {
    #[serde(rename = "type")]
    pub elem: String,
    #[serde(default)]
    pub shape: Vec<usize>,
}

/// One channel declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEntry {
    pub name: String,
    pub input: Vec<String>,
    #[serde(default)]
    pub reply: Vec<String>,
    #[serde(default)]
    pub batchsize: Option<usize>,
    #[serde(default)]
    pub timeout_us: u64,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub num_slots: Option<usize>,
    #[serde(default)]
    pub min_batchsize: Option<usize>,
}

/// Complete exchange declaration: defaults, fields, and channels in order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub alloc: AllocConfig,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldEntry>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

impl ExchangeConfig {
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        serde_json::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads a `.json` file as JSON and anything else as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// Appends extra input labels (e.g. `id`, `seq`) to every channel.
    ///
    /// Labels already present in a channel's input list are skipped. The
    /// labels must still be defined in `fields`.
    pub fn add_input_labels(&mut self, labels: &[&str]) {
        for channel in &mut self.channels {
            for label in labels {
                if !channel.input.iter().any(|name| name == label) {
                    channel.input.push((*label).to_owned());
                }
            }
        }
    }

    pub fn field_dict(&self) -> ConfigResult<FieldDict> {
        let mut dict = FieldDict::new();
        for (name, entry) in &self.fields {
            let elem =
                ElementType::from_name(&entry.elem).map_err(|source| ConfigError::Type {
                    field: name.clone(),
                    source,
                })?;
            dict.insert(name, FieldSpec::new(elem, &entry.shape))?;
        }
        Ok(dict)
    }

    pub fn channel_specs(&self) -> ConfigResult<Vec<ChannelSpec>> {
        self.channels.iter().map(ChannelEntry::to_spec).collect()
    }
}

impl ChannelEntry {
    pub fn to_spec(&self) -> ConfigResult<ChannelSpec> {
        let mut spec = ChannelSpec::new(&self.name)
            .input(self.input.iter().cloned())
            .reply(self.reply.iter().cloned())
            .timeout(Duration::from_micros(self.timeout_us));
        spec.capacity = self.batchsize;
        spec.num_slots = self.num_slots;
        if let Some(min) = self.min_batchsize {
            spec.min_batchsize = min;
        }
        if let Some(device) = &self.device {
            let device = device
                .parse::<Device>()
                .map_err(|_| ConfigError::InvalidDevice {
                    channel: self.name.clone(),
                    spec: device.clone(),
                })?;
            spec.device = Some(device);
        }
        Ok(spec)
    }
}

mod device_str {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use smem::Device;

    pub fn serialize<S: Serializer>(device: &Device, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(device)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Device, D::Error> {
        let spec = String::deserialize(deserializer)?;
        spec.parse().map_err(D::Error::custom)
    }
}
