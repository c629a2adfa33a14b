//! Device placement of field buffers.

use std::fmt;
use std::str::FromStr;

use crate::error::SmemError;

/// Where the data of a buffer or batch lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Ordinary host memory.
    #[default]
    Cpu,
    /// Accelerator memory, by ordinal.
    Accelerator(u16),
}

impl Device {
    pub fn is_host(self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = SmemError;

    /// Accepts `cpu`/`host`, `cuda:N`/`gpu:N`, or a bare ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim().to_ascii_lowercase();
        let invalid = || SmemError::InvalidDevice {
            spec: s.to_owned(),
        };
        match spec.as_str() {
            "cpu" | "host" => return Ok(Device::Cpu),
            "cuda" | "gpu" => return Ok(Device::Accelerator(0)),
            _ => {}
        }
        let ordinal = spec
            .strip_prefix("cuda:")
            .or_else(|| spec.strip_prefix("gpu:"))
            .unwrap_or(&spec);
        ordinal
            .parse::<u16>()
            .map(Device::Accelerator)
            .map_err(|_| invalid())
    }
}
