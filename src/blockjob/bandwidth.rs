//! Bandwidth limits and their unit conversion.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Unit a bandwidth value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthUnit {
    /// Bytes per second.
    Bytes,
    /// Mebibytes per second.
    #[default]
    Mib,
}

impl BandwidthUnit {
    /// Unit label for messages.
    pub fn label(&self) -> &'static str {
        match self {
            BandwidthUnit::Bytes => "B/s",
            BandwidthUnit::Mib => "MiB/s",
        }
    }
}

/// A bandwidth limit; zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bandwidth {
    /// Limit in `unit`.
    pub value: u64,
    /// Unit of `value`.
    #[serde(default)]
    pub unit: BandwidthUnit,
}

impl Bandwidth {
    /// Limit in bytes per second.
    pub fn bytes(value: u64) -> Self {
        Self {
            value,
            unit: BandwidthUnit::Bytes,
        }
    }

    /// Limit in MiB per second.
    pub fn mib(value: u64) -> Self {
        Self {
            value,
            unit: BandwidthUnit::Mib,
        }
    }

    /// No limit.
    pub fn unlimited() -> Self {
        Self::bytes(0)
    }

    /// Convert to bytes per second.
    ///
    /// The result must fit in a signed 64-bit integer.
    pub fn to_bytes_per_sec(&self) -> Result<u64> {
        let limit = i64::MAX as u64;
        let overflow = Error::Overflow {
            value: self.value,
            unit: self.unit.label(),
        };
        match self.unit {
            BandwidthUnit::Bytes if self.value > limit => Err(overflow),
            BandwidthUnit::Bytes => Ok(self.value),
            BandwidthUnit::Mib if self.value > limit >> 20 => Err(overflow),
            BandwidthUnit::Mib => Ok(self.value << 20),
        }
    }

    /// Speed argument for a start command; `None` when unlimited.
    pub fn speed_arg(&self) -> Result<Option<u64>> {
        let bytes = self.to_bytes_per_sec()?;
        Ok((bytes > 0).then_some(bytes))
    }
}

/// Express `bytes_per_sec` in `unit`, rounding down.
pub fn from_bytes_per_sec(bytes_per_sec: u64, unit: BandwidthUnit) -> u64 {
    match unit {
        BandwidthUnit::Bytes => bytes_per_sec,
        BandwidthUnit::Mib => bytes_per_sec >> 20,
    }
}
