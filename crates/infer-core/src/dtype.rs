//! Source-framework dtype and device enumerants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::{EntityId, Error, Result};

/// Element type of a source tensor.
///
/// Names follow the source framework (`torch.float16`, …) so they can be
/// printed and matched against conversion tables verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    #[strum(to_string = "float64", serialize = "double")]
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    Bool,
    Complex64,
    Complex128,
    #[strum(to_string = "float8_e4m3fn")]
    #[serde(rename = "float8_e4m3fn")]
    Float8E4M3,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool | Self::Float8E4M3 => 1,
            Self::Float16 | Self::BFloat16 | Self::Int16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 | Self::Complex64 => 8,
            Self::Complex128 => 16,
        }
    }

    /// Returns `true` for floating point element types.
    #[must_use]
    pub const fn is_floating_point(self) -> bool {
        matches!(
            self,
            Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64 | Self::Float8E4M3
        )
    }

    /// Fully-qualified source name, e.g. `torch.float16`.
    #[must_use]
    pub fn qualified_name(self) -> String {
        format!("torch.{}", self.as_ref())
    }
}

/// Kind of device a tensor lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Mps,
    Xla,
    Meta,
}

/// Source device descriptor such as `cpu` or `cuda:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Device kind.
    pub kind: DeviceKind,
    /// Device ordinal, if any.
    pub index: Option<u32>,
}

impl Device {
    /// The host CPU.
    pub const CPU: Self = Self {
        kind: DeviceKind::Cpu,
        index: None,
    };

    /// Creates a CUDA device with the given ordinal.
    #[must_use]
    pub const fn cuda(index: u32) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index: Some(index),
        }
    }

    /// Class identifier of device values.
    #[must_use]
    pub fn class_id() -> EntityId {
        EntityId::from("torch.device")
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{index}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| Error::UnsupportedDevice(s.to_owned()))?;
                (kind, Some(index))
            }
            None => (s, None),
        };
        let kind = DeviceKind::from_str(kind).map_err(|_| Error::UnsupportedDevice(s.to_owned()))?;
        Ok(Self { kind, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_names() {
        assert_eq!(DType::Float16.to_string(), "float16");
        assert_eq!(DType::Float64.qualified_name(), "torch.float64");
        assert_eq!(DType::from_str("double").unwrap(), DType::Float64);
        assert_eq!(DType::from_str("uint8").unwrap(), DType::UInt8);
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::BFloat16.size_in_bytes(), 2);
        assert_eq!(DType::Float32.size_in_bytes(), 4);
        assert!(DType::Float16.is_floating_point());
        assert!(!DType::Int64.is_floating_point());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::CPU);
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::cuda(1));
        assert_eq!(Device::cuda(0).to_string(), "cuda:0");
        assert!(matches!(
            "tpu".parse::<Device>(),
            Err(Error::UnsupportedDevice(_))
        ));
        assert!("cuda:x".parse::<Device>().is_err());
    }
}
