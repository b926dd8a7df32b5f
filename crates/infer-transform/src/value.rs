//! Backend-side values.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use infer_core::{DType, Device, DeviceKind, EntityId, Error, ObjectKey, Opaque, Result, Tensor};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::proxy::{ModuleProxy, ProxySubmodule};

/// Namespace every backend entity lives under.
pub const BACKEND_NAMESPACE: &str = "oneflow";

/// Element types the backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString, IntoStaticStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendDType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    Int32,
    Int64,
    UInt8,
}

impl BackendDType {
    /// Maps a source dtype onto the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedDType`] for dtypes outside the table.
    pub fn from_source(dtype: DType) -> Result<Self> {
        Ok(match dtype {
            DType::Float16 => Self::Float16,
            DType::BFloat16 => Self::BFloat16,
            DType::Float32 => Self::Float32,
            DType::Float64 => Self::Float64,
            DType::Int8 => Self::Int8,
            DType::Int32 => Self::Int32,
            DType::Int64 => Self::Int64,
            DType::UInt8 => Self::UInt8,
            other => return Err(Error::UnsupportedDType(other.qualified_name())),
        })
    }

    /// Maps the backend dtype back onto the source framework.
    pub fn to_source(self) -> DType {
        match self {
            Self::Float16 => DType::Float16,
            Self::BFloat16 => DType::BFloat16,
            Self::Float32 => DType::Float32,
            Self::Float64 => DType::Float64,
            Self::Int8 => DType::Int8,
            Self::Int32 => DType::Int32,
            Self::Int64 => DType::Int64,
            Self::UInt8 => DType::UInt8,
        }
    }

    /// Fully-qualified backend name, e.g. `oneflow.float16`.
    pub fn qualified_name(self) -> String {
        format!("{BACKEND_NAMESPACE}.{}", self.as_ref())
    }
}

/// Backend device descriptor. Only host and CUDA devices exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "lowercase")]
pub enum BackendDevice {
    Cpu,
    Cuda(u32),
}

impl BackendDevice {
    /// Maps a source device onto the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedDevice`] for anything but `cpu` and `cuda`.
    pub fn from_source(device: Device) -> Result<Self> {
        match device.kind {
            DeviceKind::Cpu => Ok(Self::Cpu),
            DeviceKind::Cuda => Ok(Self::Cuda(device.index.unwrap_or(0))),
            _ => Err(Error::UnsupportedDevice(device.to_string())),
        }
    }

    /// Maps the backend device back onto the source framework.
    pub fn to_source(self) -> Device {
        match self {
            Self::Cpu => Device::CPU,
            Self::Cuda(index) => Device::cuda(index),
        }
    }
}

impl fmt::Display for BackendDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// A backend tensor. Never tracks gradients.
#[derive(Debug, Clone)]
pub struct BackendTensor {
    dtype: BackendDType,
    shape: Vec<usize>,
    device: BackendDevice,
    storage: Bytes,
}

impl BackendTensor {
    /// Views a source tensor as a backend tensor without copying its storage.
    ///
    /// # Errors
    ///
    /// Fails when the dtype or device has no backend equivalent.
    pub fn from_source(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            dtype: BackendDType::from_source(tensor.dtype())?,
            shape: tensor.shape().to_vec(),
            device: BackendDevice::from_source(tensor.device())?,
            storage: tensor.storage().clone(),
        })
    }

    /// Creates a `float32` host tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the number of values does not match the shape.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let numel = shape.iter().product::<usize>();
        if numel != values.len() {
            return Err(Error::InvalidArgument(format!(
                "shape {shape:?} holds {numel} values, got {}",
                values.len()
            )));
        }
        Ok(Self {
            dtype: BackendDType::Float32,
            shape,
            device: BackendDevice::Cpu,
            storage: infer_core::encode_f32(values),
        })
    }

    /// Views the tensor as a source tensor sharing the same storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage does not match the shape.
    pub fn to_source(&self) -> Result<Tensor> {
        Ok(
            Tensor::from_bytes(self.dtype.to_source(), self.shape.clone(), self.storage.clone())?
                .with_device(self.device.to_source()),
        )
    }

    /// Places the tensor on `device` (metadata only).
    #[must_use]
    pub fn with_device(mut self, device: BackendDevice) -> Self {
        self.device = device;
        self
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> BackendDType {
        self.dtype
    }

    /// Dimensions.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Device.
    #[inline]
    pub fn device(&self) -> BackendDevice {
        self.device
    }

    /// Always `false`: backend tensors are inference-only.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        false
    }

    /// Underlying storage.
    #[inline]
    pub fn storage(&self) -> &Bytes {
        &self.storage
    }

    /// Decodes `float32` storage into host values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedDType`] for any other dtype.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        infer_core::decode_f32(self.dtype.to_source(), &self.storage)
    }
}

/// Random generator handle handed to dropout layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generator {
    seed: u64,
}

impl Generator {
    /// Creates a generator with a random seed.
    pub fn new() -> Self {
        Self {
            seed: rand::random(),
        }
    }

    /// Creates a generator with a fixed seed.
    pub fn from_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// Generator seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend value.
#[derive(Debug, Clone, Default)]
pub enum BackendValue {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DType(BackendDType),
    Device(BackendDevice),
    Tensor(Arc<BackendTensor>),
    Module(Arc<ProxySubmodule>),
    List(Vec<BackendValue>),
    Tuple(Vec<BackendValue>),
    /// Value of a type with no backend counterpart, passed through as is.
    Opaque(Arc<Opaque>),
    Generator(Generator),
}

impl BackendValue {
    /// Wraps a tensor.
    pub fn tensor(tensor: BackendTensor) -> Self {
        Self::Tensor(Arc::new(tensor))
    }

    /// Returns the identity of reference-counted values.
    pub fn object_key(&self) -> Option<ObjectKey> {
        match self {
            Self::Tensor(tensor) => Some(ObjectKey::of(tensor)),
            Self::Module(module) => Some(ObjectKey::of(module)),
            Self::Opaque(opaque) => Some(ObjectKey::of(opaque)),
            _ => None,
        }
    }

    /// Returns the tensor, if this is one.
    pub fn as_tensor(&self) -> Option<&Arc<BackendTensor>> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Returns the proxy, if this is a module.
    pub fn as_module(&self) -> Option<&Arc<ProxySubmodule>> {
        match self {
            Self::Module(module) => Some(module),
            _ => None,
        }
    }

    /// Returns `true` for [`BackendValue::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Name of the variant, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::DType(_) => "dtype",
            Self::Device(_) => "device",
            Self::Tensor(_) => "tensor",
            Self::Module(_) => "module",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Opaque(_) => "opaque",
            Self::Generator(_) => "generator",
        }
    }

    /// Returns the tensor or fails with a descriptive argument error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for non-tensor values.
    pub fn expect_tensor(&self, what: &str) -> Result<&Arc<BackendTensor>> {
        self.as_tensor().ok_or_else(|| {
            Error::InvalidArgument(format!("{what} must be a tensor, got {}", self.kind_name()))
        })
    }

    /// Class identifier of the backend value's type.
    pub fn class_id(&self) -> EntityId {
        match self {
            Self::Tensor(_) => EntityId::from("oneflow.Tensor"),
            Self::Module(module) => module.class_id().clone(),
            Self::Opaque(opaque) => opaque.class_id().clone(),
            Self::Generator(_) => EntityId::from("oneflow.Generator"),
            other => EntityId::from(format!("builtins.{}", other.kind_name())),
        }
    }
}

impl From<Arc<BackendTensor>> for BackendValue {
    fn from(value: Arc<BackendTensor>) -> Self {
        Self::Tensor(value)
    }
}

impl From<BackendTensor> for BackendValue {
    fn from(value: BackendTensor) -> Self {
        Self::tensor(value)
    }
}

impl From<Arc<ProxySubmodule>> for BackendValue {
    fn from(value: Arc<ProxySubmodule>) -> Self {
        Self::Module(value)
    }
}

impl From<i64> for BackendValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for BackendValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for BackendValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use infer_core::DType;

    use super::*;

    #[test]
    fn test_dtype_table() {
        assert_eq!(
            BackendDType::from_source(DType::BFloat16).unwrap(),
            BackendDType::BFloat16
        );
        assert_eq!(BackendDType::Float16.qualified_name(), "oneflow.float16");
        let err = BackendDType::from_source(DType::Complex64).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType(name) if name == "torch.complex64"));
    }

    #[test]
    fn test_device_table() {
        assert_eq!(
            BackendDevice::from_source(Device::cuda(1)).unwrap(),
            BackendDevice::Cuda(1)
        );
        assert_eq!(BackendDevice::Cuda(1).to_string(), "cuda:1");
        let mps: Device = "mps".parse().unwrap();
        assert!(matches!(
            BackendDevice::from_source(mps),
            Err(Error::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn test_tensor_shares_storage() {
        let source = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap().into_parameter();
        let backend = BackendTensor::from_source(&source).unwrap();
        assert_eq!(backend.storage().as_ptr(), source.storage().as_ptr());
        assert!(!backend.requires_grad());
        assert_eq!(backend.to_f32_vec().unwrap(), vec![1.0, 2.0]);

        let back = backend.to_source().unwrap();
        assert_eq!(back.storage().as_ptr(), source.storage().as_ptr());
        assert!(!back.requires_grad());
    }

    #[test]
    fn test_generator_seed() {
        assert_eq!(Generator::from_seed(7).seed(), 7);
    }
}
