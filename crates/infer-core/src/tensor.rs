//! Source-framework tensors.

use std::sync::Arc;

use bytes::Bytes;

use crate::{DType, Device, EntityId, Error, Result};

/// A dense source tensor or parameter.
///
/// Storage is a reference-counted [`Bytes`] buffer so a backend tensor can
/// view the same memory without copying.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: Device,
    requires_grad: bool,
    is_parameter: bool,
    storage: Bytes,
}

impl Tensor {
    /// Creates a tensor from raw little-endian storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer length does not match the shape.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, storage: Bytes) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if storage.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "tensor of shape {shape:?} and dtype {dtype} needs {expected} bytes, got {}",
                storage.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            device: Device::CPU,
            requires_grad: false,
            is_parameter: false,
            storage,
        })
    }

    /// Creates a `float32` tensor from host values.
    ///
    /// # Errors
    ///
    /// Returns an error if the number of values does not match the shape.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::from_bytes(DType::Float32, shape, encode_f32(values))
    }

    /// Marks the tensor as a trainable parameter.
    #[must_use]
    pub fn into_parameter(mut self) -> Self {
        self.is_parameter = true;
        self.requires_grad = true;
        self
    }

    /// Places the tensor on `device` (metadata only).
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Sets the gradient tracking flag.
    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Wraps the tensor for sharing inside an object graph.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Class identifier of the tensor (`torch.Tensor` or
    /// `torch.nn.parameter.Parameter`).
    pub fn class_id(&self) -> EntityId {
        if self.is_parameter {
            EntityId::from("torch.nn.parameter.Parameter")
        } else {
            EntityId::from("torch.Tensor")
        }
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dimensions.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Device the tensor lives on.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether gradients are tracked.
    #[inline]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Whether this tensor is a module parameter.
    #[inline]
    pub fn is_parameter(&self) -> bool {
        self.is_parameter
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
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
    /// Returns an error for any other dtype.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        decode_f32(self.dtype, &self.storage)
    }
}

/// Encodes host values as little-endian `float32` storage.
pub fn encode_f32(values: &[f32]) -> Bytes {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(buf)
}

/// Decodes little-endian `float32` storage.
///
/// # Errors
///
/// Returns [`Error::UnsupportedDType`] for any other dtype.
pub fn decode_f32(dtype: DType, storage: &Bytes) -> Result<Vec<f32>> {
    if dtype != DType::Float32 {
        return Err(Error::UnsupportedDType(format!(
            "host decoding requires float32, got {dtype}"
        )));
    }
    Ok(storage
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32_roundtrip() {
        let tensor = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(tensor.numel(), 4);
        assert_eq!(tensor.storage().len(), 16);
        assert_eq!(tensor.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let result = Tensor::from_f32(vec![3], &[1.0, 2.0]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_parameter_class() {
        let tensor = Tensor::from_f32(vec![1], &[0.5]).unwrap();
        assert_eq!(tensor.class_id().as_str(), "torch.Tensor");
        let param = tensor.into_parameter();
        assert!(param.requires_grad());
        assert_eq!(param.class_id().as_str(), "torch.nn.parameter.Parameter");
    }

    #[test]
    fn test_decode_rejects_other_dtypes() {
        let tensor = Tensor::from_bytes(DType::Int32, vec![1], Bytes::from_static(&[0; 4])).unwrap();
        assert!(matches!(tensor.to_f32_vec(), Err(Error::UnsupportedDType(_))));
    }
}
