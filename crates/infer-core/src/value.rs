//! Source-framework values.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::{DType, Device, EntityId, Module, Tensor};

/// Identity of a reference-counted source object.
///
/// Two values share a key exactly when they point at the same allocation.
/// Holders of a key must also hold the `Arc` it was taken from, otherwise
/// the address may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    /// Returns the identity of the allocation behind `value`.
    #[inline]
    pub fn of<T: ?Sized>(value: &Arc<T>) -> Self {
        Self(Arc::as_ptr(value).cast::<()>() as usize)
    }
}

/// A value of a type the transformation core does not understand.
///
/// Opaque values pass through conversion unchanged.
#[derive(Clone)]
pub struct Opaque {
    class_id: EntityId,
    repr: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wraps `inner` under the given type identifier.
    pub fn new<T: Any + Send + Sync>(class_id: impl Into<EntityId>, inner: T) -> Self {
        Self {
            class_id: class_id.into(),
            repr: String::new(),
            inner: Arc::new(inner),
        }
    }

    /// Sets the printable representation.
    #[must_use]
    pub fn with_repr(mut self, repr: impl Into<String>) -> Self {
        self.repr = repr.into();
        self
    }

    /// Class identifier of the wrapped value.
    #[inline]
    pub fn class_id(&self) -> &EntityId {
        &self.class_id
    }

    /// Attempts to view the wrapped value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("class_id", &self.class_id)
            .field("repr", &self.repr)
            .finish_non_exhaustive()
    }
}

/// A source-framework value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    None,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// String.
    Str(String),
    /// Dtype enumerant.
    DType(DType),
    /// Device descriptor.
    Device(Device),
    /// Tensor or parameter.
    Tensor(Arc<Tensor>),
    /// Module instance.
    Module(Arc<Module>),
    /// Ordered list.
    List(Vec<Value>),
    /// Tuple.
    Tuple(Vec<Value>),
    /// Value of an unrecognized type.
    Opaque(Arc<Opaque>),
}

impl Value {
    /// Wraps a tensor.
    pub fn tensor(tensor: Tensor) -> Self {
        Self::Tensor(Arc::new(tensor))
    }

    /// Wraps a module.
    pub fn module(module: Module) -> Self {
        Self::Module(Arc::new(module))
    }

    /// Wraps an opaque value.
    pub fn opaque(opaque: Opaque) -> Self {
        Self::Opaque(Arc::new(opaque))
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

    /// Class identifier of the value's type.
    pub fn class_id(&self) -> EntityId {
        match self {
            Self::None => EntityId::from("builtins.NoneType"),
            Self::Bool(_) => EntityId::from("builtins.bool"),
            Self::Int(_) => EntityId::from("builtins.int"),
            Self::Float(_) => EntityId::from("builtins.float"),
            Self::Str(_) => EntityId::from("builtins.str"),
            Self::DType(_) => EntityId::from("torch.dtype"),
            Self::Device(_) => Device::class_id(),
            Self::Tensor(tensor) => tensor.class_id(),
            Self::Module(module) => module.class_id().clone(),
            Self::List(_) => EntityId::from("builtins.list"),
            Self::Tuple(_) => EntityId::from("builtins.tuple"),
            Self::Opaque(opaque) => opaque.class_id().clone(),
        }
    }

    /// Returns `true` for [`Value::None`].
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the tensor, if this is one.
    pub fn as_tensor(&self) -> Option<&Arc<Tensor>> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    /// Returns the module, if this is one.
    pub fn as_module(&self) -> Option<&Arc<Module>> {
        match self {
            Self::Module(module) => Some(module),
            _ => None,
        }
    }

    /// Returns `true` when both values are the same object, or equal
    /// scalars. Containers compare element-wise.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::DType(a), Self::DType(b)) => a == b,
            (Self::Device(a), Self::Device(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_as(b))
            }
            _ => match (self.object_key(), other.object_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<DType> for Value {
    fn from(value: DType) -> Self {
        Self::DType(value)
    }
}

impl From<Device> for Value {
    fn from(value: Device) -> Self {
        Self::Device(value)
    }
}

impl From<Arc<Tensor>> for Value {
    fn from(value: Arc<Tensor>) -> Self {
        Self::Tensor(value)
    }
}

impl From<Arc<Module>> for Value {
    fn from(value: Arc<Module>) -> Self {
        Self::Module(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_identity() {
        let tensor = Tensor::from_f32(vec![1], &[1.0]).unwrap().shared();
        let a = Value::Tensor(Arc::clone(&tensor));
        let b = Value::Tensor(Arc::clone(&tensor));
        let c = Value::tensor(Tensor::from_f32(vec![1], &[1.0]).unwrap());
        assert_eq!(a.object_key(), b.object_key());
        assert_ne!(a.object_key(), c.object_key());
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(Value::Int(3).object_key(), None);
    }

    #[test]
    fn test_class_ids() {
        assert_eq!(Value::None.class_id().as_str(), "builtins.NoneType");
        assert_eq!(Value::from(DType::Float16).class_id().as_str(), "torch.dtype");
        let opaque = Opaque::new("my_pkg.helpers.Timer", 5_u32).with_repr("Timer(5)");
        let value = Value::opaque(opaque);
        assert_eq!(value.class_id().as_str(), "my_pkg.helpers.Timer");
    }

    #[test]
    fn test_opaque_downcast() {
        let opaque = Opaque::new("my_pkg.Counter", 7_u64);
        assert_eq!(opaque.downcast_ref::<u64>(), Some(&7));
        assert_eq!(opaque.downcast_ref::<u32>(), None);
    }
}
