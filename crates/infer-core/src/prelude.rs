//! Convenient re-exports for common use.

pub use crate::{
    CallArgs, DType, Device, EntityId, Error, ErrorKind, Module, ObjectKey, Opaque, Result,
    Tensor, Value,
};
