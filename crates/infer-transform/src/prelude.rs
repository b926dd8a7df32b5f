//! Convenient re-exports for common use.

pub use crate::proxy::{ModuleProxy, ProxySubmodule};
pub use crate::registry::EntityRegistry;
pub use crate::{
    BackendClass, BackendTensor, BackendValue, ConversionSession, MemoryFormat, Settings,
    TransformManager,
};
