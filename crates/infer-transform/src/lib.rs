#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for registry operations.
pub const TRACING_TARGET_REGISTRY: &str = "infer_transform::registry";

/// Tracing target for package mocking.
pub const TRACING_TARGET_MOCK: &str = "infer_transform::mock";

/// Tracing target for class and function resolution.
pub const TRACING_TARGET_MANAGER: &str = "infer_transform::manager";

/// Tracing target for object graph conversion.
pub const TRACING_TARGET_CONVERT: &str = "infer_transform::convert";

/// Tracing target for proxy access and dispatch.
pub const TRACING_TARGET_PROXY: &str = "infer_transform::proxy";

mod class;
mod convert;
mod manager;
mod settings;
mod value;

pub mod mock;
pub mod nn;
pub mod proxy;
pub mod registry;

#[doc(hidden)]
pub mod prelude;

pub use class::{BackendClass, BackendFunction, FORWARD_METHODS, backend_function};
pub use convert::{ConversionSession, MemoryFormat, SessionOptions};
pub use manager::TransformManager;
pub use settings::{ENV_DEBUG, ENV_FUSED_LINEAR, ENV_STRICT, Settings};
pub use value::{
    BACKEND_NAMESPACE, BackendDType, BackendDevice, BackendTensor, BackendValue, Generator,
};
