#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for object model operations.
pub const TRACING_TARGET: &str = "infer_core";

mod args;
mod dtype;
mod entity;
mod error;
mod module;
mod tensor;
mod value;

#[doc(hidden)]
pub mod prelude;

pub use args::CallArgs;
pub use dtype::{DType, Device, DeviceKind};
pub use entity::{EntityId, EntityKind};
pub use error::{Error, ErrorKind, Result};
pub use module::Module;
pub use tensor::{Tensor, decode_f32, encode_f32};
pub use value::{ObjectKey, Opaque, Value};
