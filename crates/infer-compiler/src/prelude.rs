//! Convenient re-exports for common use.

pub use infer_core::{CallArgs, Error, Module, Result, Tensor, Value};
pub use infer_transform::{MemoryFormat, Settings, TransformManager};

pub use crate::{CompileOptions, DeployableModule, Pipeline, compile};
