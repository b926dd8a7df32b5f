#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for graph compilation.
pub const TRACING_TARGET_GRAPH: &str = "infer_compiler::graph";

/// Tracing target for artifact persistence.
pub const TRACING_TARGET_ARTIFACT: &str = "infer_compiler::artifact";

/// Tracing target for backend adapters.
pub const TRACING_TARGET_BACKEND: &str = "infer_compiler::backend";

/// Tracing target for deployable modules and pipelines.
pub const TRACING_TARGET_DEPLOY: &str = "infer_compiler::deploy";

mod compile;
mod deployable;
mod options;

pub mod artifact;
pub mod backend;
pub mod graph;
pub mod pipeline;
pub mod telemetry;

#[doc(hidden)]
pub mod prelude;

pub use backend::{Backend, BackendRegistry};
pub use compile::{compile, compile_with};
pub use deployable::DeployableModule;
pub use options::{CompileOptions, CompileOptionsBuilder, OptionMap};
pub use pipeline::{PARTS, Pipeline};
