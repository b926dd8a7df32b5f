//! The compile entry point.

use std::sync::Arc;

use infer_core::{Module, Result};
use infer_transform::TransformManager;

use crate::backend::BackendRegistry;
use crate::{CompileOptions, DeployableModule, TRACING_TARGET_BACKEND};

/// Compiles `module` with one of the default backends.
///
/// # Errors
///
/// Returns [`Error::UnknownBackend`](infer_core::Error::UnknownBackend)
/// before touching the model if `backend` is not registered, and
/// [`Error::InvalidOptions`](infer_core::Error::InvalidOptions) for options
/// the backend does not recognize.
pub fn compile(
    module: &Arc<Module>,
    backend: &str,
    options: &CompileOptions,
    manager: Arc<TransformManager>,
) -> Result<DeployableModule> {
    compile_with(&BackendRegistry::with_defaults(), module, backend, options, manager)
}

/// Compiles `module` with a backend from `registry`.
///
/// # Errors
///
/// See [`compile`].
pub fn compile_with(
    registry: &BackendRegistry,
    module: &Arc<Module>,
    backend: &str,
    options: &CompileOptions,
    manager: Arc<TransformManager>,
) -> Result<DeployableModule> {
    let backend = registry.get(backend)?;
    let graph = backend.compile(module, manager, options)?;
    tracing::info!(
        target: TRACING_TARGET_BACKEND,
        backend = %backend.name(),
        class = %module.class_id(),
        "module ready for compiled execution"
    );
    Ok(DeployableModule::new(Arc::clone(module), backend, graph))
}
