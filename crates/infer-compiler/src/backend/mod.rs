//! Backend compiler adapters.
//!
//! Every adapter executes through the converted proxy graph; they differ in
//! the options they accept, how those options shape the graph
//! configuration, and the identity recorded in artifacts.

mod inductor;
mod nexfort;
mod oneflow;

use std::collections::BTreeMap;
use std::sync::Arc;

use infer_core::{Error, Module, Result};
use infer_transform::TransformManager;
use semver::Version;

pub use inductor::InductorBackend;
pub use nexfort::{ENV_INDUCTOR_CACHE_DIR, NexfortBackend};
pub use oneflow::OneflowBackend;

use crate::graph::{GraphConfig, GraphModule};
use crate::{CompileOptions, TRACING_TARGET_BACKEND};

/// A compiler backend selectable by key.
pub trait Backend: Send + Sync {
    /// Registry key, e.g. `oneflow`.
    fn name(&self) -> &str;

    /// Version recorded in artifacts.
    fn version(&self) -> &Version;

    /// Rejects options this backend does not understand.
    fn validate(&self, options: &CompileOptions) -> Result<()>;

    /// Derives the graph configuration from validated options.
    fn graph_config(&self, options: &CompileOptions) -> Result<GraphConfig>;

    /// Validates `options` and opens a graph module over `module`.
    fn compile(
        &self,
        module: &Arc<Module>,
        manager: Arc<TransformManager>,
        options: &CompileOptions,
    ) -> Result<GraphModule> {
        self.validate(options)?;
        let config = self.graph_config(options)?;
        tracing::debug!(
            target: TRACING_TARGET_BACKEND,
            backend = %self.name(),
            version = %self.version(),
            class = %module.class_id(),
            dynamic = config.dynamic,
            strict = config.strict,
            "compiling module"
        );
        GraphModule::new(module, manager, config)
    }
}

/// Backends by key.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `oneflow`, `nexfort`, `compile-default` and
    /// `compile-max-autotune`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OneflowBackend::new()));
        registry.register(Arc::new(NexfortBackend::from_env()));
        registry.register(Arc::new(InductorBackend::default_mode()));
        registry.register(Arc::new(InductorBackend::max_autotune()));
        registry
    }

    /// Registers `backend` under its name, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_owned(), backend);
    }

    /// Looks up a backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBackend`] for unregistered keys.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(name.to_owned()))
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
