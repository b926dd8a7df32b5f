//! Compile, save and load the named parts of a pipeline.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use infer_core::{Module, Result, Value};
use infer_transform::TransformManager;

use crate::{CompileOptions, DeployableModule, TRACING_TARGET_DEPLOY, compile};

/// Pipeline parts that are compiled when present, in order.
pub const PARTS: &[&str] = &[
    "text_encoder",
    "text_encoder_2",
    "image_encoder",
    "unet",
    "controlnet",
    "fast_unet",
    "prior",
    "decoder",
    "transformer",
    "vqgan.down_blocks",
    "vqgan.up_blocks",
    "vae.decoder",
    "vae.encoder",
];

/// Returns `true` if `part` is named by `ignores` or lies below one of them.
fn is_ignored(part: &str, ignores: &[&str]) -> bool {
    ignores.iter().any(|ignore| {
        part == *ignore
            || part
                .strip_prefix(ignore)
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// A pipeline object and its compiled parts.
pub struct Pipeline {
    root: Arc<Module>,
    compiled: BTreeMap<String, DeployableModule>,
}

impl Pipeline {
    /// Wraps a pipeline whose parts are (dotted) module attributes.
    pub fn new(root: Arc<Module>) -> Self {
        Self {
            root,
            compiled: BTreeMap::new(),
        }
    }

    /// The pipeline object.
    pub fn root(&self) -> &Arc<Module> {
        &self.root
    }

    /// Looks up a part by dotted path.
    pub fn part(&self, name: &str) -> Option<Arc<Module>> {
        let mut current = Arc::clone(&self.root);
        for segment in name.split('.') {
            current = match current.get(segment) {
                Some(Value::Module(module)) => module,
                _ => return None,
            };
        }
        Some(current)
    }

    /// The compiled module for `name`.
    pub fn compiled(&self, name: &str) -> Option<&DeployableModule> {
        self.compiled.get(name)
    }

    /// Names of compiled parts, sorted.
    pub fn compiled_parts(&self) -> Vec<&str> {
        self.compiled.keys().map(String::as_str).collect()
    }

    /// Compiles every present part not matched by `ignores`.
    ///
    /// Returns the names of the parts compiled by this call.
    ///
    /// # Errors
    ///
    /// Stops at the first part that fails to compile.
    pub fn compile_pipe(
        &mut self,
        backend: &str,
        options: &CompileOptions,
        manager: &Arc<TransformManager>,
        ignores: &[&str],
    ) -> Result<Vec<String>> {
        let mut compiled = Vec::new();
        for &name in PARTS {
            if is_ignored(name, ignores) {
                tracing::debug!(target: TRACING_TARGET_DEPLOY, part = name, "ignoring part");
                continue;
            }
            let Some(module) = self.part(name) else {
                continue;
            };
            let deployable = compile(&module, backend, options, Arc::clone(manager))?.with_part(name);
            tracing::info!(target: TRACING_TARGET_DEPLOY, part = name, backend, "compiled part");
            self.compiled.insert(name.to_owned(), deployable);
            compiled.push(name.to_owned());
        }
        Ok(compiled)
    }

    /// Saves every compiled part to `dir/<part>`.
    ///
    /// Parts without graphs yet are skipped with a warning. Returns the
    /// names of the parts saved.
    ///
    /// # Errors
    ///
    /// Propagates the first save failure.
    pub fn save_pipe(&self, dir: impl AsRef<Path>, ignores: &[&str], overwrite: bool) -> Result<Vec<String>> {
        let dir = dir.as_ref();
        let mut saved = Vec::new();
        for (name, module) in &self.compiled {
            if is_ignored(name, ignores) {
                continue;
            }
            if !module.is_compiled() {
                tracing::warn!(
                    target: TRACING_TARGET_DEPLOY,
                    part = %name,
                    "part has not been run yet, nothing to save"
                );
                continue;
            }
            module.save_graph_with(dir.join(name), overwrite)?;
            saved.push(name.clone());
        }
        Ok(saved)
    }

    /// Loads `dir/<part>` into every compiled part that has a file there.
    ///
    /// Returns the names of the parts loaded.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Error::GraphLoad`](infer_core::Error::GraphLoad).
    pub fn load_pipe(&self, dir: impl AsRef<Path>, ignores: &[&str]) -> Result<Vec<String>> {
        let dir = dir.as_ref();
        let mut loaded = Vec::new();
        for (name, module) in &self.compiled {
            if is_ignored(name, ignores) {
                continue;
            }
            let path = dir.join(name);
            if !path.exists() {
                tracing::debug!(
                    target: TRACING_TARGET_DEPLOY,
                    part = %name,
                    path = %path.display(),
                    "no saved graph for part"
                );
                continue;
            }
            module.load_graph(&path)?;
            loaded.push(name.clone());
        }
        Ok(loaded)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("class", self.root.class_id())
            .field("compiled", &self.compiled_parts())
            .finish()
    }
}
