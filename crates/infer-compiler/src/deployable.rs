//! The drop-in replacement returned by [`compile`](crate::compile).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use infer_core::{CallArgs, Error, Module, Result, Value};
use jiff::Timestamp;

use crate::artifact::{
    ArtifactBody, ArtifactExpectation, ArtifactHeader, FORMAT_VERSION, GraphArtifact, fingerprint,
};
use crate::backend::Backend;
use crate::graph::{GraphModule, GraphPlan};
use crate::TRACING_TARGET_DEPLOY;

/// A compiled model with the calling convention of its source module.
///
/// Graphs are compiled per input signature on first use. A failed
/// [`load_graph`](Self::load_graph) disables compiled execution until
/// [`reset_graphs`](Self::reset_graphs); calls then run eagerly through the
/// proxies.
pub struct DeployableModule {
    source: Arc<Module>,
    backend: Arc<dyn Backend>,
    graph: GraphModule,
    part: Option<String>,
    load_failed: AtomicBool,
}

impl DeployableModule {
    /// Wraps a compiled graph module.
    pub fn new(source: Arc<Module>, backend: Arc<dyn Backend>, graph: GraphModule) -> Self {
        Self {
            source,
            backend,
            graph,
            part: None,
            load_failed: AtomicBool::new(false),
        }
    }

    /// Names the pipeline part this module was compiled from.
    #[must_use]
    pub fn with_part(mut self, part: impl Into<String>) -> Self {
        self.part = Some(part.into());
        self
    }

    /// The source module.
    pub fn source(&self) -> &Arc<Module> {
        &self.source
    }

    /// The backend adapter.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Pipeline part name, if any.
    pub fn part(&self) -> Option<&str> {
        self.part.as_deref()
    }

    /// The underlying graph module.
    pub fn graph(&self) -> &GraphModule {
        &self.graph
    }

    /// Number of graphs compiled by this module.
    pub fn compilation_count(&self) -> usize {
        self.graph.compilation_count()
    }

    /// Returns `true` if at least one graph is available.
    pub fn is_compiled(&self) -> bool {
        self.graph.is_compiled()
    }

    /// Returns `false` after a failed [`load_graph`](Self::load_graph).
    pub fn compiled_execution_available(&self) -> bool {
        !self.load_failed.load(Ordering::SeqCst)
    }

    /// Calls the model.
    ///
    /// # Errors
    ///
    /// Propagates conversion, compilation and backend errors.
    pub fn call(&self, args: &CallArgs<Value>) -> Result<Value> {
        if self.compiled_execution_available() {
            return self.graph.run(args);
        }

        let key = format!("eager_fallback:{}", self.graph.session().id());
        self.graph.session().manager().warn_once(
            key,
            format!(
                "compiled graphs for {} failed to load; running eagerly until reset_graphs()",
                self.describe()
            ),
        );
        self.graph.run_eager(args)
    }

    /// Saves compiled graphs, keeping a valid artifact already at `path`.
    ///
    /// # Errors
    ///
    /// See [`save_graph_with`](Self::save_graph_with).
    pub fn save_graph(&self, path: impl AsRef<Path>) -> Result<()> {
        self.save_graph_with(path, false)
    }

    /// Saves compiled graphs atomically.
    ///
    /// Without `overwrite`, a valid artifact for this model already at
    /// `path` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphNotCompiled`] before the first compilation and
    /// propagates filesystem errors.
    pub fn save_graph_with(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if !self.graph.is_compiled() {
            return Err(Error::GraphNotCompiled {
                part: self.part.clone(),
            });
        }

        let fingerprint = fingerprint(&self.source);
        if !overwrite && path.exists() {
            let existing = GraphArtifact::read(path)
                .and_then(|artifact| artifact.validate(path, &self.expectation(&fingerprint)));
            match existing {
                Ok(()) => {
                    tracing::info!(
                        target: TRACING_TARGET_DEPLOY,
                        path = %path.display(),
                        part = ?self.part,
                        "graph artifact exists, not overwriting"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::info!(
                        target: TRACING_TARGET_DEPLOY,
                        path = %path.display(),
                        error = %err,
                        "replacing invalid graph artifact"
                    );
                }
            }
        }

        let header = ArtifactHeader {
            format_version: FORMAT_VERSION,
            backend: self.backend.name().to_owned(),
            backend_version: self.backend.version().clone(),
            part: self.part.clone(),
            source_class: self.source.class_id().clone(),
            fingerprint,
            created_at: Timestamp::now(),
        };
        let body = ArtifactBody {
            graphs: self.graph.plans().iter().map(|plan| GraphPlan::clone(plan)).collect(),
        };
        GraphArtifact::new(header, body)?.write(path)?;

        tracing::info!(
            target: TRACING_TARGET_DEPLOY,
            path = %path.display(),
            part = ?self.part,
            backend = %self.backend.name(),
            "saved compiled graphs"
        );
        Ok(())
    }

    /// Loads graphs saved for this model without invoking the compiler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphLoad`] on any failure; compiled execution is
    /// then disabled until [`reset_graphs`](Self::reset_graphs).
    pub fn load_graph(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match self.try_load(path) {
            Ok(graphs) => {
                self.load_failed.store(false, Ordering::SeqCst);
                tracing::info!(
                    target: TRACING_TARGET_DEPLOY,
                    path = %path.display(),
                    part = ?self.part,
                    graphs,
                    "loaded compiled graphs"
                );
                Ok(())
            }
            Err(err) => {
                self.load_failed.store(true, Ordering::SeqCst);
                tracing::warn!(
                    target: TRACING_TARGET_DEPLOY,
                    path = %path.display(),
                    part = ?self.part,
                    error = %err,
                    "failed to load compiled graphs"
                );
                Err(match err {
                    Error::GraphLoad { .. } => err,
                    other => Error::graph_load(path, other.to_string()),
                })
            }
        }
    }

    fn try_load(&self, path: &Path) -> Result<usize> {
        let artifact = GraphArtifact::read(path)?;
        let fingerprint = fingerprint(&self.source);
        artifact.validate(path, &self.expectation(&fingerprint))?;
        let graphs = artifact.body.graphs.len();
        self.graph.install(artifact.body.graphs)?;
        Ok(graphs)
    }

    /// Drops every graph and re-enables compiled execution.
    pub fn reset_graphs(&self) {
        self.graph.clear();
        self.load_failed.store(false, Ordering::SeqCst);
        tracing::debug!(
            target: TRACING_TARGET_DEPLOY,
            part = ?self.part,
            "reset compiled graphs"
        );
    }

    fn expectation<'a>(&'a self, fingerprint: &'a str) -> ArtifactExpectation<'a> {
        ArtifactExpectation {
            backend: self.backend.name(),
            backend_version: self.backend.version(),
            source_class: self.source.class_id(),
            fingerprint,
        }
    }

    fn describe(&self) -> String {
        match &self.part {
            Some(part) => format!("'{part}'"),
            None => format!("'{}'", self.source.class_id()),
        }
    }
}

impl std::fmt::Debug for DeployableModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployableModule")
            .field("class", self.source.class_id())
            .field("backend", &self.backend.name())
            .field("part", &self.part)
            .field("graph", &self.graph)
            .field("load_failed", &self.load_failed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use infer_core::{Opaque, Tensor};
    use infer_transform::proxy::ModuleProxy;
    use infer_transform::{Settings, TransformManager};

    use super::*;
    use crate::{CompileOptions, compile};

    fn linear(weight: &[f32]) -> Arc<Module> {
        let out = weight.len() / 2;
        Module::new("torch.nn.Linear")
            .with(
                "weight",
                Tensor::from_f32(vec![out, 2], weight).unwrap().into_parameter().shared(),
            )
            .with("bias", Value::None)
            .shared()
    }

    fn manager() -> Arc<TransformManager> {
        TransformManager::with_builtins(Settings::default()).shared()
    }

    fn deploy(module: &Arc<Module>, manager: Arc<TransformManager>) -> DeployableModule {
        compile(module, "oneflow", &CompileOptions::default(), manager).unwrap()
    }

    fn input() -> CallArgs<Value> {
        CallArgs::positional([Value::tensor(Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap())])
    }

    fn output(value: Value) -> Vec<f32> {
        value.as_tensor().unwrap().to_f32_vec().unwrap()
    }

    #[test]
    fn test_save_before_compile_fails() {
        let dir = tempfile::tempdir().unwrap();
        let module = deploy(&linear(&[1.0, 1.0]), manager()).with_part("unet");
        let err = module.save_graph(dir.path().join("unet")).unwrap_err();
        assert!(matches!(err, Error::GraphNotCompiled { part: Some(p) } if p == "unet"));
    }

    #[test]
    fn test_load_skips_compilation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let source = linear(&[1.0, 1.0]);

        let first = deploy(&source, manager());
        first.call(&input()).unwrap();
        assert_eq!(first.compilation_count(), 1);
        first.save_graph(&path).unwrap();

        let second = deploy(&source, manager());
        second.load_graph(&path).unwrap();
        assert!(second.is_compiled());
        assert_eq!(output(second.call(&input()).unwrap()), vec![3.0]);
        assert_eq!(second.compilation_count(), 0);
    }

    #[test]
    fn test_existing_artifact_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let source = linear(&[1.0, 1.0]);

        let module = deploy(&source, manager());
        module.call(&input()).unwrap();
        module.save_graph(&path).unwrap();
        let before = fs::read(&path).unwrap();

        module
            .call(&CallArgs::positional([Value::tensor(
                Tensor::from_f32(vec![2, 2], &[1.0; 4]).unwrap(),
            )]))
            .unwrap();
        assert_eq!(module.compilation_count(), 2);
        module.save_graph(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);

        module.save_graph_with(&path, true).unwrap();
        let artifact = GraphArtifact::read(&path).unwrap();
        assert_eq!(artifact.body.graphs.len(), 2);
    }

    #[test]
    fn test_corrupt_artifact_falls_back_to_eager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        fs::write(&path, b"{\"header\": ").unwrap();

        let manager = manager();
        let module = deploy(&linear(&[1.0, 1.0]), Arc::clone(&manager));
        let err = module.load_graph(&path).unwrap_err();
        assert!(matches!(err, Error::GraphLoad { .. }));
        assert!(!module.compiled_execution_available());

        assert_eq!(output(module.call(&input()).unwrap()), vec![3.0]);
        module.call(&input()).unwrap();
        assert_eq!(module.compilation_count(), 0);
        let fallbacks = manager
            .warnings()
            .into_iter()
            .filter(|w| w.contains("running eagerly"))
            .count();
        assert_eq!(fallbacks, 1);

        module.reset_graphs();
        assert!(module.compiled_execution_available());
        module.call(&input()).unwrap();
        assert_eq!(module.compilation_count(), 1);
    }

    #[test]
    fn test_artifact_for_other_weights_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");

        let small = deploy(&linear(&[1.0, 1.0]), manager());
        small.call(&input()).unwrap();
        small.save_graph(&path).unwrap();

        let large = deploy(&linear(&[1.0, 1.0, 2.0, 2.0]), manager());
        assert!(matches!(large.load_graph(&path), Err(Error::GraphLoad { .. })));
    }

    #[test]
    fn test_unregistered_attribute_warns_once_and_runs() {
        let manager = manager();
        let source = linear(&[1.0, 1.0]);
        source.set(
            "timer",
            Value::opaque(Opaque::new("my_pkg.helpers.Timer", 0_u32)),
        );
        let module = deploy(&source, Arc::clone(&manager));

        let root = module.graph().root();
        root.attribute("timer").unwrap();
        root.attribute("timer").unwrap();
        assert_eq!(output(module.call(&input()).unwrap()), vec![3.0]);

        let warnings: Vec<_> = manager
            .warnings()
            .into_iter()
            .filter(|w| w.contains("my_pkg.helpers.Timer"))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_mismatched_bias_is_an_error() {
        let source = linear(&[1.0, 0.0, 0.0, 1.0]);
        source.set("bias", Tensor::from_f32(vec![1], &[0.5]).unwrap().into_parameter().shared());
        let module = deploy(&source, manager());
        assert!(matches!(
            module.call(&input()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!module.is_compiled());
    }
}
