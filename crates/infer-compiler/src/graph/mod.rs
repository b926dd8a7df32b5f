//! Compiled graph engine.
//!
//! A [`GraphModule`] owns the conversion session of one model and a plan per
//! input signature. The first call with a new signature builds its plan;
//! every later call with that signature reuses it.

mod plan;
mod signature;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use infer_core::{CallArgs, Error, Module, Result, Value};
use infer_transform::proxy::{ModuleProxy, ProxySubmodule};
use infer_transform::{ConversionSession, MemoryFormat, SessionOptions, TransformManager};
use semver::Version;

pub use plan::{GraphPlan, PlanEntry};
pub use signature::{ArgSignature, InputSignature};

use crate::TRACING_TARGET_GRAPH;

/// How a backend wants its graphs built.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    /// Backend key.
    pub backend: String,
    /// Backend version recorded in artifacts.
    pub version: Version,
    /// Memory layout reported to convolution layers.
    pub memory_format: MemoryFormat,
    /// Key graphs by tensor rank instead of full shape.
    pub dynamic: bool,
    /// Strict conversion for this model, on top of the manager settings.
    pub strict: bool,
    /// Log every plan at debug level.
    pub debug: bool,
    /// Overrides the manager's fused linear toggle.
    pub fused_linear: Option<bool>,
    /// Kernel autotuning; recorded in every plan, and plans built with a
    /// different setting are refused.
    pub autotune: bool,
    /// Compiler cache directory, created on the first build.
    pub cache_dir: Option<PathBuf>,
}

impl GraphConfig {
    /// Creates a configuration with every option off.
    pub fn new(backend: impl Into<String>, version: Version) -> Self {
        Self {
            backend: backend.into(),
            version,
            memory_format: MemoryFormat::default(),
            dynamic: false,
            strict: false,
            debug: false,
            fused_linear: None,
            autotune: false,
            cache_dir: None,
        }
    }
}

/// Graphs compiled for one model.
pub struct GraphModule {
    config: GraphConfig,
    session: Arc<ConversionSession>,
    root: Arc<ProxySubmodule>,
    graphs: Mutex<BTreeMap<String, Arc<GraphPlan>>>,
    compilations: AtomicUsize,
}

impl GraphModule {
    /// Opens a conversion session for `module`.
    ///
    /// Only the root proxy is created here; submodules are realized when a
    /// forward pass reaches them (or, in strict mode, when a plan is built).
    ///
    /// # Errors
    ///
    /// Fails in strict mode if the root class does not resolve.
    pub fn new(module: &Arc<Module>, manager: Arc<TransformManager>, config: GraphConfig) -> Result<Self> {
        let session = ConversionSession::with_options(
            manager,
            SessionOptions {
                memory_format: config.memory_format,
                fused_linear: config.fused_linear,
                strict: config.strict.then_some(true),
            },
        );
        let root = session.convert_module(module)?;
        Ok(Self {
            config,
            session,
            root,
            graphs: Mutex::new(BTreeMap::new()),
            compilations: AtomicUsize::new(0),
        })
    }

    fn graphs(&self) -> MutexGuard<'_, BTreeMap<String, Arc<GraphPlan>>> {
        self.graphs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The conversion session.
    pub fn session(&self) -> &Arc<ConversionSession> {
        &self.session
    }

    /// Root proxy.
    pub fn root(&self) -> &Arc<ProxySubmodule> {
        &self.root
    }

    /// Runs `args` through the graph for their signature, building it first
    /// if needed.
    ///
    /// A new graph records the submodules its forward pass realizes; in
    /// strict mode the whole tree is realized up front instead.
    ///
    /// # Errors
    ///
    /// Propagates plan building, conversion and backend errors.
    pub fn run(&self, args: &CallArgs<Value>) -> Result<Value> {
        let signature = InputSignature::of(args, self.config.dynamic);
        let key = signature.to_string();
        let mut graphs = self.graphs();
        if graphs.contains_key(&key) {
            drop(graphs);
            return self.execute(args);
        }

        let strict = self.session.strict();
        let (plan, output) = if strict {
            let plan = GraphPlan::build(&self.root, signature, true)?;
            (plan, self.execute(args)?)
        } else {
            let output = self.execute(args)?;
            let plan = GraphPlan::from_proxies(&self.session.proxies(), signature, false)?;
            (plan, output)
        };
        let plan = self.compiled(plan)?;
        graphs.insert(key, plan);
        Ok(output)
    }

    /// Runs `args` through the proxies without consulting or building plans.
    ///
    /// # Errors
    ///
    /// Propagates conversion and backend errors.
    pub fn run_eager(&self, args: &CallArgs<Value>) -> Result<Value> {
        self.execute(args)
    }

    fn compiled(&self, mut plan: GraphPlan) -> Result<Arc<GraphPlan>> {
        plan.autotune = self.config.autotune;
        let count = self.compilations.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1
            && let Some(dir) = &self.config.cache_dir
            && !dir.exists()
        {
            fs::create_dir_all(dir)?;
            tracing::info!(
                target: TRACING_TARGET_GRAPH,
                backend = %self.config.backend,
                cache_dir = %dir.display(),
                "created compiler cache directory"
            );
        }
        tracing::info!(
            target: TRACING_TARGET_GRAPH,
            backend = %self.config.backend,
            signature = %plan.signature,
            submodules = plan.len(),
            autotune = plan.autotune,
            compilations = count,
            "compiled graph"
        );
        if self.config.debug {
            for entry in &plan.entries {
                tracing::debug!(
                    target: TRACING_TARGET_GRAPH,
                    path = %entry.path,
                    source = %entry.source_class,
                    backend = ?entry.backend_class,
                    "plan entry"
                );
            }
        }
        Ok(Arc::new(plan))
    }

    fn execute(&self, args: &CallArgs<Value>) -> Result<Value> {
        let converted = args.try_map(|value| self.session.convert(value))?;
        let output = self.root.invoke(converted)?;
        self.session.reverse(&output)
    }

    /// Installs previously built plans without building anything.
    ///
    /// Every plan is checked against this model before any class is bound,
    /// so either every plan is installed or none is.
    ///
    /// # Errors
    ///
    /// Fails if any plan does not fit this model or was built with a
    /// different autotuning mode.
    pub fn install(&self, plans: Vec<GraphPlan>) -> Result<()> {
        let manager = self.session.manager();
        let mut bindings = Vec::new();
        for plan in &plans {
            if plan.autotune != self.config.autotune {
                return Err(Error::InvalidArgument(format!(
                    "graph for '{}' was built with autotune={}, this module uses autotune={}",
                    plan.signature, plan.autotune, self.config.autotune
                )));
            }
            bindings.extend(plan.resolve(&self.root, manager)?);
        }
        plan::bind(bindings);

        let mut graphs = self.graphs();
        for plan in plans {
            graphs.insert(plan.signature.to_string(), Arc::new(plan));
        }
        tracing::debug!(
            target: TRACING_TARGET_GRAPH,
            backend = %self.config.backend,
            graphs = graphs.len(),
            "installed graph plans"
        );
        Ok(())
    }

    /// Drops every plan.
    pub fn clear(&self) {
        self.graphs().clear();
    }

    /// Plans in signature order.
    pub fn plans(&self) -> Vec<Arc<GraphPlan>> {
        self.graphs().values().cloned().collect()
    }

    /// Number of plans built by this module (installed plans not counted).
    pub fn compilation_count(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    /// Returns `true` if at least one plan is available.
    pub fn is_compiled(&self) -> bool {
        !self.graphs().is_empty()
    }
}

impl std::fmt::Debug for GraphModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphModule")
            .field("backend", &self.config.backend)
            .field("class", self.root.class_id())
            .field("graphs", &self.graphs().len())
            .field("compilations", &self.compilation_count())
            .finish_non_exhaustive()
    }
}
