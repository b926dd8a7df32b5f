//! Graph plans: which backend class runs at which path.

use std::collections::HashSet;
use std::sync::Arc;

use infer_core::{EntityId, Error, Result};
use infer_transform::{BackendClass, TransformManager};
use infer_transform::proxy::{ModuleProxy, ProxySubmodule};
use serde::{Deserialize, Serialize};

use super::InputSignature;

/// One realized submodule of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Dotted attribute path inside the model.
    pub path: String,
    /// Source class at that path.
    pub source_class: EntityId,
    /// Backend class bound at that path; `None` for submodules without a
    /// backend equivalent that the forward pass never reaches.
    pub backend_class: Option<EntityId>,
}

/// A compiled graph for one input signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPlan {
    pub signature: InputSignature,
    pub entries: Vec<PlanEntry>,
    /// Built with kernel autotuning.
    #[serde(default)]
    pub autotune: bool,
}

impl GraphPlan {
    /// Realizes the whole module tree under `root` and binds every
    /// submodule to its backend class.
    ///
    /// # Errors
    ///
    /// Propagates conversion errors. Unresolvable classes are an error only
    /// when `strict` is set.
    pub fn build(root: &Arc<ProxySubmodule>, signature: InputSignature, strict: bool) -> Result<Self> {
        Self::from_proxies(&root.realize_tree()?, signature, strict)
    }

    /// Records the submodules a forward pass already realized, without
    /// converting anything else.
    ///
    /// `proxies` come in creation order; when two share a path (a module
    /// passed in as an argument converts at the empty path too) the first
    /// one wins.
    ///
    /// # Errors
    ///
    /// Unresolvable classes are an error only when `strict` is set.
    pub fn from_proxies(
        proxies: &[Arc<ProxySubmodule>],
        signature: InputSignature,
        strict: bool,
    ) -> Result<Self> {
        let mut paths = HashSet::new();
        let mut entries = Vec::new();
        for proxy in proxies {
            if !paths.insert(proxy.path()) {
                continue;
            }
            let backend_class = match proxy.backend_class() {
                Ok(class) => Some(class.entity().clone()),
                Err(Error::NoBackendEquivalent(_)) if !strict => None,
                Err(err) => return Err(err),
            };
            entries.push(PlanEntry {
                path: proxy.path().to_owned(),
                source_class: proxy.class_id().clone(),
                backend_class,
            });
        }
        Ok(Self {
            signature,
            entries,
            autotune: false,
        })
    }

    /// Checks that every entry fits the model under `root` and returns the
    /// backend class to bind at each path, without binding anything.
    ///
    /// # Errors
    ///
    /// Fails when a path no longer exists, holds a different class, is
    /// already bound to another backend class, or names a backend class that
    /// is not available.
    pub fn resolve(
        &self,
        root: &Arc<ProxySubmodule>,
        manager: &TransformManager,
    ) -> Result<Vec<(Arc<ProxySubmodule>, Arc<dyn BackendClass>)>> {
        let mut bindings = Vec::new();
        for entry in &self.entries {
            let proxy = root.descendant(&entry.path)?;
            if proxy.class_id() != &entry.source_class {
                return Err(Error::InvalidArgument(format!(
                    "'{}' holds '{}', the plan expects '{}'",
                    entry.path,
                    proxy.class_id(),
                    entry.source_class
                )));
            }
            let Some(backend_id) = &entry.backend_class else {
                continue;
            };
            let class = manager
                .catalog_class(backend_id)
                .or_else(|| {
                    manager
                        .transform_class(&entry.source_class)
                        .ok()
                        .filter(|class| class.entity() == backend_id)
                })
                .ok_or_else(|| Error::UnresolvedEntity(backend_id.clone()))?;
            if let Some(bound) = proxy.resolved_class()
                && bound.entity() != backend_id
            {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is already bound to '{}', the plan expects '{backend_id}'",
                    entry.path,
                    bound.entity()
                )));
            }
            bindings.push((proxy, class));
        }
        Ok(bindings)
    }

    /// Binds the recorded backend classes onto the proxies under `root`
    /// without resolving anything through the registry rules.
    ///
    /// Returns the number of bound submodules.
    ///
    /// # Errors
    ///
    /// See [`GraphPlan::resolve`]. Nothing is bound when it fails.
    pub fn install(&self, root: &Arc<ProxySubmodule>, manager: &TransformManager) -> Result<usize> {
        let bindings = self.resolve(root, manager)?;
        Ok(bind(bindings))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the plan has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Binds resolved classes, returning how many were bound.
pub(crate) fn bind(bindings: Vec<(Arc<ProxySubmodule>, Arc<dyn BackendClass>)>) -> usize {
    let count = bindings.len();
    for (proxy, class) in bindings {
        proxy.install_class(class);
    }
    count
}
