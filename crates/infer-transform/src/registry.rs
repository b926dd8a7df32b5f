//! Entity registry mapping source identifiers onto backend entities.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use infer_core::{EntityId, Error, Result};

use crate::{BackendClass, BackendFunction, TRACING_TARGET_REGISTRY};

/// A namespace rewrite rule, e.g. `torch` to `oneflow`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceRule {
    /// Source namespace prefix.
    pub source: String,
    /// Backend namespace prefix.
    pub backend: String,
}

impl NamespaceRule {
    /// Creates a rewrite rule.
    pub fn new(source: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            backend: backend.into(),
        }
    }
}

impl<S: Into<String>, B: Into<String>> From<(S, B)> for NamespaceRule {
    fn from((source, backend): (S, B)) -> Self {
        Self::new(source, backend)
    }
}

/// Catalog of backend entities plus the rules mapping source identifiers to
/// them.
///
/// The catalog is the set of backend classes and functions that exist; it
/// is populated once at startup. Resolution tries an explicit override
/// first, then every namespace rule whose source prefix matches.
#[derive(Default)]
pub struct EntityRegistry {
    classes: HashMap<EntityId, Arc<dyn BackendClass>>,
    functions: HashMap<EntityId, BackendFunction>,
    overrides: HashMap<EntityId, Arc<dyn BackendClass>>,
    rules: Vec<NamespaceRule>,
    passthrough: HashSet<EntityId>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds namespace rewrite rules and explicit class overrides.
    ///
    /// Override keys are source (or mock) identifiers. Rules already present
    /// are not duplicated.
    pub fn register<R, O>(&mut self, rules: R, overrides: O)
    where
        R: IntoIterator,
        R::Item: Into<NamespaceRule>,
        O: IntoIterator<Item = (EntityId, Arc<dyn BackendClass>)>,
    {
        for rule in rules {
            let rule = rule.into();
            if !self.rules.contains(&rule) {
                tracing::debug!(
                    target: TRACING_TARGET_REGISTRY,
                    source = %rule.source,
                    backend = %rule.backend,
                    "registered namespace rule"
                );
                self.rules.push(rule);
            }
        }
        for (id, class) in overrides {
            self.register_override(id, class);
        }
    }

    /// Maps `id` directly onto `class`, bypassing namespace rules.
    pub fn register_override(&mut self, id: EntityId, class: Arc<dyn BackendClass>) {
        tracing::debug!(
            target: TRACING_TARGET_REGISTRY,
            source = %id,
            backend = %class.entity(),
            "registered class override"
        );
        self.overrides.insert(id, class);
    }

    /// Adds a backend class to the catalog under its own identifier.
    pub fn register_class(&mut self, class: Arc<dyn BackendClass>) {
        self.classes.insert(class.entity().clone(), class);
    }

    /// Adds a backend function to the catalog.
    pub fn register_function(&mut self, id: impl Into<EntityId>, function: BackendFunction) {
        self.functions.insert(id.into(), function);
    }

    /// Marks a helper type as known so its values pass through conversion
    /// silently.
    pub fn register_passthrough(&mut self, type_id: impl Into<EntityId>) {
        self.passthrough.insert(type_id.into());
    }

    /// Returns `true` if values of `type_id` pass through without warning.
    pub fn is_passthrough(&self, type_id: &EntityId) -> bool {
        self.passthrough.contains(type_id)
    }

    /// Returns `true` if some rule rewrites `id`.
    pub fn has_namespace(&self, id: &EntityId) -> bool {
        self.rules.iter().any(|rule| id.in_namespace(&rule.source))
    }

    /// Returns the override registered for exactly `id`.
    pub fn override_for(&self, id: &EntityId) -> Option<Arc<dyn BackendClass>> {
        self.overrides.get(id).cloned()
    }

    /// Looks up a catalog class by its backend identifier.
    pub fn catalog_class(&self, backend_id: &EntityId) -> Option<Arc<dyn BackendClass>> {
        self.classes.get(backend_id).cloned()
    }

    /// Resolves a source class identifier to its backend class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedEntity`] when no override exists and no
    /// rewritten candidate is in the catalog.
    pub fn resolve(&self, id: &EntityId) -> Result<Arc<dyn BackendClass>> {
        if let Some(class) = self.override_for(id) {
            return Ok(class);
        }
        self.candidates(id)
            .find_map(|candidate| self.classes.get(&candidate).cloned())
            .ok_or_else(|| Error::UnresolvedEntity(id.clone()))
    }

    /// Resolves a source function identifier to its backend function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedEntity`] when nothing matches.
    pub fn resolve_function(&self, id: &EntityId) -> Result<BackendFunction> {
        if let Some(function) = self.functions.get(id) {
            return Ok(Arc::clone(function));
        }
        self.candidates(id)
            .find_map(|candidate| self.functions.get(&candidate).cloned())
            .ok_or_else(|| Error::UnresolvedEntity(id.clone()))
    }

    fn candidates<'a>(&'a self, id: &'a EntityId) -> impl Iterator<Item = EntityId> + 'a {
        self.rules
            .iter()
            .filter_map(move |rule| id.rewrite_namespace(&rule.source, &rule.backend))
    }

    /// Registered namespace rules, in registration order.
    pub fn rules(&self) -> &[NamespaceRule] {
        &self.rules
    }

    /// Number of catalog classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns whether the catalog holds no classes.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field("rules", &self.rules)
            .field("passthrough", &self.passthrough)
            .finish()
    }
}
