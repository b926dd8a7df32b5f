//! Transform manager: class proxy cache and registry front end.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use infer_core::{EntityId, EntityKind, Error, Result};

use crate::mock::{MockGenerator, MockPackage};
use crate::registry::{EntityRegistry, NamespaceRule};
use crate::{BackendClass, BackendFunction, Settings, TRACING_TARGET_MANAGER};

/// Forward and reverse class mappings.
///
/// Both directions are written under the same lock, so a reader never sees
/// a forward entry without its reverse entry.
#[derive(Default)]
struct ClassProxyMap {
    forward: HashMap<EntityId, Arc<dyn BackendClass>>,
    reverse: HashMap<EntityId, EntityId>,
    functions: HashMap<EntityId, BackendFunction>,
    packages: HashMap<EntityId, Arc<MockPackage>>,
}

#[derive(Default)]
struct WarningSink {
    keys: HashSet<String>,
    messages: Vec<String>,
}

/// Orchestrates class and function resolution for every conversion that
/// shares it.
///
/// Construct one per process (or per test) and pass it around as
/// `Arc<TransformManager>`.
pub struct TransformManager {
    settings: Settings,
    registry: RwLock<EntityRegistry>,
    mock: Mutex<MockGenerator>,
    proxies: Mutex<ClassProxyMap>,
    warnings: Mutex<WarningSink>,
}

impl TransformManager {
    /// Creates a manager over `registry`.
    pub fn new(settings: Settings, registry: EntityRegistry) -> Self {
        tracing::debug!(
            target: TRACING_TARGET_MANAGER,
            debug = settings.debug,
            fused_linear = settings.fused_linear,
            strict = settings.strict,
            classes = registry.len(),
            "created transform manager"
        );
        Self {
            settings,
            registry: RwLock::new(registry),
            mock: Mutex::new(MockGenerator::default()),
            proxies: Mutex::new(ClassProxyMap::default()),
            warnings: Mutex::new(WarningSink::default()),
        }
    }

    /// Creates a manager over the reference `nn` catalog with settings read
    /// from the environment.
    pub fn from_env() -> Self {
        Self::with_builtins(Settings::from_env())
    }

    /// Creates a manager over the reference `nn` catalog.
    pub fn with_builtins(settings: Settings) -> Self {
        let mut registry = EntityRegistry::new();
        crate::nn::register(&mut registry);
        Self::new(settings, registry)
    }

    /// Wraps the manager for sharing.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Settings every conversion through this manager observes.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Read access to the registry.
    pub fn registry(&self) -> RwLockReadGuard<'_, EntityRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the registry, for catalog population.
    pub fn registry_mut(&self) -> RwLockWriteGuard<'_, EntityRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mock(&self) -> MutexGuard<'_, MockGenerator> {
        self.mock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn proxies(&self) -> MutexGuard<'_, ClassProxyMap> {
        self.proxies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Extension point: adds namespace rules and class overrides.
    ///
    /// Override keys may be source identifiers or mock identifiers.
    pub fn register<R>(&self, rules: R, overrides: BTreeMap<EntityId, Arc<dyn BackendClass>>)
    where
        R: IntoIterator,
        R::Item: Into<NamespaceRule>,
    {
        self.registry_mut().register(rules, []);
        self.update_class_proxies(overrides);
    }

    /// Bulk override registration.
    pub fn update_class_proxies(&self, overrides: BTreeMap<EntityId, Arc<dyn BackendClass>>) {
        if overrides.is_empty() {
            return;
        }
        tracing::debug!(
            target: TRACING_TARGET_MANAGER,
            count = overrides.len(),
            entries = ?overrides.keys().collect::<Vec<_>>(),
            "updating class proxies"
        );
        let mut registry = self.registry_mut();
        for (id, class) in overrides {
            registry.register_override(id, class);
        }
    }

    /// Mocks every package in `packages`.
    pub fn load_class_proxies_from_packages<I>(&self, packages: I)
    where
        I: IntoIterator,
        I::Item: Into<EntityId>,
    {
        for package in packages {
            self.transform_package(package);
        }
    }

    /// Returns the mock mirror of `package`, creating it on first use.
    pub fn transform_package(&self, package: impl Into<EntityId>) -> Arc<MockPackage> {
        let package = package.into();
        let mut proxies = self.proxies();
        if let Some(existing) = proxies.packages.get(&package) {
            return Arc::clone(existing);
        }
        let mocked = self.mock().mock_package(package.clone());
        proxies.packages.insert(package, Arc::clone(&mocked));
        mocked
    }

    /// Mock identifier used as the class cache key for `id`.
    pub fn mock_name(&self, id: &EntityId) -> EntityId {
        self.mock().mock_name(id)
    }

    /// Resolves the backend class for a source class.
    ///
    /// The first successful resolution is cached. When several source
    /// identifiers alias one backend class, the reverse mapping keeps the
    /// first one resolved. The cache lock is held
    /// from lookup to insert, so concurrent first-time resolutions of the
    /// same class observe one result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedEntity`] if nothing in the registry maps
    /// the class.
    pub fn transform_class(&self, id: &EntityId) -> Result<Arc<dyn BackendClass>> {
        let mut proxies = self.proxies();
        let source_id = self.mock().source_name(id);
        let mock_id = self.mock_name(&source_id);
        if let Some(class) = proxies.forward.get(&mock_id) {
            return Ok(Arc::clone(class));
        }

        let class = self.resolve_class(&source_id, &mock_id)?;
        if self.settings.debug {
            tracing::debug!(
                target: TRACING_TARGET_MANAGER,
                source = %source_id,
                backend = %class.entity(),
                "resolved class"
            );
        }
        proxies.forward.insert(mock_id, Arc::clone(&class));
        proxies
            .reverse
            .entry(class.entity().clone())
            .or_insert(source_id);
        Ok(class)
    }

    fn resolve_class(&self, source_id: &EntityId, mock_id: &EntityId) -> Result<Arc<dyn BackendClass>> {
        let registry = self.registry();
        if let Some(class) = registry
            .override_for(mock_id)
            .or_else(|| registry.override_for(source_id))
        {
            return Ok(class);
        }
        if registry.has_namespace(source_id) {
            return registry.resolve(source_id);
        }

        let mut mock = self.mock();
        if mock.mock_entity(source_id).is_none() {
            return Err(Error::UnresolvedEntity(source_id.clone()));
        }
        let class = registry
            .resolve(mock_id)
            .map_err(|_| Error::UnresolvedEntity(source_id.clone()))?;
        mock.mark_kind(source_id, EntityKind::Class);
        Ok(class)
    }

    /// Maps a backend class identifier back to its source identifier (the
    /// first alias resolved, if there are several).
    ///
    /// Falls back to `backend_id` itself when the class was never resolved
    /// through this manager.
    pub fn reverse_transform_class(&self, backend_id: &EntityId) -> EntityId {
        if let Some(source) = self.proxies().reverse.get(backend_id) {
            return source.clone();
        }
        tracing::info!(
            target: TRACING_TARGET_MANAGER,
            backend = %backend_id,
            "no reverse class mapping, using the backend identifier"
        );
        backend_id.clone()
    }

    /// Resolves and caches a backend function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnresolvedEntity`] if nothing maps the function.
    pub fn transform_function(&self, id: &EntityId) -> Result<BackendFunction> {
        let mut proxies = self.proxies();
        if let Some(function) = proxies.functions.get(id) {
            return Ok(Arc::clone(function));
        }
        let function = self.registry().resolve_function(id)?;
        proxies.functions.insert(id.clone(), Arc::clone(&function));
        Ok(function)
    }

    /// Looks up a catalog class by backend identifier without resolution.
    pub fn catalog_class(&self, backend_id: &EntityId) -> Option<Arc<dyn BackendClass>> {
        self.registry().catalog_class(backend_id)
    }

    /// Returns `true` if values of `type_id` pass through silently.
    pub fn is_passthrough(&self, type_id: &EntityId) -> bool {
        self.registry().is_passthrough(type_id)
    }

    /// Emits `message` as a warning the first time `key` is seen.
    ///
    /// Returns `true` if the warning was emitted.
    pub fn warn_once(&self, key: impl Into<String>, message: impl Into<String>) -> bool {
        let mut sink = self.warnings.lock().unwrap_or_else(PoisonError::into_inner);
        if !sink.keys.insert(key.into()) {
            return false;
        }
        let message = message.into();
        tracing::warn!(target: TRACING_TARGET_MANAGER, "{message}");
        sink.messages.push(message);
        true
    }

    /// Every warning emitted so far, in order.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .messages
            .clone()
    }

    /// Number of cached class mappings.
    pub fn cached_classes(&self) -> usize {
        self.proxies().forward.len()
    }
}

impl std::fmt::Debug for TransformManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformManager")
            .field("settings", &self.settings)
            .field("cached_classes", &self.cached_classes())
            .finish_non_exhaustive()
    }
}
