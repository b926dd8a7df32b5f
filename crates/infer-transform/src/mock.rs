//! Lazy mirrors of source packages.
//!
//! Mocking a package does not touch its contents: entity placeholders are
//! only created when first looked up, so overrides can be declared against
//! `mock_diffusers.X` before any backend counterpart exists.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use infer_core::{EntityId, EntityKind};

use crate::TRACING_TARGET_MOCK;

/// Default prefix prepended to the top-level package of mocked names.
pub const DEFAULT_MOCK_PREFIX: &str = "mock_";

/// A mocked source package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPackage {
    name: EntityId,
    mock_name: EntityId,
}

impl MockPackage {
    /// Source package name.
    pub fn name(&self) -> &EntityId {
        &self.name
    }

    /// Mirror namespace name.
    pub fn mock_name(&self) -> &EntityId {
        &self.mock_name
    }
}

/// Placeholder for one entity inside a mocked package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEntity {
    source: EntityId,
    mock: EntityId,
    package: EntityId,
    kind: Option<EntityKind>,
}

impl MockEntity {
    /// Source identifier.
    pub fn source(&self) -> &EntityId {
        &self.source
    }

    /// Mock identifier.
    pub fn mock(&self) -> &EntityId {
        &self.mock
    }

    /// Package the entity was mocked through.
    pub fn package(&self) -> &EntityId {
        &self.package
    }

    /// What the entity resolved to, once known.
    pub fn kind(&self) -> Option<EntityKind> {
        self.kind
    }
}

/// Generator of mock namespaces and entities.
#[derive(Debug)]
pub struct MockGenerator {
    prefix: String,
    packages: BTreeMap<EntityId, Arc<MockPackage>>,
    entities: HashMap<EntityId, Arc<MockEntity>>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_MOCK_PREFIX)
    }
}

impl MockGenerator {
    /// Creates a generator with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            packages: BTreeMap::new(),
            entities: HashMap::new(),
        }
    }

    /// Mock prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a lazy mirror of `package`. Idempotent.
    pub fn mock_package(&mut self, package: impl Into<EntityId>) -> Arc<MockPackage> {
        let name = package.into();
        if let Some(existing) = self.packages.get(&name) {
            return Arc::clone(existing);
        }

        let package = Arc::new(MockPackage {
            mock_name: name.with_root_prefix(&self.prefix),
            name: name.clone(),
        });
        tracing::debug!(
            target: TRACING_TARGET_MOCK,
            package = %name,
            mock = %package.mock_name,
            "mocked package"
        );
        self.packages.insert(name, Arc::clone(&package));
        package
    }

    /// Returns the mocked package that contains `id`, if any.
    pub fn package_of(&self, id: &EntityId) -> Option<&Arc<MockPackage>> {
        // Longest match wins so `diffusers.models` beats `diffusers`.
        self.packages
            .iter()
            .filter(|(name, _)| id.in_namespace(name.as_str()))
            .max_by_key(|(name, _)| name.as_str().len())
            .map(|(_, package)| package)
    }

    /// Returns the placeholder for `id`, creating it on first use.
    ///
    /// Returns `None` when no mocked package contains `id`.
    pub fn mock_entity(&mut self, id: &EntityId) -> Option<Arc<MockEntity>> {
        if let Some(entity) = self.entities.get(id) {
            return Some(Arc::clone(entity));
        }

        let package = self.package_of(id)?.name().clone();
        let entity = Arc::new(MockEntity {
            source: id.clone(),
            mock: id.with_root_prefix(&self.prefix),
            package,
            kind: None,
        });
        self.entities.insert(id.clone(), Arc::clone(&entity));
        Some(entity)
    }

    /// Records what a mocked entity turned out to be.
    pub fn mark_kind(&mut self, id: &EntityId, kind: EntityKind) {
        if let Some(entity) = self.entities.get_mut(id) {
            Arc::make_mut(entity).kind = Some(kind);
        }
    }

    /// Mock identifier of `id`, or `id` itself outside mocked packages.
    pub fn mock_name(&self, id: &EntityId) -> EntityId {
        if self.is_mock(id) || self.package_of(id).is_none() {
            id.clone()
        } else {
            id.with_root_prefix(&self.prefix)
        }
    }

    /// Source identifier of a mock identifier, or `id` itself.
    ///
    /// Only identifiers whose unprefixed form lies inside a mocked package
    /// count as mocks, so a real package that happens to start with the
    /// prefix keeps its name.
    pub fn source_name(&self, id: &EntityId) -> EntityId {
        self.unmocked(id).unwrap_or_else(|| id.clone())
    }

    /// Returns `true` if `id` is the mock identifier of an entity inside a
    /// mocked package.
    pub fn is_mock(&self, id: &EntityId) -> bool {
        self.unmocked(id).is_some()
    }

    fn unmocked(&self, id: &EntityId) -> Option<EntityId> {
        if self.prefix.is_empty() {
            return None;
        }
        id.strip_root_prefix(&self.prefix)
            .filter(|source| self.package_of(source).is_some())
    }

    /// Registered packages, in name order.
    pub fn mocked_packages(&self) -> Vec<EntityId> {
        self.packages.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_package_is_idempotent() {
        let mut mock = MockGenerator::default();
        let first = mock.mock_package("diffusers");
        let second = mock.mock_package("diffusers");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.mock_name().as_str(), "mock_diffusers");
        assert_eq!(mock.mocked_packages(), vec![EntityId::from("diffusers")]);
    }

    #[test]
    fn test_mock_entity_requires_mocked_package() {
        let mut mock = MockGenerator::default();
        let id = EntityId::from("diffusers.models.attention_processor.Attention");
        assert!(mock.mock_entity(&id).is_none());
        assert_eq!(mock.mock_name(&id), id);

        mock.mock_package("diffusers");
        let entity = mock.mock_entity(&id).unwrap();
        assert_eq!(
            entity.mock().as_str(),
            "mock_diffusers.models.attention_processor.Attention"
        );
        assert_eq!(entity.package().as_str(), "diffusers");
        assert_eq!(mock.mock_name(&id), *entity.mock());
        assert!(Arc::ptr_eq(&entity, &mock.mock_entity(&id).unwrap()));
    }

    #[test]
    fn test_mock_name_roundtrip() {
        let mut mock = MockGenerator::new("mk_");
        mock.mock_package("my_pkg");
        let id = EntityId::from("my_pkg.blocks.Block");
        let mocked = mock.mock_name(&id);
        assert_eq!(mocked.as_str(), "mk_my_pkg.blocks.Block");
        assert!(mock.is_mock(&mocked));
        assert_eq!(mock.mock_name(&mocked), mocked);
        assert_eq!(mock.source_name(&mocked), id);
    }

    #[test]
    fn test_longest_package_wins() {
        let mut mock = MockGenerator::default();
        mock.mock_package("diffusers");
        mock.mock_package("diffusers.models");
        let id = EntityId::from("diffusers.models.Unet");
        let package = mock.package_of(&id).unwrap();
        assert_eq!(package.name().as_str(), "diffusers.models");
        assert!(mock.package_of(&"diffusers_extra.X".into()).is_none());
    }

    #[test]
    fn test_mark_kind() {
        let mut mock = MockGenerator::default();
        mock.mock_package("my_pkg");
        let id = EntityId::from("my_pkg.Layer");
        mock.mock_entity(&id);
        mock.mark_kind(&id, EntityKind::Class);
        assert_eq!(mock.mock_entity(&id).unwrap().kind(), Some(EntityKind::Class));
    }

    #[test]
    fn test_prefixed_real_package_is_not_a_mock() {
        let mut mock = MockGenerator::default();
        let id = EntityId::from("mock_utils.helpers.Timer");
        assert!(!mock.is_mock(&id));
        assert_eq!(mock.source_name(&id), id);

        mock.mock_package("mock_utils");
        assert_eq!(mock.source_name(&id), id);
        assert_eq!(mock.mock_name(&id).as_str(), "mock_mock_utils.helpers.Timer");

        mock.mock_package("utils");
        assert!(mock.is_mock(&id));
        assert_eq!(mock.source_name(&id).as_str(), "utils.helpers.Timer");
    }
}
