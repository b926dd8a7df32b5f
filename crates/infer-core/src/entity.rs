//! Fully-qualified entity identifiers.

use std::borrow::Borrow;
use std::str::FromStr;

use derive_more::{Debug, Display, From, Into};
use serde::{Deserialize, Serialize};

/// Canonical `module.path.QualName` key for a class, function, or package.
///
/// Identifiers are plain strings so they can index every cache in the
/// workspace and survive serialization into graph artifacts unchanged.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Debug, Display, From, Into)]
#[debug("{_0}")]
#[display("{_0}")]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Builds an identifier from a module path and a qualified name.
    pub fn new(module_path: impl AsRef<str>, qualname: impl AsRef<str>) -> Self {
        let module_path = module_path.as_ref();
        let qualname = qualname.as_ref();
        if module_path.is_empty() {
            Self(qualname.to_owned())
        } else {
            Self(format!("{module_path}.{qualname}"))
        }
    }

    /// Returns the identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns everything before the last segment.
    pub fn module_path(&self) -> &str {
        self.0.rsplit_once('.').map(|(module, _)| module).unwrap_or("")
    }

    /// Returns the last segment.
    pub fn name(&self) -> &str {
        self.0
            .rsplit_once('.')
            .map(|(_, name)| name)
            .unwrap_or(&self.0)
    }

    /// Returns the first segment (the top-level package).
    pub fn root(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }

    /// Returns `true` when the identifier is `namespace` itself or lives
    /// below it. `torch` matches `torch.nn.Linear` but not `torchvision.X`.
    pub fn in_namespace(&self, namespace: &str) -> bool {
        let namespace = namespace.trim_end_matches('.');
        if namespace.is_empty() {
            return false;
        }
        self.0 == namespace
            || self
                .0
                .strip_prefix(namespace)
                .is_some_and(|rest| rest.starts_with('.'))
    }

    /// Replaces the leading `from` namespace with `to`.
    ///
    /// Returns `None` when the identifier is outside `from`.
    pub fn rewrite_namespace(&self, from: &str, to: &str) -> Option<Self> {
        if !self.in_namespace(from) {
            return None;
        }
        let from = from.trim_end_matches('.');
        let to = to.trim_end_matches('.');
        let rest = &self.0[from.len()..];
        Some(Self(format!("{to}{rest}")))
    }

    /// Prepends `prefix` to the top-level package name.
    pub fn with_root_prefix(&self, prefix: &str) -> Self {
        Self(format!("{prefix}{}", self.0))
    }

    /// Removes `prefix` from the top-level package name.
    pub fn strip_root_prefix(&self, prefix: &str) -> Option<Self> {
        if prefix.is_empty() {
            return None;
        }
        self.0.strip_prefix(prefix).map(|rest| Self(rest.to_owned()))
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What an entity identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A class (module type, tensor type, helper type).
    Class,
    /// A free function.
    Function,
    /// A whole package or module namespace.
    Package,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments() {
        let id = EntityId::new("torch.nn.modules.linear", "Linear");
        assert_eq!(id.as_str(), "torch.nn.modules.linear.Linear");
        assert_eq!(id.module_path(), "torch.nn.modules.linear");
        assert_eq!(id.name(), "Linear");
        assert_eq!(id.root(), "torch");
    }

    #[test]
    fn test_namespace_boundaries() {
        let id = EntityId::from("torch.nn.Linear");
        assert!(id.in_namespace("torch"));
        assert!(id.in_namespace("torch."));
        assert!(id.in_namespace("torch.nn"));
        assert!(!id.in_namespace("torc"));
        assert!(!EntityId::from("torchvision.ops.Nms").in_namespace("torch"));
    }

    #[test]
    fn test_rewrite_namespace() {
        let id = EntityId::from("torch.nn.Linear");
        assert_eq!(
            id.rewrite_namespace("torch", "oneflow"),
            Some(EntityId::from("oneflow.nn.Linear"))
        );
        assert_eq!(id.rewrite_namespace("diffusers", "oneflow"), None);
    }

    #[test]
    fn test_root_prefix() {
        let id = EntityId::from("diffusers.models.Attention");
        let mocked = id.with_root_prefix("mock_");
        assert_eq!(mocked.as_str(), "mock_diffusers.models.Attention");
        assert_eq!(mocked.strip_root_prefix("mock_"), Some(id));
    }

    #[test]
    fn test_empty_module_path() {
        let id = EntityId::new("", "builtins");
        assert_eq!(id.as_str(), "builtins");
        assert_eq!(id.module_path(), "");
        assert_eq!(id.name(), "builtins");
    }
}
