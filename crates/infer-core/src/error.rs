//! Error types shared by every infer crate.

use strum::{AsRefStr, IntoStaticStr};
use thiserror::Error as ThisError;

use crate::EntityId;

/// Result type for transformation and compilation operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categories of errors, used for logging and for callers that only need to
/// branch on the broad failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// A class or function has no backend mapping.
    UnresolvedEntity,
    /// A dtype or device enumerant has no backend equivalent.
    UnsupportedValue,
    /// A proxied submodule has no backend replacement class.
    NoBackendEquivalent,
    /// The requested compiler backend is unknown or misconfigured.
    Backend,
    /// A compiled graph artifact could not be written or restored.
    Graph,
    /// Attribute, index or argument access on a module failed.
    Access,
    /// Filesystem or serialization failure.
    Io,
    /// Internal invariant violation.
    Internal,
}

/// Errors that can occur while transforming, compiling or executing modules.
#[derive(Debug, ThisError)]
pub enum Error {
    /// No override and no namespace rewrite produced a backend entity.
    #[error("no backend mapping found for entity '{0}'")]
    UnresolvedEntity(EntityId),

    /// A source dtype has no backend equivalent.
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),

    /// A source device has no backend equivalent.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// A proxied submodule cannot be invoked because its class has no
    /// backend replacement.
    #[error("no backend equivalent for module class '{0}'")]
    NoBackendEquivalent(EntityId),

    /// The requested backend key is not registered.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// Compile options were rejected by the selected backend.
    #[error("invalid options for backend '{backend}': {message}")]
    InvalidOptions {
        /// Backend that rejected the options.
        backend: String,
        /// Reason for the rejection.
        message: String,
    },

    /// A graph artifact is absent, corrupt or incompatible.
    #[error("failed to load graph from '{path}': {message}")]
    GraphLoad {
        /// Artifact location.
        path: String,
        /// Reason for the failure.
        message: String,
    },

    /// A graph was requested before any compilation happened.
    #[error("no compiled graph available{}", .part.as_ref().map(|p| format!(" for '{p}'")).unwrap_or_default())]
    GraphNotCompiled {
        /// Pipeline part, when known.
        part: Option<String>,
    },

    /// An opaque value of an unregistered type was met in strict mode.
    #[error("unregistered type '{type_id}' in strict conversion{}", .attribute.as_ref().map(|a| format!(" (attribute '{a}')")).unwrap_or_default())]
    UnregisteredType {
        /// Type of the offending value.
        type_id: EntityId,
        /// Attribute the value was read from, if any.
        attribute: Option<String>,
    },

    /// A module attribute does not exist.
    #[error("'{class}' has no attribute '{attribute}'")]
    AttributeNotFound {
        /// Class of the module that was queried.
        class: EntityId,
        /// Missing attribute.
        attribute: String,
    },

    /// Indexing was attempted on a module that holds no items.
    #[error("'{0}' is not indexable")]
    NotIndexable(EntityId),

    /// Index is outside the module's item list.
    #[error("index {index} out of range for '{class}' with {len} items")]
    IndexOutOfRange {
        /// Class of the indexed module.
        class: EntityId,
        /// Requested index.
        index: isize,
        /// Number of items.
        len: usize,
    },

    /// A call received arguments it cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The conversion session backing a proxy was dropped.
    #[error("conversion session was released")]
    SessionReleased,

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new invalid options error.
    pub fn invalid_options(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a new graph load error.
    pub fn graph_load(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::GraphLoad {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvedEntity(_) => ErrorKind::UnresolvedEntity,
            Self::UnsupportedDType(_) | Self::UnsupportedDevice(_) => ErrorKind::UnsupportedValue,
            Self::NoBackendEquivalent(_) => ErrorKind::NoBackendEquivalent,
            Self::UnknownBackend(_) | Self::InvalidOptions { .. } => ErrorKind::Backend,
            Self::GraphLoad { .. } | Self::GraphNotCompiled { .. } => ErrorKind::Graph,
            Self::UnregisteredType { .. }
            | Self::AttributeNotFound { .. }
            | Self::NotIndexable(_)
            | Self::IndexOutOfRange { .. }
            | Self::InvalidArgument(_) => ErrorKind::Access,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Io,
            Self::SessionReleased | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error kind as a string.
    pub fn kind_str(&self) -> &'static str {
        self.kind().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_str() {
        let err = Error::UnknownBackend("made-up".into());
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.kind_str(), "backend");
    }

    #[test]
    fn test_graph_not_compiled_message() {
        let err = Error::GraphNotCompiled {
            part: Some("unet".into()),
        };
        assert_eq!(err.to_string(), "no compiled graph available for 'unet'");
        assert_eq!(
            Error::GraphNotCompiled { part: None }.to_string(),
            "no compiled graph available"
        );
    }

    #[test]
    fn test_graph_load_path() {
        let err = Error::graph_load("/tmp/unet", "truncated");
        assert_eq!(
            err.to_string(),
            "failed to load graph from '/tmp/unet': truncated"
        );
    }
}
