//! The `oneflow` backend.

use semver::Version;

use super::Backend;
use crate::graph::GraphConfig;
use crate::options::{check_keys, flag};
use crate::CompileOptions;
use infer_core::Result;

const NAME: &str = "oneflow";
const KEYS: &[&str] = &["debug", "dynamic", "fuse_linear"];

/// Graph compilation through the `oneflow` namespace.
#[derive(Debug, Clone)]
pub struct OneflowBackend {
    version: Version,
}

impl OneflowBackend {
    /// Version of the backend this adapter targets.
    pub const VERSION: Version = Version::new(0, 9, 1);

    /// An adapter reporting [`OneflowBackend::VERSION`].
    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
        }
    }

    /// An adapter reporting a different backend version.
    pub fn with_version(version: Version) -> Self {
        Self { version }
    }
}

impl Default for OneflowBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OneflowBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &Version {
        &self.version
    }

    fn validate(&self, options: &CompileOptions) -> Result<()> {
        check_keys(NAME, &options.oneflow, KEYS)?;
        for key in KEYS {
            flag(NAME, &options.oneflow, key)?;
        }
        Ok(())
    }

    fn graph_config(&self, options: &CompileOptions) -> Result<GraphConfig> {
        let nested = &options.oneflow;
        let mut config = GraphConfig::new(NAME, self.version.clone());
        config.memory_format = options.memory_format;
        config.strict = options.strict;
        config.debug = flag(NAME, nested, "debug")?.unwrap_or(false);
        config.dynamic = flag(NAME, nested, "dynamic")?.unwrap_or(false);
        config.fused_linear = flag(NAME, nested, "fuse_linear")?;
        Ok(config)
    }
}
