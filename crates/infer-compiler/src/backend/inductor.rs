//! Torch-level compiler backends.

use semver::Version;

use super::Backend;
use crate::graph::GraphConfig;
use crate::options::{check_keys, flag};
use crate::CompileOptions;
use infer_core::Result;

const KEYS: &[&str] = &["dynamic", "fullgraph"];

/// `compile-default` and `compile-max-autotune`.
#[derive(Debug, Clone)]
pub struct InductorBackend {
    name: &'static str,
    autotune: bool,
    version: Version,
}

impl InductorBackend {
    /// Version of the compiler this adapter targets.
    pub const VERSION: Version = Version::new(2, 3, 0);

    /// Autotuning off.
    pub fn default_mode() -> Self {
        Self {
            name: "compile-default",
            autotune: false,
            version: Self::VERSION,
        }
    }

    /// Autotuning on.
    pub fn max_autotune() -> Self {
        Self {
            name: "compile-max-autotune",
            autotune: true,
            version: Self::VERSION,
        }
    }
}

impl Backend for InductorBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &Version {
        &self.version
    }

    fn validate(&self, options: &CompileOptions) -> Result<()> {
        check_keys(self.name, &options.inductor, KEYS)?;
        for key in KEYS {
            flag(self.name, &options.inductor, key)?;
        }
        Ok(())
    }

    fn graph_config(&self, options: &CompileOptions) -> Result<GraphConfig> {
        let nested = &options.inductor;
        let mut config = GraphConfig::new(self.name, self.version.clone());
        config.memory_format = options.memory_format;
        config.autotune = self.autotune || options.autotune;
        config.dynamic = flag(self.name, nested, "dynamic")?.unwrap_or(false);
        config.strict = options.strict || flag(self.name, nested, "fullgraph")?.unwrap_or(false);
        Ok(config)
    }
}
