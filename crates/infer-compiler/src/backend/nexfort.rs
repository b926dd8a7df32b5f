//! The `nexfort` ahead-of-time compiler backend.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use infer_core::{Error, Result};
use infer_transform::MemoryFormat;
use semver::Version;

use super::Backend;
use crate::graph::GraphConfig;
use crate::options::{check_keys, flag, string};
use crate::{CompileOptions, TRACING_TARGET_BACKEND};

/// Environment variable naming the compiler cache directory.
pub const ENV_INDUCTOR_CACHE_DIR: &str = "TORCHINDUCTOR_CACHE_DIR";

const NAME: &str = "nexfort";
const KEYS: &[&str] = &["mode", "memory_format", "dynamic", "fullgraph", "options"];
const DEFAULT_CACHE_DIR: &str = ".torchinductor_cache";

/// Ahead-of-time compilation with an on-disk kernel cache.
#[derive(Debug, Clone)]
pub struct NexfortBackend {
    version: Version,
    cache_dir: PathBuf,
}

impl NexfortBackend {
    /// Version of the backend this adapter targets.
    pub const VERSION: Version = Version::new(0, 1, 0);

    /// Uses `TORCHINDUCTOR_CACHE_DIR`, or `.torchinductor_cache` when unset.
    pub fn from_env() -> Self {
        let cache_dir = std::env::var_os(ENV_INDUCTOR_CACHE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        Self::with_cache_dir(cache_dir)
    }

    /// Uses an explicit cache directory.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            version: Self::VERSION,
            cache_dir: cache_dir.into(),
        }
    }

    /// Kernel cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl Backend for NexfortBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &Version {
        &self.version
    }

    fn validate(&self, options: &CompileOptions) -> Result<()> {
        let nested = &options.nexfort;
        check_keys(NAME, nested, KEYS)?;
        string(NAME, nested, "mode")?;
        flag(NAME, nested, "dynamic")?;
        flag(NAME, nested, "fullgraph")?;
        if let Some(format) = string(NAME, nested, "memory_format")? {
            MemoryFormat::from_str(format).map_err(|_| {
                Error::invalid_options(NAME, format!("unknown memory_format '{format}'"))
            })?;
        }
        if let Some(extra) = nested.get("options")
            && !extra.is_object()
        {
            return Err(Error::invalid_options(NAME, "'options' must be an object"));
        }
        Ok(())
    }

    fn graph_config(&self, options: &CompileOptions) -> Result<GraphConfig> {
        let nested = &options.nexfort;
        let mut config = GraphConfig::new(NAME, self.version.clone());
        config.memory_format = match string(NAME, nested, "memory_format")? {
            Some(format) => MemoryFormat::from_str(format).map_err(|_| {
                Error::invalid_options(NAME, format!("unknown memory_format '{format}'"))
            })?,
            None => options.memory_format,
        };
        config.dynamic = flag(NAME, nested, "dynamic")?.unwrap_or(false);
        config.strict = options.strict || flag(NAME, nested, "fullgraph")?.unwrap_or(false);
        config.autotune = string(NAME, nested, "mode")?.is_some_and(|mode| mode.contains("max-autotune"));

        if self.cache_dir.exists() {
            tracing::debug!(
                target: TRACING_TARGET_BACKEND,
                cache_dir = %self.cache_dir.display(),
                "using existing compiler cache"
            );
        } else {
            tracing::info!(
                target: TRACING_TARGET_BACKEND,
                cache_dir = %self.cache_dir.display(),
                "compiler cache directory will be created on first build"
            );
        }
        config.cache_dir = Some(self.cache_dir.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::OptionMap;

    fn options(entries: &[(&str, serde_json::Value)]) -> CompileOptions {
        CompileOptions {
            nexfort: entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect::<OptionMap>(),
            ..CompileOptions::default()
        }
    }

    #[test]
    fn test_memory_format_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NexfortBackend::with_cache_dir(dir.path());
        let options = options(&[
            ("memory_format", json!("channels_last")),
            ("mode", json!("max-optimize:max-autotune")),
            ("fullgraph", json!(true)),
            ("options", json!({"triton.fuse_attention_allow_fp16_reduction": false})),
        ]);
        backend.validate(&options).unwrap();
        let config = backend.graph_config(&options).unwrap();
        assert_eq!(config.memory_format, MemoryFormat::ChannelsLast);
        assert!(config.autotune);
        assert!(config.strict);
        assert_eq!(config.cache_dir.as_deref(), Some(dir.path()));
    }

    #[test]
    fn test_rejects_bad_entries() {
        let backend = NexfortBackend::with_cache_dir("unused");
        assert!(backend.validate(&options(&[("debug", json!(true))])).is_err());
        assert!(backend.validate(&options(&[("memory_format", json!("nhwc"))])).is_err());
        assert!(backend.validate(&options(&[("options", json!(1))])).is_err());
    }
}
