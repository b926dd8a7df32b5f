//! Compile options.

use std::collections::BTreeMap;
use std::str::FromStr;

use derive_builder::Builder;
use infer_core::{Error, Result};
use infer_transform::MemoryFormat;
use serde::{Deserialize, Serialize};

/// Backend-specific option table.
pub type OptionMap = BTreeMap<String, serde_json::Value>;

/// Options accepted by [`compile`](crate::compile).
///
/// The nested maps are validated by the selected backend: keys it does not
/// recognize are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into), default, build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct CompileOptions {
    /// Memory layout reported to convolution layers.
    pub memory_format: MemoryFormat,

    /// Autotune kernels (torch-level compiler only).
    pub autotune: bool,

    /// Fail on unregistered types and resolve module classes eagerly.
    pub strict: bool,

    /// Options for the `oneflow` backend.
    pub oneflow: OptionMap,

    /// Options for the `nexfort` backend.
    pub nexfort: OptionMap,

    /// Options for the torch-level compiler backends.
    pub inductor: OptionMap,
}

impl CompileOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(nexfort) = &self.nexfort
            && let Some(format) = nexfort.get("memory_format")
        {
            let valid = format
                .as_str()
                .is_some_and(|f| MemoryFormat::from_str(f).is_ok());
            if !valid {
                return Err(format!("nexfort memory_format {format} is not a memory format"));
            }
        }
        Ok(())
    }
}

impl CompileOptions {
    /// Returns a builder.
    pub fn builder() -> CompileOptionsBuilder {
        CompileOptionsBuilder::default()
    }

    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Rejects keys of `map` that are not in `recognized`.
pub(crate) fn check_keys(backend: &str, map: &OptionMap, recognized: &[&str]) -> Result<()> {
    let unknown: Vec<&str> = map
        .keys()
        .map(String::as_str)
        .filter(|key| !recognized.contains(key))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(Error::invalid_options(
        backend,
        format!(
            "unrecognized keys [{}]; expected one of [{}]",
            unknown.join(", "),
            recognized.join(", ")
        ),
    ))
}

/// Reads an optional boolean entry.
pub(crate) fn flag(backend: &str, map: &OptionMap, key: &str) -> Result<Option<bool>> {
    match map.get(key) {
        None => Ok(None),
        Some(serde_json::Value::Bool(value)) => Ok(Some(*value)),
        Some(other) => Err(Error::invalid_options(
            backend,
            format!("'{key}' must be a boolean, got {other}"),
        )),
    }
}

/// Reads an optional string entry.
pub(crate) fn string<'a>(backend: &str, map: &'a OptionMap, key: &str) -> Result<Option<&'a str>> {
    match map.get(key) {
        None => Ok(None),
        Some(serde_json::Value::String(value)) => Ok(Some(value.as_str())),
        Some(other) => Err(Error::invalid_options(
            backend,
            format!("'{key}' must be a string, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_builder_defaults() {
        let options = CompileOptions::builder().build().unwrap();
        assert_eq!(options, CompileOptions::default());
        assert_eq!(options.memory_format, MemoryFormat::ContiguousFormat);
    }

    #[test]
    fn test_builder_rejects_bad_memory_format() {
        let nexfort = OptionMap::from([("memory_format".to_owned(), json!("diagonal"))]);
        assert!(CompileOptions::builder().nexfort(nexfort).build().is_err());

        let nexfort = OptionMap::from([("memory_format".to_owned(), json!("channels_last"))]);
        assert!(CompileOptions::builder().nexfort(nexfort).build().is_ok());
    }

    #[test]
    fn test_from_json() {
        let options = CompileOptions::from_json(
            r#"{"memory_format": "channels_last", "oneflow": {"dynamic": true}}"#,
        )
        .unwrap();
        assert_eq!(options.memory_format, MemoryFormat::ChannelsLast);
        assert_eq!(options.oneflow["dynamic"], json!(true));
        assert!(CompileOptions::from_json("{").is_err());
    }

    #[test]
    fn test_key_and_value_checks() {
        let map = OptionMap::from([
            ("dynamic".to_owned(), json!(true)),
            ("mode".to_owned(), json!(3)),
        ]);
        assert!(check_keys("nexfort", &map, &["dynamic", "mode"]).is_ok());
        let err = check_keys("oneflow", &map, &["dynamic"]).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions { backend, .. } if backend == "oneflow"));
        assert_eq!(flag("x", &map, "dynamic").unwrap(), Some(true));
        assert_eq!(flag("x", &map, "absent").unwrap(), None);
        assert!(string("x", &map, "mode").is_err());
    }
}
