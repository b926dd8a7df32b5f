//! Persisted graph artifacts.
//!
//! An artifact is a JSON envelope of a header, a body holding one plan per
//! input signature, and a SHA-256 checksum over both. It is written to a
//! temporary file next to the destination and renamed into place.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use infer_core::{EntityId, Error, Module, Result};
use jiff::Timestamp;
use semver::{Comparator, Op, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TRACING_TARGET_ARTIFACT;
use crate::graph::GraphPlan;

/// Current envelope format.
pub const FORMAT_VERSION: u32 = 1;

/// Artifact metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub format_version: u32,
    pub backend: String,
    pub backend_version: Version,
    pub part: Option<String>,
    pub source_class: EntityId,
    /// Digest of parameter names, shapes and dtypes.
    pub fingerprint: String,
    pub created_at: Timestamp,
}

/// Artifact payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactBody {
    pub graphs: Vec<GraphPlan>,
}

/// What a loader expects an artifact to match.
#[derive(Debug, Clone)]
pub struct ArtifactExpectation<'a> {
    pub backend: &'a str,
    pub backend_version: &'a Version,
    pub source_class: &'a EntityId,
    pub fingerprint: &'a str,
}

/// A compiled graph artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphArtifact {
    pub header: ArtifactHeader,
    pub body: ArtifactBody,
    pub checksum: String,
}

impl GraphArtifact {
    /// Seals `header` and `body` with their checksum.
    ///
    /// # Errors
    ///
    /// Fails if the contents cannot be serialized.
    pub fn new(header: ArtifactHeader, body: ArtifactBody) -> Result<Self> {
        let checksum = checksum(&header, &body)?;
        Ok(Self {
            header,
            body,
            checksum,
        })
    }

    /// Writes the artifact atomically.
    ///
    /// # Errors
    ///
    /// Fails on filesystem or serialization errors.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| Error::Io(err.error))?;

        tracing::debug!(
            target: TRACING_TARGET_ARTIFACT,
            path = %path.display(),
            backend = %self.header.backend,
            graphs = self.body.graphs.len(),
            "wrote graph artifact"
        );
        Ok(())
    }

    /// Reads and checksums an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphLoad`] if the file is missing, truncated,
    /// malformed or fails its checksum.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| Error::graph_load(path, err.to_string()))?;
        let artifact: Self = serde_json::from_slice(&bytes)
            .map_err(|err| Error::graph_load(path, format!("malformed artifact: {err}")))?;

        let expected = checksum(&artifact.header, &artifact.body)
            .map_err(|err| Error::graph_load(path, err.to_string()))?;
        if expected != artifact.checksum {
            return Err(Error::graph_load(path, "checksum mismatch"));
        }
        Ok(artifact)
    }

    /// Checks that the artifact was produced for the expected model and a
    /// compatible backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphLoad`] describing the first mismatch.
    pub fn validate(&self, path: &Path, expect: &ArtifactExpectation<'_>) -> Result<()> {
        let header = &self.header;
        if header.format_version != FORMAT_VERSION {
            return Err(Error::graph_load(
                path,
                format!("unsupported format version {}", header.format_version),
            ));
        }
        if header.backend != expect.backend {
            return Err(Error::graph_load(
                path,
                format!(
                    "compiled for backend '{}', not '{}'",
                    header.backend, expect.backend
                ),
            ));
        }
        if !is_compatible(&header.backend_version, expect.backend_version) {
            return Err(Error::graph_load(
                path,
                format!(
                    "compiled with {} {}, incompatible with {}",
                    header.backend, header.backend_version, expect.backend_version
                ),
            ));
        }
        if &header.source_class != expect.source_class {
            return Err(Error::graph_load(
                path,
                format!(
                    "compiled for '{}', not '{}'",
                    header.source_class, expect.source_class
                ),
            ));
        }
        if header.fingerprint != expect.fingerprint {
            return Err(Error::graph_load(path, "parameter fingerprint mismatch"));
        }
        Ok(())
    }
}

fn checksum(header: &ArtifactHeader, body: &ArtifactBody) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(header)?);
    hasher.update(serde_json::to_vec(body)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Returns `true` if graphs compiled with `saved` run on `current`.
///
/// Caret semantics: same major version (same minor below 1.0), and
/// `current` not older than `saved`.
pub fn is_compatible(saved: &Version, current: &Version) -> bool {
    let comparator = Comparator {
        op: Op::Caret,
        major: saved.major,
        minor: Some(saved.minor),
        patch: Some(saved.patch),
        pre: saved.pre.clone(),
    };
    comparator.matches(current)
}

/// Digest of every parameter reachable from `module`: names, shapes and
/// dtypes. Values are not hashed, so refreshed weights keep the fingerprint.
pub fn fingerprint(module: &Arc<Module>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module.class_id().as_str().as_bytes());
    for (name, tensor) in module.named_tensors() {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update(tensor.dtype().as_ref().as_bytes());
        for dim in tensor.shape() {
            hasher.update((*dim as u64).to_le_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use infer_core::Tensor;

    use super::*;
    use crate::graph::{InputSignature, PlanEntry};

    fn module(out: usize) -> Arc<Module> {
        Module::new("torch.nn.Linear")
            .with(
                "weight",
                Tensor::from_f32(vec![out, 1], &vec![0.0; out]).unwrap().shared(),
            )
            .shared()
    }

    fn artifact(module: &Arc<Module>) -> GraphArtifact {
        let header = ArtifactHeader {
            format_version: FORMAT_VERSION,
            backend: "oneflow".into(),
            backend_version: Version::new(1, 2, 0),
            part: Some("unet".into()),
            source_class: module.class_id().clone(),
            fingerprint: fingerprint(module),
            created_at: Timestamp::now(),
        };
        let body = ArtifactBody {
            graphs: vec![GraphPlan {
                signature: InputSignature::default(),
                entries: vec![PlanEntry {
                    path: String::new(),
                    source_class: "torch.nn.Linear".into(),
                    backend_class: Some("oneflow.nn.Linear".into()),
                }],
                autotune: false,
            }],
        };
        GraphArtifact::new(header, body).unwrap()
    }

    fn expectation<'a>(
        module: &'a Arc<Module>,
        version: &'a Version,
        fingerprint: &'a str,
    ) -> ArtifactExpectation<'a> {
        ArtifactExpectation {
            backend: "oneflow",
            backend_version: version,
            source_class: module.class_id(),
            fingerprint,
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("unet");
        let module = module(2);
        let written = artifact(&module);
        written.write(&path).unwrap();

        let read = GraphArtifact::read(&path).unwrap();
        assert_eq!(read, written);
        let version = Version::new(1, 3, 1);
        let fp = fingerprint(&module);
        read.validate(&path, &expectation(&module, &version, &fp))
            .unwrap();
    }

    #[test]
    fn test_corrupt_and_truncated_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unet");
        artifact(&module(2)).write(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, &text[..text.len() / 2]).unwrap();
        assert!(matches!(GraphArtifact::read(&path), Err(Error::GraphLoad { .. })));

        fs::write(&path, text.replace("oneflow.nn.Linear", "oneflow.nn.Linaer")).unwrap();
        let err = GraphArtifact::read(&path).unwrap_err();
        assert!(matches!(err, Error::GraphLoad { message, .. } if message == "checksum mismatch"));

        assert!(matches!(
            GraphArtifact::read(&dir.path().join("missing")),
            Err(Error::GraphLoad { .. })
        ));
    }

    #[test]
    fn test_validation_mismatches() {
        let path = Path::new("unet");
        let module = module(2);
        let artifact = artifact(&module);
        let fp = fingerprint(&module);

        let major = Version::new(2, 0, 0);
        assert!(artifact.validate(path, &expectation(&module, &major, &fp)).is_err());

        let same = Version::new(1, 2, 0);
        let other = fingerprint(&self::module(3));
        assert!(artifact.validate(path, &expectation(&module, &same, &other)).is_err());

        let mut wrong_backend = expectation(&module, &same, &fp);
        wrong_backend.backend = "nexfort";
        assert!(artifact.validate(path, &wrong_backend).is_err());
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible(&Version::new(1, 2, 0), &Version::new(1, 4, 0)));
        assert!(!is_compatible(&Version::new(1, 2, 0), &Version::new(1, 1, 0)));
        assert!(!is_compatible(&Version::new(1, 2, 0), &Version::new(2, 0, 0)));
        assert!(is_compatible(&Version::new(0, 3, 1), &Version::new(0, 3, 5)));
        assert!(!is_compatible(&Version::new(0, 3, 1), &Version::new(0, 4, 0)));
    }

    #[test]
    fn test_fingerprint_ignores_values() {
        let a = module(2);
        let b = module(2);
        b.set(
            "weight",
            Tensor::from_f32(vec![2, 1], &[5.0, 6.0]).unwrap().shared(),
        );
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&module(3)));
    }
}
