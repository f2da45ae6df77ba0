//! Upstream digest resolution.
//!
//! The digest source adapter is a pure query layer over the container
//! engine: given `repository:tag` it resolves the manifest-list digest and
//! enumerates the per-architecture platform entries. It holds no state; the
//! baseline store owns persistence and the reconciler owns comparison.

use crate::error::{Error, Result};
use crate::exec;
use serde::Deserialize;
use std::fmt;
use std::process::Command;

/// Architectures admitted into the baseline. Immutable at runtime: anything
/// else reported upstream is skipped during sync and never stored.
pub const ARCH_ALLOWLIST: [&str; 2] = ["amd64", "arm64"];

/// Returns true if `arch` may be recorded in the baseline.
pub fn is_supported_arch(arch: &str) -> bool {
    ARCH_ALLOWLIST.contains(&arch.trim().to_lowercase().as_str())
}

/// The running host's architecture, normalized to container platform naming.
pub fn local_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Syntactic check for an OCI content digest (`sha256:` + 64 hex chars).
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix("sha256:") {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// A `repository:tag` reference, with no digest suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// The content-addressed form, `repository@sha256:...`.
    pub fn pinned(&self, digest: &str) -> String {
        format!("{}@{}", self.repository, digest)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// One platform entry of a multi-architecture manifest.
#[derive(Debug, Clone)]
pub struct PlatformEntry {
    pub architecture: String,
    pub os: String,
    pub digest: String,
}

/// Adapter output: the top-level index digest plus every platform entry.
/// Callers pick their architecture with [`ManifestSummary::digest_for`]; the
/// full list feeds the merge step in sync.
#[derive(Debug, Clone)]
pub struct ManifestSummary {
    pub manifest_list: String,
    pub platforms: Vec<PlatformEntry>,
}

impl ManifestSummary {
    /// The single-platform digest for `arch`, if the manifest carries one.
    pub fn digest_for(&self, arch: &str) -> Option<&str> {
        self.platforms
            .iter()
            .find(|p| p.architecture.eq_ignore_ascii_case(arch))
            .map(|p| p.digest.as_str())
    }
}

/// Registry/build-engine query surface consumed by the reconciler.
pub trait DigestSource {
    /// Refreshes the local copy of `image` from the registry so inspection
    /// reflects current registry content. Sync calls this before inspecting.
    fn refresh(&self, image: &ImageRef) -> Result<()>;

    /// Resolves the manifest-list digest and per-architecture entries.
    fn inspect(&self, image: &ImageRef) -> Result<ManifestSummary>;
}

/// Wire shape of `docker manifest inspect` output, reduced to what the
/// reconciler needs. Additive upstream fields are ignored.
#[derive(Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    manifests: Vec<ManifestEntryDoc>,
}

#[derive(Deserialize)]
struct ManifestEntryDoc {
    digest: String,
    platform: PlatformDoc,
}

#[derive(Deserialize)]
struct PlatformDoc {
    architecture: String,
    #[serde(default)]
    os: String,
}

/// The Docker CLI-backed digest source.
pub struct DockerCli;

impl DockerCli {
    /// Resolves the manifest-list digest from the pulled image's repo
    /// digests (`docker inspect --format '{{index .RepoDigests 0}}'`).
    fn manifest_list_digest(&self, image: &ImageRef) -> Result<String> {
        let reference = image.to_string();
        let out = exec::output_checked(
            Command::new("docker")
                .args(["inspect", "--format", "{{index .RepoDigests 0}}"])
                .arg(&reference),
            "docker",
            &format!("resolving manifest list digest for {reference}"),
        )?;
        let text = String::from_utf8_lossy(&out);
        let trimmed = text.trim();
        let digest = trimmed
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .ok_or_else(|| Error::Parse {
                what: "repo digest".into(),
                detail: format!("expected repository@digest, got {trimmed:?}"),
            })?;
        if !is_valid_digest(&digest) {
            return Err(Error::Parse {
                what: "repo digest".into(),
                detail: format!("not a sha256 content digest: {digest:?}"),
            });
        }
        Ok(digest)
    }
}

impl DigestSource for DockerCli {
    fn refresh(&self, image: &ImageRef) -> Result<()> {
        let reference = image.to_string();
        exec::output_checked(
            Command::new("docker").args(["pull", &reference]),
            "docker",
            &format!("pulling {reference}"),
        )?;
        Ok(())
    }

    fn inspect(&self, image: &ImageRef) -> Result<ManifestSummary> {
        let manifest_list = self.manifest_list_digest(image)?;

        let reference = image.to_string();
        let out = exec::output_checked(
            Command::new("docker").args(["manifest", "inspect", &reference]),
            "docker",
            &format!("inspecting manifest for {reference}"),
        )?;
        let doc: ManifestDoc = serde_json::from_slice(&out).map_err(|e| Error::Parse {
            what: "manifest JSON".into(),
            detail: e.to_string(),
        })?;

        let platforms = doc
            .manifests
            .into_iter()
            .map(|m| PlatformEntry {
                architecture: m.platform.architecture,
                os: m.platform.os,
                digest: m.digest,
            })
            .collect();

        Ok(ManifestSummary {
            manifest_list,
            platforms,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const D1: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_allowlist_membership() {
        assert!(is_supported_arch("amd64"));
        assert!(is_supported_arch("arm64"));
        assert!(is_supported_arch(" ARM64 "));
        assert!(!is_supported_arch("386"));
        assert!(!is_supported_arch("s390x"));
        assert!(!is_supported_arch(""));
    }

    #[test]
    fn test_digest_syntax() {
        assert!(is_valid_digest(D1));
        assert!(!is_valid_digest("sha256:short"));
        assert!(!is_valid_digest("md5:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(!is_valid_digest(""));
        assert!(!is_valid_digest(
            "sha256:zzzzaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        ));
    }

    #[test]
    fn test_image_ref_display_and_pinning() {
        let image = ImageRef::new("example/app", "1.0.0");
        assert_eq!(image.to_string(), "example/app:1.0.0");
        assert_eq!(image.pinned(D1), format!("example/app@{D1}"));
    }

    #[test]
    fn test_digest_for_is_case_insensitive() {
        let summary = ManifestSummary {
            manifest_list: D1.into(),
            platforms: vec![PlatformEntry {
                architecture: "AMD64".into(),
                os: "linux".into(),
                digest: D1.into(),
            }],
        };
        assert_eq!(summary.digest_for("amd64"), Some(D1));
        assert_eq!(summary.digest_for("arm64"), None);
    }

    #[test]
    fn test_manifest_doc_tolerates_extra_fields() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                    "size": 1234,
                    "platform": { "architecture": "amd64", "os": "linux", "variant": "" }
                }
            ]
        }"#;
        let doc: ManifestDoc = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.manifests.len(), 1);
        assert_eq!(doc.manifests[0].platform.architecture, "amd64");
    }

    #[test]
    fn test_local_arch_is_in_container_naming() {
        let arch = local_arch();
        assert_ne!(arch, "x86_64");
        assert_ne!(arch, "aarch64");
    }
}
