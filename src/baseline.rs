//! Durable baseline of last-known-good upstream digests.
//!
//! One JSON record per tracked `repository:tag`, written with stable field
//! names so external consumers can read it; unknown fields are tolerated on
//! load. The store guarantees the record is never observable half-written:
//! saves build the full serialization in memory, write it to a sibling temp
//! file, and rename into place.

use crate::digest::{is_supported_arch, is_valid_digest};
use crate::error::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Maximum baseline file size accepted on load. A baseline holds two digest
/// entries; anything near this limit is not a baseline.
const MAX_BASELINE_BYTES: u64 = 1024 * 1024;

/// The durable record of tracked upstream digests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    /// Registry-qualified image name, no tag or digest suffix.
    pub repository: String,
    /// The upstream tag being tracked.
    pub tag: String,
    /// Content digest of the top-level multi-architecture index.
    #[serde(rename = "manifest_list")]
    pub manifest_list: String,
    /// Architecture → single-platform content digest. Keys are restricted
    /// to the allow-list.
    #[serde(default)]
    pub digests: BTreeMap<String, String>,
    /// Timestamp of the last successful sync, UTC, second precision.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BaselineRecord {
    /// Checks the record invariants before it is allowed on disk.
    pub fn validate(&self) -> Result<()> {
        if self.repository.is_empty() || self.repository.contains('@') {
            return Err(invariant(format!(
                "repository must be a bare image name, got {:?}",
                self.repository
            )));
        }
        if !self.manifest_list.is_empty() && !is_valid_digest(&self.manifest_list) {
            return Err(invariant(format!(
                "manifest_list is not a content digest: {:?}",
                self.manifest_list
            )));
        }
        if !self.digests.is_empty() && self.manifest_list.is_empty() {
            return Err(invariant(
                "digests present without a manifest_list digest".into(),
            ));
        }
        for (arch, digest) in &self.digests {
            if !is_supported_arch(arch) {
                return Err(invariant(format!(
                    "architecture {arch:?} is outside the allow-list"
                )));
            }
            if !is_valid_digest(digest) {
                return Err(invariant(format!(
                    "digest for {arch} is not a content digest: {digest:?}"
                )));
            }
        }
        Ok(())
    }
}

fn invariant(detail: String) -> Error {
    Error::Parse {
        what: "baseline record".into(),
        detail,
    }
}

/// Current UTC time truncated to whole seconds, the baseline's `updated_at`
/// precision.
pub fn now_second_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// File-backed store for a single [`BaselineRecord`].
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record. A missing file is the recoverable
    /// [`Error::NoBaseline`] condition, distinct from I/O and parse failures.
    pub fn load(&self) -> Result<BaselineRecord> {
        let meta = match fs::symlink_metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NoBaseline(self.path.clone()))
            }
            Err(e) => return Err(Error::io(format!("stat {}", self.path.display()), e)),
        };
        if meta.len() > MAX_BASELINE_BYTES {
            return Err(Error::Parse {
                what: "baseline file".into(),
                detail: format!("{} bytes, max {MAX_BASELINE_BYTES}", meta.len()),
            });
        }

        let data = fs::read(&self.path)
            .map_err(|e| Error::io(format!("read {}", self.path.display()), e))?;
        serde_json::from_slice(&data).map_err(|e| Error::Parse {
            what: "baseline file".into(),
            detail: e.to_string(),
        })
    }

    /// Persists the record atomically: full serialization in memory, temp
    /// file in the same directory, then rename over the live path. A failed
    /// write never leaves a truncated baseline in place.
    pub fn save(&self, record: &BaselineRecord) -> Result<()> {
        record.validate()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
            }
        }

        let mut json = serde_json::to_vec_pretty(record).map_err(|e| Error::Parse {
            what: "baseline record".into(),
            detail: e.to_string(),
        })?;
        json.push(b'\n');

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| Error::io(format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::io(
                format!("rename {} -> {}", tmp.display(), self.path.display()),
                e,
            )
        })
    }

    /// Takes an exclusive advisory lock for a load-merge-save sequence.
    /// The lock lives on a sibling `.lock` file so it survives the rename
    /// of the baseline itself, and releases when the guard drops.
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io(format!("open {}", lock_path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| Error::io(format!("lock {}", lock_path.display()), e))?;
        Ok(StoreLock { file })
    }
}

/// Guard for the store's advisory lock.
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
