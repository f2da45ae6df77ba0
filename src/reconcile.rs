//! Drift detection and baseline synchronization.
//!
//! `compare` classifies the upstream state against the stored baseline,
//! `sync` re-establishes the baseline from the registry, and `reconcile`
//! composes the two: initialize when no baseline exists, no-op when current,
//! resync on any drift.

use crate::baseline::{now_second_utc, BaselineRecord, BaselineStore};
use crate::digest::{is_supported_arch, DigestSource, ImageRef};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Where a drift was detected. Manifest-list drift is checked first and
/// wins: once the index digest differs, per-architecture state is not
/// consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftScope {
    ManifestList,
    Arch(String),
}

/// Outcome of a baseline comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    UpToDate,
    Drifted {
        scope: DriftScope,
        old: String,
        new: String,
    },
    NoBaseline,
    MissingArchEntry {
        arch: String,
    },
}

/// Outcome of a composite reconcile.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Baseline matched upstream; nothing was written.
    AlreadyCurrent,
    /// No baseline existed; an initial sync created one.
    Initialized(BaselineRecord),
    /// Drift (or a missing arch entry) triggered a resync.
    Resynced {
        verdict: Verdict,
        record: BaselineRecord,
    },
}

pub struct Reconciler<'a, S: DigestSource> {
    store: &'a BaselineStore,
    source: &'a S,
    image: ImageRef,
}

impl<'a, S: DigestSource> Reconciler<'a, S> {
    pub fn new(store: &'a BaselineStore, source: &'a S, image: ImageRef) -> Self {
        Self {
            store,
            source,
            image,
        }
    }

    /// Classifies upstream state against the baseline for `local_arch`.
    /// Read-only: never mutates the baseline file.
    pub fn compare(&self, local_arch: &str) -> Result<Verdict> {
        let baseline = match self.store.load() {
            Ok(record) => record,
            Err(Error::NoBaseline(_)) => return Ok(Verdict::NoBaseline),
            Err(e) => return Err(e),
        };

        let summary = self.source.inspect(&self.image)?;

        if baseline.manifest_list != summary.manifest_list {
            return Ok(Verdict::Drifted {
                scope: DriftScope::ManifestList,
                old: baseline.manifest_list,
                new: summary.manifest_list,
            });
        }

        let current = summary.digest_for(local_arch).ok_or_else(|| {
            Error::NotFound(format!(
                "architecture {local_arch} in upstream manifest for {}",
                self.image
            ))
        })?;

        match baseline.digests.get(local_arch) {
            None => Ok(Verdict::MissingArchEntry {
                arch: local_arch.to_string(),
            }),
            Some(stored) if stored != current => Ok(Verdict::Drifted {
                scope: DriftScope::Arch(local_arch.to_string()),
                old: stored.clone(),
                new: current.to_string(),
            }),
            Some(_) => Ok(Verdict::UpToDate),
        }
    }

    /// Re-establishes the baseline from the registry. Carry-forward merge:
    /// the new digest map starts from the existing baseline's entries and
    /// only overwrites architectures present in the fresh manifest, so an
    /// architecture not refreshed in this run is never dropped. A missing
    /// or corrupt prior baseline starts from an empty map.
    pub fn sync(&self) -> Result<BaselineRecord> {
        let _lock = self.store.lock()?;

        self.source.refresh(&self.image)?;
        let summary = self.source.inspect(&self.image)?;

        let mut digests: BTreeMap<String, String> = BTreeMap::new();
        let mut last_saved_at = None;
        match self.store.load() {
            Ok(previous) => {
                last_saved_at = Some(previous.updated_at);
                digests = previous.digests;
            }
            Err(Error::NoBaseline(_)) | Err(Error::Parse { .. }) => {}
            Err(e) => return Err(e),
        }

        for platform in &summary.platforms {
            let arch = platform.architecture.trim().to_lowercase();
            if !is_supported_arch(&arch) {
                println!(
                    "Skipping unsupported architecture {:?} ({})",
                    arch, platform.digest
                );
                continue;
            }
            digests.insert(arch, platform.digest.clone());
        }

        // updated_at is truncated to whole seconds, so a resync landing in
        // the same second as the previous save would repeat the timestamp.
        // Bump past it to keep updated_at strictly increasing.
        let mut updated_at = now_second_utc();
        if let Some(previous) = last_saved_at {
            if updated_at <= previous {
                updated_at = previous.saturating_add(time::Duration::SECOND);
            }
        }

        let record = BaselineRecord {
            repository: self.image.repository.clone(),
            tag: self.image.tag.clone(),
            manifest_list: summary.manifest_list,
            digests,
            updated_at,
        };
        self.store.save(&record)?;
        Ok(record)
    }

    /// Composite: compare, then sync when needed. Never syncs when the
    /// baseline is current, and a missing baseline is answered with an
    /// initial sync rather than surfaced as an error.
    pub fn reconcile(&self, local_arch: &str) -> Result<ReconcileOutcome> {
        match self.compare(local_arch)? {
            Verdict::UpToDate => Ok(ReconcileOutcome::AlreadyCurrent),
            Verdict::NoBaseline => {
                let record = self.sync()?;
                Ok(ReconcileOutcome::Initialized(record))
            }
            verdict => {
                let record = self.sync()?;
                Ok(ReconcileOutcome::Resynced { verdict, record })
            }
        }
    }
}
