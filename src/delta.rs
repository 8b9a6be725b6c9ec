use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::changes::{ChangeEntry, ChangeKind};
use crate::digest::{self, Digest};
use crate::engine::DeltaEngine;
use crate::error::{FileFailure, PatchError, Result};
use crate::util::{self, FileBytes};

/// Delta blob for one Added or Modified path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaArtifact {
    pub relative_path: String,
    pub delta: Vec<u8>,
    /// Digest the delta must reconstruct when applied to the old file
    /// (or to nothing, for Added files).
    pub target_digest: Digest,
    pub delta_digest: Digest,
}

#[derive(Debug, Default)]
pub struct DeltaReport {
    pub artifacts: BTreeMap<String, DeltaArtifact>,
    pub failures: Vec<FileFailure>,
}

impl DeltaReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the delta engine over a change set.
pub struct DeltaProducer<'a> {
    engine: &'a dyn DeltaEngine,
    old_root: Option<&'a Path>,
    new_root: &'a Path,
    verify: bool,
}

impl<'a> DeltaProducer<'a> {
    /// `old_root` is `None` for a first release; every entry is then Added.
    pub fn new(engine: &'a dyn DeltaEngine, old_root: Option<&'a Path>, new_root: &'a Path) -> Self {
        Self {
            engine,
            old_root,
            new_root,
            verify: true,
        }
    }

    /// Replay each delta and check it against the target digest.
    pub fn verify_deltas(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Produce artifacts for every Added and Modified entry. A failing file
    /// is recorded and the remaining files are still processed.
    pub fn produce(&self, entries: &[ChangeEntry], pool: &rayon::ThreadPool) -> DeltaReport {
        let work: Vec<&ChangeEntry> = entries.iter().filter(|e| e.kind.needs_delta()).collect();

        let results: Vec<std::result::Result<DeltaArtifact, FileFailure>> = pool.install(|| {
            work.par_iter()
                .map(|entry| {
                    self.produce_one(entry).map_err(|error| {
                        warn!(path = %entry.relative_path, "delta failed: {error}");
                        FileFailure::new(entry.relative_path.clone(), error)
                    })
                })
                .collect()
        });

        let mut report = DeltaReport::default();
        for result in results {
            match result {
                Ok(artifact) => {
                    report
                        .artifacts
                        .insert(artifact.relative_path.clone(), artifact);
                }
                Err(failure) => report.failures.push(failure),
            }
        }
        report
    }

    pub fn produce_one(&self, entry: &ChangeEntry) -> Result<DeltaArtifact> {
        let path = &entry.relative_path;
        let new_bytes = util::map_file(&self.new_root.join(path))?;
        let target_digest = digest::hash_bytes(&new_bytes);
        if let Some(expected) = entry.new_digest {
            if expected != target_digest {
                return Err(PatchError::mismatch(
                    format!("{path} (changed since scan)"),
                    expected,
                    target_digest,
                ));
            }
        }

        let old_bytes = match (entry.kind, self.old_root) {
            (ChangeKind::Modified, Some(old_root)) => util::map_file(&old_root.join(path))?,
            (ChangeKind::Modified, None) => {
                return Err(PatchError::InconsistentPackage(format!(
                    "{path} is Modified but no old tree was given"
                )))
            }
            _ => FileBytes::Empty,
        };

        let delta = self
            .engine
            .diff(&old_bytes, &new_bytes)
            .map_err(|e| PatchError::DeltaEngine {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if delta.is_empty() && !(old_bytes.is_empty() && new_bytes.is_empty()) {
            return Err(PatchError::DeltaEngine {
                path: path.clone(),
                reason: format!("{} returned an empty delta for non-empty input", self.engine.name()),
            });
        }

        if self.verify {
            let rebuilt = self
                .engine
                .apply(&old_bytes, &delta)
                .map_err(|e| PatchError::DeltaEngine {
                    path: path.clone(),
                    reason: format!("replay failed: {e}"),
                })?;
            let rebuilt_digest = digest::hash_bytes(&rebuilt);
            if rebuilt_digest != target_digest {
                return Err(PatchError::mismatch(
                    format!("{path} (delta replay)"),
                    target_digest,
                    rebuilt_digest,
                ));
            }
        }

        debug!(
            path = %path,
            kind = ?entry.kind,
            source_size = old_bytes.len(),
            target_size = new_bytes.len(),
            delta_size = delta.len(),
            "delta produced"
        );
        Ok(DeltaArtifact {
            relative_path: path.clone(),
            delta_digest: digest::hash_bytes(&delta),
            delta,
            target_digest,
        })
    }
}
