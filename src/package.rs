use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::changes::{ChangeEntry, ChangeKind};
use crate::delta::DeltaArtifact;
use crate::digest::Digest;
use crate::error::{PatchError, Result};
use crate::seal;

pub const DELTA_EXTENSION: &str = "delta";

/// Entry of the patch manifest for one changed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFileEntry {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_hash: Option<Digest>,
}

/// JSON document describing how to turn `version_old` into `version_new`.
/// Unchanged paths are not listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifest {
    pub version_old: String,
    pub version_new: String,
    pub files: BTreeMap<String, PatchFileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<Digest>,
}

impl PatchManifest {
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(seal::canonical_value_bytes(serde_json::to_value(self)?))
    }

    pub fn seal_digest(&self) -> Result<Digest> {
        Ok(seal::hash_canonical(&self.canonical_bytes()?))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Check the embedded `manifest_hash` against a fresh computation.
    pub fn verify_seal(&self) -> Result<Digest> {
        let actual = self.seal_digest()?;
        match self.manifest_hash {
            Some(expected) if expected == actual => Ok(actual),
            Some(expected) => Err(PatchError::mismatch("patch manifest", expected, actual)),
            None => Err(PatchError::mismatch("patch manifest", "<missing>", actual)),
        }
    }
}

/// Immutable, validated patch between two versions.
#[derive(Debug, Clone)]
pub struct PatchPackage {
    version_old: String,
    version_new: String,
    change_entries: Vec<ChangeEntry>,
    artifacts: BTreeMap<String, DeltaArtifact>,
    package_digest: Digest,
}

impl PatchPackage {
    pub fn name(&self) -> String {
        package_name(&self.version_old, &self.version_new)
    }

    pub fn version_old(&self) -> &str {
        &self.version_old
    }

    pub fn version_new(&self) -> &str {
        &self.version_new
    }

    pub fn change_entries(&self) -> &[ChangeEntry] {
        &self.change_entries
    }

    pub fn artifacts(&self) -> &BTreeMap<String, DeltaArtifact> {
        &self.artifacts
    }

    pub fn artifact(&self, relative_path: &str) -> Option<&DeltaArtifact> {
        self.artifacts.get(relative_path)
    }

    pub fn package_digest(&self) -> &Digest {
        &self.package_digest
    }

    #[cfg(test)]
    pub(crate) fn with_package_digest(mut self, package_digest: Digest) -> Self {
        self.package_digest = package_digest;
        self
    }

    /// Sealed patch manifest of this package.
    pub fn patch_manifest(&self) -> PatchManifest {
        PatchManifest {
            manifest_hash: Some(self.package_digest),
            ..unsealed_manifest(
                &self.version_old,
                &self.version_new,
                &self.change_entries,
                &self.artifacts,
            )
        }
    }
}

pub fn package_name(version_old: &str, version_new: &str) -> String {
    format!("{version_old}_to_{version_new}")
}

pub fn delta_file_name(relative_path: &str) -> String {
    format!("{relative_path}.{DELTA_EXTENSION}")
}

fn unsealed_manifest(
    version_old: &str,
    version_new: &str,
    entries: &[ChangeEntry],
    artifacts: &BTreeMap<String, DeltaArtifact>,
) -> PatchManifest {
    let files = entries
        .iter()
        .filter(|entry| entry.kind != ChangeKind::Unchanged)
        .map(|entry| {
            let artifact = artifacts.get(&entry.relative_path);
            (
                entry.relative_path.clone(),
                PatchFileEntry {
                    kind: entry.kind,
                    delta_size: artifact.map(|a| a.delta.len() as u64),
                    target_hash: artifact.map(|a| a.target_digest),
                    source_hash: entry.old_digest,
                    delta_hash: artifact.map(|a| a.delta_digest),
                },
            )
        })
        .collect();
    PatchManifest {
        version_old: version_old.to_string(),
        version_new: version_new.to_string(),
        files,
        manifest_hash: None,
    }
}

/// Merge change entries and delta artifacts into a package, enforcing that
/// exactly the Added and Modified entries carry a matching artifact.
pub fn assemble(
    version_old: impl Into<String>,
    version_new: impl Into<String>,
    change_entries: Vec<ChangeEntry>,
    artifacts: BTreeMap<String, DeltaArtifact>,
) -> Result<PatchPackage> {
    let version_old = version_old.into();
    let version_new = version_new.into();

    for pair in change_entries.windows(2) {
        if pair[0].relative_path >= pair[1].relative_path {
            return Err(PatchError::InconsistentPackage(format!(
                "change entries out of order or duplicated at {}",
                pair[1].relative_path
            )));
        }
    }

    for entry in &change_entries {
        let path = &entry.relative_path;
        match (entry.kind.needs_delta(), artifacts.get(path)) {
            (true, None) => {
                return Err(PatchError::InconsistentPackage(format!(
                    "{path} is {:?} but has no delta artifact",
                    entry.kind
                )))
            }
            (true, Some(artifact)) if Some(artifact.target_digest) != entry.new_digest => {
                return Err(PatchError::InconsistentPackage(format!(
                    "{path}: artifact target digest {} does not match new digest",
                    artifact.target_digest
                )))
            }
            (false, Some(_)) => {
                return Err(PatchError::InconsistentPackage(format!(
                    "{path} is {:?} but carries a delta artifact",
                    entry.kind
                )))
            }
            _ => {}
        }
    }

    let listed = change_entries.len();
    if let Some(stray) = artifacts.keys().find(|path| {
        change_entries
            .binary_search_by(|e| e.relative_path.as_str().cmp(path.as_str()))
            .is_err()
    }) {
        return Err(PatchError::InconsistentPackage(format!(
            "artifact {stray} has no change entry"
        )));
    }

    let package_digest =
        unsealed_manifest(&version_old, &version_new, &change_entries, &artifacts).seal_digest()?;

    info!(
        package = %package_name(&version_old, &version_new),
        entries = listed,
        artifacts = artifacts.len(),
        digest = %package_digest,
        "patch package assembled"
    );

    Ok(PatchPackage {
        version_old,
        version_new,
        change_entries,
        artifacts,
        package_digest,
    })
}
