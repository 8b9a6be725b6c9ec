use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::digest::Digest;
use crate::error::{FileFailure, PatchError, Result};
use crate::scan::Scanner;
use crate::seal;
use crate::util;

/// Digest and size of a single file, keyed by its POSIX path relative to the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub relative_path: String,
    pub digest: Digest,
    pub size_bytes: u64,
}

/// Content-addressed listing of a release tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    version: String,
    files: BTreeMap<String, FileRecord>,
    total_size_bytes: u64,
    self_digest: Option<Digest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDocument {
    version: String,
    files: BTreeMap<String, FileEntry>,
    total_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_hash: Option<Digest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    hash: Digest,
    size: u64,
}

impl Manifest {
    /// Manifest of a tree that does not exist yet (first release).
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            files: BTreeMap::new(),
            total_size_bytes: 0,
            self_digest: None,
        }
    }

    /// Build from scanned records. Duplicate paths are rejected.
    pub fn from_records(
        version: impl Into<String>,
        records: impl IntoIterator<Item = FileRecord>,
    ) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut total: u64 = 0;
        for record in records {
            total = total.checked_add(record.size_bytes).ok_or_else(|| {
                PatchError::InconsistentPackage("total tree size overflows u64".into())
            })?;
            let path = record.relative_path.clone();
            if files.insert(path.clone(), record).is_some() {
                return Err(PatchError::InconsistentPackage(format!(
                    "duplicate manifest path: {path}"
                )));
            }
        }
        Ok(Self {
            version: version.into(),
            files,
            total_size_bytes: total,
            self_digest: None,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn files(&self) -> &BTreeMap<String, FileRecord> {
        &self.files
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileRecord> {
        self.files.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub fn self_digest(&self) -> Option<&Digest> {
        self.self_digest.as_ref()
    }

    fn document(&self, with_seal: bool) -> ManifestDocument {
        ManifestDocument {
            version: self.version.clone(),
            files: self
                .files
                .iter()
                .map(|(path, record)| {
                    (
                        path.clone(),
                        FileEntry {
                            hash: record.digest,
                            size: record.size_bytes,
                        },
                    )
                })
                .collect(),
            total_size: self.total_size_bytes,
            manifest_hash: if with_seal { self.self_digest } else { None },
        }
    }

    /// Canonical bytes the seal is computed over: compact JSON, keys sorted,
    /// seal field excluded.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self.document(false))?;
        Ok(seal::canonical_value_bytes(value))
    }

    /// Return a sealed copy. Sealing an already sealed manifest yields the same digest.
    pub fn seal(&self) -> Result<Manifest> {
        let digest = seal::hash_canonical(&self.canonical_bytes()?);
        Ok(Manifest {
            self_digest: Some(digest),
            ..self.clone()
        })
    }

    /// Recompute the seal and compare it with the stored one.
    pub fn verify_seal(&self) -> Result<()> {
        let actual = seal::hash_canonical(&self.canonical_bytes()?);
        match self.self_digest {
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(PatchError::mismatch(
                format!("manifest {}", self.version),
                expected,
                actual,
            )),
            None => Err(PatchError::mismatch(
                format!("manifest {}", self.version),
                "<unsealed>",
                actual,
            )),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document(true))?)
    }

    /// Parse a manifest document. The stored seal is kept as-is; call
    /// [`Manifest::verify_seal`] to check it. Sizes are re-summed.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: ManifestDocument = serde_json::from_str(text)?;
        let records = doc.files.into_iter().map(|(relative_path, entry)| FileRecord {
            relative_path,
            digest: entry.hash,
            size_bytes: entry.size,
        });
        let mut manifest = Manifest::from_records(doc.version, records)?;
        if manifest.total_size_bytes != doc.total_size {
            return Err(PatchError::InconsistentPackage(format!(
                "manifest total_size {} does not match sum of file sizes {}",
                doc.total_size, manifest.total_size_bytes
            )));
        }
        manifest.self_digest = doc.manifest_hash;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))?;
        Self::from_json(&text)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        util::write_atomic(path, self.to_json_pretty()?.as_bytes())
    }
}

/// Read and validate a tree's version declaration.
pub fn read_version(root: &Path, file_name: &str) -> Result<String> {
    let path = root.join(file_name);
    let text = std::fs::read_to_string(&path).map_err(|e| PatchError::MissingVersion {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    let version = text.trim();
    if !is_dotted_numeric(version) {
        return Err(PatchError::MissingVersion {
            path,
            reason: format!("expected a dotted numeric version, found {version:?}"),
        });
    }
    Ok(version.to_string())
}

pub fn is_dotted_numeric(version: &str) -> bool {
    !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Scan `root`, build and seal its manifest, and collect per-file failures.
pub fn build_manifest(
    root: &Path,
    config: &Config,
    pool: &rayon::ThreadPool,
) -> Result<(Manifest, Vec<String>, Vec<FileFailure>)> {
    let version = read_version(root, &config.version_file)?;
    let outcome = Scanner::new(root, &config.ignore)
        .exclude_root_file(config.manifest_file.clone())
        .scan()?
        .hash_all(pool);
    let manifest = Manifest::from_records(version, outcome.records)?.seal()?;
    info!(
        root = %root.display(),
        version = manifest.version(),
        files = manifest.len(),
        total_size = manifest.total_size_bytes(),
        skipped = outcome.skipped.len(),
        failed = outcome.failures.len(),
        "manifest built"
    );
    Ok((manifest, outcome.skipped, outcome.failures))
}

/// Build the manifest for `root` and write it to `output`
/// (defaults to the configured manifest file inside `root`).
pub fn generate_manifest(
    root: &Path,
    output: Option<&Path>,
    config: &Config,
    validate: bool,
) -> Result<(Manifest, Vec<FileFailure>)> {
    let pool = config.worker_pool()?;
    let (manifest, _skipped, failures) = build_manifest(root, config, &pool)?;
    if !failures.is_empty() {
        return Ok((manifest, failures));
    }

    let target = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join(&config.manifest_file));
    manifest.write(&target)?;
    info!(path = %target.display(), "manifest written");

    if validate {
        Manifest::load(&target)?.verify_seal()?;
        let text = std::fs::read_to_string(&target).map_err(|e| PatchError::io(&target, e))?;
        seal::verify_sealed(&text)?;
        info!(path = %target.display(), "manifest seal verified");
    }
    Ok((manifest, failures))
}
