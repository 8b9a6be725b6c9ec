use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing or malformed version declaration {}: {reason}", path.display())]
    MissingVersion { path: PathBuf, reason: String },

    #[error("Hash mismatch for {subject}: expected {expected}, got {actual}")]
    HashMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Delta engine failed for {path}: {reason}")]
    DeltaEngine { path: String, reason: String },

    #[error("Inconsistent patch package: {0}")]
    InconsistentPackage(String),

    #[error("Invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PatchError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PatchError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn mismatch(
        subject: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        PatchError::HashMismatch {
            subject: subject.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Short label used in end-of-run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PatchError::Io { .. } => "io",
            PatchError::MissingVersion { .. } => "missing-version",
            PatchError::HashMismatch { .. } => "hash-mismatch",
            PatchError::DeltaEngine { .. } => "delta-engine",
            PatchError::InconsistentPackage(_) => "inconsistent-package",
            PatchError::Json(_) => "json",
            PatchError::Config(_) => "config",
            PatchError::ThreadPool(_) => "thread-pool",
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// A per-file error collected during a run instead of aborting it.
#[derive(Debug)]
pub struct FileFailure {
    pub relative_path: String,
    pub error: PatchError,
}

impl FileFailure {
    pub fn new(relative_path: impl Into<String>, error: PatchError) -> Self {
        Self {
            relative_path: relative_path.into(),
            error,
        }
    }
}
