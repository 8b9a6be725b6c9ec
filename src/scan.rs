use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::IgnorePolicy;
use crate::digest;
use crate::error::{FileFailure, PatchError, Result};
use crate::manifest::FileRecord;
use crate::util;

/// A regular file found by the walk, not yet hashed.
#[derive(Debug, Clone)]
struct PendingFile {
    relative_path: String,
    full_path: PathBuf,
}

/// Walks a release tree and yields one [`FileRecord`] per non-ignored regular file.
pub struct Scanner<'a> {
    root: &'a Path,
    policy: &'a IgnorePolicy,
    excluded_root_files: Vec<String>,
}

impl<'a> Scanner<'a> {
    pub fn new(root: &'a Path, policy: &'a IgnorePolicy) -> Self {
        Self {
            root,
            policy,
            excluded_root_files: Vec::new(),
        }
    }

    /// Skip a file directly under the root without reporting it, e.g. the
    /// manifest the scan is about to produce.
    pub fn exclude_root_file(mut self, name: impl Into<String>) -> Self {
        self.excluded_root_files.push(name.into());
        self
    }

    /// Walk the tree. Only the walk happens here; hashing is deferred to the
    /// returned [`Scan`].
    pub fn scan(&self) -> Result<Scan> {
        let meta = std::fs::metadata(self.root).map_err(|e| PatchError::io(self.root, e))?;
        if !meta.is_dir() {
            return Err(PatchError::io(
                self.root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            ));
        }

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        let mut failures = Vec::new();

        let mut walker = WalkDir::new(self.root).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let relative = err
                        .path()
                        .and_then(|p| p.strip_prefix(self.root).ok())
                        .and_then(util::posix_relative)
                        .unwrap_or_default();
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    warn!(path = %relative, "walk failed: {source}");
                    failures.push(FileFailure::new(relative, PatchError::io(path, source)));
                    continue;
                }
            };

            let full_path = entry.path();
            let Some(relative) = full_path
                .strip_prefix(self.root)
                .ok()
                .and_then(util::posix_relative)
            else {
                failures.push(FileFailure::new(
                    full_path.to_string_lossy(),
                    PatchError::io(
                        full_path,
                        std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF-8 path"),
                    ),
                ));
                continue;
            };
            let name = entry.file_name().to_string_lossy();

            if entry.file_type().is_dir() {
                if self.policy.ignores_dir(&name) {
                    debug!(path = %relative, "skipping ignored directory");
                    skipped.push(relative);
                    walker.skip_current_dir();
                }
                continue;
            }
            // Symlinks and special files are not release content.
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.depth() == 1 && self.excluded_root_files.iter().any(|f| *f == name) {
                continue;
            }
            if self.policy.ignores_file(&name) {
                debug!(path = %relative, "skipping ignored file");
                skipped.push(relative);
                continue;
            }

            pending.push(PendingFile {
                relative_path: relative,
                full_path: full_path.to_path_buf(),
            });
        }

        pending.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        skipped.sort();

        Ok(Scan {
            pending,
            skipped,
            failures,
        })
    }
}

/// Result of walking a tree: files to hash, in lexicographic path order.
pub struct Scan {
    pending: Vec<PendingFile>,
    skipped: Vec<String>,
    failures: Vec<FileFailure>,
}

/// Hashed scan output.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<FileRecord>,
    pub skipped: Vec<String>,
    pub failures: Vec<FileFailure>,
}

impl Scan {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Hash files one at a time as the iterator is advanced. Walk failures
    /// are yielded after the last record.
    pub fn records(self) -> Records {
        Records {
            pending: self.pending.into_iter(),
            failures: self.failures.into_iter(),
        }
    }

    /// Hash every file on `pool`, keeping the lexicographic order of the walk.
    pub fn hash_all(self, pool: &rayon::ThreadPool) -> ScanOutcome {
        let hashed: Vec<std::result::Result<FileRecord, FileFailure>> =
            pool.install(|| self.pending.par_iter().map(hash_pending).collect());

        let mut outcome = ScanOutcome {
            skipped: self.skipped,
            failures: self.failures,
            ..Default::default()
        };
        for result in hashed {
            match result {
                Ok(record) => outcome.records.push(record),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }
}

pub struct Records {
    pending: std::vec::IntoIter<PendingFile>,
    failures: std::vec::IntoIter<FileFailure>,
}

impl Iterator for Records {
    type Item = std::result::Result<FileRecord, FileFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pending.next() {
            Some(file) => Some(hash_pending(&file)),
            None => self.failures.next().map(Err),
        }
    }
}

fn hash_pending(file: &PendingFile) -> std::result::Result<FileRecord, FileFailure> {
    let hashed = std::fs::File::open(&file.full_path)
        .and_then(digest::hash_reader_sized)
        .map_err(|e| PatchError::io(&file.full_path, e));

    match hashed {
        Ok((digest, size_bytes)) => {
            debug!(path = %file.relative_path, size_bytes, "hashed");
            Ok(FileRecord {
                relative_path: file.relative_path.clone(),
                digest,
                size_bytes,
            })
        }
        Err(error) => {
            warn!(path = %file.relative_path, "hashing failed: {error}");
            Err(FileFailure::new(file.relative_path.clone(), error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::hash_bytes;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_lexicographic_order_across_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "a/b.txt", b"1");
        write(dir.path(), "a.txt", b"2");
        write(dir.path(), "Z.txt", b"3");
        let policy = IgnorePolicy::none();

        let paths: Vec<String> = Scanner::new(dir.path(), &policy)
            .scan()
            .unwrap()
            .records()
            .map(|r| r.unwrap().relative_path)
            .collect();
        assert_eq!(paths, vec!["Z.txt", "a.txt", "a/b.txt"]);
    }

    #[test]
    fn test_records_carry_digest_and_size() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "data/blob.bin", &[9u8; 1000]);
        let policy = IgnorePolicy::none();

        let records: Vec<FileRecord> = Scanner::new(dir.path(), &policy)
            .scan()
            .unwrap()
            .records()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size_bytes, 1000);
        assert_eq!(records[0].digest, hash_bytes(&[9u8; 1000]));
    }

    #[test]
    fn test_ignored_paths_are_skipped_and_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "keep.txt", b"k");
        write(dir.path(), "debug.pdb", b"p");
        write(dir.path(), "Logs/run.txt", b"l");
        write(dir.path(), "sub/Temp/deep.txt", b"t");
        write(dir.path(), "files_manifest.json", b"{}");
        let policy = IgnorePolicy::default();

        let scan = Scanner::new(dir.path(), &policy)
            .exclude_root_file("files_manifest.json")
            .scan()
            .unwrap();
        assert_eq!(scan.skipped(), &["Logs", "debug.pdb", "sub/Temp"]);
        let paths: Vec<String> = scan.records().map(|r| r.unwrap().relative_path).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[test]
    fn test_parallel_hash_matches_lazy_order() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..40 {
            write(dir.path(), &format!("d{}/f{i}.bin", i % 3), &[i as u8; 64]);
        }
        let policy = IgnorePolicy::none();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();

        let lazy: Vec<FileRecord> = Scanner::new(dir.path(), &policy)
            .scan()
            .unwrap()
            .records()
            .map(|r| r.unwrap())
            .collect();
        let parallel = Scanner::new(dir.path(), &policy).scan().unwrap().hash_all(&pool);
        assert!(parallel.failures.is_empty());
        assert_eq!(parallel.records, lazy);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let policy = IgnorePolicy::none();
        let missing = dir.path().join("nope");
        let err = Scanner::new(&missing, &policy).scan().err().unwrap();
        assert!(matches!(err, PatchError::Io { .. }));
    }

    #[test]
    fn test_file_removed_after_walk_is_collected() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a");
        write(dir.path(), "b.txt", b"b");
        let policy = IgnorePolicy::none();

        let scan = Scanner::new(dir.path(), &policy).scan().unwrap();
        std::fs::remove_file(dir.path().join("a.txt")).unwrap();
        let results: Vec<_> = scan.records().collect();
        assert_eq!(results.len(), 2);
        let failure = results[0].as_ref().unwrap_err();
        assert_eq!(failure.relative_path, "a.txt");
        assert!(matches!(failure.error, PatchError::Io { .. }));
        assert_eq!(results[1].as_ref().unwrap().relative_path, "b.txt");
    }
}
