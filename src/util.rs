use memmap2::Mmap;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;

use crate::error::{PatchError, Result};

/// Read-only view of a file's bytes: memory-mapped, or empty for zero-length files.
pub enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the mapping is live.
pub fn map_file(path: &Path) -> Result<FileBytes> {
    let file = std::fs::File::open(path).map_err(|e| PatchError::io(path, e))?;
    let len = file.metadata().map_err(|e| PatchError::io(path, e))?.len();
    if len == 0 {
        return Ok(FileBytes::Empty);
    }
    // SAFETY: release trees are read-only inputs for the duration of a run.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| PatchError::io(path, e))?;
    Ok(FileBytes::Mapped(map))
}

/// Convert a tree-relative path to the POSIX form used as manifest key.
pub fn posix_relative(relative: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
    parts.map(|parts| parts.join("/"))
}

/// Write `contents` next to `path` and rename it into place, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| PatchError::io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| PatchError::io(dir, e))?;
    tmp.write_all(contents).map_err(|e| PatchError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| PatchError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PatchError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_maps_to_empty_slice() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        assert!(map_file(&path).unwrap().is_empty());

        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(&*map_file(&path).unwrap(), b"abc");
    }

    #[test]
    fn test_posix_relative_joins_with_slashes() {
        let rel = Path::new("a").join("b").join("c.txt");
        assert_eq!(posix_relative(&rel).as_deref(), Some("a/b/c.txt"));
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
