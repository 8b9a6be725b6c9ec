use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use crate::changes::ChangeKind;
use crate::digest::{self, Digest};
use crate::error::{PatchError, Result};
use crate::package::{delta_file_name, package_name, PatchManifest, PatchPackage};
use crate::seal;

pub const VERSION_FILE: &str = "version.txt";
pub const PATCH_MANIFEST_FILE: &str = "patch_manifest.json";
pub const RELEASE_INFO_FILE: &str = "release_info.json";
pub const DELTA_DIR: &str = "deltas";

const ARCHIVE_ZSTD_LEVEL: i32 = 19;

/// Describes the packaged archive; lives next to it, outside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub version_old: String,
    pub version_new: String,
    pub archive: String,
    pub archive_size: u64,
    pub archive_hash: Digest,
    pub uncompressed_size: u64,
}

#[derive(Debug, Clone)]
pub struct PublishedPackage {
    pub dir: PathBuf,
    pub archive: PathBuf,
    pub release_info: ReleaseInfo,
    pub package_digest: Digest,
}

/// Result of validating a published package directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCheck {
    pub version_old: String,
    pub version_new: String,
    pub package_digest: Digest,
    pub archive_hash: Digest,
    pub deltas: usize,
}

pub fn archive_name(version_old: &str, version_new: &str) -> String {
    format!("{}.tar.zst", package_name(version_old, version_new))
}

/// Write the package under `out_dir/{old}_to_{new}/`.
///
/// Everything is written to a hidden staging directory and checked there.
/// Only a package that passes `verify_package` replaces the published
/// directory; on failure the staging directory is removed and any earlier
/// package stays in place.
pub fn publish(package: &PatchPackage, out_dir: &Path) -> Result<PublishedPackage> {
    let name = package.name();
    let final_dir = out_dir.join(&name);
    let staging = out_dir.join(format!(".{name}.partial"));

    std::fs::create_dir_all(out_dir).map_err(|e| PatchError::io(out_dir, e))?;
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| PatchError::io(&staging, e))?;
    }

    let release_info = match stage(package, &staging).and_then(|info| {
        check_staged(package, &staging)?;
        Ok(info)
    }) {
        Ok(info) => info,
        Err(error) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                warn!(dir = %staging.display(), "failed to remove staging directory: {cleanup}");
            }
            return Err(error);
        }
    };

    if final_dir.exists() {
        std::fs::remove_dir_all(&final_dir).map_err(|e| PatchError::io(&final_dir, e))?;
    }
    std::fs::rename(&staging, &final_dir).map_err(|e| PatchError::io(&final_dir, e))?;

    info!(
        dir = %final_dir.display(),
        archive_size = release_info.archive_size,
        archive_hash = %release_info.archive_hash,
        "patch package published"
    );

    Ok(PublishedPackage {
        archive: final_dir.join(&release_info.archive),
        dir: final_dir,
        release_info,
        package_digest: *package.package_digest(),
    })
}

/// Write the package layout and archive into `staging`.
fn stage(package: &PatchPackage, staging: &Path) -> Result<ReleaseInfo> {
    let manifest_json = package.patch_manifest().to_json_pretty()?;
    let version_line = format!("{}\n", package.version_new());

    // Archive order follows the change entries, not the filesystem.
    let mut contents: Vec<(String, &[u8])> = vec![
        (VERSION_FILE.to_string(), version_line.as_bytes()),
        (PATCH_MANIFEST_FILE.to_string(), manifest_json.as_bytes()),
    ];
    for entry in package.change_entries() {
        if let Some(artifact) = package.artifact(&entry.relative_path) {
            contents.push((
                format!("{DELTA_DIR}/{}", delta_file_name(&entry.relative_path)),
                artifact.delta.as_slice(),
            ));
        }
    }

    for (relative, bytes) in &contents {
        let path = staging.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PatchError::io(parent, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| PatchError::io(&path, e))?;
    }

    let archive_file = archive_name(package.version_old(), package.version_new());
    let staged_archive = staging.join(&archive_file);
    write_archive(&staged_archive, &package.name(), &contents)?;

    let release_info = ReleaseInfo {
        version_old: package.version_old().to_string(),
        version_new: package.version_new().to_string(),
        archive: archive_file,
        archive_size: std::fs::metadata(&staged_archive)
            .map_err(|e| PatchError::io(&staged_archive, e))?
            .len(),
        archive_hash: seal::seal_file(&staged_archive)?,
        uncompressed_size: contents.iter().map(|(_, b)| b.len() as u64).sum(),
    };
    let info_path = staging.join(RELEASE_INFO_FILE);
    std::fs::write(&info_path, serde_json::to_string_pretty(&release_info)?)
        .map_err(|e| PatchError::io(&info_path, e))?;
    Ok(release_info)
}

/// The staged package must validate and carry the assembled digest.
fn check_staged(package: &PatchPackage, staging: &Path) -> Result<()> {
    let check = verify_package(staging)?;
    if check.package_digest != *package.package_digest() {
        return Err(PatchError::mismatch(
            format!("staged package {}", package.name()),
            package.package_digest(),
            check.package_digest,
        ));
    }
    Ok(())
}

/// Reproducible tar: fixed mtime, owner and mode; entries in the given order.
fn write_archive(path: &Path, root_name: &str, contents: &[(String, &[u8])]) -> Result<()> {
    let io_err = |e| PatchError::io(path, e);
    let file = File::create(path).map_err(io_err)?;
    let encoder = zstd::Encoder::new(BufWriter::new(file), ARCHIVE_ZSTD_LEVEL).map_err(io_err)?;
    let mut builder = tar::Builder::new(encoder);

    for (relative, bytes) in contents {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder
            .append_data(&mut header, format!("{root_name}/{relative}"), *bytes)
            .map_err(io_err)?;
    }

    let encoder = builder.into_inner().map_err(io_err)?;
    let mut writer = encoder.finish().map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;
    Ok(())
}

/// Reject paths that could escape the package directory.
fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))
}

/// Validate a published package: the patch manifest seal, the archive hash
/// recorded in the release info, the version declaration, and every delta
/// file's size and digest. Reports problems, never repairs them.
pub fn verify_package(dir: &Path) -> Result<PackageCheck> {
    let manifest_text = read_text(&dir.join(PATCH_MANIFEST_FILE))?;
    seal::verify_sealed(&manifest_text)?;
    let manifest = PatchManifest::from_json(&manifest_text)?;
    let package_digest = manifest.verify_seal()?;

    let declared = read_text(&dir.join(VERSION_FILE))?;
    if declared.trim() != manifest.version_new {
        return Err(PatchError::InconsistentPackage(format!(
            "version.txt declares {:?}, patch manifest targets {:?}",
            declared.trim(),
            manifest.version_new
        )));
    }

    let info: ReleaseInfo = serde_json::from_str(&read_text(&dir.join(RELEASE_INFO_FILE))?)?;
    if info.version_old != manifest.version_old || info.version_new != manifest.version_new {
        return Err(PatchError::InconsistentPackage(
            "release info and patch manifest disagree on versions".into(),
        ));
    }
    if !is_safe_relative(&info.archive) {
        return Err(PatchError::InconsistentPackage(format!(
            "unsafe archive name {:?}",
            info.archive
        )));
    }
    let archive_path = dir.join(&info.archive);
    let archive_hash = seal::seal_file(&archive_path)?;
    if archive_hash != info.archive_hash {
        return Err(PatchError::mismatch(
            info.archive.clone(),
            info.archive_hash,
            archive_hash,
        ));
    }

    let mut deltas = 0;
    for (path, entry) in &manifest.files {
        if !is_safe_relative(path) {
            return Err(PatchError::InconsistentPackage(format!("unsafe path {path:?}")));
        }
        let delta_path = dir.join(DELTA_DIR).join(delta_file_name(path));
        match entry.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let (Some(size), Some(expected), Some(_)) =
                    (entry.delta_size, entry.delta_hash, entry.target_hash)
                else {
                    return Err(PatchError::InconsistentPackage(format!(
                        "{path} is {:?} but lacks delta metadata",
                        entry.kind
                    )));
                };
                let bytes = std::fs::read(&delta_path).map_err(|e| PatchError::io(&delta_path, e))?;
                if bytes.len() as u64 != size {
                    return Err(PatchError::InconsistentPackage(format!(
                        "{path}: delta is {} bytes, manifest says {size}",
                        bytes.len()
                    )));
                }
                let actual = digest::hash_bytes(&bytes);
                if actual != expected {
                    return Err(PatchError::mismatch(delta_file_name(path), expected, actual));
                }
                deltas += 1;
            }
            ChangeKind::Removed => {
                if entry.delta_size.is_some() || delta_path.exists() {
                    return Err(PatchError::InconsistentPackage(format!(
                        "{path} is removed but has a delta"
                    )));
                }
            }
            ChangeKind::Unchanged => {
                return Err(PatchError::InconsistentPackage(format!(
                    "{path}: unchanged paths are not listed in a patch manifest"
                )));
            }
        }
    }

    Ok(PackageCheck {
        version_old: manifest.version_old,
        version_new: manifest.version_new,
        package_digest,
        archive_hash,
        deltas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeEntry;
    use crate::delta::DeltaArtifact;
    use crate::package::assemble;
    use std::collections::BTreeMap;
    use std::io::Read;

    fn sample_package() -> PatchPackage {
        let new = b"new contents".to_vec();
        let digest = digest::hash_bytes(&new);
        let entries = vec![
            ChangeEntry {
                relative_path: "bin/app.exe".into(),
                kind: ChangeKind::Added,
                old_digest: None,
                new_digest: Some(digest),
            },
            ChangeEntry {
                relative_path: "old.txt".into(),
                kind: ChangeKind::Removed,
                old_digest: Some(digest::hash_bytes(b"old")),
                new_digest: None,
            },
        ];
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "bin/app.exe".to_string(),
            DeltaArtifact {
                relative_path: "bin/app.exe".into(),
                delta_digest: digest::hash_bytes(&new),
                delta: new,
                target_digest: digest,
            },
        );
        assemble("1.0", "1.1", entries, artifacts).unwrap()
    }

    #[test]
    fn test_publish_layout() {
        let out = tempfile::TempDir::new().unwrap();
        let published = publish(&sample_package(), out.path()).unwrap();

        let dir = out.path().join("1.0_to_1.1");
        assert_eq!(published.dir, dir);
        assert_eq!(std::fs::read_to_string(dir.join(VERSION_FILE)).unwrap(), "1.1\n");
        assert!(dir.join(PATCH_MANIFEST_FILE).is_file());
        assert_eq!(
            std::fs::read(dir.join("deltas/bin/app.exe.delta")).unwrap(),
            b"new contents"
        );
        assert!(!dir.join("deltas/old.txt.delta").exists());
        assert!(dir.join("1.0_to_1.1.tar.zst").is_file());
        assert!(!out.path().join(".1.0_to_1.1.partial").exists());
    }

    #[test]
    fn test_archive_lists_entries_in_change_order() {
        let out = tempfile::TempDir::new().unwrap();
        let published = publish(&sample_package(), out.path()).unwrap();

        let file = File::open(&published.archive).unwrap();
        let mut archive = tar::Archive::new(zstd::Decoder::new(file).unwrap());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
            let mut sink = Vec::new();
            entry.read_to_end(&mut sink).unwrap();
        }
        assert_eq!(
            names,
            vec![
                "1.0_to_1.1/version.txt",
                "1.0_to_1.1/patch_manifest.json",
                "1.0_to_1.1/deltas/bin/app.exe.delta",
            ]
        );
    }

    #[test]
    fn test_republish_is_byte_identical() {
        let first = tempfile::TempDir::new().unwrap();
        let second = tempfile::TempDir::new().unwrap();
        let a = publish(&sample_package(), first.path()).unwrap();
        let b = publish(&sample_package(), second.path()).unwrap();
        assert_eq!(a.release_info.archive_hash, b.release_info.archive_hash);
        assert_eq!(a.package_digest, b.package_digest);

        // Publishing again over an existing package replaces it cleanly.
        let again = publish(&sample_package(), first.path()).unwrap();
        assert_eq!(again.release_info, a.release_info);
    }

    #[test]
    fn test_verify_detects_tampered_delta() {
        let out = tempfile::TempDir::new().unwrap();
        let published = publish(&sample_package(), out.path()).unwrap();
        std::fs::write(published.dir.join("deltas/bin/app.exe.delta"), b"new contentz").unwrap();
        assert!(matches!(
            verify_package(&published.dir),
            Err(PatchError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_detects_tampered_archive_and_manifest() {
        let out = tempfile::TempDir::new().unwrap();
        let published = publish(&sample_package(), out.path()).unwrap();

        let mut bytes = std::fs::read(&published.archive).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&published.archive, &bytes).unwrap();
        assert!(matches!(
            verify_package(&published.dir),
            Err(PatchError::HashMismatch { .. })
        ));

        let out = tempfile::TempDir::new().unwrap();
        let published = publish(&sample_package(), out.path()).unwrap();
        let path = published.dir.join(PATCH_MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"1.0\"", "\"0.9\"")).unwrap();
        assert!(matches!(
            verify_package(&published.dir),
            Err(PatchError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_check_keeps_previous_package() {
        let out = tempfile::TempDir::new().unwrap();
        let good = publish(&sample_package(), out.path()).unwrap();

        let broken = sample_package().with_package_digest(digest::hash_bytes(b"not the seal"));
        assert!(matches!(
            publish(&broken, out.path()),
            Err(PatchError::HashMismatch { .. })
        ));

        assert!(!out.path().join(".1.0_to_1.1.partial").exists());
        let check = verify_package(&good.dir).unwrap();
        assert_eq!(check.package_digest, good.package_digest);
    }

    #[test]
    fn test_failed_first_publish_leaves_nothing() {
        let out = tempfile::TempDir::new().unwrap();
        let broken = sample_package().with_package_digest(digest::hash_bytes(b"not the seal"));
        assert!(publish(&broken, out.path()).is_err());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative("a/b.txt"));
        assert!(!is_safe_relative("../escape"));
        assert!(!is_safe_relative("/etc/passwd"));
        assert!(!is_safe_relative(""));
    }
}
