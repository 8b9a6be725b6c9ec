//! Seals and verifies JSON documents and packaged archives.
//!
//! A document's seal is the BLAKE3 digest of its canonical form: the JSON
//! value without the top-level `manifest_hash` field, with object keys sorted
//! and no insignificant whitespace. Verification never rewrites content.

use serde_json::{Map, Value};
use std::path::Path;

use crate::digest::{self, Digest};
use crate::error::{PatchError, Result};

pub const SEAL_KEY: &str = "manifest_hash";

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Canonical bytes of an already parsed document.
pub fn canonical_value_bytes(mut value: Value) -> Vec<u8> {
    if let Value::Object(map) = &mut value {
        map.remove(SEAL_KEY);
    }
    sort_keys(value).to_string().into_bytes()
}

pub fn canonical_bytes(content: &str) -> Result<Vec<u8>> {
    let value: Value = serde_json::from_str(content)?;
    Ok(canonical_value_bytes(value))
}

pub fn hash_canonical(canonical: &[u8]) -> Digest {
    digest::hash_bytes(canonical)
}

/// Digest of a JSON document's canonical content.
pub fn seal(content: &str) -> Result<Digest> {
    Ok(hash_canonical(&canonical_bytes(content)?))
}

/// True if `content` canonicalizes to `expected`. Unparseable content never verifies.
pub fn verify(content: &str, expected: &Digest) -> bool {
    matches!(seal(content), Ok(actual) if actual == *expected)
}

/// Return the document with its seal embedded under `manifest_hash`.
pub fn apply_seal(content: &str) -> Result<String> {
    let mut value: Value = serde_json::from_str(content)?;
    let digest = hash_canonical(&canonical_value_bytes(value.clone()));
    match &mut value {
        Value::Object(map) => {
            map.insert(SEAL_KEY.to_string(), Value::String(digest.to_hex()));
        }
        _ => {
            return Err(PatchError::InconsistentPackage(
                "only JSON objects can carry a seal".into(),
            ))
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Check the seal embedded in a document and return it.
pub fn verify_sealed(content: &str) -> Result<Digest> {
    let value: Value = serde_json::from_str(content)?;
    let stored = value
        .get(SEAL_KEY)
        .and_then(Value::as_str)
        .map(str::to_string);
    let actual = hash_canonical(&canonical_value_bytes(value));
    let Some(stored) = stored else {
        return Err(PatchError::mismatch("sealed document", "<missing>", actual));
    };
    match stored.parse::<Digest>() {
        Ok(expected) if expected == actual => Ok(actual),
        _ => Err(PatchError::mismatch("sealed document", stored, actual)),
    }
}

/// Digest of a packaged archive, streamed from disk.
pub fn seal_file(path: &Path) -> Result<Digest> {
    digest::hash_file(path)
}

pub fn verify_file(path: &Path, expected: &Digest) -> Result<bool> {
    Ok(seal_file(path)? == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{"version":"1.0","files":{"b":{"size":2,"hash":"x"},"a":{"hash":"y","size":1}},"total_size":3}"#;

    #[test]
    fn test_whitespace_and_key_order_do_not_matter() {
        let reordered = r#"
        {
            "total_size": 3,
            "files": { "a": { "size": 1, "hash": "y" }, "b": { "hash": "x", "size": 2 } },
            "version": "1.0"
        }"#;
        assert_eq!(seal(DOC).unwrap(), seal(reordered).unwrap());
    }

    #[test]
    fn test_verify_accepts_own_seal_and_rejects_other_content() {
        let digest = seal(DOC).unwrap();
        assert!(verify(DOC, &digest));
        let other = DOC.replace("\"1.0\"", "\"1.1\"");
        assert!(!verify(&other, &digest));
        assert!(!verify("not json", &digest));
    }

    #[test]
    fn test_apply_seal_is_idempotent() {
        let sealed = apply_seal(DOC).unwrap();
        assert_eq!(seal(&sealed).unwrap(), seal(DOC).unwrap());
        let resealed = apply_seal(&sealed).unwrap();
        assert_eq!(resealed, sealed);
        assert_eq!(verify_sealed(&sealed).unwrap(), seal(DOC).unwrap());
    }

    #[test]
    fn test_single_byte_corruption_breaks_seal() {
        let sealed = apply_seal(DOC).unwrap();
        let digest = verify_sealed(&sealed).unwrap();
        let corrupted = sealed.replacen("\"size\": 2", "\"size\": 3", 1);
        assert_ne!(corrupted, sealed);
        assert!(!verify(&corrupted, &digest));
        assert!(matches!(
            verify_sealed(&corrupted),
            Err(PatchError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_seal_is_reported() {
        assert!(matches!(
            verify_sealed(DOC),
            Err(PatchError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_non_object_cannot_be_sealed() {
        assert!(apply_seal("[1,2,3]").is_err());
    }

    #[test]
    fn test_file_seal_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.tar.zst");
        std::fs::write(&path, b"archive bytes").unwrap();
        let expected = digest::hash_bytes(b"archive bytes");
        assert!(verify_file(&path, &expected).unwrap());
        assert!(!verify_file(&path, &digest::hash_bytes(b"other")).unwrap());
    }
}
