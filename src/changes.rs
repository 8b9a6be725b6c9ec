use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::digest::Digest;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    Unchanged,
}

impl ChangeKind {
    /// Added and Modified entries carry a delta artifact; the others never do.
    pub fn needs_delta(self) -> bool {
        matches!(self, ChangeKind::Added | ChangeKind::Modified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub relative_path: String,
    pub kind: ChangeKind,
    pub old_digest: Option<Digest>,
    pub new_digest: Option<Digest>,
}

/// Classify every path in `old ∪ new`, in lexicographic path order.
/// A missing `old` manifest is a first release: everything is Added.
pub fn diff_manifests(old: Option<&Manifest>, new: &Manifest) -> Vec<ChangeEntry> {
    let mut paths: BTreeSet<&str> = new.files().keys().map(String::as_str).collect();
    if let Some(old) = old {
        paths.extend(old.files().keys().map(String::as_str));
    }

    paths
        .into_iter()
        .filter_map(|path| {
            let old_digest = old.and_then(|m| m.get(path)).map(|r| r.digest);
            let new_digest = new.get(path).map(|r| r.digest);
            let kind = match (old_digest, new_digest) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                (Some(a), Some(b)) if a == b => ChangeKind::Unchanged,
                (Some(_), Some(_)) => ChangeKind::Modified,
                (None, None) => return None,
            };
            Some(ChangeEntry {
                relative_path: path.to_string(),
                kind,
                old_digest,
                new_digest,
            })
        })
        .collect()
}

/// Per-kind counts of a change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ChangeCounts {
    pub fn of(entries: &[ChangeEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.kind {
                ChangeKind::Added => counts.added += 1,
                ChangeKind::Modified => counts.modified += 1,
                ChangeKind::Removed => counts.removed += 1,
                ChangeKind::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }
}
