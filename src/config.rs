use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::engine::{BlockEngine, DeltaEngine, ExternalEngine};
use crate::error::{PatchError, Result};

pub const DEFAULT_VERSION_FILE: &str = "version.txt";
pub const DEFAULT_MANIFEST_FILE: &str = "files_manifest.json";

/// Paths excluded from scanning. Matching is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnorePolicy {
    /// File name suffixes, including the leading dot (".log").
    pub extensions: BTreeSet<String>,
    /// Directory names matched against every component of the relative path.
    pub directories: BTreeSet<String>,
}

impl Default for IgnorePolicy {
    fn default() -> Self {
        Self {
            extensions: [".log", ".pdb", ".bak"].iter().map(|s| s.to_string()).collect(),
            directories: ["Temp", "Logs"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl IgnorePolicy {
    pub fn none() -> Self {
        Self {
            extensions: BTreeSet::new(),
            directories: BTreeSet::new(),
        }
    }

    pub fn ignores_dir(&self, name: &str) -> bool {
        self.directories.contains(name)
    }

    pub fn ignores_file(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Block,
    Xdelta3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// External tool used when `kind = "xdelta3"`.
    pub program: PathBuf,
    pub block_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Block,
            program: PathBuf::from("xdelta3"),
            block_size: crate::engine::DEFAULT_BLOCK_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn build(&self) -> Result<Box<dyn DeltaEngine>> {
        match self.kind {
            EngineKind::Block => {
                if self.block_size == 0 {
                    return Err(PatchError::Config("engine.block_size must be > 0".into()));
                }
                Ok(Box::new(BlockEngine::with_block_size(self.block_size)))
            }
            EngineKind::Xdelta3 => Ok(Box::new(ExternalEngine::new(&self.program))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version_file: String,
    pub manifest_file: String,
    /// Worker threads for hashing and diffing; 0 means available parallelism.
    pub concurrency: usize,
    /// Replay every delta and check it reconstructs the target digest.
    pub verify_deltas: bool,
    pub ignore: IgnorePolicy,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version_file: DEFAULT_VERSION_FILE.to_string(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            concurrency: 0,
            verify_deltas: true,
            ignore: IgnorePolicy::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PatchError::Config(e.to_string()))
    }

    pub fn worker_pool(&self) -> Result<rayon::ThreadPool> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|i| format!("treepatch-worker-{i}"))
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_matches_release_conventions() {
        let policy = IgnorePolicy::default();
        assert!(policy.ignores_file("game.pdb"));
        assert!(policy.ignores_dir("Logs"));
        assert!(policy.ignores_dir("Temp"));
        assert!(!policy.ignores_dir("temp"));
        assert!(!policy.ignores_file("Temp.txt"));
        assert!(!policy.ignores_file("notes.LOG"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            concurrency = 4
            [ignore]
            extensions = [".tmp"]
            [engine]
            kind = "xdelta3"
            program = "/opt/xdelta3"
            "#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.version_file, DEFAULT_VERSION_FILE);
        assert!(config.ignore.ignores_file("a.tmp"));
        assert!(!config.ignore.ignores_file("a.log"));
        assert!(config.ignore.ignores_dir("Temp"));
        assert_eq!(config.engine.kind, EngineKind::Xdelta3);
        assert_eq!(config.engine.block_size, crate::engine::DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_unknown_engine_is_config_error() {
        let err = Config::from_toml("[engine]\nkind = \"bsdiff\"").unwrap_err();
        assert!(matches!(err, PatchError::Config(_)));
    }
}
