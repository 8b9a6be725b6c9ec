use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::changes::{diff_manifests, ChangeCounts};
use crate::config::Config;
use crate::delta::DeltaProducer;
use crate::error::{FileFailure, PatchError, Result};
use crate::manifest::{build_manifest, is_dotted_numeric, Manifest};
use crate::package::assemble;
use crate::publish::{publish, PublishedPackage};

/// Version assumed for a first release when no old tree is given.
pub const INITIAL_VERSION: &str = "0.0.0";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` for a first release.
    pub old_root: Option<PathBuf>,
    pub new_root: PathBuf,
    pub output_dir: PathBuf,
    /// Old version to record when `old_root` is `None`. Ignored otherwise,
    /// since the old tree declares its own version.
    pub version_old: Option<String>,
    pub config: Config,
}

impl PipelineConfig {
    pub fn new(
        old_root: Option<PathBuf>,
        new_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            old_root,
            new_root: new_root.into(),
            output_dir: output_dir.into(),
            version_old: None,
            config: Config::default(),
        }
    }
}

/// End-of-run report.
#[derive(Debug)]
pub struct RunSummary {
    pub version_old: String,
    pub version_new: String,
    pub counts: ChangeCounts,
    pub skipped: Vec<String>,
    pub failures: Vec<FileFailure>,
    pub published: Option<PublishedPackage>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.published.is_some()
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Scan, diff, produce deltas, assemble and publish.
    ///
    /// Structural problems (missing roots, bad version declarations, an
    /// unusable configuration) return `Err` before any per-file work. Per-file
    /// problems are collected into the summary; when there are any, nothing
    /// is published.
    pub fn run(cfg: &PipelineConfig) -> Result<RunSummary> {
        let start = Instant::now();
        let config = &cfg.config;

        require_dir(&cfg.new_root)?;
        if let Some(old_root) = &cfg.old_root {
            require_dir(old_root)?;
        }
        if let Some(version) = &cfg.version_old {
            if !is_dotted_numeric(version) {
                return Err(PatchError::MissingVersion {
                    path: PathBuf::from("--version-old"),
                    reason: format!("expected a dotted numeric version, found {version:?}"),
                });
            }
        }
        let engine = config.engine.build()?;
        let pool = config.worker_pool()?;

        let (new_manifest, mut skipped, mut failures) =
            build_manifest(&cfg.new_root, config, &pool)?;
        let old_manifest = match &cfg.old_root {
            Some(old_root) => {
                let (manifest, old_skipped, old_failures) =
                    build_manifest(old_root, config, &pool)?;
                skipped.extend(old_skipped);
                skipped.sort();
                skipped.dedup();
                failures.extend(old_failures);
                manifest
            }
            None => Manifest::empty(
                cfg.version_old
                    .clone()
                    .unwrap_or_else(|| INITIAL_VERSION.to_string()),
            ),
        };

        let mut summary = RunSummary {
            version_old: old_manifest.version().to_string(),
            version_new: new_manifest.version().to_string(),
            counts: ChangeCounts::default(),
            skipped,
            failures,
            published: None,
            elapsed: Duration::ZERO,
        };
        if !summary.failures.is_empty() {
            warn!(
                failed = summary.failures.len(),
                "scan failures, not diffing"
            );
            summary.elapsed = start.elapsed();
            return Ok(summary);
        }

        let entries = diff_manifests(Some(&old_manifest), &new_manifest);
        summary.counts = ChangeCounts::of(&entries);
        info!(
            added = summary.counts.added,
            modified = summary.counts.modified,
            removed = summary.counts.removed,
            unchanged = summary.counts.unchanged,
            "manifests diffed"
        );

        let report = DeltaProducer::new(engine.as_ref(), cfg.old_root.as_deref(), &cfg.new_root)
            .verify_deltas(config.verify_deltas)
            .produce(&entries, &pool);
        if !report.is_complete() {
            warn!(
                failed = report.failures.len(),
                "delta production failed, not publishing"
            );
            summary.failures = report.failures;
            summary.elapsed = start.elapsed();
            return Ok(summary);
        }

        let package = assemble(
            old_manifest.version(),
            new_manifest.version(),
            entries,
            report.artifacts,
        )?;
        summary.published = Some(publish(&package, &cfg.output_dir)?);
        summary.elapsed = start.elapsed();
        Ok(summary)
    }
}

fn require_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(PatchError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        ))
    }
}
