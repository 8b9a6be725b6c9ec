//! Content-addressed release manifests and delta patch packages.
//!
//! A release tree is scanned into a sealed [`Manifest`]; two manifests are
//! diffed into [`ChangeEntry`] records; a [`DeltaEngine`] turns every added or
//! modified file into a delta; the results are assembled into a
//! [`PatchPackage`] and published as a directory plus a reproducible archive.

pub mod changes;
pub mod config;
pub mod delta;
pub mod digest;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod package;
pub mod pipeline;
pub mod publish;
pub mod scan;
pub mod seal;
pub mod util;

pub use changes::{diff_manifests, ChangeCounts, ChangeEntry, ChangeKind};
pub use config::{Config, EngineConfig, EngineKind, IgnorePolicy};
pub use delta::{DeltaArtifact, DeltaProducer, DeltaReport};
pub use digest::Digest;
pub use engine::{BlockEngine, DeltaEngine, EngineError, ExternalEngine};
pub use error::{FileFailure, PatchError, Result};
pub use manifest::{build_manifest, generate_manifest, read_version, FileRecord, Manifest};
pub use package::{assemble, PatchFileEntry, PatchManifest, PatchPackage};
pub use pipeline::{Pipeline, PipelineConfig, RunSummary};
pub use publish::{publish, verify_package, PackageCheck, PublishedPackage, ReleaseInfo};
pub use scan::{Scan, Scanner};
