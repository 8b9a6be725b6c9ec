use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use treepatch::{
    generate_manifest, seal, util, verify_package, Config, Digest, EngineKind, FileFailure,
    Pipeline, PipelineConfig,
};

#[derive(Parser)]
#[command(name = "treepatch", version, about = "Release manifest and delta patch generator")]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineArg {
    Block,
    Xdelta3,
}

impl From<EngineArg> for EngineKind {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Block => EngineKind::Block,
            EngineArg::Xdelta3 => EngineKind::Xdelta3,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a release tree and write its sealed manifest
    Manifest {
        /// Release directory to scan
        #[arg(long)]
        source: PathBuf,
        /// Manifest path (defaults to files_manifest.json inside the source)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Skip re-reading and verifying the written manifest
        #[arg(long)]
        no_validate: bool,
    },
    /// Insert manifest_hash into an existing JSON document
    Seal {
        /// JSON document to seal in place
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        no_validate: bool,
    },
    /// Verify a sealed JSON document, or a raw file against --expected
    Verify {
        #[arg(long)]
        source: PathBuf,
        /// Expected hex digest of the raw file bytes
        #[arg(long)]
        expected: Option<String>,
    },
    /// Create a patch package by comparing old and new release trees
    Create {
        /// Old release directory (omit for a first release)
        #[arg(long)]
        old: Option<PathBuf>,
        /// New release directory
        #[arg(long)]
        new: PathBuf,
        /// Directory that receives {old}_to_{new}/
        #[arg(long, short)]
        output: PathBuf,
        /// Old version to record when --old is omitted
        #[arg(long)]
        version_old: Option<String>,
        #[arg(long, value_enum)]
        engine: Option<EngineArg>,
        /// Worker threads (0 = all cores)
        #[arg(long, short)]
        jobs: Option<usize>,
    },
    /// Validate a published patch package
    Check {
        /// Package directory ({old}_to_{new}/)
        #[arg(long)]
        package: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn print_failures(failures: &[FileFailure]) {
    for failure in failures {
        println!(
            "  ! {} [{}]: {}",
            failure.relative_path,
            failure.error.kind(),
            failure.error
        );
    }
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Manifest {
            source,
            output,
            no_validate,
        } => {
            println!("Generating manifest...");
            println!("  Source: {}", source.display());

            let start = Instant::now();
            let (manifest, failures) =
                generate_manifest(&source, output.as_deref(), &config, !no_validate)?;
            if !failures.is_empty() {
                println!("\nManifest not written, {} file(s) failed:", failures.len());
                print_failures(&failures);
                bail!("manifest generation failed");
            }

            println!("\nManifest written successfully!");
            println!("  Version: {}", manifest.version());
            println!("  Files: {}", manifest.len());
            println!("  Total size: {} bytes", manifest.total_size_bytes());
            if let Some(digest) = manifest.self_digest() {
                println!("  Manifest hash: {digest}");
            }
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
        Commands::Seal {
            source,
            no_validate,
        } => {
            let sealed = seal::apply_seal(&read_text(&source)?)?;
            util::write_atomic(&source, sealed.as_bytes())?;
            let digest = if no_validate {
                seal::seal(&sealed)?
            } else {
                seal::verify_sealed(&read_text(&source)?)?
            };
            println!("Sealed {}", source.display());
            println!("  manifest_hash: {digest}");
        }
        Commands::Verify { source, expected } => match expected {
            Some(hex) => {
                let expected: Digest = hex
                    .parse()
                    .with_context(|| format!("Invalid digest {hex:?}"))?;
                if !seal::verify_file(&source, &expected)? {
                    bail!("{}: hash does not match {expected}", source.display());
                }
                println!("OK {} {expected}", source.display());
            }
            None => {
                let digest = seal::verify_sealed(&read_text(&source)?)?;
                println!("OK {} {digest}", source.display());
            }
        },
        Commands::Create {
            old,
            new,
            output,
            version_old,
            engine,
            jobs,
        } => {
            if let Some(engine) = engine {
                config.engine.kind = engine.into();
            }
            if let Some(jobs) = jobs {
                config.concurrency = jobs;
            }

            println!("Creating patch...");
            match &old {
                Some(old) => println!("  Old: {}", old.display()),
                None => println!("  Old: (first release)"),
            }
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let summary = Pipeline::run(&PipelineConfig {
                old_root: old,
                new_root: new,
                output_dir: output,
                version_old,
                config,
            })?;

            println!("\n{} -> {}", summary.version_old, summary.version_new);
            println!("  Files added: {}", summary.counts.added);
            println!("  Files modified: {}", summary.counts.modified);
            println!("  Files removed: {}", summary.counts.removed);
            println!("  Files unchanged: {}", summary.counts.unchanged);
            println!("  Paths skipped: {}", summary.skipped.len());
            for path in &summary.skipped {
                println!("  - {path}");
            }
            println!("  Time elapsed: {:.3}s", summary.elapsed.as_secs_f64());

            if !summary.failures.is_empty() {
                println!("\nPatch not published, {} file(s) failed:", summary.failures.len());
                print_failures(&summary.failures);
                bail!("patch creation failed");
            }
            if let Some(published) = &summary.published {
                println!("\nPatch created successfully!");
                println!("  Package: {}", published.dir.display());
                println!("  Archive: {}", published.archive.display());
                println!("  Archive size: {} bytes", published.release_info.archive_size);
                println!("  Archive hash: {}", published.release_info.archive_hash);
                println!("  Package digest: {}", published.package_digest);
            }
        }
        Commands::Check { package } => {
            let check = verify_package(&package)
                .with_context(|| format!("Package {} failed validation", package.display()))?;
            println!("Package OK: {}", package.display());
            println!("  {} -> {}", check.version_old, check.version_new);
            println!("  Deltas: {}", check.deltas);
            println!("  Package digest: {}", check.package_digest);
            println!("  Archive hash: {}", check.archive_hash);
        }
    }

    Ok(())
}
