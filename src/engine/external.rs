use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use super::{DeltaEngine, EngineError};

/// Delegates to an xdelta3-compatible command line tool.
///
/// Encoding runs `PROGRAM -e -f [-s OLD] NEW OUT`, decoding runs
/// `PROGRAM -d -f [-s OLD] DELTA OUT`. The `-s` source is omitted when the
/// old side is empty, so added files are encoded against nothing.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
}

impl ExternalEngine {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    fn run(&self, mode: &str, source: &[u8], input: &[u8]) -> Result<Vec<u8>, EngineError> {
        let scratch = tempfile::TempDir::new()?;
        let source_path = scratch.path().join("source");
        let input_path = scratch.path().join("input");
        let output_path = scratch.path().join("output");
        std::fs::write(&input_path, input)?;

        let mut args: Vec<OsString> = vec![mode.into(), "-f".into()];
        if !source.is_empty() {
            std::fs::write(&source_path, source)?;
            args.push("-s".into());
            args.push(source_path.into_os_string());
        }
        args.push(input_path.into_os_string());
        args.push(output_path.clone().into_os_string());

        debug!(program = %self.program.display(), mode, "invoking external delta tool");
        let output = Command::new(&self.program).args(&args).output()?;
        if !output.status.success() {
            return Err(EngineError::Tool {
                program: self.program.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(std::fs::read(&output_path)?)
    }
}

impl DeltaEngine for ExternalEngine {
    fn name(&self) -> &str {
        "xdelta3"
    }

    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, EngineError> {
        self.run("-e", old, new)
    }

    fn apply(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>, EngineError> {
        self.run("-d", old, delta)
    }
}
