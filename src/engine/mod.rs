//! Byte-level delta engines.
//!
//! The pipeline only sees the [`DeltaEngine`] trait, so tests can swap in a
//! stub and production can pick the built-in block engine or an external
//! xdelta3-compatible tool.

mod block;
mod external;
mod rolling_hash;

pub use block::{BlockEngine, DEFAULT_BLOCK_SIZE};
pub use external::ExternalEngine;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error("{program} exited with {status}: {stderr}")]
    Tool {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Produces a delta that rebuilds `new` from `old`, and replays it.
///
/// An empty `old` stands for an absent file: `apply(&[], &diff(&[], new))`
/// must return `new`.
pub trait DeltaEngine: Send + Sync {
    fn name(&self) -> &str;

    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, EngineError>;

    fn apply(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>, EngineError>;
}

impl<E: DeltaEngine + ?Sized> DeltaEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, EngineError> {
        (**self).diff(old, new)
    }

    fn apply(&self, old: &[u8], delta: &[u8]) -> Result<Vec<u8>, EngineError> {
        (**self).apply(old, delta)
    }
}
