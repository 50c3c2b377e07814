//! CLI command implementations.

pub mod check;
pub mod clean;
pub mod copy;
pub mod dump_log;
pub mod extract;
pub mod status;

use std::path::Path;
use std::sync::Arc;
use tsfs_core::{Engine, EngineConfig, TransactionalBackend};

/// Failures reported by the tools themselves.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The checker found problems.
    #[error("check found {0} problems")]
    CheckFailed(usize),

    /// A destructive command was not confirmed.
    #[error("{0} requires --yes")]
    NotConfirmed(&'static str),

    /// A pipeline stage went away before the copy finished.
    #[error("copy pipeline stopped: {0}")]
    Pipeline(String),
}

/// Opens an existing store. Opening runs recovery.
pub fn open_backend(
    path: &Path,
    config: impl FnOnce(EngineConfig) -> EngineConfig,
) -> tsfs_core::FsResult<TransactionalBackend> {
    let engine = Engine::open(config(EngineConfig::new(path).create_if_missing(false)))?;
    Ok(TransactionalBackend::new(Arc::new(engine)))
}
