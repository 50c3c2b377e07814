//! Status command implementation.

use super::open_backend;
use std::path::Path;
use tsfs_core::FileStoreBackend;

/// Runs the status command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_backend(path, |c| c)?;
    let report = backend.status()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    backend.shutdown()?;
    Ok(())
}
