//! Clean command implementation.

use super::{open_backend, CliError};
use std::path::Path;
use tracing::warn;
use tsfs_core::FileStoreBackend;

/// Runs the clean command.
///
/// Cleanup is only enabled in the engine configuration when the caller
/// confirmed it, so an unconfirmed run never reaches the store.
pub fn run(path: &Path, confirmed: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !confirmed {
        return Err(CliError::NotConfirmed("clean").into());
    }
    let backend = open_backend(path, |c| c.allow_cleanup(true))?;
    warn!(path = %path.display(), "deleting all items");
    let removed = backend.clean_file_store()?;
    backend.shutdown()?;
    println!("✓ Removed {removed} items");
    Ok(())
}
