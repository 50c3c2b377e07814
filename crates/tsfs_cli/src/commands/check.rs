//! Check command implementation.

use super::{open_backend, CliError};
use serde::Serialize;
use std::path::Path;
use tsfs_core::{check_store, CheckReport, Problem, RecoveryReport};

#[derive(Serialize)]
struct CheckOutput<'a> {
    path: String,
    recovery: &'a RecoveryReport,
    check: &'a CheckReport,
}

/// Runs the check command.
///
/// Recovery always runs first: opening the store resolves leftover
/// transaction logs, and the checker only makes sense against the
/// resolved state. With `dry_run` the checker reports without repairing.
pub fn run(path: &Path, dry_run: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_backend(path, |c| c)?;
    let engine = backend.engine();
    let report = check_store(engine.store(), dry_run)?;

    match format {
        "json" => {
            let output = CheckOutput {
                path: path.display().to_string(),
                recovery: engine.recovery_report(),
                check: &report,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => print_text_output(path, engine.recovery_report(), &report),
    }
    engine.shutdown()?;

    if report.is_clean() || report.repaired {
        Ok(())
    } else {
        Err(CliError::CheckFailed(report.problems.len()).into())
    }
}

fn print_text_output(path: &Path, recovery: &RecoveryReport, report: &CheckReport) {
    println!("Checking store at {:?}", path);
    println!();
    println!("Recovery:");
    println!("  Replayed: {}", recovery.replayed.len());
    println!("  Rolled back: {}", recovery.rolled_back.len());
    println!("  Forgotten: {}", recovery.forgotten.len());
    println!("  Awaiting forget: {}", recovery.heuristic.len());
    println!("  Orphan journals removed: {}", recovery.orphan_journals);
    println!();
    println!("Structure:");
    println!("  Ids checked: {}", report.ids_checked);
    println!("  Files scanned: {}", report.files_scanned);
    println!("  Problems: {}", report.problems.len());
    for problem in &report.problems {
        println!("    - {}", describe(problem));
    }
    println!();
    if report.is_clean() {
        println!("✓ Store check passed");
    } else if report.repaired {
        println!("✓ Repaired {} problems", report.problems.len());
    } else {
        println!("✗ Store check failed (dry run, nothing repaired)");
    }
}

fn describe(problem: &Problem) -> String {
    match problem {
        Problem::MissingDataFile { kind, id, file_id } => {
            format!("{kind} {id}: data file {file_id} missing")
        }
        Problem::MissingMetadata { kind, id, file_id } => {
            format!("{kind} {id}: metadata of file {file_id} missing")
        }
        Problem::UnreadableMetadata {
            kind,
            id,
            file_id,
            reason,
        } => format!("{kind} {id}: metadata of file {file_id} unreadable: {reason}"),
        Problem::ShortDataFile {
            kind,
            id,
            file_id,
            expected,
            actual,
        } => format!("{kind} {id}: file {file_id} has {actual} of {expected} bytes"),
        Problem::DuplicateFileId {
            kind,
            kept,
            dropped,
            file_id,
        } => format!("{kind}: file {file_id} mapped by {kept} and {dropped}"),
        Problem::MisplacedFile { path, expected } => {
            format!("{} belongs at {}", path.display(), expected.display())
        }
        Problem::OrphanFile { path } => format!("{} is not referenced", path.display()),
        Problem::StaleTempFile { path } => format!("{} is a stale temporary", path.display()),
        Problem::UnknownFile { path } => format!("{} is not a store file", path.display()),
        Problem::BadHashConfig { dir, reason } => {
            format!("{}: directory hash {reason}", dir.display())
        }
    }
}
