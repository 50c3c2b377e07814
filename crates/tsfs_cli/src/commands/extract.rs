//! Extract command implementation.

use super::open_backend;
use clap::Subcommand;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tsfs_core::{
    DataType, ExistsPolicy, FileStoreBackend, FsId, TimeSeriesCarrier, TransactionService,
};

/// What to extract.
#[derive(Subcommand)]
pub enum Target {
    /// A time series over an inclusive cadence range
    Ts {
        /// Identifier, e.g. /pa/flux/100
        id: String,
        /// First cadence
        start: i64,
        /// Last cadence
        end: i64,
    },
    /// The content of a blob
    Blob {
        /// Identifier
        id: String,
        /// Write the bytes here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// The points of an MJD series within an inclusive date range
    Mjd {
        /// Identifier
        id: String,
        /// First date
        start: f64,
        /// Last date
        end: f64,
    },
}

/// Runs the extract command.
///
/// Reads happen in a transaction that is rolled back afterwards, so the
/// store is left as it was found.
pub fn run(path: &Path, target: &Target) -> Result<(), Box<dyn std::error::Error>> {
    let backend = open_backend(path, |c| c)?;
    let xid = backend.begin()?;
    let result = extract(&backend, &xid, target);
    backend.rollback(&xid)?;
    backend.shutdown()?;
    result
}

fn extract(
    backend: &impl FileStoreBackend,
    xid: &tsfs_core::Xid,
    target: &Target,
) -> Result<(), Box<dyn std::error::Error>> {
    match target {
        Target::Ts { id, start, end } => {
            let id = FsId::new(id)?;
            let mut series =
                backend.read_time_series(xid, &[id], *start, *end, None, ExistsPolicy::Error)?;
            let carrier = series.pop().ok_or("no series returned")?;
            println!("{}", serde_json::to_string_pretty(&series_json(&carrier)?)?);
        }
        Target::Blob { id, output } => {
            let id = FsId::new(id)?;
            let blob = backend.read_blob(xid, &id, ExistsPolicy::Error)?;
            info!(fsid = %id, origin = blob.origin, bytes = blob.data.len(), "blob read");
            match output {
                Some(file) => fs::write(file, &blob.data)?,
                None => std::io::stdout().lock().write_all(&blob.data)?,
            }
        }
        Target::Mjd { id, start, end } => {
            let id = FsId::new(id)?;
            let mut series =
                backend.read_mjd_series(xid, &[id], *start, *end, ExistsPolicy::Error)?;
            let series = series.pop().ok_or("no series returned")?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
    }
    Ok(())
}

/// The carrier's intervals plus its elements decoded by type.
pub fn series_json(carrier: &TimeSeriesCarrier) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(carrier)?;
    let values = match carrier.data_type {
        DataType::Int => serde_json::to_value(carrier.ints())?,
        DataType::Float => serde_json::to_value(carrier.floats())?,
        DataType::Double => serde_json::to_value(carrier.doubles())?,
    };
    if let Value::Object(map) = &mut value {
        map.insert("values".to_string(), values);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_json_decodes_elements() {
        let id = FsId::new("/a/b").unwrap();
        let carrier = TimeSeriesCarrier::from_ints(id, 10, &[1, 2, 3], 7).unwrap();
        let json = series_json(&carrier).unwrap();
        assert_eq!(json["values"], serde_json::json!([1, 2, 3]));
        assert_eq!(json["start_cadence"], 10);
        assert_eq!(json["end_cadence"], 12);
        assert_eq!(json["exists"], true);
    }
}
