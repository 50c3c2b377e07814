//! Copy command implementation.
//!
//! Copies are a three stage pipeline joined by bounded channels:
//!
//! ```text
//! producer ──ids──▶ reader ──items──▶ writer
//!  (query)         (source txn)      (destination txn)
//! ```
//!
//! A full channel blocks the stage feeding it, so at most `capacity`
//! batches are in flight between any two stages. Every batch is read in
//! its own source transaction and written in its own destination
//! transaction.

use super::{open_backend, CliError};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use tracing::{debug, info};
use tsfs_core::{
    BlobCarrier, ExistsPolicy, FileKind, FileStoreBackend, FsId, FsQuery, FsResult,
    MjdTimeSeries, TimeSeriesCarrier,
};

/// What a copy did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySummary {
    /// Destination transactions committed.
    pub batches: usize,
    /// Items written.
    pub items: usize,
}

enum Batch {
    Series(Vec<TimeSeriesCarrier>),
    Blobs(Vec<BlobCarrier>),
    Mjd(Vec<MjdTimeSeries>),
}

impl Batch {
    fn len(&self) -> usize {
        match self {
            Self::Series(v) => v.len(),
            Self::Blobs(v) => v.len(),
            Self::Mjd(v) => v.len(),
        }
    }
}

/// Runs the copy command from the store at `from` into the store at `to`.
pub fn run(
    from: &Path,
    to: &Path,
    query: &str,
    batch: usize,
    capacity: usize,
) -> Result<CopySummary, Box<dyn std::error::Error>> {
    let source = open_backend(from, |c| c)?;
    let dest = open_backend(to, |c| c.create_if_missing(true))?;
    let summary = copy_between(&source, &dest, query, batch, capacity)?;
    source.shutdown()?;
    dest.shutdown()?;
    Ok(summary)
}

/// Copies every committed id of `source` matching `query` into `dest`.
pub fn copy_between<S, D>(
    source: &S,
    dest: &D,
    query: &str,
    batch: usize,
    capacity: usize,
) -> Result<CopySummary, Box<dyn std::error::Error>>
where
    S: FileStoreBackend,
    D: FileStoreBackend,
{
    let kind = FsQuery::parse(query)?.kind();
    let batch = batch.max(1);
    let (id_tx, id_rx) = sync_channel::<Vec<FsId>>(capacity);
    let (item_tx, item_rx) = sync_channel::<Batch>(capacity);

    let (produced, read, written) = thread::scope(|s| {
        let producer = s.spawn(move || produce(source, query, batch, &id_tx));
        let reader = s.spawn(move || read_stage(source, kind, id_rx, &item_tx));
        let written = write_stage(dest, item_rx);
        (producer.join(), reader.join(), written)
    });

    let summary = written?;
    read.map_err(|_| CliError::Pipeline("reader panicked".into()))??;
    let matched = produced.map_err(|_| CliError::Pipeline("producer panicked".into()))??;
    info!(
        query,
        matched,
        items = summary.items,
        batches = summary.batches,
        "copy finished"
    );
    Ok(summary)
}

/// Sends the matching ids in batches. Returns how many matched.
fn produce<S: FileStoreBackend>(
    source: &S,
    query: &str,
    batch: usize,
    out: &SyncSender<Vec<FsId>>,
) -> FsResult<usize> {
    let ids = source.query_ids(query)?;
    for chunk in ids.chunks(batch) {
        // A closed channel means a later stage failed and reports why.
        if out.send(chunk.to_vec()).is_err() {
            break;
        }
    }
    Ok(ids.len())
}

fn read_stage<S: FileStoreBackend>(
    source: &S,
    kind: FileKind,
    ids: Receiver<Vec<FsId>>,
    out: &SyncSender<Batch>,
) -> FsResult<()> {
    for batch in ids {
        let xid = source.begin()?;
        let items = read_batch(source, &xid, kind, &batch);
        source.rollback(&xid)?;
        let items = items?;
        debug!(items = items.len(), "batch read");
        if out.send(items).is_err() {
            break;
        }
    }
    Ok(())
}

fn read_batch<S: FileStoreBackend>(
    source: &S,
    xid: &tsfs_core::Xid,
    kind: FileKind,
    ids: &[FsId],
) -> FsResult<Batch> {
    match kind {
        FileKind::TimeSeries => {
            let intervals = source.get_cadence_intervals(xid, ids)?;
            let mut series = Vec::with_capacity(ids.len());
            for (id, iv) in ids.iter().zip(intervals) {
                // Ids deleted since the query, and series with no data, are skipped.
                let Some(iv) = iv else { continue };
                let Some((start, end)) = iv.valid.bounds() else {
                    continue;
                };
                series.extend(source.read_time_series(
                    xid,
                    std::slice::from_ref(id),
                    start,
                    end,
                    Some(iv.data_type),
                    ExistsPolicy::Error,
                )?);
            }
            Ok(Batch::Series(series))
        }
        FileKind::Blob => {
            let mut blobs = Vec::with_capacity(ids.len());
            for id in ids {
                let blob = source.read_blob(xid, id, ExistsPolicy::Empty)?;
                if blob.exists {
                    blobs.push(blob);
                }
            }
            Ok(Batch::Blobs(blobs))
        }
        FileKind::Mjd => {
            let series =
                source.read_mjd_series(xid, ids, f64::MIN, f64::MAX, ExistsPolicy::Empty)?;
            Ok(Batch::Mjd(series.into_iter().filter(|s| s.exists).collect()))
        }
    }
}

fn write_stage<D: FileStoreBackend>(
    dest: &D,
    batches: Receiver<Batch>,
) -> FsResult<CopySummary> {
    let mut summary = CopySummary::default();
    for batch in batches {
        let count = batch.len();
        if count == 0 {
            continue;
        }
        let xid = dest.begin()?;
        if let Err(e) = write_batch(dest, &xid, batch) {
            dest.rollback(&xid)?;
            return Err(e);
        }
        dest.commit(&xid, true)?;
        summary.batches += 1;
        summary.items += count;
    }
    Ok(summary)
}

fn write_batch<D: FileStoreBackend>(dest: &D, xid: &tsfs_core::Xid, batch: Batch) -> FsResult<()> {
    match batch {
        Batch::Series(series) => dest.write_time_series(xid, series, true),
        Batch::Blobs(blobs) => {
            for blob in blobs {
                dest.write_blob(xid, &blob.id, blob.origin, &blob.data)?;
            }
            Ok(())
        }
        Batch::Mjd(series) => dest.write_mjd_series(xid, series),
    }
}
