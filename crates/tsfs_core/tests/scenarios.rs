//! End-to-end behaviour through the transactional backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tsfs_core::{
    DataType, Engine, EngineConfig, ExistsPolicy, FaultClass, FileStoreBackend, FsId, GlobalXid,
    HeuristicOutcome, Interval, IntervalSet, SimpleInterval, TaggedInterval, TimeSeriesCarrier,
    TransactionService, TransactionState, TransactionalBackend, Vote,
};

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig::new(dir.path())
        .sync_on_commit(false)
        .lock_timeout(Duration::from_secs(10))
        .reaper_interval(Duration::from_millis(20))
}

fn open(config: &EngineConfig) -> TransactionalBackend {
    TransactionalBackend::new(Arc::new(Engine::open(config.clone()).unwrap()))
}

fn id(s: &str) -> FsId {
    FsId::new(s).unwrap()
}

fn ints(s: &str, start: i64, values: &[i32], origin: u64) -> TimeSeriesCarrier {
    TimeSeriesCarrier::from_ints(id(s), start, values, origin).unwrap()
}

fn commit(backend: &TransactionalBackend, series: Vec<TimeSeriesCarrier>, overwrite: bool) {
    let xid = backend.begin().unwrap();
    backend.write_time_series(&xid, series, overwrite).unwrap();
    backend.commit(&xid, false).unwrap();
}

fn read(backend: &TransactionalBackend, s: &str, start: i64, end: i64) -> TimeSeriesCarrier {
    let xid = backend.begin().unwrap();
    let mut out = backend
        .read_time_series(&xid, &[id(s)], start, end, Some(DataType::Int), ExistsPolicy::Empty)
        .unwrap();
    backend.rollback(&xid).unwrap();
    out.remove(0)
}

fn tagged(list: &[(i64, i64, u64)]) -> IntervalSet<TaggedInterval> {
    IntervalSet::from_intervals(list.iter().map(|&(s, e, t)| TaggedInterval::new(s, e, t)))
}

#[test]
fn committed_write_is_read_back_with_its_origin() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    let values: Vec<i32> = (0..100).map(|v| v * 3).collect();
    commit(&backend, vec![ints("/a/b", 0, &values, 7)], true);

    let found = read(&backend, "/a/b", 0, 99);
    assert!(found.exists);
    assert_eq!(found.ints(), values);
    assert_eq!(found.origins, tagged(&[(0, 99, 7)]));
    assert_eq!(found.valid.covered(), 100);
}

#[test]
fn second_writer_waits_for_the_first_to_commit() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    let t1 = backend.begin().unwrap();
    backend.write_time_series(&t1, vec![ints("/x", 0, &[1; 10], 1)], true).unwrap();

    let t1_done = AtomicBool::new(false);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let t2 = backend.begin().unwrap();
            backend.write_time_series(&t2, vec![ints("/x", 5, &[2; 10], 2)], true).unwrap();
            let saw_commit = t1_done.load(Ordering::SeqCst);
            backend.commit(&t2, false).unwrap();
            saw_commit
        });
        thread::sleep(Duration::from_millis(200));
        t1_done.store(true, Ordering::SeqCst);
        backend.commit(&t1, false).unwrap();
        assert!(waiter.join().unwrap(), "second writer ran before the first committed");
    });

    let found = read(&backend, "/x", 0, 14);
    assert_eq!(found.ints(), [vec![1; 5], vec![2; 10]].concat());
    assert_eq!(found.origins, tagged(&[(0, 4, 1), (5, 14, 2)]));
}

#[test]
fn rolled_back_holder_lets_the_waiter_proceed() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    let t1 = backend.begin().unwrap();
    backend.write_time_series(&t1, vec![ints("/x2", 0, &[1; 10], 1)], true).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let t2 = backend.begin().unwrap();
            backend.write_time_series(&t2, vec![ints("/x2", 5, &[2; 10], 2)], true).unwrap();
            backend.commit(&t2, false).unwrap();
        });
        thread::sleep(Duration::from_millis(100));
        backend.rollback(&t1).unwrap();
        waiter.join().unwrap();
    });

    let found = read(&backend, "/x2", 0, 14);
    assert_eq!(found.valid.as_slice(), &[SimpleInterval::new(5, 14)]);
    assert_eq!(found.origins, tagged(&[(5, 14, 2)]));
}

#[test]
fn overwrite_splits_the_older_origin() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    commit(&backend, vec![ints("/y", 0, &[1; 50], 10)], true);
    commit(&backend, vec![ints("/y", 20, &[2; 10], 11)], true);

    let found = read(&backend, "/y", 0, 49);
    assert_eq!(found.origins, tagged(&[(0, 19, 10), (20, 29, 11), (30, 49, 10)]));
    assert_eq!(&found.ints()[18..32], &[1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1]);
}

#[test]
fn merge_write_keeps_data_between_new_intervals() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    commit(&backend, vec![ints("/m", 10, &[5; 5], 1)], true);

    // Two new intervals with the existing [10, 14] sitting in their gap.
    let values: Vec<u8> = (0..30).flat_map(|_| 9i32.to_le_bytes()).collect();
    let valid = IntervalSet::from_intervals([SimpleInterval::new(0, 4), SimpleInterval::new(20, 29)]);
    let origins = tagged(&[(0, 4, 2), (20, 29, 2)]);
    let series =
        TimeSeriesCarrier::new(id("/m"), DataType::Int, 0, 29, values, valid, origins).unwrap();
    commit(&backend, vec![series], false);

    let found = read(&backend, "/m", 0, 29);
    assert_eq!(
        found.valid.as_slice(),
        &[SimpleInterval::new(0, 4), SimpleInterval::new(10, 14), SimpleInterval::new(20, 29)]
    );
    assert_eq!(found.origins, tagged(&[(0, 4, 2), (10, 14, 1), (20, 29, 2)]));
    let got = found.ints();
    assert_eq!(&got[10..15], &[5; 5]);
    assert_eq!(&got[20..30], &[9; 10]);
}

#[test]
fn committed_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    {
        let backend = open(&config);
        commit(&backend, vec![ints("/r/a", 0, &[4; 8], 3)], true);
        let xid = backend.begin().unwrap();
        backend.write_blob(&xid, &id("/r/blob"), 5, b"payload").unwrap();
        backend.commit(&xid, true).unwrap();
        backend.shutdown().unwrap();
    }
    let backend = open(&config);
    assert!(backend.engine().recovery_report().is_clean());
    assert_eq!(read(&backend, "/r/a", 0, 7).ints(), vec![4; 8]);
    let xid = backend.begin().unwrap();
    let blob = backend.read_blob(&xid, &id("/r/blob"), ExistsPolicy::Error).unwrap();
    backend.rollback(&xid).unwrap();
    assert_eq!((blob.origin, blob.data.as_slice()), (5, &b"payload"[..]));
}

#[test]
fn uncommitted_work_is_rolled_back_at_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    {
        let backend = open(&config);
        let xid = backend.begin().unwrap();
        backend.write_time_series(&xid, vec![ints("/u", 0, &[1; 4], 1)], true).unwrap();
    }
    let backend = open(&config);
    assert!(!read(&backend, "/u", 0, 3).exists);
    assert!(backend.query_ids("/u").unwrap().is_empty());
}

#[test]
fn prepared_external_branch_outlives_a_restart() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let gxid = GlobalXid::new(1, b"global-1", b"b1");
    {
        let backend = open(&config);
        let xid = backend.start_external(gxid.clone(), None).unwrap();
        backend.write_time_series(&xid, vec![ints("/e", 0, &[1; 4], 1)], true).unwrap();
        assert_eq!(backend.prepare(&xid).unwrap(), Vote::Commit);
    }
    let backend = open(&config);
    let pending = backend.recover().unwrap();
    assert_eq!(pending.len(), 1);
    let xid = pending[0].clone();
    assert_eq!(
        backend.engine().transactions().state(&xid).unwrap(),
        TransactionState::Heuristic(HeuristicOutcome::RolledBack)
    );
    assert!(!read(&backend, "/e", 0, 3).exists);
    assert_eq!(backend.commit(&xid, false).unwrap_err().class(), FaultClass::Heuristic);

    backend.forget(&xid).unwrap();
    assert!(backend.recover().unwrap().is_empty());
}

#[test]
fn expired_transaction_is_reaped() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    let xid = backend.begin().unwrap();
    backend.write_time_series(&xid, vec![ints("/t", 0, &[1; 4], 1)], true).unwrap();
    backend.set_timeout(&xid, Duration::from_millis(30)).unwrap();

    let started = Instant::now();
    while backend.engine().transactions().state(&xid).is_ok() {
        assert!(started.elapsed() < Duration::from_secs(5), "reaper never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(backend.commit(&xid, false).is_err());
    assert!(!read(&backend, "/t", 0, 3).exists);
}

#[test]
fn only_writes_end_read_only_status() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir));
    commit(&backend, vec![ints("/ro", 0, &[1; 4], 1)], true);

    let xid = backend.start_external(GlobalXid::new(2, b"g", b"1"), None).unwrap();
    backend
        .read_time_series(&xid, &[id("/ro")], 0, 3, None, ExistsPolicy::Error)
        .unwrap();
    assert!(backend.is_read_only(&xid).unwrap());
    backend.delete_time_series_interval(&xid, &id("/ro"), 0, 0).unwrap();
    assert!(!backend.is_read_only(&xid).unwrap());
    assert_eq!(backend.prepare(&xid).unwrap(), Vote::Commit);
    backend.commit(&xid, false).unwrap();

    let found = read(&backend, "/ro", 0, 3);
    assert_eq!(found.valid.as_slice(), &[SimpleInterval::new(1, 3)]);
    assert_eq!(found.origins.iter().map(|o| o.start()).collect::<Vec<_>>(), vec![1]);
}

#[test]
fn permits_return_after_a_batch() {
    let dir = TempDir::new().unwrap();
    let backend = open(&config(&dir).total_permits(8));
    let series: Vec<_> = (0..40).map(|n| ints(&format!("/p/{n}"), 0, &[n; 16], 1)).collect();
    commit(&backend, series, true);
    let ids: Vec<FsId> = (0..40).map(|n| id(&format!("/p/{n}"))).collect();
    let xid = backend.begin().unwrap();
    let out = backend
        .read_time_series(&xid, &ids, 0, 15, Some(DataType::Int), ExistsPolicy::Error)
        .unwrap();
    backend.rollback(&xid).unwrap();

    assert!(out.iter().zip(0..).all(|(s, n)| s.id == ids[n as usize] && s.ints() == vec![n; 16]));
    let status = backend.status().unwrap();
    assert_eq!(status.permits_available, status.permits_total);
    assert!(status.active_transactions.is_empty());
}
