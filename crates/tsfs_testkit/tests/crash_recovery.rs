//! Crash recovery tests.
//!
//! Every test interrupts a transaction, reopens the store and checks that
//! each written identifier is either fully committed or fully absent.

use tsfs_core::{
    CrashPoint, ExistsPolicy, FileStoreBackend, GlobalXid, HeuristicOutcome, StorageFault,
    TaggedInterval, TransactionService,
};
use tsfs_testkit::{commit_ints, fsid, int_series, read_ints, CrashHarness, Presence, TestStore};

#[test]
fn uncommitted_write_is_gone_after_crash() {
    let mut harness = CrashHarness::new();
    let z = int_series("/z", 0, &[1, 2, 3, 4], 1);
    let report = harness
        .crash_before_commit(|b, xid| b.write_time_series(xid, vec![z.clone()], true))
        .unwrap();
    assert_eq!(report.orphan_journals, 1);
    assert!(report.replayed.is_empty());
    assert_eq!(harness.presence(&z).unwrap(), Presence::Absent);
}

#[test]
fn crash_after_prepare_rolls_back() {
    let mut harness = CrashHarness::new();
    let z = int_series("/z", 10, &[5; 32], 2);
    let report = harness
        .crash_in_commit(CrashPoint::AfterPrepare, |b, xid| {
            b.write_time_series(xid, vec![z.clone()], true)
        })
        .unwrap();
    assert_eq!(report.rolled_back.len(), 1);
    assert_eq!(harness.presence(&z).unwrap(), Presence::Absent);

    // The rolled back file id is free again and the id can be written.
    commit_ints(harness.backend(), "/z", 10, &[5; 32], 2).unwrap();
    assert_eq!(harness.presence(&z).unwrap(), Presence::Complete);
}

#[test]
fn crash_after_commit_log_is_replayed() {
    let mut harness = CrashHarness::new();
    let z = int_series("/z", 0, &[9; 100], 3);
    let report = harness
        .crash_in_commit(CrashPoint::AfterCommitLog, |b, xid| {
            b.write_time_series(xid, vec![z.clone()], true)
        })
        .unwrap();
    assert_eq!(report.replayed.len(), 1);
    assert_eq!(harness.presence(&z).unwrap(), Presence::Complete);
}

#[test]
fn replaying_an_applied_commit_changes_nothing() {
    let mut harness = CrashHarness::new();
    let z = int_series("/z", 0, &[7; 64], 4);
    harness
        .crash_in_commit(CrashPoint::AfterApply, |b, xid| {
            b.write_time_series(xid, vec![z.clone()], true)
        })
        .unwrap();
    assert_eq!(harness.presence(&z).unwrap(), Presence::Complete);

    // A second restart finds nothing left to do.
    let report = harness.crash_and_recover().unwrap();
    assert!(report.is_clean());
    assert_eq!(harness.presence(&z).unwrap(), Presence::Complete);
}

#[test]
fn every_file_of_a_transaction_shares_its_fate() {
    for (point, expected) in [
        (CrashPoint::AfterPrepare, Presence::Absent),
        (CrashPoint::AfterCommitLog, Presence::Complete),
        (CrashPoint::AfterApply, Presence::Complete),
    ] {
        let mut harness = CrashHarness::new();
        let series: Vec<_> = (0..6)
            .map(|i| int_series(&format!("/multi/{i}"), i * 100, &[i as i32; 50], 8))
            .collect();
        let written = series.clone();
        harness
            .crash_in_commit(point, move |b, xid| b.write_time_series(xid, written, true))
            .unwrap();
        for s in &series {
            assert_eq!(harness.presence(s).unwrap(), expected, "{point:?} {}", s.id);
        }
    }
}

#[test]
fn replayed_overwrite_keeps_surrounding_origins() {
    let mut harness = CrashHarness::new();
    commit_ints(harness.backend(), "/y", 0, &[1; 50], 0xA).unwrap();
    harness
        .crash_in_commit(CrashPoint::AfterCommitLog, |b, xid| {
            b.write_time_series(xid, vec![int_series("/y", 20, &[2; 10], 0xB)], true)
        })
        .unwrap();

    let read = read_ints(harness.backend(), "/y", 0, 49).unwrap();
    assert_eq!(
        read.origins.as_slice(),
        &[
            TaggedInterval::new(0, 19, 0xA),
            TaggedInterval::new(20, 29, 0xB),
            TaggedInterval::new(30, 49, 0xA),
        ]
    );
    let ints = read.ints();
    assert!(ints[..20].iter().all(|v| *v == 1));
    assert!(ints[20..30].iter().all(|v| *v == 2));
    assert!(ints[30..].iter().all(|v| *v == 1));
}

#[test]
fn replayed_blob_delete_removes_the_blob() {
    let mut harness = CrashHarness::new();
    let id = fsid("/blob/1");
    let backend = harness.backend();
    let xid = backend.begin().unwrap();
    backend.write_blob(&xid, &id, 5, b"to be deleted").unwrap();
    backend.commit(&xid, false).unwrap();

    let deleted = id.clone();
    harness
        .crash_in_commit(CrashPoint::AfterCommitLog, move |b, xid| {
            assert!(b.delete_blob(xid, &deleted)?);
            Ok(())
        })
        .unwrap();

    let backend = harness.backend();
    let xid = backend.begin().unwrap();
    assert!(!backend.read_blob(&xid, &id, ExistsPolicy::Empty).unwrap().exists);
    backend.rollback(&xid).unwrap();
}

#[test]
fn prepared_external_transaction_waits_for_forget() {
    let mut harness = CrashHarness::new();
    let z = int_series("/xa/z", 0, &[1; 8], 6);
    let gxid = GlobalXid::new(42, b"global", b"branch");
    let report = harness
        .crash_after_external_prepare(gxid, |b, xid| {
            b.write_time_series(xid, vec![z.clone()], true)
        })
        .unwrap();
    assert_eq!(report.heuristic.len(), 1);
    assert!(report
        .heuristic
        .values()
        .all(|o| *o == HeuristicOutcome::RolledBack));
    assert_eq!(harness.presence(&z).unwrap(), Presence::Absent);

    let backend = harness.backend();
    let pending = backend.recover().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(matches!(
        backend.commit(&pending[0], false),
        Err(StorageFault::Heuristic {
            outcome: HeuristicOutcome::RolledBack,
            ..
        })
    ));
    backend.rollback(&pending[0]).unwrap();
    backend.forget(&pending[0]).unwrap();
    assert!(backend.recover().unwrap().is_empty());

    // Forgotten for good: the next restart does not bring it back.
    let report = harness.crash_and_recover().unwrap();
    assert!(report.heuristic.is_empty());
}

#[test]
fn prepared_external_transactions_can_be_forgotten_at_startup() {
    let mut harness = CrashHarness::with_config(|c| c.forget_xa_on_startup(true));
    let report = harness
        .crash_after_external_prepare(GlobalXid::new(1, b"g", b"b"), |b, xid| {
            b.write_blob(xid, &fsid("/xa/blob"), 1, b"abc")
        })
        .unwrap();
    assert_eq!(report.forgotten.len(), 1);
    assert!(report.heuristic.is_empty());
    assert!(harness.backend().recover().unwrap().is_empty());
}

#[test]
fn clean_shutdown_leaves_nothing_to_recover() {
    let mut store = TestStore::new();
    commit_ints(store.backend(), "/s/1", 0, &[1, 2], 1).unwrap();
    let xid = store.backend().begin().unwrap();
    store
        .backend()
        .write_time_series(&xid, vec![int_series("/s/2", 0, &[3], 1)], true)
        .unwrap();
    // Shutdown rolls back the open transaction.
    store.reopen().unwrap();
    assert!(store.engine().recovery_report().is_clean());
    assert!(!read_ints(store.backend(), "/s/2", 0, 0).unwrap().exists);
    assert_eq!(read_ints(store.backend(), "/s/1", 0, 1).unwrap().ints(), vec![1, 2]);
}
