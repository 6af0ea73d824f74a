//! Crash-recovery tests: the database handle is dropped without a
//! shutdown, so buffered pages are lost and only the log survives.

use marrow::{Database, EngineConfig, LogRecovery, PageId, Tuple};
use std::sync::Arc;
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    EngineConfig {
        buffer_pool_frames: 64,
        ..EngineConfig::in_dir(dir.path())
    }
}

#[test]
fn test_committed_transaction_survives_crash() {
    init_logging();
    let dir = tempdir().unwrap();
    let rid;
    {
        let db = Database::open(config(&dir)).unwrap();
        let txn = db.begin();
        let table = db.create_table("t", &txn).unwrap();
        rid = table.insert_tuple(&txn, &Tuple::new(&b"survivor"[..])).unwrap();
        db.commit(&txn).unwrap();

        // Keep the catalog record; lose every data page.
        db.pool().flush_page(PageId::HEADER).unwrap();
        // Crash: drop without shutdown.
    }

    let db = Database::open(config(&dir)).unwrap();
    db.recover().unwrap();

    let table = db.open_table("t").unwrap();
    let reader = db.begin();
    assert_eq!(
        table.get_tuple(&reader, rid).unwrap(),
        Some(Tuple::new(&b"survivor"[..]))
    );
    db.commit(&reader).unwrap();
    db.shutdown().unwrap();
}

#[test]
fn test_loser_insert_is_rolled_back() {
    // Spec scenario: a flushed INSERT without a COMMIT is redone (the
    // transaction shows up as active), then undone.
    init_logging();
    let dir = tempdir().unwrap();
    let rid;
    let loser_id;
    {
        let db = Database::open(config(&dir)).unwrap();
        let txn = db.begin();
        loser_id = txn.id();
        let table = db.create_table("t", &txn).unwrap();
        rid = table.insert_tuple(&txn, &Tuple::new(&b"ghost"[..])).unwrap();

        // The log reaches disk; the transaction never commits.
        db.log_manager().unwrap().force_flush(txn.prev_lsn());
        db.pool().flush_page(PageId::HEADER).unwrap();
        // Crash.
    }

    let db = Database::open(config(&dir)).unwrap();
    let mut recovery = LogRecovery::new(
        Arc::clone(db.pool().disk()),
        Arc::clone(db.pool()),
    );

    recovery.redo().unwrap();
    assert!(recovery.active_transactions().contains_key(&loser_id));

    // After redo the uncommitted tuple is present.
    let table = db.open_table("t").unwrap();
    let peek = db.begin();
    assert_eq!(
        table.get_tuple(&peek, rid).unwrap(),
        Some(Tuple::new(&b"ghost"[..]))
    );
    db.commit(&peek).unwrap();

    // Undo erases it.
    recovery.undo().unwrap();
    let reader = db.begin();
    assert_eq!(table.get_tuple(&reader, rid).unwrap(), None);
    db.commit(&reader).unwrap();
    db.shutdown().unwrap();
}

#[test]
fn test_interleaved_winner_and_loser() {
    init_logging();
    let dir = tempdir().unwrap();
    let committed_rid;
    let loser_rid;
    let updated_rid;
    {
        let db = Database::open(config(&dir)).unwrap();

        let setup = db.begin();
        let table = db.create_table("t", &setup).unwrap();
        updated_rid = table.insert_tuple(&setup, &Tuple::new(&b"original"[..])).unwrap();
        db.commit(&setup).unwrap();

        let winner = db.begin();
        committed_rid = table.insert_tuple(&winner, &Tuple::new(&b"winner"[..])).unwrap();
        db.commit(&winner).unwrap();

        let loser = db.begin();
        loser_rid = table.insert_tuple(&loser, &Tuple::new(&b"loser"[..])).unwrap();
        assert!(table
            .update_tuple(&loser, updated_rid, &Tuple::new(&b"tampered"[..]))
            .unwrap());
        db.log_manager().unwrap().force_flush(loser.prev_lsn());
        db.pool().flush_page(PageId::HEADER).unwrap();
        // Crash with the loser in flight.
    }

    let db = Database::open(config(&dir)).unwrap();
    db.recover().unwrap();

    let table = db.open_table("t").unwrap();
    let reader = db.begin();
    assert_eq!(
        table.get_tuple(&reader, committed_rid).unwrap(),
        Some(Tuple::new(&b"winner"[..]))
    );
    assert_eq!(table.get_tuple(&reader, loser_rid).unwrap(), None);
    // The loser's update is rolled back to the committed image.
    assert_eq!(
        table.get_tuple(&reader, updated_rid).unwrap(),
        Some(Tuple::new(&b"original"[..]))
    );
    db.commit(&reader).unwrap();
    db.shutdown().unwrap();
}

#[test]
fn test_loser_mark_delete_is_rolled_back() {
    init_logging();
    let dir = tempdir().unwrap();
    let rid;
    {
        let db = Database::open(config(&dir)).unwrap();
        let setup = db.begin();
        let table = db.create_table("t", &setup).unwrap();
        rid = table.insert_tuple(&setup, &Tuple::new(&b"precious"[..])).unwrap();
        db.commit(&setup).unwrap();

        let loser = db.begin();
        assert!(table.mark_delete(&loser, rid).unwrap());
        db.log_manager().unwrap().force_flush(loser.prev_lsn());
        db.pool().flush_page(PageId::HEADER).unwrap();
        // Crash before commit.
    }

    let db = Database::open(config(&dir)).unwrap();
    db.recover().unwrap();

    let table = db.open_table("t").unwrap();
    let reader = db.begin();
    assert_eq!(
        table.get_tuple(&reader, rid).unwrap(),
        Some(Tuple::new(&b"precious"[..]))
    );
    db.commit(&reader).unwrap();
    db.shutdown().unwrap();
}

#[test]
fn test_recovery_is_repeatable() {
    // Redo is idempotent through the page LSN check, so running
    // recovery again must not duplicate effects.
    init_logging();
    let dir = tempdir().unwrap();
    let rid;
    {
        let db = Database::open(config(&dir)).unwrap();
        let txn = db.begin();
        let table = db.create_table("t", &txn).unwrap();
        rid = table.insert_tuple(&txn, &Tuple::new(&b"once"[..])).unwrap();
        db.commit(&txn).unwrap();
        db.pool().flush_page(PageId::HEADER).unwrap();
    }

    for _ in 0..2 {
        let db = Database::open(config(&dir)).unwrap();
        db.recover().unwrap();
        let table = db.open_table("t").unwrap();
        let reader = db.begin();
        assert_eq!(
            table.get_tuple(&reader, rid).unwrap(),
            Some(Tuple::new(&b"once"[..]))
        );
        db.commit(&reader).unwrap();
        db.shutdown().unwrap();
    }
}

#[test]
fn test_crash_with_many_rows_across_pages() {
    init_logging();
    let dir = tempdir().unwrap();
    let mut committed = Vec::new();
    let mut lost = Vec::new();
    {
        let db = Database::open(config(&dir)).unwrap();
        let txn = db.begin();
        let table = db.create_table("t", &txn).unwrap();
        for i in 0..30u8 {
            committed.push((
                table.insert_tuple(&txn, &Tuple::new(vec![i; 700])).unwrap(),
                i,
            ));
        }
        db.commit(&txn).unwrap();

        let loser = db.begin();
        for i in 100..110u8 {
            lost.push(table.insert_tuple(&loser, &Tuple::new(vec![i; 700])).unwrap());
        }
        db.log_manager().unwrap().force_flush(loser.prev_lsn());
        db.pool().flush_page(PageId::HEADER).unwrap();
        // Crash.
    }

    let db = Database::open(config(&dir)).unwrap();
    db.recover().unwrap();

    let table = db.open_table("t").unwrap();
    let reader = db.begin();
    for (rid, i) in committed {
        assert_eq!(
            table.get_tuple(&reader, rid).unwrap(),
            Some(Tuple::new(vec![i; 700])),
            "row {} lost",
            i
        );
    }
    for rid in lost {
        assert_eq!(table.get_tuple(&reader, rid).unwrap(), None);
    }
    db.commit(&reader).unwrap();
    db.shutdown().unwrap();
}
