use super::tables;
use super::Database;

#[test]
fn put_get_delete_round_trip() {
    let db = Database::memory();
    let mut txn = db.begin().unwrap();
    txn.put(tables::NODES, b"3.0.1", b"record".to_vec());
    assert_eq!(txn.get(tables::NODES, b"3.0.1"), Some(b"record".to_vec()));
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    assert_eq!(txn.get(tables::NODES, b"3.0.1"), Some(b"record".to_vec()));
    txn.delete(tables::NODES, b"3.0.1");
    assert_eq!(txn.get(tables::NODES, b"3.0.1"), None);
    txn.commit().unwrap();

    let txn = db.begin().unwrap();
    assert_eq!(txn.get(tables::NODES, b"3.0.1"), None);
    drop(txn);
}

#[test]
fn abort_discards_buffered_writes() {
    let db = Database::memory();
    let mut txn = db.begin().unwrap();
    txn.put(tables::MISCELLANEOUS, b"next-node-id", b"7".to_vec());
    drop(txn); // abort

    let txn = db.begin().unwrap();
    assert_eq!(txn.get(tables::MISCELLANEOUS, b"next-node-id"), None);
}

#[test]
fn duplicate_key_tables_accumulate_rows() {
    let db = Database::memory();
    let mut txn = db.begin().unwrap();
    txn.append_row(tables::STRINGS, b"s1", b"hello ".to_vec());
    txn.append_row(tables::STRINGS, b"s1", b"world".to_vec());
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    txn.append_row(tables::STRINGS, b"s1", b"!".to_vec());
    let rows = txn.get_rows(tables::STRINGS, b"s1").unwrap();
    assert_eq!(rows, vec![b"hello ".to_vec(), b"world".to_vec(), b"!".to_vec()]);
    drop(txn);

    // The third chunk was never committed.
    let txn = db.begin().unwrap();
    assert_eq!(txn.get_rows(tables::STRINGS, b"s1").unwrap().len(), 2);
}

#[test]
fn scan_prefix_merges_overlay() {
    let db = Database::memory();
    let mut txn = db.begin().unwrap();
    txn.put(tables::LOCK_TOKENS, b"/A/mu", b"t1".to_vec());
    txn.put(tables::LOCK_TOKENS, b"/A/nu", b"t2".to_vec());
    txn.put(tables::LOCK_TOKENS, b"/B", b"t3".to_vec());
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    txn.delete(tables::LOCK_TOKENS, b"/A/nu");
    txn.put(tables::LOCK_TOKENS, b"/A/xi", b"t4".to_vec());
    let keys = txn.scan_prefix(tables::LOCK_TOKENS, b"/A/");
    assert_eq!(keys, vec![b"/A/mu".to_vec(), b"/A/xi".to_vec()]);
}

#[test]
fn last_key_sees_uncommitted_appends() {
    let db = Database::memory();
    let mut txn = db.begin().unwrap();
    txn.put(tables::REVISIONS, b"00000000000000000000", b"r0".to_vec());
    txn.commit().unwrap();

    let mut txn = db.begin().unwrap();
    txn.put(tables::REVISIONS, b"00000000000000000001", b"r1".to_vec());
    assert_eq!(txn.last_key(tables::REVISIONS), Some(b"00000000000000000001".to_vec()));
    txn.commit().unwrap();
}

#[test]
fn persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().join("db");
    {
        let db = Database::create(&db_dir).unwrap();
        let mut txn = db.begin().unwrap();
        txn.put(tables::UUIDS, b"1", b"some-uuid".to_vec());
        txn.append_row(tables::STRINGS, b"s9", b"chunk-a".to_vec());
        txn.commit().unwrap();
        let mut txn = db.begin().unwrap();
        txn.append_row(tables::STRINGS, b"s9", b"chunk-b".to_vec());
        txn.commit().unwrap();
    }
    {
        let db = Database::open(&db_dir).unwrap();
        let txn = db.begin().unwrap();
        assert_eq!(txn.get(tables::UUIDS, b"1"), Some(b"some-uuid".to_vec()));
        assert_eq!(
            txn.get_rows(tables::STRINGS, b"s9").unwrap(),
            vec![b"chunk-a".to_vec(), b"chunk-b".to_vec()]
        );
    }
    // A second reopen exercises the checkpoint path (snapshot + empty WAL).
    let db = Database::open(&db_dir).unwrap();
    let txn = db.begin().unwrap();
    assert_eq!(txn.get(tables::UUIDS, b"1"), Some(b"some-uuid".to_vec()));
}
