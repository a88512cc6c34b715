//! Transaction bookkeeping, revision properties and repository identity.

use revfs::{Error, Fs};

#[test]
fn txn_props_become_revision_props() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    txn.change_prop("revfs:log", Some(b"add greek root".to_vec())).unwrap();
    txn.change_prop("revfs:author", Some(b"harry".to_vec())).unwrap();
    txn.root().make_dir("/A").unwrap();
    let rev = txn.commit().unwrap();

    assert_eq!(fs.revision_prop(rev, "revfs:log").unwrap(), Some(b"add greek root".to_vec()));
    assert_eq!(fs.revision_prop(rev, "revfs:author").unwrap(), Some(b"harry".to_vec()));
    assert!(fs.revision_prop(rev, "revfs:date").unwrap().is_some());
}

#[test]
fn revision_props_can_be_rewritten() {
    let fs = Fs::memory().unwrap();
    fs.change_rev_prop(0, "revfs:log", Some(b"amended".to_vec())).unwrap();
    assert_eq!(fs.revision_prop(0, "revfs:log").unwrap(), Some(b"amended".to_vec()));
    fs.change_rev_prop(0, "revfs:log", None).unwrap();
    assert_eq!(fs.revision_prop(0, "revfs:log").unwrap(), None);
    assert!(matches!(
        fs.change_rev_prop(99, "revfs:log", None),
        Err(Error::NoSuchRevision { rev: 99 })
    ));
}

#[test]
fn txns_can_be_reopened_and_listed() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let name = txn.name().to_string();
    txn.root().make_file("/wip").unwrap();

    assert_eq!(fs.list_txns().unwrap(), vec![name.clone()]);

    // A second handle onto the same transaction sees its state.
    let again = fs.open_txn(&name).unwrap();
    assert_eq!(again.base_revision().unwrap(), 0);
    assert_eq!(again.root().check_path("/wip").unwrap().is_some(), true);

    let rev = again.commit().unwrap();
    assert_eq!(rev, 1);
    assert!(fs.list_txns().unwrap().is_empty());
    assert!(matches!(fs.open_txn(&name), Err(Error::TxnNotMutable { .. })));
}

#[test]
fn base_revision_ratchets_forward_during_merges() {
    let fs = Fs::memory().unwrap();
    let t1 = fs.begin_txn(0).unwrap();
    let t2 = fs.begin_txn(0).unwrap();
    t1.root().make_file("/a").unwrap();
    t2.root().make_file("/b").unwrap();
    t1.commit().unwrap();

    assert_eq!(t2.base_revision().unwrap(), 0);
    let r2 = t2.commit().unwrap();
    assert_eq!(r2, 2);
    let head = fs.revision_root(r2).unwrap();
    assert!(head.check_path("/a").unwrap().is_some());
    assert!(head.check_path("/b").unwrap().is_some());
}

#[test]
fn uuid_round_trip() {
    let fs = Fs::memory().unwrap();
    let original = fs.get_uuid().unwrap();
    assert_eq!(original.len(), 36);
    fs.set_uuid("00000000-feed-face-0000-000000000000").unwrap();
    assert_eq!(fs.get_uuid().unwrap(), "00000000-feed-face-0000-000000000000");
}

#[test]
fn begin_txn_rejects_missing_base() {
    let fs = Fs::memory().unwrap();
    assert!(matches!(fs.begin_txn(7), Err(Error::NoSuchRevision { rev: 7 })));
}
