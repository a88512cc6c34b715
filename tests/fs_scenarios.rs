//! End-to-end scenarios over the public filesystem API.
//!
//! Run with `RUST_LOG=revfs=debug` to watch the engine work.

use revfs::{Error, Fs, NodeKind};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const GREEK_TREE: &[(&str, Option<&str>)] = &[
    ("/A", None),
    ("/A/mu", Some("This is the file 'mu'.\n")),
    ("/A/B", None),
    ("/A/B/lambda", Some("This is the file 'lambda'.\n")),
    ("/A/B/E", None),
    ("/A/B/E/alpha", Some("This is the file 'alpha'.\n")),
    ("/A/B/E/beta", Some("This is the file 'beta'.\n")),
    ("/A/B/F", None),
    ("/A/C", None),
    ("/A/D", None),
    ("/A/D/gamma", Some("This is the file 'gamma'.\n")),
    ("/A/D/G", None),
    ("/A/D/G/pi", Some("This is the file 'pi'.\n")),
    ("/A/D/G/rho", Some("This is the file 'rho'.\n")),
    ("/A/D/G/tau", Some("This is the file 'tau'.\n")),
    ("/A/D/H", None),
    ("/A/D/H/chi", Some("This is the file 'chi'.\n")),
    ("/A/D/H/psi", Some("This is the file 'psi'.\n")),
    ("/A/D/H/omega", Some("This is the file 'omega'.\n")),
];

fn create_greek_tree(root: &revfs::Root) {
    for (path, contents) in GREEK_TREE {
        match contents {
            None => root.make_dir(path).unwrap(),
            Some(text) => {
                root.make_file(path).unwrap();
                root.apply_text(path, None, text.as_bytes()).unwrap();
            }
        }
    }
}

#[test]
fn initial_repository_state() {
    init_logging();
    let fs = Fs::memory().unwrap();
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    let root = fs.revision_root(0).unwrap();
    assert_eq!(root.check_path("/").unwrap(), Some(NodeKind::Dir));
    assert!(root.dir_entries("/").unwrap().is_empty());
    assert!(fs.revision_prop(0, "revfs:date").unwrap().is_some());
    assert!(!fs.get_uuid().unwrap().is_empty());
}

#[test]
fn create_a_file() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_file("/iota").unwrap();
    root.apply_text("/iota", None, b"This is the file 'iota'.\n").unwrap();
    let rev = txn.commit().unwrap();
    assert_eq!(rev, 1);

    let head = fs.revision_root(1).unwrap();
    assert_eq!(head.check_path("/iota").unwrap(), Some(NodeKind::File));
    assert_eq!(head.file_length("/iota").unwrap(), 25);
    assert_eq!(head.file_contents("/iota").unwrap(), b"This is the file 'iota'.\n".to_vec());
    assert_eq!(head.node_created_rev("/iota").unwrap(), Some(1));
    assert!(fs.revision_prop(1, "revfs:date").unwrap().is_some());
}

/// Builds the fixture used by the copy, merge and history scenarios:
/// r1 = iota, r2 = the Greek tree under /A.
fn iota_and_greek(fs: &Fs) -> (u64, u64) {
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_file("/iota").unwrap();
    root.apply_text("/iota", None, b"This is the file 'iota'.\n").unwrap();
    let r1 = txn.commit().unwrap();

    let txn = fs.begin_txn(r1).unwrap();
    create_greek_tree(&txn.root());
    let r2 = txn.commit().unwrap();
    (r1, r2)
}

#[test]
fn directory_copy_with_history() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let txn = fs.begin_txn(r2).unwrap();
    let root = txn.root();
    root.copy(&fs.revision_root(r2).unwrap(), "/A", "/Z").unwrap();
    let r3 = txn.commit().unwrap();

    let head = fs.revision_root(r3).unwrap();
    assert_eq!(head.copied_from("/Z").unwrap(), Some((r2, "/A".to_string())));
    assert_eq!(head.copied_from("/A").unwrap(), None);

    // The copy destination is a new node-revision on the same line of
    // history, branched onto its own copy id.
    let at2 = fs.revision_root(r2).unwrap();
    let a = at2.node_id("/A").unwrap();
    let z = head.node_id("/Z").unwrap();
    assert_ne!(a, z);
    assert!(a.same_node(&z));
    assert_ne!(a.copy_id(), z.copy_id());

    // Unchanged children are shared wholesale between the two trees.
    assert_eq!(at2.node_id("/A/mu").unwrap(), head.node_id("/Z/mu").unwrap());
    assert_eq!(
        head.file_contents("/Z/mu").unwrap(),
        b"This is the file 'mu'.\n".to_vec()
    );
    assert!(!head.contents_changed("/Z/mu", &at2, "/A/mu").unwrap());
    assert!(!head.props_changed("/Z/mu", &at2, "/A/mu").unwrap());
}

#[test]
fn redundant_nested_copy_is_a_noop() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let txn = fs.begin_txn(r2).unwrap();
    let root = txn.root();
    let at2 = fs.revision_root(r2).unwrap();
    root.copy(&at2, "/A", "/Z").unwrap();
    // /Z/D/G already *is* /A/D/G; copying again must change nothing.
    root.copy(&at2, "/A/D/G", "/Z/D/G").unwrap();
    let r3 = txn.commit().unwrap();

    let head = fs.revision_root(r3).unwrap();
    // /Z/D was never cloned: it is still the shared node from /A/D.
    assert_eq!(head.node_id("/Z/D").unwrap(), at2.node_id("/A/D").unwrap());
    // Exactly one change (the /A -> /Z copy) and one copy record.
    let changed = fs.paths_changed(r3).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].path, "/Z");
}

#[test]
fn non_overlapping_commits_merge() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    // Two concurrent txns, both based on r2.
    let t1 = fs.begin_txn(r2).unwrap();
    let t2 = fs.begin_txn(r2).unwrap();

    t1.root().apply_text("/A/mu", None, b"mu, as seen by txn one\n").unwrap();
    t2.root().apply_text("/iota", None, b"iota, as seen by txn two\n").unwrap();

    let r3 = t1.commit().unwrap();
    assert_eq!(r3, 3);
    // T2 is out of date; its commit merges against r3 and succeeds.
    let r4 = t2.commit().unwrap();
    assert_eq!(r4, 4);

    let head = fs.revision_root(r4).unwrap();
    assert_eq!(head.file_contents("/A/mu").unwrap(), b"mu, as seen by txn one\n".to_vec());
    assert_eq!(head.file_contents("/iota").unwrap(), b"iota, as seen by txn two\n".to_vec());
}

#[test]
fn overlapping_commits_conflict() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let t1 = fs.begin_txn(r2).unwrap();
    let t2 = fs.begin_txn(r2).unwrap();
    t1.root().apply_text("/A/mu", None, b"one\n").unwrap();
    t2.root().apply_text("/A/mu", None, b"two\n").unwrap();

    t1.commit().unwrap();
    match t2.commit() {
        Err(Error::Conflict { path }) => assert_eq!(path, "/A/mu"),
        other => panic!("expected a conflict, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn double_delete_merges_without_conflict() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let t1 = fs.begin_txn(r2).unwrap();
    let t2 = fs.begin_txn(r2).unwrap();
    t1.root().delete("/A/D/gamma").unwrap();
    t2.root().delete("/A/D/gamma").unwrap();
    t2.root().apply_text("/iota", None, b"also this\n").unwrap();

    let r3 = t1.commit().unwrap();
    let r4 = t2.commit().unwrap();
    let head = fs.revision_root(r4).unwrap();
    assert_eq!(head.check_path("/A/D/gamma").unwrap(), None);

    // The second txn is not credited with the delete it lost to r3.
    let changed = fs.paths_changed(r4).unwrap();
    let paths: Vec<&str> = changed.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["/iota"]);
    let _ = r3;
}

#[test]
fn deletion_of_locally_changed_path_conflicts() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let t1 = fs.begin_txn(r2).unwrap();
    let t2 = fs.begin_txn(r2).unwrap();
    t1.root().delete("/A/mu").unwrap();
    t2.root().apply_text("/A/mu", None, b"still editing\n").unwrap();

    t1.commit().unwrap();
    assert!(matches!(t2.commit(), Err(Error::Conflict { .. })));
}

#[test]
fn skip_delta_reads_stay_correct_and_bounded() {
    init_logging();
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_file("/f").unwrap();
    let mut body = String::from("the original first line of the file, long enough to matter\n");
    root.apply_text("/f", None, body.as_bytes()).unwrap();
    let r1 = txn.commit().unwrap();
    assert_eq!(r1, 1);

    let mut expected_at = vec![String::new(), body.clone()];
    for i in 0..128u32 {
        let head = fs.youngest_rev().unwrap();
        let txn = fs.begin_txn(head).unwrap();
        body.push_str(&format!("appended line number {} with a bit of padding text\n", i));
        txn.root().apply_text("/f", None, body.as_bytes()).unwrap();
        let rev = txn.commit().unwrap();
        fs.deltify_revision(rev).unwrap();
        expected_at.push(body.clone());
    }
    assert_eq!(fs.youngest_rev().unwrap(), 129);

    // Every historical revision reconstructs exactly, including the oldest.
    for rev in [1u64, 2, 17, 33, 64, 96, 128, 129] {
        let root = fs.revision_root(rev).unwrap();
        assert_eq!(
            root.file_contents("/f").unwrap(),
            expected_at[rev as usize].as_bytes(),
            "contents diverged at revision {}",
            rev
        );
    }
}

#[test]
fn history_crosses_copies() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let txn = fs.begin_txn(r2).unwrap();
    txn.root().copy(&fs.revision_root(r2).unwrap(), "/A", "/Z").unwrap();
    let r3 = txn.commit().unwrap();

    let root = fs.revision_root(r3).unwrap();
    let mut history = root.node_history("/Z/mu").unwrap();
    let mut locations = Vec::new();
    while let Some(next) = fs.history_prev(&history, true).unwrap() {
        let (path, rev) = next.location();
        locations.push((path.to_string(), rev));
        history = next;
    }
    assert_eq!(
        locations,
        vec![("/Z/mu".to_string(), r3), ("/A/mu".to_string(), r2)]
    );

    // Without copy crossing the walk stops at the copy boundary.
    let mut history = root.node_history("/Z/mu").unwrap();
    let first = fs.history_prev(&history, false).unwrap().unwrap();
    assert_eq!(first.location(), ("/Z/mu", r3));
    history = first;
    assert!(fs.history_prev(&history, false).unwrap().is_none());
}

#[test]
fn history_follows_edits_within_a_line() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    txn.root().make_file("/notes").unwrap();
    txn.root().apply_text("/notes", None, b"v1\n").unwrap();
    let r1 = txn.commit().unwrap();

    // An unrelated commit in between.
    let txn = fs.begin_txn(r1).unwrap();
    txn.root().make_file("/other").unwrap();
    let r2 = txn.commit().unwrap();

    let txn = fs.begin_txn(r2).unwrap();
    txn.root().apply_text("/notes", None, b"v2\n").unwrap();
    let r3 = txn.commit().unwrap();

    let revs = fs.get_file_revs("/notes", 0, r3).unwrap();
    assert_eq!(
        revs,
        vec![("/notes".to_string(), r3), ("/notes".to_string(), r1)]
    );
}

#[test]
fn immutability_of_committed_revisions() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let before = fs.revision_root(r2).unwrap().file_contents("/A/mu").unwrap();
    let props_before = fs.revision_root(r2).unwrap().node_proplist("/A/mu").unwrap();

    for round in 0..3u8 {
        let head = fs.youngest_rev().unwrap();
        let txn = fs.begin_txn(head).unwrap();
        let root = txn.root();
        root.apply_text("/A/mu", None, format!("round {}\n", round).as_bytes()).unwrap();
        root.change_node_prop("/A/mu", "round", Some(vec![round])).unwrap();
        txn.commit().unwrap();
    }

    let at2 = fs.revision_root(r2).unwrap();
    assert_eq!(at2.file_contents("/A/mu").unwrap(), before);
    assert_eq!(at2.node_proplist("/A/mu").unwrap(), props_before);
}

#[test]
fn abort_leaves_no_trace() {
    let fs = Fs::memory().unwrap();
    let (_r1, r2) = iota_and_greek(&fs);

    let txn = fs.begin_txn(r2).unwrap();
    let name = txn.name().to_string();
    let root = txn.root();
    root.make_file("/doomed").unwrap();
    root.apply_text("/doomed", None, b"never to be seen").unwrap();
    root.delete("/A/B").unwrap();
    txn.abort().unwrap();

    assert_eq!(fs.youngest_rev().unwrap(), r2);
    assert!(fs.open_txn(&name).is_err());
    assert!(!fs.list_txns().unwrap().contains(&name));
    let head = fs.revision_root(r2).unwrap();
    assert_eq!(head.check_path("/doomed").unwrap(), None);
    assert_eq!(head.check_path("/A/B").unwrap(), Some(NodeKind::Dir));
}

#[test]
fn repository_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    let r2 = {
        let fs = Fs::create(&repo).unwrap();
        let (_r1, r2) = iota_and_greek(&fs);
        r2
    };
    let fs = Fs::open(&repo).unwrap();
    assert_eq!(fs.youngest_rev().unwrap(), r2);
    let head = fs.revision_root(r2).unwrap();
    assert_eq!(
        head.file_contents("/A/D/G/rho").unwrap(),
        b"This is the file 'rho'.\n".to_vec()
    );
    assert_eq!(head.dir_entries("/A/D/G").unwrap().len(), 3);

    // And it keeps working: another commit on top.
    let txn = fs.begin_txn(r2).unwrap();
    txn.root().apply_text("/iota", None, b"after reopen\n").unwrap();
    let r3 = txn.commit().unwrap();
    assert_eq!(
        fs.revision_root(r3).unwrap().file_contents("/iota").unwrap(),
        b"after reopen\n".to_vec()
    );
}

#[test]
fn deltify_then_undeltify_round_trips() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    txn.root().make_file("/f").unwrap();
    let v1 = b"a paragraph of text that will be shared between the revisions, word for word".repeat(5);
    txn.root().apply_text("/f", None, &v1).unwrap();
    let r1 = txn.commit().unwrap();

    let txn = fs.begin_txn(r1).unwrap();
    let mut v2 = v1.clone();
    v2.extend_from_slice(b" -- plus an edit");
    txn.root().apply_text("/f", None, &v2).unwrap();
    let r2 = txn.commit().unwrap();

    fs.deltify_revision(r2).unwrap();
    assert_eq!(fs.revision_root(r1).unwrap().file_contents("/f").unwrap(), v1);
    fs.undeltify_revision(r2).unwrap();
    assert_eq!(fs.revision_root(r1).unwrap().file_contents("/f").unwrap(), v1);
    assert_eq!(fs.revision_root(r2).unwrap().file_contents("/f").unwrap(), v2);
}
