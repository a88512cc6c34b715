//! Randomized checks of the engine's core guarantees: committed state is a
//! faithful function of the applied writes, copies are cheap and local,
//! change summaries match the actual tree differences.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use revfs::{Fs, NodeKind};

fn random_body(rng: &mut StdRng, max: usize) -> Vec<u8> {
    let len = rng.gen_range(0..max);
    (0..len).map(|_| rng.gen()).collect()
}

/// Apply a random sequence of writes through a txn while tracking the
/// expected tree in a plain map, commit, and compare path by path.
#[test]
fn random_write_sequences_round_trip() {
    for seed in [7u64, 99, 20260801] {
        let mut rng = StdRng::seed_from_u64(seed);
        let fs = Fs::memory().unwrap();
        let txn = fs.begin_txn(0).unwrap();
        let root = txn.root();

        let dirs = ["/d0", "/d1", "/d0/sub"];
        for d in dirs {
            root.make_dir(d).unwrap();
        }
        let mut expected: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for i in 0..40 {
            let dir = dirs[rng.gen_range(0..dirs.len())];
            let path = format!("{}/f{}", dir, i % 12);
            match rng.gen_range(0..4) {
                // Create or rewrite.
                0 | 1 => {
                    if !expected.contains_key(&path) {
                        root.make_file(&path).unwrap();
                    }
                    let body = random_body(&mut rng, 2048);
                    root.apply_text(&path, None, &body).unwrap();
                    expected.insert(path, body);
                }
                // Append through a second rewrite.
                2 => {
                    if let Some(old) = expected.get(&path).cloned() {
                        let mut body = old;
                        body.extend(random_body(&mut rng, 256));
                        root.apply_text(&path, None, &body).unwrap();
                        expected.insert(path, body);
                    }
                }
                // Delete.
                _ => {
                    if expected.remove(&path).is_some() {
                        root.delete(&path).unwrap();
                    }
                }
            }
        }

        let rev = txn.commit().unwrap();
        let head = fs.revision_root(rev).unwrap();
        for (path, body) in &expected {
            assert_eq!(
                head.file_contents(path).unwrap(),
                *body,
                "seed {} path {}",
                seed,
                path
            );
        }
        // Nothing extra survived either.
        for d in dirs {
            for (name, entry) in head.dir_entries(d).unwrap() {
                if entry.kind == NodeKind::File {
                    assert!(expected.contains_key(&format!("{}/{}", d, name)));
                }
            }
        }
    }
}

/// Making a path mutable twice in one txn changes nothing the second time:
/// the node ids along the spine are stable.
#[test]
fn make_mutable_is_idempotent() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_dir("/A").unwrap();
    root.make_dir("/A/B").unwrap();
    root.make_file("/A/B/f").unwrap();
    let r1 = txn.commit().unwrap();

    let txn = fs.begin_txn(r1).unwrap();
    let root = txn.root();
    root.apply_text("/A/B/f", None, b"first write clones the spine").unwrap();
    let spine: Vec<_> = ["/", "/A", "/A/B", "/A/B/f"]
        .iter()
        .map(|p| root.node_id(p).unwrap())
        .collect();
    root.apply_text("/A/B/f", None, b"second write rides the same clones").unwrap();
    let again: Vec<_> = ["/", "/A", "/A/B", "/A/B/f"]
        .iter()
        .map(|p| root.node_id(p).unwrap())
        .collect();
    assert_eq!(spine, again);
}

/// All nodes created under one mutability transition share a copy id.
#[test]
fn copy_id_locality() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_dir("/tree").unwrap();
    root.make_dir("/tree/inner").unwrap();
    root.make_file("/tree/inner/leaf").unwrap();
    root.make_file("/tree/leaf").unwrap();
    let rev = txn.commit().unwrap();

    let head = fs.revision_root(rev).unwrap();
    let top = head.node_id("/tree").unwrap();
    for p in ["/tree/inner", "/tree/inner/leaf", "/tree/leaf"] {
        assert_eq!(head.node_id(p).unwrap().copy_id(), top.copy_id(), "{}", p);
    }
}

/// Walk two revision trees and collect every path whose node-revision id
/// differs (additions and removals included).
fn tree_diff(fs: &Fs, older: u64, newer: u64) -> Vec<String> {
    fn collect(root: &revfs::Root, dir: &str, out: &mut BTreeMap<String, revfs::NodeRevId>) {
        for (name, entry) in root.dir_entries(dir).unwrap() {
            let path = if dir == "/" { format!("/{}", name) } else { format!("{}/{}", dir, name) };
            out.insert(path.clone(), entry.id.clone());
            if entry.kind == NodeKind::Dir {
                collect(root, &path, out);
            }
        }
    }
    let (mut a, mut b) = (BTreeMap::new(), BTreeMap::new());
    collect(&fs.revision_root(older).unwrap(), "/", &mut a);
    collect(&fs.revision_root(newer).unwrap(), "/", &mut b);
    let mut diff: Vec<String> = Vec::new();
    for (path, id) in &b {
        if a.get(path) != Some(id) {
            diff.push(path.clone());
        }
    }
    for path in a.keys() {
        if !b.contains_key(path) {
            diff.push(path.clone());
        }
    }
    diff.sort();
    diff
}

/// `paths_changed` agrees with the actual node-id differences between a
/// revision and its base, modulo parent directories (the change log records
/// the leaves that were operated on, the tree also re-ids the cloned spine).
#[test]
fn change_log_matches_tree_diff() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_dir("/A").unwrap();
    root.make_dir("/A/B").unwrap();
    root.make_file("/A/B/one").unwrap();
    root.apply_text("/A/B/one", None, b"1").unwrap();
    root.make_file("/A/two").unwrap();
    root.apply_text("/A/two", None, b"2").unwrap();
    root.make_file("/doomed").unwrap();
    let r1 = txn.commit().unwrap();

    let txn = fs.begin_txn(r1).unwrap();
    let root = txn.root();
    root.apply_text("/A/B/one", None, b"1, edited").unwrap();
    root.delete("/doomed").unwrap();
    root.make_file("/fresh").unwrap();
    let r2 = txn.commit().unwrap();

    let mut changed: Vec<String> =
        fs.paths_changed(r2).unwrap().into_iter().map(|c| c.path).collect();
    changed.sort();
    assert_eq!(changed, vec!["/A/B/one", "/doomed", "/fresh"]);

    // Every changed path shows up in the tree diff; the rest of the diff is
    // exactly the cloned spine above those paths.
    let diff = tree_diff(&fs, r1, r2);
    for path in &changed {
        assert!(diff.contains(path), "{} missing from tree diff {:?}", path, diff);
    }
    for path in &diff {
        let explained = changed
            .iter()
            .any(|c| c == path || c.starts_with(&format!("{}/", path)));
        assert!(explained, "unexplained tree diff at {}", path);
    }
}

/// Concurrent committers serialize: both land, revision numbers are dense,
/// and each revision reads back exactly what its writer wrote.
#[test]
fn interleaved_commits_serialize() {
    let fs = Fs::memory().unwrap();
    let txn = fs.begin_txn(0).unwrap();
    for i in 0..4 {
        txn.root().make_file(&format!("/file-{}", i)).unwrap();
    }
    let base = txn.commit().unwrap();

    let txns: Vec<_> = (0..4).map(|_| fs.begin_txn(base).unwrap()).collect();
    for (i, t) in txns.iter().enumerate() {
        t.root()
            .apply_text(&format!("/file-{}", i), None, format!("writer {}", i).as_bytes())
            .unwrap();
    }
    let mut revs: Vec<u64> = txns.iter().map(|t| t.commit().unwrap()).collect();
    revs.sort();
    assert_eq!(revs, vec![base + 1, base + 2, base + 3, base + 4]);

    let head = fs.revision_root(base + 4).unwrap();
    for i in 0..4 {
        assert_eq!(
            head.file_contents(&format!("/file-{}", i)).unwrap(),
            format!("writer {}", i).into_bytes()
        );
    }
}
