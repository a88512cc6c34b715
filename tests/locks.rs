//! Advisory lock behavior and enforcement.

use chrono::{Duration, Utc};
use revfs::{AccessContext, Error, Fs};

fn fs_with_file() -> (Fs, u64) {
    let fs = Fs::memory().unwrap();
    fs.set_access(AccessContext::with_user("harry"));
    let txn = fs.begin_txn(0).unwrap();
    let root = txn.root();
    root.make_dir("/A").unwrap();
    root.make_file("/A/mu").unwrap();
    root.apply_text("/A/mu", None, b"mu\n").unwrap();
    let rev = txn.commit().unwrap();
    (fs, rev)
}

#[test]
fn lock_and_unlock_round_trip() {
    let (fs, rev) = fs_with_file();
    let lock = fs.lock("/A/mu", None, Some("mine".to_string()), false, None, rev).unwrap();
    assert_eq!(lock.path, "/A/mu");
    assert_eq!(lock.owner, "harry");
    assert!(lock.token.starts_with("opaquelocktoken:"));

    let found = fs.get_lock("/A/mu").unwrap().unwrap();
    assert_eq!(found.token, lock.token);

    fs.unlock("/A/mu", &lock.token, false).unwrap();
    assert!(fs.get_lock("/A/mu").unwrap().is_none());
    assert!(matches!(
        fs.unlock("/A/mu", &lock.token, false),
        Err(Error::NotLocked { .. })
    ));
}

#[test]
fn lock_requires_a_user_and_a_file() {
    let (fs, rev) = fs_with_file();
    assert!(matches!(
        fs.lock("/A", None, None, false, None, rev),
        Err(Error::NotFileLock { .. })
    ));
    assert!(matches!(
        fs.lock("/ghost", None, None, false, None, rev),
        Err(Error::NotFound { .. })
    ));
    fs.set_access(AccessContext::default());
    assert!(matches!(
        fs.lock("/A/mu", None, None, false, None, rev),
        Err(Error::NoUser)
    ));
}

#[test]
fn stale_current_rev_is_out_of_date() {
    let (fs, rev) = fs_with_file();
    // The file was created in `rev`; claiming it as of an older revision
    // means the caller has not seen it yet.
    assert!(matches!(
        fs.lock("/A/mu", None, None, false, None, rev - 1),
        Err(Error::OutOfDateLock { .. })
    ));
}

#[test]
fn second_lock_needs_steal() {
    let (fs, rev) = fs_with_file();
    let first = fs.lock("/A/mu", None, None, false, None, rev).unwrap();
    assert!(matches!(
        fs.lock("/A/mu", None, None, false, None, rev),
        Err(Error::PathAlreadyLocked { .. })
    ));
    let second = fs.lock("/A/mu", None, None, true, None, rev).unwrap();
    assert_ne!(first.token, second.token);
    assert_eq!(fs.get_lock("/A/mu").unwrap().unwrap().token, second.token);
}

#[test]
fn expired_locks_vanish() {
    let (fs, rev) = fs_with_file();
    let expired = Utc::now() - Duration::seconds(10);
    fs.lock("/A/mu", None, None, false, Some(expired), rev).unwrap();
    assert!(fs.get_lock("/A/mu").unwrap().is_none());
}

#[test]
fn unlock_token_and_owner_checks() {
    let (fs, rev) = fs_with_file();
    let lock = fs.lock("/A/mu", None, None, false, None, rev).unwrap();

    assert!(matches!(
        fs.unlock("/A/mu", "opaquelocktoken:bogus", false),
        Err(Error::BadLockToken { .. })
    ));

    fs.set_access(AccessContext::with_user("sally"));
    assert!(matches!(
        fs.unlock("/A/mu", &lock.token, false),
        Err(Error::LockOwnerMismatch { .. })
    ));

    // break_lock overrides both checks.
    fs.unlock("/A/mu", "whatever", true).unwrap();
    assert!(fs.get_lock("/A/mu").unwrap().is_none());
}

#[test]
fn writes_to_locked_paths_are_enforced() {
    let (fs, rev) = fs_with_file();
    let lock = fs.lock("/A/mu", None, None, false, None, rev).unwrap();

    // Another user without the token: denied, nothing committed.
    fs.set_access(AccessContext::with_user("sally"));
    let txn = fs.begin_txn(rev).unwrap();
    assert!(matches!(
        txn.root().apply_text("/A/mu", None, b"sally's text\n"),
        Err(Error::LockOwnerMismatch { .. })
    ));
    // Deleting the parent directory covers the lock too.
    assert!(matches!(
        txn.root().delete("/A"),
        Err(Error::LockOwnerMismatch { .. })
    ));
    txn.abort().unwrap();

    // The owner without the token is still refused.
    fs.set_access(AccessContext::with_user("harry"));
    let txn = fs.begin_txn(rev).unwrap();
    assert!(matches!(
        txn.root().apply_text("/A/mu", None, b"no token\n"),
        Err(Error::BadLockToken { .. })
    ));
    txn.abort().unwrap();

    // Owner plus token: allowed.
    let mut access = AccessContext::with_user("harry");
    access.add_token(lock.token.clone());
    fs.set_access(access);
    let txn = fs.begin_txn(rev).unwrap();
    txn.root().apply_text("/A/mu", None, b"harry's text\n").unwrap();
    let r2 = txn.commit().unwrap();
    assert_eq!(
        fs.revision_root(r2).unwrap().file_contents("/A/mu").unwrap(),
        b"harry's text\n".to_vec()
    );

    let unchanged = fs.revision_root(rev).unwrap();
    assert_eq!(unchanged.file_contents("/A/mu").unwrap(), b"mu\n".to_vec());
}

#[test]
fn get_locks_recurses() {
    let (fs, rev) = fs_with_file();
    let txn = fs.begin_txn(rev).unwrap();
    txn.root().make_file("/A/nu").unwrap();
    txn.root().make_file("/top").unwrap();
    let r2 = txn.commit().unwrap();

    fs.lock("/A/mu", None, None, false, None, r2).unwrap();
    fs.lock("/A/nu", None, None, false, None, r2).unwrap();
    fs.lock("/top", None, None, false, None, r2).unwrap();

    assert_eq!(fs.get_locks("/A", true).unwrap().len(), 2);
    assert_eq!(fs.get_locks("/A", false).unwrap().len(), 0);
    assert_eq!(fs.get_locks("/", true).unwrap().len(), 3);
}
