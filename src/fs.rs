//! The filesystem handle.
//!
//! An [`Fs`] owns the backing database plus the repository settings and the
//! caller's access context (username and lock tokens). Repository layout on
//! disk: a `format` file with the schema version, an `fs.json` settings
//! document, and the KV engine's `db/` directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::{self, DagNode};
use crate::error::{Error, FsResult};
use crate::id::{Revision, TxnId};
use crate::kv::{tables, Database};
use crate::skel::Proplist;
use crate::store::changes::ChangeRecord;
use crate::store::locks::{self, LockRecord};
use crate::store::nodes::NodeKind;
use crate::store::{reps, revisions, txns};
use crate::trail::{retry_txn, Trail};
use crate::tree::history::NodeHistory;
use crate::tree::{commit, history, Root, RootKind};

const FORMAT_FILE: &str = "format";
const FORMAT_VERSION: u32 = 1;
const SETTINGS_FILE: &str = "fs.json";
const DB_DIR: &str = "db";

/// Who is calling, and which lock tokens they carry. Enforcement only kicks
/// in on paths that actually hold locks.
#[derive(Debug, Default, Clone)]
pub struct AccessContext {
    pub username: Option<String>,
    pub tokens: HashSet<String>,
}

impl AccessContext {
    pub fn with_user(username: impl Into<String>) -> AccessContext {
        AccessContext { username: Some(username.into()), tokens: HashSet::new() }
    }

    pub fn add_token(&mut self, token: impl Into<String>) {
        self.tokens.insert(token.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FsSettings {
    name: String,
    created: String,
}

#[derive(Clone)]
pub struct Fs {
    pub(crate) db: Database,
    settings: Arc<FsSettings>,
    access: Arc<Mutex<AccessContext>>,
    dir: Option<PathBuf>,
}

impl Fs {
    /// Create a repository at `dir`, bootstrapping revision 0.
    pub fn create(dir: impl AsRef<Path>) -> FsResult<Fs> {
        let dir = dir.as_ref().to_path_buf();
        let format_path = dir.join(FORMAT_FILE);
        if format_path.exists() {
            return Err(Error::corrupt(format!(
                "refusing to create: '{}' is already a repository",
                dir.display()
            )));
        }
        std::fs::create_dir_all(&dir).map_err(|e| Error::io_at(&dir, e))?;
        std::fs::write(&format_path, format!("{}\n", FORMAT_VERSION))
            .map_err(|e| Error::io_at(&format_path, e))?;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repository".to_string());
        let settings = FsSettings { name, created: Utc::now().to_rfc3339() };
        let settings_path = dir.join(SETTINGS_FILE);
        let bytes = serde_json::to_vec_pretty(&settings)
            .map_err(|e| Error::corrupt(format!("settings encode: {}", e)))?;
        std::fs::write(&settings_path, bytes).map_err(|e| Error::io_at(&settings_path, e))?;

        let db = Database::create(dir.join(DB_DIR))?;
        let fs = Fs {
            db,
            settings: Arc::new(settings),
            access: Arc::new(Mutex::new(AccessContext::default())),
            dir: Some(dir.clone()),
        };
        fs.bootstrap()?;
        info!(target: "revfs::fs", "created repository at '{}'", dir.display());
        Ok(fs)
    }

    /// Open an existing repository.
    pub fn open(dir: impl AsRef<Path>) -> FsResult<Fs> {
        let dir = dir.as_ref().to_path_buf();
        let format_path = dir.join(FORMAT_FILE);
        let format = std::fs::read_to_string(&format_path)
            .map_err(|e| Error::io_at(&format_path, e))?;
        let version: u32 = format
            .trim()
            .parse()
            .map_err(|_| Error::corrupt(format!("malformed format file '{}'", format.trim())))?;
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported repository schema version {}",
                version
            )));
        }
        let settings_path = dir.join(SETTINGS_FILE);
        let settings: FsSettings = match std::fs::read(&settings_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::corrupt(format!("settings decode: {}", e)))?,
            Err(_) => FsSettings { name: "repository".to_string(), created: String::new() },
        };
        let db = Database::open(dir.join(DB_DIR))?;
        debug!(target: "revfs::fs", "opened repository '{}'", settings.name);
        Ok(Fs {
            db,
            settings: Arc::new(settings),
            access: Arc::new(Mutex::new(AccessContext::default())),
            dir: Some(dir),
        })
    }

    /// An in-memory repository; used by tests and scratch tooling.
    pub fn memory() -> FsResult<Fs> {
        let fs = Fs {
            db: Database::memory(),
            settings: Arc::new(FsSettings {
                name: "memory".to_string(),
                created: Utc::now().to_rfc3339(),
            }),
            access: Arc::new(Mutex::new(AccessContext::default())),
            dir: None,
        };
        fs.bootstrap()?;
        Ok(fs)
    }

    fn bootstrap(&self) -> FsResult<()> {
        retry_txn(&self.db, |trail| {
            dag::init_fs(trail)?;
            trail.txn.put(
                tables::UUIDS,
                b"1",
                uuid::Uuid::new_v4().to_string().into_bytes(),
            );
            Ok(())
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    // ---------- access context ----------

    pub fn set_access(&self, access: AccessContext) {
        *self.access.lock() = access;
    }

    pub fn access(&self) -> AccessContext {
        self.access.lock().clone()
    }

    /// Enforce lock ownership for a mutating operation touching `path` (and
    /// everything beneath it when `recurse` is set).
    pub(crate) fn allow_locked_operation(&self, path: &str, recurse: bool) -> FsResult<()> {
        let access = self.access();
        retry_txn(&self.db, |trail| {
            for lock in locks::locks_under(trail, path, recurse, Utc::now())? {
                match &access.username {
                    None => return Err(Error::NoUser),
                    Some(user) if user != &lock.owner => {
                        return Err(Error::LockOwnerMismatch {
                            user: user.clone(),
                            path: lock.path.clone(),
                        })
                    }
                    Some(_) => {}
                }
                if !access.tokens.contains(&lock.token) {
                    return Err(Error::BadLockToken { path: lock.path.clone() });
                }
            }
            Ok(())
        })
    }

    // ---------- revisions and roots ----------

    pub fn youngest_rev(&self) -> FsResult<Revision> {
        retry_txn(&self.db, |trail| revisions::youngest_rev(trail))
    }

    pub fn revision_root(&self, rev: Revision) -> FsResult<Root> {
        retry_txn(&self.db, |trail| {
            revisions::get_revision(trail, rev)?;
            Ok(())
        })?;
        Ok(Root::new(self.clone(), RootKind::Revision(rev)))
    }

    pub fn revision_proplist(&self, rev: Revision) -> FsResult<Proplist> {
        retry_txn(&self.db, |trail| Ok(revisions::get_revision(trail, rev)?.props))
    }

    pub fn revision_prop(&self, rev: Revision, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(self.revision_proplist(rev)?.remove(name))
    }

    /// Change one property of a committed revision (`None` removes it).
    /// Unlike node properties this mutates history and is unversioned.
    pub fn change_rev_prop(
        &self,
        rev: Revision,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> FsResult<()> {
        retry_txn(&self.db, |trail| {
            let mut rec = revisions::get_revision(trail, rev)?;
            match &value {
                Some(v) => rec.props.insert(name.to_string(), v.clone()),
                None => rec.props.remove(name),
            };
            revisions::put_revision(trail, rev, &rec);
            Ok(())
        })
    }

    /// The folded change summary of a committed revision.
    pub fn paths_changed(&self, rev: Revision) -> FsResult<Vec<ChangeRecord>> {
        retry_txn(&self.db, |trail| {
            revisions::get_revision(trail, rev)?;
            commit::paths_changed(trail, rev)
        })
    }

    // ---------- transactions ----------

    pub fn begin_txn(&self, base_rev: Revision) -> FsResult<Txn> {
        let id = retry_txn(&self.db, |trail| {
            let base_root = revisions::rev_get_root(trail, base_rev)?;
            txns::create_txn(trail, &base_root)
        })?;
        debug!(target: "revfs::fs", "began txn {} (base revision {})", id, base_rev);
        Ok(Txn { fs: self.clone(), id })
    }

    /// Reopen an active transaction by name.
    pub fn open_txn(&self, name: &str) -> FsResult<Txn> {
        let id = TxnId::new(name);
        retry_txn(&self.db, |trail| {
            txns::get_active_txn(trail, &id)?;
            Ok(())
        })?;
        Ok(Txn { fs: self.clone(), id: TxnId::new(name) })
    }

    /// Names of all active transactions.
    pub fn list_txns(&self) -> FsResult<Vec<String>> {
        let ids = retry_txn(&self.db, |trail| txns::list_active_txns(trail))?;
        Ok(ids.into_iter().map(|id| id.as_str().to_string()).collect())
    }

    // ---------- uuid ----------

    pub fn get_uuid(&self) -> FsResult<String> {
        retry_txn(&self.db, |trail| {
            trail
                .txn
                .get(tables::UUIDS, b"1")
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .ok_or_else(|| Error::corrupt("repository has no uuid"))
        })
    }

    pub fn set_uuid(&self, uuid: &str) -> FsResult<()> {
        let value = uuid.as_bytes().to_vec();
        retry_txn(&self.db, move |trail| {
            trail.txn.put(tables::UUIDS, b"1", value.clone());
            Ok(())
        })
    }

    // ---------- locks ----------

    /// Take out a lock on `path` (a file in the youngest revision).
    /// `current_rev` is the caller's belief about the file's age; an older
    /// belief than the file's created revision is out of date.
    pub fn lock(
        &self,
        path: &str,
        token: Option<String>,
        comment: Option<String>,
        steal: bool,
        expiration: Option<DateTime<Utc>>,
        current_rev: Revision,
    ) -> FsResult<LockRecord> {
        let user = self.access().username.ok_or(Error::NoUser)?;
        let canon = crate::tree::canonicalize_path(path);
        let root = self.revision_root(self.youngest_rev()?)?;
        match root.check_path(&canon)? {
            Some(NodeKind::File) => {}
            Some(NodeKind::Dir) => return Err(Error::NotFileLock { path: canon }),
            None => return Err(Error::not_found(&canon)),
        }
        if let Some(created) = root.node_created_rev(&canon)? {
            if current_rev < created {
                return Err(Error::OutOfDateLock { path: canon, rev: current_rev });
            }
        }
        let rec = retry_txn(&self.db, |trail| {
            let now = Utc::now();
            if let Some(existing) = locks::get_lock(trail, &canon, now)? {
                if !steal {
                    return Err(Error::PathAlreadyLocked { path: canon.clone() });
                }
                locks::remove_lock(trail, &existing);
            }
            let rec = LockRecord {
                path: canon.clone(),
                token: token
                    .clone()
                    .unwrap_or_else(|| format!("opaquelocktoken:{}", uuid::Uuid::new_v4())),
                owner: user.clone(),
                comment: comment.clone(),
                is_dav_comment: false,
                creation_date: now,
                expiration_date: expiration,
            };
            locks::put_lock(trail, &rec);
            Ok(rec)
        })?;
        debug!(target: "revfs::fs", "locked '{}' with token {}", rec.path, rec.token);
        Ok(rec)
    }

    /// Release the lock on `path`. Without `break_lock` the caller must be
    /// the owner and present the matching token.
    pub fn unlock(&self, path: &str, token: &str, break_lock: bool) -> FsResult<()> {
        let canon = crate::tree::canonicalize_path(path);
        let access = self.access();
        retry_txn(&self.db, |trail| {
            let rec = locks::get_lock(trail, &canon, Utc::now())?
                .ok_or_else(|| Error::NotLocked { path: canon.clone() })?;
            if !break_lock {
                if rec.token != token {
                    return Err(Error::BadLockToken { path: canon.clone() });
                }
                match &access.username {
                    None => return Err(Error::NoUser),
                    Some(user) if user != &rec.owner => {
                        return Err(Error::LockOwnerMismatch {
                            user: user.clone(),
                            path: canon.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            locks::remove_lock(trail, &rec);
            Ok(())
        })
    }

    pub fn get_lock(&self, path: &str) -> FsResult<Option<LockRecord>> {
        let canon = crate::tree::canonicalize_path(path);
        retry_txn(&self.db, |trail| locks::get_lock(trail, &canon, Utc::now()))
    }

    pub fn get_locks(&self, path: &str, recurse: bool) -> FsResult<Vec<LockRecord>> {
        let canon = crate::tree::canonicalize_path(path);
        retry_txn(&self.db, |trail| locks::locks_under(trail, &canon, recurse, Utc::now()))
    }

    // ---------- history ----------

    /// See [`history::get_file_revs`].
    pub fn get_file_revs(
        &self,
        path: &str,
        start_rev: Revision,
        end_rev: Revision,
    ) -> FsResult<Vec<(String, Revision)>> {
        history::get_file_revs(self, path, start_rev, end_rev)
    }

    pub fn history_location(&self, history: &NodeHistory) -> (String, Revision) {
        let (path, rev) = history.location();
        (path.to_string(), rev)
    }

    // ---------- storage administration ----------

    /// Offer every node in `rev` the chance to store its predecessor as a
    /// delta against it.
    pub fn deltify_revision(&self, rev: Revision) -> FsResult<()> {
        retry_txn(&self.db, |trail| {
            let root = dag::revision_root(trail, rev)?;
            deltify_tree(trail, &root, false)
        })
    }

    /// Re-expand the predecessors of every node in `rev` to fulltext.
    pub fn undeltify_revision(&self, rev: Revision) -> FsResult<()> {
        retry_txn(&self.db, |trail| {
            let root = dag::revision_root(trail, rev)?;
            deltify_tree(trail, &root, true)
        })
    }
}

/// Walk the tree under `node`, deltifying (or undeltifying) each node's
/// immediate predecessor against it. Directories touch property reps only.
fn deltify_tree(trail: &mut Trail<'_>, node: &DagNode, undo: bool) -> FsResult<()> {
    if node.is_dir() {
        for (_, child_id) in dag::dir_entries(trail, node)? {
            let child = dag::get_node(trail, &child_id)?;
            deltify_tree(trail, &child, undo)?;
        }
    }
    let pred_id = match &node.rec.predecessor {
        None => return Ok(()),
        Some(id) => id.clone(),
    };
    let pred = dag::get_node(trail, &pred_id)?;
    let offers = [
        (pred.rec.prop_key.clone(), node.rec.prop_key.clone(), true),
        (pred.rec.data_key.clone(), node.rec.data_key.clone(), !node.is_dir()),
    ];
    for (target, source, eligible) in offers {
        if !eligible {
            continue;
        }
        if let (Some(target), Some(source)) = (target, source) {
            if target != source {
                if undo {
                    reps::rep_undeltify(trail, &target)?;
                } else {
                    reps::rep_deltify(trail, &target, &source)?;
                }
            }
        }
    }
    Ok(())
}

/// An in-progress transaction: a mutable tree hanging off a base revision.
#[derive(Clone)]
pub struct Txn {
    fs: Fs,
    id: TxnId,
}

impl Txn {
    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn root(&self) -> Root {
        Root::new(self.fs.clone(), RootKind::Txn(self.id.clone()))
    }

    /// The revision this txn is currently based on (ratcheted forward by
    /// merges during commit).
    pub fn base_revision(&self) -> FsResult<Revision> {
        retry_txn(&self.fs.db, |trail| {
            let rec = txns::get_txn(trail, &self.id)?;
            txns::txn_get_revision(trail, rec.base_root_id.txn_id())?
                .ok_or_else(|| Error::corrupt("txn base root is not committed"))
        })
    }

    pub fn proplist(&self) -> FsResult<Proplist> {
        retry_txn(&self.fs.db, |trail| Ok(txns::get_txn(trail, &self.id)?.props))
    }

    pub fn prop(&self, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(self.proplist()?.remove(name))
    }

    pub fn change_prop(&self, name: &str, value: Option<Vec<u8>>) -> FsResult<()> {
        retry_txn(&self.fs.db, |trail| {
            let mut rec = txns::get_active_txn(trail, &self.id)?;
            match &value {
                Some(v) => rec.props.insert(name.to_string(), v.clone()),
                None => rec.props.remove(name),
            };
            txns::put_txn(trail, &self.id, &rec);
            Ok(())
        })
    }

    /// Commit, merging against newer revisions as needed. `Conflict` carries
    /// the losing path; the txn survives a conflict and may be repaired.
    pub fn commit(&self) -> FsResult<Revision> {
        commit::commit_txn(&self.fs, &self.id)
    }

    /// Abort: reclaim all mutable state and delete the transaction.
    pub fn abort(self) -> FsResult<()> {
        retry_txn(&self.fs.db, |trail| dag::purge_txn(trail, &self.id))
    }
}
