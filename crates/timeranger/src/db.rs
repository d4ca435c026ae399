//! Database lifecycle: the top-level handle owning the master lock, the
//! topic registry, and the shared descriptor cache.
//!
//! One database lives under `{path}/{database}/`. Its root marker file
//! doubles as the persisted defaults and as the advisory exclusive-lock
//! semaphore: the single process holding the lock is the master (sole
//! writer); any number of read-only processes may open the same database
//! concurrently. A requested master that loses the lock race is silently
//! downgraded to non-master.
//!
//! The handle is single-threaded and synchronous: every call may mutate
//! the registries and descriptor cache, so in-process callers serialize
//! through `&mut Database`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::codec::MetaRecord;
use crate::cursor::Direction;
use crate::error::{CriticalPolicy, Result, TrError};
use crate::fdcache::{FdCache, DEFAULT_FD_CAPACITY};
use crate::fsutil;
use crate::list::{List, ListEntry, ListId, ListSpec, ReplayOrder};
use crate::matcher::{MatchCond, RecordKey};
use crate::rangecache::KeyFilter;
use crate::topic::{Topic, TopicConfig, TopicCtx, TopicVar};

/// Database root marker file: persisted defaults plus the exclusive-lock
/// semaphore.
pub const MARKER_FILE: &str = "__timeranger2__.json";

/// Default bucket file name mask.
pub const DEFAULT_FILENAME_MASK: &str = "%Y-%m-%d";

/// Default permission bits for created files.
pub const DEFAULT_RPERMISSION: u32 = 0o644;

/// Default permission bits for created directories.
pub const DEFAULT_XPERMISSION: u32 = 0o755;

/// Persisted content of the root marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerFile {
    filename_mask: String,
    rpermission: u32,
    xpermission: u32,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Base path the database directory lives under.
    pub path: PathBuf,
    /// Database name (directory under `path`).
    pub database: String,
    /// Request the master (writer) role.
    pub master: bool,
    /// Default bucket mask written into a freshly created marker.
    pub filename_mask: String,
    /// Default file permission bits for a freshly created marker.
    pub rpermission: u32,
    /// Default directory permission bits for a freshly created marker.
    pub xpermission: u32,
    /// Critical-error policy.
    pub critical: CriticalPolicy,
    /// Descriptor cache capacity.
    pub fd_capacity: usize,
}

impl DbConfig {
    /// Creates a config requesting the master role with default mask,
    /// permissions and policy.
    pub fn new<P: AsRef<Path>>(path: P, database: &str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            database: database.to_string(),
            master: true,
            filename_mask: DEFAULT_FILENAME_MASK.to_string(),
            rpermission: DEFAULT_RPERMISSION,
            xpermission: DEFAULT_XPERMISSION,
            critical: CriticalPolicy::default(),
            fd_capacity: DEFAULT_FD_CAPACITY,
        }
    }

    /// Requests or declines the master role.
    pub fn with_master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    /// Sets the default bucket mask.
    pub fn with_filename_mask(mut self, mask: &str) -> Self {
        self.filename_mask = mask.to_string();
        self
    }

    /// Sets the critical-error policy.
    pub fn with_critical(mut self, policy: CriticalPolicy) -> Self {
        self.critical = policy;
        self
    }

    /// Sets the descriptor cache capacity.
    pub fn with_fd_capacity(mut self, capacity: usize) -> Self {
        self.fd_capacity = capacity;
        self
    }
}

fn lookup<'a>(topics: &'a HashMap<String, Topic>, name: &str) -> Result<&'a Topic> {
    topics
        .get(name)
        .ok_or_else(|| TrError::NotFound(format!("topic {:?}", name)))
}

fn lookup_mut<'a>(topics: &'a mut HashMap<String, Topic>, name: &str) -> Result<&'a mut Topic> {
    topics
        .get_mut(name)
        .ok_or_else(|| TrError::NotFound(format!("topic {:?}", name)))
}

/// An open database handle.
pub struct Database {
    cfg: DbConfig,
    dir: PathBuf,
    master: bool,
    // Held open for the lifetime of the handle; holding it is what keeps
    // the advisory lock.
    _lock: Option<std::fs::File>,
    filename_mask: String,
    rpermission: u32,
    xpermission: u32,
    topics: HashMap<String, Topic>,
    fds: FdCache,
    next_list_id: ListId,
}

impl Database {
    /// Opens (or, for a master, creates) a database.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` when a non-master opens a database whose marker
    /// does not exist; `TrError::Io` on filesystem failure.
    pub fn startup(cfg: DbConfig) -> Result<Database> {
        let dir = cfg.path.join(&cfg.database);
        if cfg.master {
            fsutil::ensure_dir(&dir, cfg.xpermission)?;
        } else if !dir.is_dir() {
            return Err(TrError::NotFound(format!("database directory {:?}", dir)));
        }

        let marker_path = dir.join(MARKER_FILE);
        if !marker_path.is_file() {
            if !cfg.master {
                return Err(TrError::NotFound(format!(
                    "database marker {:?}",
                    marker_path
                )));
            }
            let marker = MarkerFile {
                filename_mask: cfg.filename_mask.clone(),
                rpermission: cfg.rpermission,
                xpermission: cfg.xpermission,
            };
            match fsutil::create_exclusive(&marker_path, cfg.rpermission) {
                Ok(_) => {
                    fsutil::write_json(
                        &marker_path,
                        &serde_json::to_value(&marker)?,
                        cfg.rpermission,
                    )?;
                    info!(db = %cfg.database, "created database marker");
                }
                // Lost the creation race; fall through to the open path.
                Err(TrError::Io(ref e))
                    if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }

        let marker: MarkerFile = serde_json::from_value(fsutil::read_json(&marker_path)?)?;

        let lock_file = OpenOptions::new().read(true).write(cfg.master).open(&marker_path)?;
        let master = if cfg.master {
            match lock_file.try_lock_exclusive() {
                Ok(()) => true,
                Err(_) => {
                    warn!(
                        db = %cfg.database,
                        "master lock held elsewhere, downgrading to non-master"
                    );
                    false
                }
            }
        } else {
            false
        };

        debug!(db = %cfg.database, master, "database started");
        Ok(Database {
            fds: FdCache::new(cfg.fd_capacity),
            dir,
            master,
            _lock: Some(lock_file),
            filename_mask: marker.filename_mask,
            rpermission: marker.rpermission,
            xpermission: marker.xpermission,
            topics: HashMap::new(),
            next_list_id: 1,
            cfg,
        })
    }

    /// Closes every descriptor and topic and releases the handle (and,
    /// for a master, the lock).
    pub fn shutdown(mut self) {
        let names: Vec<String> = self.topics.keys().cloned().collect();
        for name in names {
            if let Some(mut topic) = self.topics.remove(&name) {
                topic.close(&mut self.fds);
            }
        }
        self.fds.close_all();
        self._lock.take();
        debug!(db = %self.cfg.database, "database shut down");
    }

    /// Whether this handle holds the master role.
    pub fn is_master(&self) -> bool {
        self.master
    }

    /// The database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Effective bucket mask (from the marker file).
    pub fn filename_mask(&self) -> &str {
        &self.filename_mask
    }

    /// Routes unrecoverable conditions through the critical-error policy.
    fn escalate<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.is_critical() {
                error!(db = %self.cfg.database, %err, "critical storage error");
                if self.cfg.critical == CriticalPolicy::Exit {
                    std::process::exit(1);
                }
            }
        }
        res
    }

    fn ctx(&mut self) -> (&mut HashMap<String, Topic>, TopicCtx<'_>) {
        (
            &mut self.topics,
            TopicCtx {
                master: self.master,
                fds: &mut self.fds,
                filename_mask: &self.filename_mask,
                rpermission: self.rpermission,
                xpermission: self.xpermission,
            },
        )
    }

    /// Creates a topic idempotently and opens it.
    ///
    /// # Errors
    ///
    /// See [`Topic::create`].
    pub fn create_topic(&mut self, cfg: &TopicConfig) -> Result<&Topic> {
        let up_to_date = self
            .topics
            .get(&cfg.name)
            .is_some_and(|t| cfg.var.topic_version <= t.var().topic_version);
        if !up_to_date {
            // Version upgrade or unknown topic: drop any stale handle and
            // run the (idempotent) on-disk create.
            if let Some(mut stale) = self.topics.remove(&cfg.name) {
                stale.close(&mut self.fds);
            }
            let dir = self.dir.clone();
            let (_, mut ctx) = self.ctx();
            let res = Topic::create(&dir, &mut ctx, cfg);
            let topic = self.escalate(res)?;
            self.topics.insert(cfg.name.clone(), topic);
        }
        self.topics
            .get(&cfg.name)
            .ok_or_else(|| TrError::NotFound(format!("topic {:?}", cfg.name)))
    }

    /// Opens a topic, cached.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic.
    pub fn open_topic(&mut self, name: &str) -> Result<&Topic> {
        if !self.topics.contains_key(name) {
            let res = Topic::open(&self.dir, name);
            let topic = self.escalate(res)?;
            self.topics.insert(name.to_string(), topic);
        }
        self.topics
            .get(name)
            .ok_or_else(|| TrError::NotFound(format!("topic {:?}", name)))
    }

    /// Closes a topic: its descriptors are dropped and it leaves the
    /// registry. Idempotent.
    pub fn close_topic(&mut self, name: &str) {
        if let Some(mut topic) = self.topics.remove(name) {
            topic.close(&mut self.fds);
        }
    }

    /// Deletes a topic's directory tree. Irreversible.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`, `TrError::Io`.
    pub fn delete_topic(&mut self, name: &str) -> Result<()> {
        self.open_topic(name)?;
        let Some(topic) = self.topics.remove(name) else {
            return Err(TrError::NotFound(format!("topic {:?}", name)));
        };
        let (_, mut ctx) = self.ctx();
        let res = topic.delete(&mut ctx);
        self.escalate(res)
    }

    /// Moves a topic's data to a backup location and recreates the topic
    /// empty. Returns the fresh topic.
    ///
    /// # Errors
    ///
    /// See [`Topic::backup`].
    pub fn backup_topic(
        &mut self,
        name: &str,
        backup_path: Option<&Path>,
        backup_name: Option<&str>,
        overwrite: bool,
        deleting_callback: Option<&mut dyn FnMut(&Path) -> bool>,
    ) -> Result<&Topic> {
        self.open_topic(name)?;
        let Some(topic) = self.topics.remove(name) else {
            return Err(TrError::NotFound(format!("topic {:?}", name)));
        };
        let dir = self.dir.clone();
        let (_, mut ctx) = self.ctx();
        let res = topic.backup(
            &dir,
            &mut ctx,
            backup_path,
            backup_name,
            overwrite,
            deleting_callback,
        );
        let fresh = self.escalate(res)?;
        self.topics.insert(name.to_string(), fresh);
        self.topics
            .get(name)
            .ok_or_else(|| TrError::NotFound(format!("topic {:?}", name)))
    }

    /// Replaces a topic's mutable metadata file.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn write_topic_var(&mut self, name: &str, var: TopicVar) -> Result<()> {
        self.open_topic(name)?;
        let (topics, mut ctx) = self.ctx();
        lookup_mut(topics, name)?.write_var(&mut ctx, var)
    }

    /// Replaces a topic's column schema file.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn write_topic_cols(&mut self, name: &str, cols: Value) -> Result<()> {
        self.open_topic(name)?;
        let (topics, mut ctx) = self.ctx();
        lookup_mut(topics, name)?.write_cols(&mut ctx, cols)
    }

    /// Appends one record to a topic. Returns the key, rowid, and
    /// metadata of the written record.
    ///
    /// # Errors
    ///
    /// See [`Topic::append`].
    pub fn append(
        &mut self,
        topic: &str,
        t_or_0: u64,
        user_flag: u32,
        record: &Value,
    ) -> Result<(RecordKey, i64, MetaRecord)> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let t = lookup_mut(topics, topic)?;
        let res = t.append(&mut ctx, t_or_0, user_flag, record);
        self.escalate(res)
    }

    /// Marks a record soft-deleted.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn soft_delete(&mut self, topic: &str, key: &RecordKey, rowid: i64) -> Result<()> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.soft_delete(&mut ctx, key, rowid);
        self.escalate(res)
    }

    /// Marks a record hard-deleted.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn hard_delete(&mut self, topic: &str, key: &RecordKey, rowid: i64) -> Result<()> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.hard_delete(&mut ctx, key, rowid);
        self.escalate(res)
    }

    /// Replaces a record's user flag.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn write_user_flag(
        &mut self,
        topic: &str,
        key: &RecordKey,
        rowid: i64,
        flag: u32,
    ) -> Result<()> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.write_user_flag(&mut ctx, key, rowid, flag);
        self.escalate(res)
    }

    /// ORs bits into a record's user flag, returning the new value.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster`, `TrError::NotFound`.
    pub fn set_user_flag(
        &mut self,
        topic: &str,
        key: &RecordKey,
        rowid: i64,
        mask: u32,
    ) -> Result<u32> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.set_user_flag(&mut ctx, key, rowid, mask);
        self.escalate(res)
    }

    /// Reads a record's user flag.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound`.
    pub fn read_user_flag(&mut self, topic: &str, key: &RecordKey, rowid: i64) -> Result<u32> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.read_user_flag(&mut ctx, key, rowid);
        self.escalate(res)
    }

    /// First record under a key, if any.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic or key.
    pub fn first(&mut self, topic: &str, key: &RecordKey) -> Result<Option<(i64, MetaRecord)>> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?
            .reader(&mut ctx, key)
            .and_then(|mut r| r.first());
        self.escalate(res)
    }

    /// Last record under a key, if any.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic or key.
    pub fn last(&mut self, topic: &str, key: &RecordKey) -> Result<Option<(i64, MetaRecord)>> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?
            .reader(&mut ctx, key)
            .and_then(|mut r| r.last());
        self.escalate(res)
    }

    /// Record after `rowid` under a key, if any.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic or key.
    pub fn next(
        &mut self,
        topic: &str,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<Option<(i64, MetaRecord)>> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?
            .reader(&mut ctx, key)
            .and_then(|mut r| r.next(rowid));
        self.escalate(res)
    }

    /// Record before `rowid` under a key, if any.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic or key.
    pub fn prev(
        &mut self,
        topic: &str,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<Option<(i64, MetaRecord)>> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?
            .reader(&mut ctx, key)
            .and_then(|mut r| r.prev(rowid));
        self.escalate(res)
    }

    /// First record under a key satisfying a condition, scanning in the
    /// given direction from `start` (or the matching sequence end).
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic or key.
    pub fn find(
        &mut self,
        topic: &str,
        key: &RecordKey,
        cond: &MatchCond,
        direction: Direction,
        start: Option<i64>,
    ) -> Result<Option<(i64, MetaRecord)>> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.find(&mut ctx, key, cond, direction, start);
        self.escalate(res)
    }

    /// Reads the metadata and content of one record.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic, key, or rowid.
    pub fn read_record(
        &mut self,
        topic: &str,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<(MetaRecord, Option<Value>)> {
        self.open_topic(topic)?;
        let (topics, mut ctx) = self.ctx();
        let res = lookup(topics, topic)?.reader(&mut ctx, key).and_then(|mut r| {
            let meta = r.read_meta(rowid)?;
            let record = r.read_record(rowid, &meta)?;
            Ok((meta, record))
        });
        self.escalate(res)
    }

    /// Opens a list: refreshes the cache for the keys its condition
    /// covers, replays matching history, registers it for live fan-out,
    /// and returns its handle.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown topic, `TrError::Parameter` for
    /// a bad condition, `TrError::ListAborted` if the callback aborts the
    /// replay.
    pub fn open_list(&mut self, spec: ListSpec) -> Result<ListId> {
        self.open_topic(&spec.topic)?;
        let cond = MatchCond::compile(&spec.cond)?;
        let filter = if let Some(key) = cond.single_key() {
            KeyFilter::Single(key)
        } else if let Some(re) = cond.key_pattern() {
            KeyFilter::Pattern(re.clone())
        } else {
            KeyFilter::All
        };

        let id = self.next_list_id;
        self.next_list_id += 1;

        let master = self.master;
        let filename_mask = self.filename_mask.clone();
        let (rperm, xperm) = (self.rpermission, self.xpermission);
        let topics = &mut self.topics;
        let fds = &mut self.fds;
        let topic = lookup_mut(topics, &spec.topic)?;

        let res = (|| -> Result<List> {
            topic.refresh_cache(&filter)?;
            let mut list = List::new(id, cond, spec.callback);

            let keys: Vec<RecordKey> = topic
                .cached_keys()
                .into_iter()
                .filter(|k| list.cond().accepts_key(k))
                .collect();
            for key in keys {
                let mut ctx = TopicCtx {
                    master,
                    fds: &mut *fds,
                    filename_mask: &filename_mask,
                    rpermission: rperm,
                    xpermission: xperm,
                };
                let mut reader = topic.reader(&mut ctx, &key)?;
                let direction = match spec.order {
                    ReplayOrder::Forward => Direction::Forward,
                    ReplayOrder::Backward => Direction::Backward,
                };
                let rows = reader.rows() as i64;
                let mut start: Option<i64> = None;
                loop {
                    let Some((rowid, meta)) = reader.find(list.cond(), direction, start)? else {
                        break;
                    };
                    let record = reader.read_record(rowid, &meta)?;
                    list.deliver(ListEntry {
                        key: key.clone(),
                        rowid,
                        meta,
                        record,
                    })?;
                    start = match direction {
                        Direction::Forward if rowid + 1 < rows => Some(rowid + 1),
                        Direction::Backward if rowid > 0 => Some(rowid - 1),
                        _ => break,
                    };
                }
            }
            Ok(list)
        })();

        let list = self.escalate(res)?;
        lookup_mut(&mut self.topics, &spec.topic)?.register_list(list);
        debug!(topic = %spec.topic, list = id, "opened list");
        Ok(id)
    }

    /// Closes a list, returning it. Idempotent: an unknown id yields
    /// `None`.
    pub fn close_list(&mut self, id: ListId) -> Option<List> {
        for topic in self.topics.values_mut() {
            if let Some(list) = topic.remove_list(id) {
                return Some(list);
            }
        }
        None
    }

    /// Borrows an open list by id.
    pub fn list(&self, id: ListId) -> Option<&List> {
        self.topics.values().find_map(|t| t.list(id))
    }

    /// Borrows an open topic by name, if open.
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.dir)
            .field("master", &self.master)
            .field("topics", &self.topics.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_defaults() {
        let cfg = DbConfig::new("/tmp/tr", "metrics");
        assert!(cfg.master);
        assert_eq!(cfg.filename_mask, DEFAULT_FILENAME_MASK);
        assert_eq!(cfg.rpermission, DEFAULT_RPERMISSION);
        assert_eq!(cfg.xpermission, DEFAULT_XPERMISSION);
        assert_eq!(cfg.critical, CriticalPolicy::Exit);
    }

    #[test]
    fn marker_persists_database_defaults() {
        let tmp = TempDir::new().unwrap();
        let db = Database::startup(
            DbConfig::new(tmp.path(), "d").with_filename_mask("%Y-%m-%d_%H"),
        )
        .unwrap();
        db.shutdown();

        // A later handle without the override inherits the stored mask.
        let db = Database::startup(DbConfig::new(tmp.path(), "d")).unwrap();
        assert_eq!(db.filename_mask(), "%Y-%m-%d_%H");
    }
}
