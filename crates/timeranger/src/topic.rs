//! Topic lifecycle, partition resolution, and the append path.
//!
//! A topic is a named collection of time-ordered JSON records partitioned
//! by primary-key value. On disk a topic directory holds three descriptor
//! files and one subdirectory per distinct key:
//!
//! ```text
//! {topic}/topic_desc.json   immutable: name, pkey, tkey, system_flag
//! {topic}/topic_cols.json   optional column schema, re-creatable
//! {topic}/topic_var.json    mutable topic metadata
//! {topic}/{key}/{bucket}.json  append-only content records
//! {topic}/{key}/{bucket}.md2   append-only 32-byte metadata records
//! ```
//!
//! Buckets are time windows named by `strftime(filename_mask, gmtime(t))`.
//! Appends only grow files; the sole in-place mutation is the delete/user
//! flag rewrite of one metadata record.

use std::collections::HashMap;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::codec::{MetaRecord, RecordState, SystemFlags};
use crate::cursor::{Direction, KeyReader};
use crate::error::{Result, TrError};
use crate::fdcache::{FdCache, FdKey, FdMode};
use crate::fsutil;
use crate::list::{List, ListEntry, ListId};
use crate::matcher::{MatchCond, RecordKey};
use crate::rangecache::{KeyFilter, TopicCache, DATA_EXTENSION, MD_EXTENSION};

/// Immutable topic descriptor file name.
pub const TOPIC_DESC_FILE: &str = "topic_desc.json";

/// Optional column schema file name.
pub const TOPIC_COLS_FILE: &str = "topic_cols.json";

/// Mutable topic metadata file name.
pub const TOPIC_VAR_FILE: &str = "topic_var.json";

/// Longest accepted string primary key.
pub const MAX_STRING_KEY_LEN: usize = 200;

/// Default backup directory suffix.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Fields of `topic_var.json` that never override the descriptor when the
/// var file is merged at open.
const IMMUTABLE_FIELDS: &[&str] = &["topic_name", "pkey", "tkey", "system_flag"];

/// Database-side context threaded into topic operations.
pub struct TopicCtx<'a> {
    /// Whether this process holds the master lock.
    pub master: bool,
    /// Shared descriptor cache.
    pub fds: &'a mut FdCache,
    /// Database default bucket mask, used when the topic sets none.
    pub filename_mask: &'a str,
    /// Permission bits for created files.
    pub rpermission: u32,
    /// Permission bits for created directories.
    pub xpermission: u32,
}

/// Immutable topic identity, the content of `topic_desc.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicDesc {
    /// Topic name.
    pub topic_name: String,
    /// Record field holding the partition key.
    pub pkey: String,
    /// Record field holding the message time, empty if none.
    #[serde(default)]
    pub tkey: String,
    /// Behavior bits.
    #[serde(default)]
    pub system_flag: SystemFlags,
}

/// Mutable topic metadata, the content of `topic_var.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicVar {
    /// Bucket mask override; the database default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_mask: Option<String>,
    /// Seconds added to message times parsed from string `tkey` values.
    #[serde(default)]
    pub tkey_offset: i64,
    /// Monotonic version; a higher version at create re-creates var/cols.
    #[serde(default)]
    pub topic_version: u32,
    /// Arbitrary caller-owned fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Arguments for creating (or version-upgrading) a topic.
pub struct TopicConfig {
    /// Topic name.
    pub name: String,
    /// Record field holding the partition key.
    pub pkey: String,
    /// Record field holding the message time.
    pub tkey: Option<String>,
    /// Behavior bits. The key-type bit is auto-derived when unset.
    pub flags: SystemFlags,
    /// Optional column schema.
    pub cols: Option<Value>,
    /// Initial mutable metadata.
    pub var: TopicVar,
}

impl TopicConfig {
    /// Creates a config with the given name and pkey field, string keys,
    /// no tkey, no schema.
    pub fn new(name: &str, pkey: &str) -> Self {
        Self {
            name: name.to_string(),
            pkey: pkey.to_string(),
            tkey: None,
            flags: SystemFlags::default(),
            cols: None,
            var: TopicVar::default(),
        }
    }

    /// Sets the message-time field.
    pub fn with_tkey(mut self, tkey: &str) -> Self {
        self.tkey = Some(tkey.to_string());
        self
    }

    /// Sets behavior bits.
    pub fn with_flags(mut self, flags: SystemFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the column schema.
    pub fn with_cols(mut self, cols: Value) -> Self {
        self.cols = Some(cols);
        self
    }

    /// Sets the bucket mask override.
    pub fn with_filename_mask(mut self, mask: &str) -> Self {
        self.var.filename_mask = Some(mask.to_string());
        self
    }

    /// Sets the topic version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.var.topic_version = version;
        self
    }

    /// Sets the tkey offset in seconds.
    pub fn with_tkey_offset(mut self, offset: i64) -> Self {
        self.var.tkey_offset = offset;
        self
    }
}

/// One open topic.
pub struct Topic {
    desc: TopicDesc,
    var: TopicVar,
    cols: Option<Value>,
    dir: PathBuf,
    cache: TopicCache,
    lists: HashMap<ListId, List>,
}

impl Topic {
    /// Creates a topic on disk, idempotently, then opens it.
    ///
    /// An absent topic directory is master-only to create. An existing
    /// topic is left untouched unless `cfg.var.topic_version` exceeds the
    /// stored version, in which case `topic_var.json` and
    /// `topic_cols.json` are deleted and re-created; `topic_desc.json` is
    /// immutable either way.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` when a non-master must create, `TrError::Io`
    /// on filesystem failure.
    pub fn create(db_dir: &Path, ctx: &mut TopicCtx<'_>, cfg: &TopicConfig) -> Result<Topic> {
        let dir = db_dir.join(&cfg.name);
        if !dir.is_dir() {
            if !ctx.master {
                return Err(TrError::NotMaster(format!(
                    "create topic {:?}",
                    cfg.name
                )));
            }
            fsutil::ensure_dir(&dir, ctx.xpermission)?;

            let mut flags = cfg.flags;
            if !flags.string_key() && !flags.int_key() {
                // Key type follows the pkey field: named field means
                // string keys, unnamed means integer keys.
                if cfg.pkey.is_empty() {
                    flags.set(SystemFlags::INT_KEY);
                } else {
                    flags.set(SystemFlags::STRING_KEY);
                }
            }
            let desc = TopicDesc {
                topic_name: cfg.name.clone(),
                pkey: cfg.pkey.clone(),
                tkey: cfg.tkey.clone().unwrap_or_default(),
                system_flag: flags,
            };
            fsutil::write_json(
                &dir.join(TOPIC_DESC_FILE),
                &serde_json::to_value(&desc)?,
                ctx.rpermission,
            )?;
            if let Some(cols) = &cfg.cols {
                fsutil::write_json(&dir.join(TOPIC_COLS_FILE), cols, ctx.rpermission)?;
            }
            fsutil::write_json(
                &dir.join(TOPIC_VAR_FILE),
                &serde_json::to_value(&cfg.var)?,
                ctx.rpermission,
            )?;
            info!(topic = %cfg.name, "created topic");
        } else if cfg.var.topic_version > 0 {
            let stored: TopicVar = match fsutil::read_json(&dir.join(TOPIC_VAR_FILE)) {
                Ok(v) => serde_json::from_value(v)?,
                Err(_) => TopicVar::default(),
            };
            if cfg.var.topic_version > stored.topic_version {
                if !ctx.master {
                    return Err(TrError::NotMaster(format!(
                        "upgrade topic {:?}",
                        cfg.name
                    )));
                }
                info!(
                    topic = %cfg.name,
                    from = stored.topic_version,
                    to = cfg.var.topic_version,
                    "re-creating mutable topic files for new version"
                );
                let _ = fs::remove_file(dir.join(TOPIC_VAR_FILE));
                let _ = fs::remove_file(dir.join(TOPIC_COLS_FILE));
                fsutil::write_json(
                    &dir.join(TOPIC_VAR_FILE),
                    &serde_json::to_value(&cfg.var)?,
                    ctx.rpermission,
                )?;
                if let Some(cols) = &cfg.cols {
                    fsutil::write_json(&dir.join(TOPIC_COLS_FILE), cols, ctx.rpermission)?;
                }
            }
        }

        Self::open(db_dir, &cfg.name)
    }

    /// Opens an existing topic: loads the descriptor, merges the var file
    /// over it (immutable fields excluded), loads the schema, and rebuilds
    /// the per-key time-range cache.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` if the topic directory or descriptor is absent.
    pub fn open(db_dir: &Path, name: &str) -> Result<Topic> {
        let dir = db_dir.join(name);
        let desc_path = dir.join(TOPIC_DESC_FILE);
        if !desc_path.is_file() {
            return Err(TrError::NotFound(format!("topic {:?}", name)));
        }
        let mut desc: TopicDesc = serde_json::from_value(fsutil::read_json(&desc_path)?)?;
        desc.system_flag.set(SystemFlags::LOADING_FROM_DISK);

        let var: TopicVar = match fsutil::read_json(&dir.join(TOPIC_VAR_FILE)) {
            Ok(mut value) => {
                if let Some(map) = value.as_object_mut() {
                    for field in IMMUTABLE_FIELDS {
                        map.remove(*field);
                    }
                }
                serde_json::from_value(value)?
            }
            Err(_) => TopicVar::default(),
        };
        let cols = fsutil::read_json(&dir.join(TOPIC_COLS_FILE)).ok();

        let mut topic = Topic {
            desc,
            var,
            cols,
            dir,
            cache: TopicCache::new(),
            lists: HashMap::new(),
        };
        topic.cache.refresh(
            &topic.dir,
            topic.desc.system_flag.int_key(),
            &KeyFilter::All,
        )?;
        topic.desc.system_flag.clear(SystemFlags::LOADING_FROM_DISK);
        debug!(topic = %topic.desc.topic_name, keys = topic.cache.len(), "opened topic");
        Ok(topic)
    }

    /// Topic name.
    pub fn name(&self) -> &str {
        &self.desc.topic_name
    }

    /// Topic directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Behavior bits.
    pub fn flags(&self) -> SystemFlags {
        self.desc.system_flag
    }

    /// Column schema, if any.
    pub fn cols(&self) -> Option<&Value> {
        self.cols.as_ref()
    }

    /// Mutable topic metadata.
    pub fn var(&self) -> &TopicVar {
        &self.var
    }

    /// Cached time range for a key.
    pub fn key_range(&self, key: &RecordKey) -> Option<&crate::rangecache::KeyRange> {
        self.cache.get(key)
    }

    /// Keys currently present in the time-range cache, sorted by
    /// directory name.
    pub fn cached_keys(&self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.cache.keys().cloned().collect();
        keys.sort_by_key(|k| k.dir_name());
        keys
    }

    /// Re-scans the cache for the keys a filter covers.
    pub fn refresh_cache(&mut self, filter: &KeyFilter) -> Result<()> {
        self.cache
            .refresh(&self.dir, self.desc.system_flag.int_key(), filter)
    }

    /// Replaces `topic_var.json` and the in-memory var state. Master only.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` for non-master handles.
    pub fn write_var(&mut self, ctx: &mut TopicCtx<'_>, var: TopicVar) -> Result<()> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!("write var of {:?}", self.name())));
        }
        fsutil::write_json(
            &self.dir.join(TOPIC_VAR_FILE),
            &serde_json::to_value(&var)?,
            ctx.rpermission,
        )?;
        self.var = var;
        Ok(())
    }

    /// Replaces `topic_cols.json` and the in-memory schema. Master only.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` for non-master handles.
    pub fn write_cols(&mut self, ctx: &mut TopicCtx<'_>, cols: Value) -> Result<()> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!(
                "write cols of {:?}",
                self.name()
            )));
        }
        fsutil::write_json(&self.dir.join(TOPIC_COLS_FILE), &cols, ctx.rpermission)?;
        self.cols = Some(cols);
        Ok(())
    }

    /// Extracts and validates the partition key from a record.
    ///
    /// # Errors
    ///
    /// `TrError::Parameter` when the pkey field is missing, the wrong
    /// type, an over-long string, a path-hostile string, or a
    /// non-positive integer.
    pub fn record_key(&self, record: &Value) -> Result<RecordKey> {
        let field = &self.desc.pkey;
        let value = record.get(field).ok_or_else(|| {
            TrError::Parameter(format!("record lacks pkey field {:?}", field))
        })?;
        if self.desc.system_flag.int_key() {
            let i = value.as_i64().ok_or_else(|| {
                TrError::Parameter(format!("pkey field {:?} must be an integer", field))
            })?;
            if i <= 0 {
                return Err(TrError::Parameter(format!(
                    "pkey field {:?} must be positive, got {}",
                    field, i
                )));
            }
            Ok(RecordKey::Int(i))
        } else {
            let s = value.as_str().ok_or_else(|| {
                TrError::Parameter(format!("pkey field {:?} must be a string", field))
            })?;
            if s.is_empty() || s.len() > MAX_STRING_KEY_LEN {
                return Err(TrError::Parameter(format!(
                    "pkey value length {} outside 1..={}",
                    s.len(),
                    MAX_STRING_KEY_LEN
                )));
            }
            if s.contains('/') || s == "." || s == ".." {
                return Err(TrError::Parameter(format!(
                    "pkey value {:?} is not a valid partition name",
                    s
                )));
            }
            Ok(RecordKey::Str(s.to_string()))
        }
    }

    /// Bucket name for a content timestamp:
    /// `strftime(filename_mask, gmtime(t))`.
    ///
    /// # Errors
    ///
    /// `TrError::Parameter` if `t` is outside the representable range.
    pub fn bucket_name(&self, ctx: &TopicCtx<'_>, t: u64) -> Result<String> {
        let secs = if self.desc.system_flag.contains(SystemFlags::T_MS) {
            (t / 1000) as i64
        } else {
            t as i64
        };
        let mask = self
            .var
            .filename_mask
            .as_deref()
            .unwrap_or(ctx.filename_mask);
        let dt = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| TrError::Parameter(format!("timestamp {} out of range", t)))?;
        Ok(dt.format(mask).to_string())
    }

    /// Resolves the message time (`tm`) from a record's tkey field.
    fn resolve_tm(&self, record: &Value) -> u64 {
        if self.desc.tkey.is_empty() {
            return 0;
        }
        let Some(value) = record.get(&self.desc.tkey) else {
            return 0;
        };
        match value {
            // Integer message times are taken verbatim.
            Value::Number(n) => n.as_u64().unwrap_or(0),
            Value::String(s) => match crate::timeparse::parse_time(s) {
                Some(secs) => {
                    let secs = secs + self.var.tkey_offset;
                    let secs = secs.max(0) as u64;
                    if self.desc.system_flag.contains(SystemFlags::TM_MS) {
                        secs * 1000
                    } else {
                        secs
                    }
                }
                None => 0,
            },
            _ => 0,
        }
    }

    /// Appends one record: content plus metadata, cache update, list
    /// fan-out.
    ///
    /// `t_or_0` of zero means "now" at the topic's resolution. Returns the
    /// key, the record's rowid, and its metadata.
    ///
    /// # Errors
    ///
    /// Fails without touching disk on a non-master handle or an invalid
    /// record. `TrError::ListAborted` reports a callback abort after the
    /// record is durably written.
    pub fn append(
        &mut self,
        ctx: &mut TopicCtx<'_>,
        t_or_0: u64,
        user_flag: u32,
        record: &Value,
    ) -> Result<(RecordKey, i64, MetaRecord)> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!("append to {:?}", self.name())));
        }
        let key = self.record_key(record)?;

        let t = if t_or_0 != 0 {
            t_or_0
        } else {
            let now = Utc::now();
            if self.desc.system_flag.contains(SystemFlags::T_MS) {
                now.timestamp_millis() as u64
            } else {
                now.timestamp() as u64
            }
        };
        let tm = self.resolve_tm(record);
        let bucket = self.bucket_name(ctx, t)?;

        let key_dir = self.dir.join(key.dir_name());
        if !key_dir.is_dir() {
            fsutil::ensure_dir(&key_dir, ctx.xpermission)?;
        }

        let body = if self.desc.system_flag.contains(SystemFlags::SAVE_MD_IN_RECORD) {
            let mut stored = record.clone();
            if let Some(map) = stored.as_object_mut() {
                map.insert("_t".to_string(), Value::from(t));
                map.insert("_tm".to_string(), Value::from(tm));
            }
            serde_json::to_vec(&stored)?
        } else {
            serde_json::to_vec(record)?
        };

        let (offset, size) = if self.desc.system_flag.contains(SystemFlags::NO_RECORD_DISK) {
            // Metadata-only persistence: the content is never written.
            (0, 0)
        } else {
            let data_name = format!("{}.{}", bucket, DATA_EXTENSION);
            let data_path = key_dir.join(&data_name);
            let fd = ctx.fds.get(
                FdKey::new(self.name(), &key.dir_name(), &data_name, FdMode::Write),
                &data_path,
                true,
                ctx.rpermission,
            )?;
            let offset = fd.seek(SeekFrom::End(0))?;
            fd.write_all(&body)?;
            fd.write_all(&[0])?;
            fd.flush()?;
            (offset, body.len() as u32 + 1)
        };

        let mut meta = MetaRecord::new(t, tm, offset, size);
        meta.user_flag = user_flag;

        let md_name = format!("{}.{}", bucket, MD_EXTENSION);
        let md_path = key_dir.join(&md_name);
        let fd = ctx.fds.get(
            FdKey::new(self.name(), &key.dir_name(), &md_name, FdMode::Write),
            &md_path,
            true,
            ctx.rpermission,
        )?;
        fd.seek(SeekFrom::End(0))?;
        fd.write_all(&meta.encode())?;
        fd.flush()?;

        let rowid = self.cache.get(&key).map_or(0, |r| r.rows) as i64;
        self.cache.note_append(&key, &bucket, &meta);

        self.fan_out(&key, rowid, &meta, record)?;
        Ok((key, rowid, meta))
    }

    /// Delivers a freshly appended record to every matching open list.
    fn fan_out(
        &mut self,
        key: &RecordKey,
        rowid: i64,
        meta: &MetaRecord,
        record: &Value,
    ) -> Result<()> {
        if self.lists.is_empty() {
            return Ok(());
        }
        let bounds = self
            .cache
            .get(key)
            .map(|r| r.scan_bounds())
            .unwrap_or_default();
        for list in self.lists.values_mut() {
            let out = list.cond().eval(key, rowid, &bounds, meta);
            if !out.matched {
                continue;
            }
            list.deliver(ListEntry {
                key: key.clone(),
                rowid,
                meta: *meta,
                record: Some(record.clone()),
            })?;
        }
        Ok(())
    }

    /// Builds a positional reader over one key. The key must be known to
    /// the cache.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown key.
    pub fn reader<'a>(
        &'a self,
        ctx: &'a mut TopicCtx<'_>,
        key: &'a RecordKey,
    ) -> Result<KeyReader<'a>> {
        let range = self.cache.get(key).ok_or_else(|| {
            TrError::NotFound(format!("key {:?} in topic {:?}", key, self.name()))
        })?;
        Ok(KeyReader::new(
            self.name(),
            key,
            self.dir.join(key.dir_name()),
            range,
            ctx.fds,
            ctx.rpermission,
        ))
    }

    /// Rewrites one metadata record in place through a closure. The shared
    /// path behind the delete and user-flag operations. Master only.
    fn rewrite_meta_with(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
        mutate: impl FnOnce(&mut MetaRecord),
    ) -> Result<MetaRecord> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!(
                "rewrite metadata in {:?}",
                self.name()
            )));
        }
        let range = self.cache.get(key).ok_or_else(|| {
            TrError::NotFound(format!("key {:?} in topic {:?}", key, self.name()))
        })?;
        let mut reader = KeyReader::new(
            self.name(),
            key,
            self.dir.join(key.dir_name()),
            range,
            ctx.fds,
            ctx.rpermission,
        );
        let mut meta = reader.read_meta(rowid)?;
        mutate(&mut meta);
        reader.rewrite_meta(rowid, &meta)?;
        Ok(meta)
    }

    /// Marks a record soft-deleted: hidden unless a filter opts in.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` or `TrError::NotFound`.
    pub fn soft_delete(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<()> {
        self.rewrite_meta_with(ctx, key, rowid, |m| m.state = RecordState::SoftDeleted)?;
        Ok(())
    }

    /// Marks a record hard-deleted: never visible again.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` or `TrError::NotFound`.
    pub fn hard_delete(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<()> {
        self.rewrite_meta_with(ctx, key, rowid, |m| m.state = RecordState::HardDeleted)?;
        Ok(())
    }

    /// Replaces a record's user flag.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` or `TrError::NotFound`.
    pub fn write_user_flag(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
        flag: u32,
    ) -> Result<()> {
        self.rewrite_meta_with(ctx, key, rowid, |m| m.user_flag = flag)?;
        Ok(())
    }

    /// ORs bits into a record's user flag, returning the new value.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` or `TrError::NotFound`.
    pub fn set_user_flag(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
        mask: u32,
    ) -> Result<u32> {
        let meta = self.rewrite_meta_with(ctx, key, rowid, |m| m.user_flag |= mask)?;
        Ok(meta.user_flag)
    }

    /// Reads a record's user flag.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` for an unknown key or rowid.
    pub fn read_user_flag(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        rowid: i64,
    ) -> Result<u32> {
        let mut reader = self.reader(ctx, key)?;
        Ok(reader.read_meta(rowid)?.user_flag)
    }

    /// Finds the first matching record in a direction. See
    /// [`KeyReader::find`].
    ///
    /// # Errors
    ///
    /// Propagates reader errors.
    pub fn find(
        &self,
        ctx: &mut TopicCtx<'_>,
        key: &RecordKey,
        cond: &MatchCond,
        direction: Direction,
        start: Option<i64>,
    ) -> Result<Option<(i64, MetaRecord)>> {
        let mut reader = self.reader(ctx, key)?;
        reader.find(cond, direction, start)
    }

    /// Registers an open list on the topic.
    pub fn register_list(&mut self, list: List) {
        self.lists.insert(list.id(), list);
    }

    /// Deregisters a list, returning it. Idempotent: an unknown id is
    /// `None`.
    pub fn remove_list(&mut self, id: ListId) -> Option<List> {
        self.lists.remove(&id)
    }

    /// An open list by id.
    pub fn list(&self, id: ListId) -> Option<&List> {
        self.lists.get(&id)
    }

    /// A mutable open list by id.
    pub fn list_mut(&mut self, id: ListId) -> Option<&mut List> {
        self.lists.get_mut(&id)
    }

    /// Number of open lists.
    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    /// Closes the topic's descriptors and drops its lists.
    ///
    /// Still-open lists are the caller's responsibility; closing a topic
    /// under them drops them without notice.
    pub fn close(&mut self, fds: &mut FdCache) {
        if !self.lists.is_empty() {
            warn!(
                topic = %self.name(),
                lists = self.lists.len(),
                "closing topic with open lists"
            );
        }
        fds.close_topic(&self.desc.topic_name);
        self.lists.clear();
        self.cache.clear();
    }

    /// Deletes the topic's directory tree. Irreversible. Master only.
    ///
    /// # Errors
    ///
    /// `TrError::NotMaster` or `TrError::Io`.
    pub fn delete(mut self, ctx: &mut TopicCtx<'_>) -> Result<()> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!("delete topic {:?}", self.name())));
        }
        self.close(ctx.fds);
        fs::remove_dir_all(&self.dir)?;
        info!(topic = %self.desc.topic_name, "deleted topic");
        Ok(())
    }

    /// Moves the topic's data aside and recreates it empty.
    ///
    /// The destination defaults to `{topic}.bak` next to the topic. When
    /// it already exists and `overwrite` is set, `deleting_callback` (if
    /// given) is asked whether the caller controls that backup before it
    /// is removed. The move is an atomic rename; a fresh, empty topic is
    /// then recreated from the moved descriptor and returned.
    ///
    /// # Errors
    ///
    /// `TrError::Parameter` when the destination exists and may not be
    /// replaced; `TrError::NotMaster`; `TrError::Io`.
    pub fn backup(
        mut self,
        db_dir: &Path,
        ctx: &mut TopicCtx<'_>,
        backup_path: Option<&Path>,
        backup_name: Option<&str>,
        overwrite: bool,
        deleting_callback: Option<&mut dyn FnMut(&Path) -> bool>,
    ) -> Result<Topic> {
        if !ctx.master {
            return Err(TrError::NotMaster(format!("backup topic {:?}", self.name())));
        }
        let name = self.desc.topic_name.clone();
        self.close(ctx.fds);

        let dest_dir = backup_path.unwrap_or(db_dir);
        let dest_name = match backup_name {
            Some(n) => n.to_string(),
            None => format!("{}{}", name, BACKUP_SUFFIX),
        };
        let dest = dest_dir.join(&dest_name);

        if dest.exists() {
            if !overwrite {
                return Err(TrError::Parameter(format!(
                    "backup destination {:?} already exists",
                    dest
                )));
            }
            if let Some(cb) = deleting_callback {
                if !cb(&dest) {
                    return Err(TrError::Parameter(format!(
                        "existing backup {:?} is not ours to delete",
                        dest
                    )));
                }
            }
            fs::remove_dir_all(&dest)?;
        }

        fs::rename(&self.dir, &dest)?;
        info!(topic = %name, dest = %dest.display(), "moved topic data to backup");

        // Recreate the empty topic from the moved descriptor.
        let desc: TopicDesc =
            serde_json::from_value(fsutil::read_json(&dest.join(TOPIC_DESC_FILE))?)?;
        fsutil::ensure_dir(&self.dir, ctx.xpermission)?;
        fsutil::write_json(
            &self.dir.join(TOPIC_DESC_FILE),
            &serde_json::to_value(&desc)?,
            ctx.rpermission,
        )?;
        if let Ok(cols) = fsutil::read_json(&dest.join(TOPIC_COLS_FILE)) {
            fsutil::write_json(&self.dir.join(TOPIC_COLS_FILE), &cols, ctx.rpermission)?;
        }
        if let Ok(var) = fsutil::read_json(&dest.join(TOPIC_VAR_FILE)) {
            fsutil::write_json(&self.dir.join(TOPIC_VAR_FILE), &var, ctx.rpermission)?;
        }

        Self::open(db_dir, &name)
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.desc.topic_name)
            .field("pkey", &self.desc.pkey)
            .field("keys", &self.cache.len())
            .field("lists", &self.lists.len())
            .finish()
    }
}
