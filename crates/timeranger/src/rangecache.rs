//! Per-key time-range cache built by scanning partition metadata files.
//!
//! For every key directory the scanner reads only the first and last
//! fixed-size metadata record of each `.md2` bucket file (two seeks per
//! file) to derive the file's time span and row count, then aggregates
//! min/max/sum across files into a [`KeyRange`]. The cache is rebuilt at
//! topic open, refreshed when a list is opened against a new key or
//! pattern, and updated incrementally on every append.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::codec::{check_md_file_len, MetaRecord, META_RECORD_SIZE};
use crate::error::Result;
use crate::fsutil;
use crate::matcher::{RecordKey, ScanBounds};

/// Metadata file extension.
pub const MD_EXTENSION: &str = "md2";

/// Data file extension.
pub const DATA_EXTENSION: &str = "json";

/// Time coverage of one bucket file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRange {
    /// Bucket name without extension.
    pub name: String,
    /// Lowest `t` in the file.
    pub fr_t: u64,
    /// Highest `t` in the file.
    pub to_t: u64,
    /// Lowest `tm` in the file.
    pub fr_tm: u64,
    /// Highest `tm` in the file.
    pub to_tm: u64,
    /// Number of metadata records in the file.
    pub rows: u64,
}

/// Aggregate time coverage of one key partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Lowest `t` across all files.
    pub fr_t: u64,
    /// Highest `t` across all files.
    pub to_t: u64,
    /// Lowest `tm` across all files.
    pub fr_tm: u64,
    /// Highest `tm` across all files.
    pub to_tm: u64,
    /// Total record count across all files.
    pub rows: u64,
    /// Per-file coverage, ordered by bucket name.
    pub files: Vec<FileRange>,
}

impl KeyRange {
    /// Scan context for resolving relative bounds against this key.
    pub fn scan_bounds(&self) -> ScanBounds {
        ScanBounds {
            last_rowid: self.rows as i64 - 1,
            last_t: self.to_t,
            last_tm: self.to_tm,
        }
    }

    /// Folds one record into the aggregate and its bucket's file entry,
    /// creating the entry when the bucket is new. Keeps `files` ordered.
    pub fn note_append(&mut self, bucket: &str, meta: &MetaRecord) {
        let idx = match self.files.iter().position(|f| f.name == bucket) {
            Some(idx) => idx,
            None => {
                let at = self
                    .files
                    .iter()
                    .position(|f| f.name.as_str() > bucket)
                    .unwrap_or(self.files.len());
                self.files.insert(
                    at,
                    FileRange {
                        name: bucket.to_string(),
                        fr_t: u64::MAX,
                        to_t: 0,
                        fr_tm: u64::MAX,
                        to_tm: 0,
                        rows: 0,
                    },
                );
                at
            }
        };
        let file = &mut self.files[idx];
        file.fr_t = file.fr_t.min(meta.t);
        file.to_t = file.to_t.max(meta.t);
        file.fr_tm = file.fr_tm.min(meta.tm);
        file.to_tm = file.to_tm.max(meta.tm);
        file.rows += 1;

        if self.rows == 0 {
            self.fr_t = meta.t;
            self.fr_tm = meta.tm;
        } else {
            self.fr_t = self.fr_t.min(meta.t);
            self.fr_tm = self.fr_tm.min(meta.tm);
        }
        self.to_t = self.to_t.max(meta.t);
        self.to_tm = self.to_tm.max(meta.tm);
        self.rows += 1;
    }
}

/// Which keys a scan should cover.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    /// Every key directory in the topic.
    All,
    /// One key only.
    Single(RecordKey),
    /// Key directory names matching a regular expression.
    Pattern(Regex),
}

impl KeyFilter {
    fn accepts(&self, dir_name: &str) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Single(key) => key.dir_name() == dir_name,
            KeyFilter::Pattern(re) => re.is_match(dir_name),
        }
    }
}

/// Per-key time-range cache for one topic.
#[derive(Debug, Default)]
pub struct TopicCache {
    keys: HashMap<RecordKey, KeyRange>,
}

impl TopicCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached range for a key.
    pub fn get(&self, key: &RecordKey) -> Option<&KeyRange> {
        self.keys.get(key)
    }

    /// Iterates over all cached keys.
    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.keys.keys()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is cached.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Scans key directories under `topic_dir` matching `filter` and
    /// replaces their cache entries.
    ///
    /// # Errors
    ///
    /// Returns `TrError::Io` on directory or file access failure,
    /// `TrError::Corruption` on a truncated metadata file.
    pub fn refresh(&mut self, topic_dir: &Path, int_key: bool, filter: &KeyFilter) -> Result<()> {
        for name in fsutil::list_sorted(topic_dir, None, true)? {
            if !filter.accepts(&name) {
                continue;
            }
            let key = match RecordKey::from_dir_name(&name, int_key) {
                Some(key) => key,
                None => continue, // not a key directory for this topic
            };
            let range = scan_key_dir(&topic_dir.join(&name))?;
            debug!(key = %name, rows = range.rows, "scanned key partition");
            self.keys.insert(key, range);
        }
        Ok(())
    }

    /// Folds a freshly appended record into the cache.
    pub fn note_append(&mut self, key: &RecordKey, bucket: &str, meta: &MetaRecord) {
        self.keys
            .entry(key.clone())
            .or_default()
            .note_append(bucket, meta);
    }

    /// Drops every cached entry.
    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Derives the time coverage of one key directory from its `.md2` files.
///
/// Only the first and last record of each file are read.
///
/// # Errors
///
/// Returns `TrError::Io` on access failure, `TrError::Corruption` if a
/// metadata file length is not a multiple of the record size.
pub fn scan_key_dir(key_dir: &Path) -> Result<KeyRange> {
    let mut range = KeyRange::default();
    let md_suffix = format!(".{}", MD_EXTENSION);

    for name in fsutil::list_sorted(key_dir, None, false)? {
        let Some(bucket) = name.strip_suffix(&md_suffix) else {
            continue;
        };
        let path = key_dir.join(&name);
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        let rows = check_md_file_len(&path, len)?;

        let mut fr = FileRange {
            name: bucket.to_string(),
            ..FileRange::default()
        };
        if rows > 0 {
            let first = MetaRecord::read_from(&mut file)?;
            file.seek(SeekFrom::Start(len - META_RECORD_SIZE))?;
            let last = MetaRecord::read_from(&mut file)?;

            fr.fr_t = first.t.min(last.t);
            fr.to_t = first.t.max(last.t);
            fr.fr_tm = first.tm.min(last.tm);
            fr.to_tm = first.tm.max(last.tm);
            fr.rows = rows;

            if range.rows == 0 {
                range.fr_t = fr.fr_t;
                range.fr_tm = fr.fr_tm;
            } else {
                range.fr_t = range.fr_t.min(fr.fr_t);
                range.fr_tm = range.fr_tm.min(fr.fr_tm);
            }
            range.to_t = range.to_t.max(fr.to_t);
            range.to_tm = range.to_tm.max(fr.to_tm);
            range.rows += rows;
        }
        range.files.push(fr);
    }
    Ok(range)
}
