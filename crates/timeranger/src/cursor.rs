//! Position-addressed iteration over one key's metadata sequence.
//!
//! Records under a key form a single monotonic sequence across bucket
//! files; the sequence index is derived from the cached per-file row
//! counts (cumulative `.md2` lengths), so rowid `n` maps to one file and
//! one in-file slot without scanning. `first`/`last`/`next`/`prev`
//! address by position; `find` walks positions through the matcher with
//! early termination.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde_json::Value;

use crate::codec::{MetaRecord, META_RECORD_SIZE};
use crate::error::{Result, TrError};
use crate::fdcache::{FdCache, FdKey, FdMode};
use crate::matcher::{MatchCond, RecordKey};
use crate::rangecache::{KeyRange, DATA_EXTENSION, MD_EXTENSION};

/// Scan direction for `find`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending rowid.
    Forward,
    /// Descending rowid.
    Backward,
}

/// Reader over one key's metadata sequence.
///
/// Borrows the topic's cached [`KeyRange`] for the sequence index and the
/// shared descriptor cache for file access.
pub struct KeyReader<'a> {
    topic: &'a str,
    key: &'a RecordKey,
    key_dir: PathBuf,
    range: &'a KeyRange,
    fds: &'a mut FdCache,
    rpermission: u32,
}

impl<'a> KeyReader<'a> {
    /// Creates a reader for one key partition.
    pub fn new(
        topic: &'a str,
        key: &'a RecordKey,
        key_dir: PathBuf,
        range: &'a KeyRange,
        fds: &'a mut FdCache,
        rpermission: u32,
    ) -> Self {
        Self {
            topic,
            key,
            key_dir,
            range,
            fds,
            rpermission,
        }
    }

    /// Total records under the key.
    pub fn rows(&self) -> u64 {
        self.range.rows
    }

    /// Maps a rowid to its bucket file and in-file slot.
    fn locate(&self, rowid: i64) -> Result<(String, u64)> {
        if rowid < 0 {
            return Err(TrError::NotFound(format!(
                "rowid {} out of range for key {:?}",
                rowid, self.key
            )));
        }
        let mut remaining = rowid as u64;
        for file in &self.range.files {
            if remaining < file.rows {
                return Ok((file.name.clone(), remaining));
            }
            remaining -= file.rows;
        }
        Err(TrError::NotFound(format!(
            "rowid {} out of range for key {:?} ({} rows)",
            rowid, self.key, self.range.rows
        )))
    }

    /// Reads the metadata record at a rowid.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` if the rowid is out of range, `TrError::Io` on
    /// read failure.
    pub fn read_meta(&mut self, rowid: i64) -> Result<MetaRecord> {
        let (bucket, slot) = self.locate(rowid)?;
        let file_name = format!("{}.{}", bucket, MD_EXTENSION);
        let path = self.key_dir.join(&file_name);
        let fd = self.fds.get(
            FdKey::new(self.topic, &self.key.dir_name(), &file_name, FdMode::Read),
            &path,
            false,
            self.rpermission,
        )?;
        fd.seek(SeekFrom::Start(slot * META_RECORD_SIZE))?;
        MetaRecord::read_from(fd)
    }

    /// Rewrites the metadata record at a rowid in place.
    ///
    /// This is the only permitted mutation of written data: flipping the
    /// delete bits or the user flag of one existing 32-byte record.
    ///
    /// # Errors
    ///
    /// `TrError::NotFound` if the rowid is out of range, `TrError::Io` on
    /// write failure.
    pub fn rewrite_meta(&mut self, rowid: i64, meta: &MetaRecord) -> Result<()> {
        let (bucket, slot) = self.locate(rowid)?;
        let file_name = format!("{}.{}", bucket, MD_EXTENSION);
        let path = self.key_dir.join(&file_name);
        let fd = self.fds.get(
            FdKey::new(self.topic, &self.key.dir_name(), &file_name, FdMode::Write),
            &path,
            false,
            self.rpermission,
        )?;
        fd.seek(SeekFrom::Start(slot * META_RECORD_SIZE))?;
        fd.write_all(&meta.encode())?;
        fd.flush()?;
        Ok(())
    }

    /// Reads the content record a metadata record points at.
    ///
    /// Returns `None` for records persisted without content
    /// (`no_record_disk`).
    ///
    /// # Errors
    ///
    /// `TrError::Corruption` on a short read, `TrError::Json` if the
    /// stored body does not parse.
    pub fn read_record(&mut self, rowid: i64, meta: &MetaRecord) -> Result<Option<Value>> {
        if meta.size == 0 {
            return Ok(None);
        }
        let (bucket, _) = self.locate(rowid)?;
        let file_name = format!("{}.{}", bucket, DATA_EXTENSION);
        let path = self.key_dir.join(&file_name);
        let fd = self.fds.get(
            FdKey::new(self.topic, &self.key.dir_name(), &file_name, FdMode::Read),
            &path,
            false,
            self.rpermission,
        )?;
        fd.seek(SeekFrom::Start(meta.offset))?;
        let mut buf = vec![0u8; meta.size as usize];
        fd.read_exact(&mut buf).map_err(|_| TrError::Corruption {
            file: path.clone(),
            detail: format!(
                "short read of {} bytes at offset {}",
                meta.size, meta.offset
            ),
        })?;
        // Stored form is compact JSON plus a terminating NUL.
        let body = match buf.split_last() {
            Some((0, body)) => body,
            _ => {
                return Err(TrError::Corruption {
                    file: path,
                    detail: "record missing NUL terminator".into(),
                })
            }
        };
        Ok(Some(serde_json::from_slice(body)?))
    }

    /// First record under the key, if any.
    pub fn first(&mut self) -> Result<Option<(i64, MetaRecord)>> {
        if self.range.rows == 0 {
            return Ok(None);
        }
        Ok(Some((0, self.read_meta(0)?)))
    }

    /// Last record under the key, if any.
    pub fn last(&mut self) -> Result<Option<(i64, MetaRecord)>> {
        if self.range.rows == 0 {
            return Ok(None);
        }
        let rowid = self.range.rows as i64 - 1;
        Ok(Some((rowid, self.read_meta(rowid)?)))
    }

    /// Record after `rowid`, if any.
    pub fn next(&mut self, rowid: i64) -> Result<Option<(i64, MetaRecord)>> {
        let next = rowid + 1;
        if next >= self.range.rows as i64 {
            return Ok(None);
        }
        Ok(Some((next, self.read_meta(next)?)))
    }

    /// Record before `rowid`, if any.
    pub fn prev(&mut self, rowid: i64) -> Result<Option<(i64, MetaRecord)>> {
        if rowid <= 0 || rowid > self.range.rows as i64 {
            return Ok(None);
        }
        let prev = rowid - 1;
        Ok(Some((prev, self.read_meta(prev)?)))
    }

    /// First record satisfying `cond`, walking from `start` (or the
    /// sequence end matching `direction`) until a match, the sequence end,
    /// or the condition's termination signal.
    ///
    /// # Errors
    ///
    /// Propagates read failures.
    pub fn find(
        &mut self,
        cond: &MatchCond,
        direction: Direction,
        start: Option<i64>,
    ) -> Result<Option<(i64, MetaRecord)>> {
        if self.range.rows == 0 {
            return Ok(None);
        }
        let last = self.range.rows as i64 - 1;
        let mut rowid = match (start, direction) {
            // A start past the sequence end in the scan direction means the
            // previous find consumed the last candidate.
            (Some(r), Direction::Forward) => {
                if r > last {
                    return Ok(None);
                }
                r.max(0)
            }
            (Some(r), Direction::Backward) => {
                if r < 0 {
                    return Ok(None);
                }
                r.min(last)
            }
            (None, Direction::Forward) => 0,
            (None, Direction::Backward) => last,
        };
        let bounds = self.range.scan_bounds();

        loop {
            let meta = self.read_meta(rowid)?;
            let out = cond.eval(self.key, rowid, &bounds, &meta);
            if out.matched {
                return Ok(Some((rowid, meta)));
            }
            match direction {
                Direction::Forward => {
                    if out.end_forward || rowid >= last {
                        return Ok(None);
                    }
                    rowid += 1;
                }
                Direction::Backward => {
                    if out.end_backward || rowid == 0 {
                        return Ok(None);
                    }
                    rowid -= 1;
                }
            }
        }
    }
}
