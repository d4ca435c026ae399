//! Bounded LRU cache of open file descriptors.
//!
//! Descriptors are keyed by `(topic, key, file, mode)`. The cache is bounded
//! two ways: a global capacity evicting least-recently-used entries, and a
//! per-(topic, key) cap of [`MAX_WRITE_FDS_PER_KEY`] write descriptors —
//! exceeding the cap, or hitting OS descriptor exhaustion on open, closes
//! every cached write descriptor for that key and retries the open once.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::fsutil;

/// Maximum write descriptors kept open per (topic, key).
pub const MAX_WRITE_FDS_PER_KEY: usize = 2;

/// Default overall descriptor capacity.
pub const DEFAULT_FD_CAPACITY: usize = 64;

/// Open mode of a cached descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FdMode {
    /// Read-only.
    Read,
    /// Read-write (appends and in-place metadata rewrites).
    Write,
}

/// Identity of one cached descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FdKey {
    /// Topic name.
    pub topic: String,
    /// Partition key directory name.
    pub key: String,
    /// Bucket file name, extension included.
    pub file: String,
    /// Open mode.
    pub mode: FdMode,
}

impl FdKey {
    /// Creates a descriptor key.
    pub fn new(topic: &str, key: &str, file: &str, mode: FdMode) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.to_string(),
            file: file.to_string(),
            mode,
        }
    }
}

struct FdEntry {
    file: File,
    last_used: u64,
}

/// Bounded LRU descriptor cache.
pub struct FdCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<FdKey, FdEntry>,
}

impl FdCache {
    /// Creates a cache bounded to `capacity` open descriptors.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::new(),
        }
    }

    /// Number of currently cached descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no descriptors are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a cached descriptor, opening (and optionally creating) the
    /// file on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened after the forced-close
    /// retry.
    pub fn get(
        &mut self,
        key: FdKey,
        path: &Path,
        create: bool,
        mode_bits: u32,
    ) -> Result<&mut File> {
        self.clock += 1;
        let clock = self.clock;

        if self.entries.contains_key(&key) {
            let entry = self.entries.get_mut(&key).unwrap();
            entry.last_used = clock;
            return Ok(&mut entry.file);
        }

        if key.mode == FdMode::Write && self.write_fds_for_key(&key.topic, &key.key) >= MAX_WRITE_FDS_PER_KEY
        {
            debug!(
                topic = %key.topic,
                key = %key.key,
                "write descriptor cap reached, closing cached write fds"
            );
            self.close_key_writes(&key.topic, &key.key);
        }

        let file = match open_file(path, key.mode, create, mode_bits) {
            Ok(f) => f,
            Err(crate::error::TrError::Io(ref e)) if fsutil::is_fd_exhaustion(e) => {
                warn!(
                    topic = %key.topic,
                    key = %key.key,
                    "descriptor exhaustion, closing cached write fds and retrying"
                );
                self.close_key_writes(&key.topic, &key.key);
                open_file(path, key.mode, create, mode_bits)?
            }
            Err(e) => return Err(e),
        };

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        let entry = self.entries.entry(key).or_insert(FdEntry {
            file,
            last_used: clock,
        });
        Ok(&mut entry.file)
    }

    /// Closes every descriptor belonging to a topic.
    pub fn close_topic(&mut self, topic: &str) {
        self.entries.retain(|k, _| k.topic != topic);
    }

    /// Closes every cached write descriptor for one (topic, key).
    pub fn close_key_writes(&mut self, topic: &str, key: &str) {
        self.entries
            .retain(|k, _| !(k.topic == topic && k.key == key && k.mode == FdMode::Write));
    }

    /// Closes every cached descriptor.
    pub fn close_all(&mut self) {
        self.entries.clear();
    }

    fn write_fds_for_key(&self, topic: &str, key: &str) -> usize {
        self.entries
            .keys()
            .filter(|k| k.topic == topic && k.key == key && k.mode == FdMode::Write)
            .count()
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        {
            debug!(file = %victim.file, "evicting least recently used descriptor");
            self.entries.remove(&victim);
        }
    }
}

fn open_file(path: &Path, mode: FdMode, create: bool, mode_bits: u32) -> Result<File> {
    let file = match mode {
        FdMode::Read => OpenOptions::new().read(true).open(path)?,
        FdMode::Write => {
            let existed = path.exists();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(path)?;
            if !existed {
                fsutil::set_mode(path, mode_bits)?;
            }
            file
        }
    };
    Ok(file)
}
