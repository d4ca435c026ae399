//! Fixed-size metadata record codec and topic system flags.
//!
//! Every content record appended to a topic is paired with one 32-byte
//! metadata record in the partition's `.md2` file:
//!
//! ```text
//! offset  size  field
//! 0x00    8     t      (u64 BE; bit 63 soft-deleted, bit 62 hard-deleted)
//! 0x08    8     tm     (u64 BE)
//! 0x10    8     offset (u64 BE; byte offset of the record in the data file)
//! 0x18    8     size   (u64 BE; high 32 bits user_flag, low 32 bits size)
//! ```
//!
//! `t` is the content timestamp (seconds or milliseconds per topic flags),
//! `tm` the message timestamp parsed from the topic's `tkey` field. Appends
//! only grow `.md2` files; the single permitted mutation is an in-place
//! rewrite of one record at its existing offset to flip delete bits or the
//! user flag.

use std::io::{Read, Write};

use crate::error::{Result, TrError};

/// Size of one metadata record on disk, in bytes.
pub const META_RECORD_SIZE: u64 = 32;

/// Bit marking a soft-deleted record in the on-disk `t` word.
const SOFT_DELETED_BIT: u64 = 1 << 63;

/// Bit marking a hard-deleted record in the on-disk `t` word.
const HARD_DELETED_BIT: u64 = 1 << 62;

/// Mask selecting the timestamp portion of the on-disk `t` word.
const T_MASK: u64 = (1 << 62) - 1;

/// Deletion state of a record, stored in the top bits of the `t` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    /// Normal, visible record.
    #[default]
    Live,
    /// Soft-deleted: hidden from scans unless a filter opts in.
    SoftDeleted,
    /// Hard-deleted: never visible again.
    HardDeleted,
}

/// One decoded metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetaRecord {
    /// Content timestamp (seconds or milliseconds per topic flags).
    pub t: u64,
    /// Message timestamp parsed from the topic's `tkey` field, 0 if absent.
    pub tm: u64,
    /// Byte offset of the content record in the paired data file.
    pub offset: u64,
    /// Size of the content record in bytes, including the NUL terminator.
    pub size: u32,
    /// Opaque caller-owned 32-bit tag.
    pub user_flag: u32,
    /// Deletion state.
    pub state: RecordState,
}

impl MetaRecord {
    /// Creates a live metadata record.
    pub fn new(t: u64, tm: u64, offset: u64, size: u32) -> Self {
        Self {
            t,
            tm,
            offset,
            size,
            user_flag: 0,
            state: RecordState::Live,
        }
    }

    /// Encodes the record into its 32-byte on-disk form, network byte order.
    pub fn encode(&self) -> [u8; META_RECORD_SIZE as usize] {
        let mut word0 = self.t & T_MASK;
        match self.state {
            RecordState::Live => {}
            RecordState::SoftDeleted => word0 |= SOFT_DELETED_BIT,
            RecordState::HardDeleted => word0 |= HARD_DELETED_BIT,
        }
        let word3 = (u64::from(self.user_flag) << 32) | u64::from(self.size);

        let mut buf = [0u8; META_RECORD_SIZE as usize];
        buf[0..8].copy_from_slice(&word0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tm.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..32].copy_from_slice(&word3.to_be_bytes());
        buf
    }

    /// Decodes a record from its 32-byte on-disk form.
    pub fn decode(buf: &[u8; META_RECORD_SIZE as usize]) -> Self {
        fn word(buf: &[u8; META_RECORD_SIZE as usize], i: usize) -> u64 {
            let mut w = [0u8; 8];
            w.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_be_bytes(w)
        }
        let word0 = word(buf, 0);
        let tm = word(buf, 1);
        let offset = word(buf, 2);
        let word3 = word(buf, 3);

        let state = if word0 & HARD_DELETED_BIT != 0 {
            RecordState::HardDeleted
        } else if word0 & SOFT_DELETED_BIT != 0 {
            RecordState::SoftDeleted
        } else {
            RecordState::Live
        };

        Self {
            t: word0 & T_MASK,
            tm,
            offset,
            size: (word3 & 0xFFFF_FFFF) as u32,
            user_flag: (word3 >> 32) as u32,
            state,
        }
    }

    /// Writes the record to a writer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads one record from a reader.
    ///
    /// # Errors
    ///
    /// Returns `TrError::Io` on a short read.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; META_RECORD_SIZE as usize];
        reader.read_exact(&mut buf)?;
        Ok(Self::decode(&buf))
    }

    /// Returns true if the record is neither soft- nor hard-deleted.
    pub fn is_live(&self) -> bool {
        self.state == RecordState::Live
    }
}

/// Validates that a metadata file length holds whole records.
///
/// # Errors
///
/// Returns `TrError::Corruption` if `len` is not a multiple of the record
/// size.
pub fn check_md_file_len(path: &std::path::Path, len: u64) -> Result<u64> {
    if len % META_RECORD_SIZE != 0 {
        return Err(TrError::Corruption {
            file: path.to_path_buf(),
            detail: format!(
                "metadata file length {} is not a multiple of {}",
                len, META_RECORD_SIZE
            ),
        });
    }
    Ok(len / META_RECORD_SIZE)
}

/// Per-topic behavior bits, persisted in `topic_desc.json`.
///
/// The key-type pair (`STRING_KEY`/`INT_KEY`) is auto-derived at topic
/// creation from whether `pkey` names a field; the rest are caller options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SystemFlags(pub u32);

impl SystemFlags {
    /// Partition keys are strings.
    pub const STRING_KEY: u32 = 1 << 0;
    /// Partition keys are positive integers.
    pub const INT_KEY: u32 = 1 << 1;
    /// Placeholder: compress record content (not applied end-to-end).
    pub const ZIP_RECORD: u32 = 1 << 2;
    /// Placeholder: encrypt record content (not applied end-to-end).
    pub const CIPHER_RECORD: u32 = 1 << 3;
    /// Duplicate the metadata fields inside the stored record body.
    pub const SAVE_MD_IN_RECORD: u32 = 1 << 4;
    /// `t` carries milliseconds instead of seconds.
    pub const T_MS: u32 = 1 << 5;
    /// `tm` carries milliseconds instead of seconds.
    pub const TM_MS: u32 = 1 << 6;
    /// Suppress content persistence; only metadata is written.
    pub const NO_RECORD_DISK: u32 = 1 << 7;
    /// Transient: set while a topic is being loaded from disk.
    pub const LOADING_FROM_DISK: u32 = 1 << 8;

    /// Returns true if the given bit(s) are all set.
    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    /// Sets the given bit(s).
    pub fn set(&mut self, bits: u32) {
        self.0 |= bits;
    }

    /// Clears the given bit(s).
    pub fn clear(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    /// Returns true if partition keys are strings.
    pub fn string_key(&self) -> bool {
        self.contains(Self::STRING_KEY)
    }

    /// Returns true if partition keys are integers.
    pub fn int_key(&self) -> bool {
        self.contains(Self::INT_KEY)
    }
}
