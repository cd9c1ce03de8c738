//! # Record Layout
//!
//! Every key in the directory is described by one or more fixed-header
//! records stored in the byte stream of a page chain. The 36-byte header is
//! little-endian and is followed by the key bytes on the first record of a
//! key only; version records reuse the key of the first record and store
//! `key_size = 0`.
//!
//! ## Header Layout (36 bytes)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ----------------------------------------
//! 0       4     file_id     Data file holding the value
//! 4       4     total_size  On-disk record size in bytes
//! 8       8     epoch       Mutation epoch stamped by the keydir
//! 16      8     offset      Byte offset in the data file (MAX = tombstone)
//! 24      4     timestamp   Caller-supplied record timestamp
//! 28      4     next        Chain offset of the next older/newer version
//! 32      4     key_size    Key length; zero on version records
//! ```
//!
//! Records are padded to an 8-byte boundary, so a header's fixed-width
//! fields always land inside a single page; only the key bytes may straddle
//! page boundaries. The scan layer gathers and scatters the header through
//! page-aware copies, so nothing here assumes the 36 bytes are contiguous
//! in memory.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{ENTRY_ALIGN, MAX_FILE_ID, MAX_OFFSET};

/// Fixed portion of every record, before the optional key bytes.
pub(crate) const ENTRY_HEADER_SIZE: usize = size_of::<EntryHeader>();

const _: () = assert!(ENTRY_HEADER_SIZE == 36, "record header layout is frozen at 36 bytes");

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub(crate) struct EntryHeader {
    file_id: U32,
    total_size: U32,
    epoch: U64,
    offset: U64,
    timestamp: U32,
    next: U32,
    key_size: U32,
}

impl EntryHeader {
    /// Header for the first record of a key: carries the key and starts a
    /// fresh version list.
    pub(crate) fn first(entry: &KeydirEntry, epoch: u64, key_size: u32) -> Self {
        Self {
            file_id: U32::new(entry.file_id),
            total_size: U32::new(entry.total_size),
            epoch: U64::new(epoch),
            offset: U64::new(entry.offset),
            timestamp: U32::new(entry.timestamp),
            next: U32::new(0),
            key_size: U32::new(key_size),
        }
    }

    /// Header for an appended version record; the key lives on the first
    /// record, so `key_size` is zero.
    pub(crate) fn version(entry: &KeydirEntry, epoch: u64) -> Self {
        Self::first(entry, epoch, 0)
    }

    /// Tombstone version record: synthetic file id, sentinel offset, no
    /// payload.
    pub(crate) fn tombstone(epoch: u64) -> Self {
        Self {
            file_id: U32::new(MAX_FILE_ID),
            total_size: U32::new(0),
            epoch: U64::new(epoch),
            offset: U64::new(MAX_OFFSET),
            timestamp: U32::new(0),
            next: U32::new(0),
            key_size: U32::new(0),
        }
    }

    pub(crate) fn file_id(&self) -> u32 {
        self.file_id.get()
    }

    pub(crate) fn set_file_id(&mut self, val: u32) {
        self.file_id = U32::new(val);
    }

    pub(crate) fn total_size(&self) -> u32 {
        self.total_size.get()
    }

    pub(crate) fn set_total_size(&mut self, val: u32) {
        self.total_size = U32::new(val);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub(crate) fn set_epoch(&mut self, val: u64) {
        self.epoch = U64::new(val);
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset.get()
    }

    pub(crate) fn set_offset(&mut self, val: u64) {
        self.offset = U64::new(val);
    }

    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp.get()
    }

    pub(crate) fn set_timestamp(&mut self, val: u32) {
        self.timestamp = U32::new(val);
    }

    pub(crate) fn next(&self) -> u32 {
        self.next.get()
    }

    pub(crate) fn set_next(&mut self, val: u32) {
        self.next = U32::new(val);
    }

    pub(crate) fn key_size(&self) -> u32 {
        self.key_size.get()
    }
}

/// Padded size in the chain byte stream of a record with a `key_size`-byte
/// key. Computed in `u64` so sizes near the 4 GiB chain limit do not wrap;
/// the caller decides whether the result still fits the chain.
pub(crate) fn padded_entry_size(key_size: u32) -> u64 {
    let unpadded = ENTRY_HEADER_SIZE as u64 + key_size as u64;
    (unpadded + (ENTRY_ALIGN as u64 - 1)) & !(ENTRY_ALIGN as u64 - 1)
}

/// The location of one version of one key, as stored in and returned by the
/// directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeydirEntry {
    pub file_id: u32,
    pub total_size: u32,
    pub offset: u64,
    pub timestamp: u32,
    /// Stamped by the keydir on `put`; callers only read it back.
    pub epoch: u64,
}

impl KeydirEntry {
    pub(crate) fn from_header(header: &EntryHeader) -> Self {
        Self {
            file_id: header.file_id(),
            total_size: header.total_size(),
            offset: header.offset(),
            timestamp: header.timestamp(),
            epoch: header.epoch(),
        }
    }

    /// True when this version marks the key as deleted.
    pub fn is_tombstone(&self) -> bool {
        self.offset == MAX_OFFSET
    }
}
