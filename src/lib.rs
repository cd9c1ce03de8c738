//! # caskdir: Paged, Epoch-Versioned Key Directory
//!
//! The hot, concurrent index of a log-structured key/value store in the
//! Bitcask family. Every read, write, and delete goes through this
//! directory: it maps a variable-length key to the location of its most
//! recent record in the append-only data files (file id, offset, record
//! size, timestamp), and keeps older versions indexed by epoch so
//! concurrent scans read a consistent snapshot while writers continue.
//!
//! ## Quick Start
//!
//! ```ignore
//! use caskdir::{Keydir, KeydirEntry, KeydirOptions, MAX_EPOCH};
//!
//! let keydir = Keydir::open("./data", &KeydirOptions::default())?;
//!
//! keydir.put(
//!     b"hello",
//!     KeydirEntry { file_id: 7, total_size: 42, offset: 100, timestamp: 1000, epoch: 0 },
//!     None,
//! );
//! let entry = keydir.get(b"hello", MAX_EPOCH).unwrap();
//! assert_eq!(entry.offset, 100);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     Public API (get / put / remove)      │
//! ├──────────────────────────────────────────┤
//! │  Chain scan iterator (locked page spans) │
//! ├──────────────────────────────────────────┤
//! │   Record codec (36-byte headers + keys)  │
//! ├─────────────────────┬────────────────────┤
//! │  Resident page pool │  Swap-file manager │
//! │  (lock-free free    │  (mmap per page,   │
//! │   list, 4 KiB pages)│   doubling growth) │
//! └─────────────────────┴────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Parallel OS threads, per-page mutexes taken in chain order, lock-free
//! free lists for page allocation, and a global epoch counter ordering all
//! mutations. Operations are per-key atomic; there is no cross-key
//! ordering beyond what the epochs imply.
//!
//! ## Durability
//!
//! None, by design. The directory is rebuilt from the data files at
//! startup; the swap file is a private paging area that is truncated on
//! open and on drop.
//!
//! ## Module Overview
//!
//! - `keydir`: the directory handle and its operations
//! - `pool`: resident pages and their lock-free free list
//! - `swap`: the mmap-backed swap file
//! - `scan`: chain traversal over locked page spans
//! - `entry`: record layout
//! - `fstats`: per-data-file counters

mod config;
mod entry;
mod fstats;
mod keydir;
mod page;
mod pool;
mod scan;
mod swap;

pub use config::{MAX_EPOCH, MAX_FILE_ID, MAX_OFFSET, MAX_PAGE_IDX, PAGE_SIZE};
pub use entry::KeydirEntry;
pub use fstats::FileStats;
pub use keydir::{Keydir, KeydirOptions, PutOutcome};
