//! # Keydir Configuration Constants
//!
//! This module centralizes the constants that shape the page table and the
//! record layout. Constants that depend on each other are co-located and the
//! dependencies are enforced with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> ENTRY_ALIGN (8 bytes)
//!       │     Records are padded to this boundary. Because PAGE_SIZE is a
//!       │     multiple of ENTRY_ALIGN, no fixed-width header field can
//!       │     straddle a page boundary; only key bytes can.
//!       │
//!       └─> Swap file geometry
//!             The swap file is always a whole number of pages and every
//!             page is mapped as its own PAGE_SIZE-long view.
//!
//! FREE_LIST_STRIDE (16)
//!       │
//!       └─> Order in which resident pages are threaded onto the free list
//!           at startup. Striding spreads consecutive allocations across the
//!           page array so neighboring chains do not share cache lines.
//!
//! SCAN_INLINE_PAGES (8)
//!       │
//!       └─> Inline capacity of the scan iterator's locked-page vector.
//!           Chains longer than this spill the vector to the heap.
//! ```
//!
//! ## Sentinels
//!
//! The index space and the record format reserve their maximum values as
//! "none" markers: `MAX_PAGE_IDX` for page links, `MAX_EPOCH` for an
//! unbounded snapshot, `MAX_OFFSET` for tombstones, and `MAX_FILE_ID` for
//! the synthetic file id carried by tombstone records.

/// Size of every page, resident or swapped, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Records are padded so each starts on this boundary.
pub const ENTRY_ALIGN: usize = 8;

/// Step used when threading resident pages onto the startup free list.
pub const FREE_LIST_STRIDE: u32 = 16;

/// Inline capacity of the scan iterator's locked-page vector.
pub const SCAN_INLINE_PAGES: usize = 8;

/// Page-link sentinel meaning "no page".
pub const MAX_PAGE_IDX: u32 = u32::MAX;

/// Epoch sentinel meaning "no bound"; reads at this epoch see the latest
/// version of every key.
pub const MAX_EPOCH: u64 = u64::MAX;

/// Offset sentinel marking a record as a tombstone.
pub const MAX_OFFSET: u64 = u64::MAX;

/// Synthetic file id stored in tombstone version records.
pub const MAX_FILE_ID: u32 = u32::MAX;

/// Name of the swap file created under the keydir's base directory.
pub const SWAP_FILE_NAME: &str = "bitcask.swap";

/// Seed for the key hash that selects a base page.
pub const HASH_SEED: u32 = 42;

const _: () = assert!(
    PAGE_SIZE % ENTRY_ALIGN == 0,
    "PAGE_SIZE must be a multiple of ENTRY_ALIGN so fixed-width header fields never straddle pages"
);

const _: () = assert!(
    PAGE_SIZE.is_power_of_two(),
    "PAGE_SIZE must be a power of two; chain offsets are split with shifts and masks"
);

const _: () = assert!(FREE_LIST_STRIDE > 0, "free list stride cannot be zero");
