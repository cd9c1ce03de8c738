//! # Page Structure
//!
//! Every page in the directory, resident or swapped, is a 4 KiB buffer
//! plus chain metadata. Pages live in a single index space: indices below
//! the resident pool size name resident pages, everything above names swap
//! pages.
//!
//! ## Locking Model
//!
//! Chain metadata and page bytes are guarded by a per-page
//! `parking_lot::Mutex`. The two free-list fields sit outside the mutex:
//! `next_free` and `is_free` are atomics manipulated by the lock-free
//! free-list pops and pushes. The handshake between the two worlds is
//! narrow: an allocator that wins the head CAS still locks the page and
//! re-checks `is_free` before taking ownership, and a release sets
//! `is_free` before splicing the page back onto the list.
//!
//! ## Chain-Head Fields
//!
//! `size`, `alt_idx`, `dead_bytes`, and `is_borrowed` are only meaningful on
//! the page currently heading a chain (normally the hash-slot base page, or
//! the alternate swap page once a slot has spilled). Overflow pages carry
//! them along untouched.

use std::sync::atomic::{AtomicBool, AtomicU32};

use memmap2::MmapMut;
use parking_lot::{Mutex, MutexGuard};

use crate::config::{MAX_PAGE_IDX, PAGE_SIZE};

/// Backing storage for one page.
pub(crate) enum PageData {
    /// Heap buffer owned by the resident pool.
    Resident(Box<[u8; PAGE_SIZE]>),
    /// A 4 KiB shared mapping of the swap file.
    Swapped(MmapMut),
}

impl PageData {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            PageData::Resident(buf) => &buf[..],
            PageData::Swapped(map) => &map[..],
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            PageData::Resident(buf) => &mut buf[..],
            PageData::Swapped(map) => &mut map[..],
        }
    }
}

/// Mutex-guarded portion of a page: the buffer, the chain links, and the
/// chain-head metadata.
pub(crate) struct PageCore {
    pub prev: u32,
    pub next: u32,
    /// Bytes occupied by the chain rooted at this page; zero when the slot
    /// is idle.
    pub size: u32,
    /// Swap-relative index of the page serving as this slot's chain head
    /// once the slot has spilled; `MAX_PAGE_IDX` otherwise.
    pub alt_idx: u32,
    /// Bytes owned by superseded versions, maintained by compaction.
    pub dead_bytes: u32,
    /// Set while the page is lent to another slot's chain as overflow.
    pub is_borrowed: bool,
    data: PageData,
}

impl PageCore {
    pub(crate) fn data(&self) -> &[u8] {
        self.data.bytes()
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.data.bytes_mut()
    }
}

pub(crate) struct Page {
    core: Mutex<PageCore>,
    /// Successor in the free list; only meaningful while the page is free.
    pub next_free: AtomicU32,
    /// True while the page is reachable from a free-list head.
    pub is_free: AtomicBool,
}

impl Page {
    pub(crate) fn new(data: PageData) -> Self {
        Self {
            core: Mutex::new(PageCore {
                prev: MAX_PAGE_IDX,
                next: MAX_PAGE_IDX,
                size: 0,
                alt_idx: MAX_PAGE_IDX,
                dead_bytes: 0,
                is_borrowed: false,
                data,
            }),
            next_free: AtomicU32::new(MAX_PAGE_IDX),
            is_free: AtomicBool::new(true),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PageCore> {
        self.core.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, PageCore>> {
        self.core.try_lock()
    }
}
