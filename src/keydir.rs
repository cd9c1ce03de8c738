//! # Keydir
//!
//! The in-memory key directory of a log-structured key/value store. It maps
//! each key to the location of its most recent record in the append-only
//! data files, and keeps enough older versions around for concurrent scans
//! to read a consistent snapshot while writers keep mutating.
//!
//! ## Layout
//!
//! The directory is a page-granular hash table. Hashing a key selects a
//! base page from the resident pool; all records whose keys hash there live
//! in the chain rooted at that page. Chains grow by linking further pages:
//! idle resident pages first, swap-backed pages once the pool is dry.
//!
//! ```text
//!  hash(key) % N
//!        │
//!        ▼
//!  ┌───────────┐    next    ┌───────────┐    next    ┌───────────┐
//!  │ base page ├───────────>│ overflow  ├───────────>│ swap page │
//!  │ (chain    │<───────────┤ (borrowed)│<───────────┤           │
//!  │  head)    │    prev    └───────────┘    prev    └───────────┘
//!  └───────────┘
//!        records tile the concatenated bytes of the chain
//! ```
//!
//! ## Versions and Epochs
//!
//! Every mutation draws a fresh epoch from a global counter before it
//! touches the chain. While no snapshot is outstanding (`min_epoch` above
//! the writer's epoch), an update overwrites the current version in place.
//! Otherwise the old version must stay readable: the update appends a
//! version record at the end of the chain and links it from the version it
//! supersedes. Version links therefore run oldest to newest, and an
//! epoch-bounded read walks them to the last version at or below its
//! snapshot epoch.
//!
//! ## Locking
//!
//! Page mutexes are always taken in chain order. The one deliberate
//! exception is reclaiming a borrowed base page, which needs the page's
//! predecessor: the predecessor is try-locked first, and on contention the
//! base is released, both are retaken in order, and the chain is
//! re-validated before continuing. Operations restart from the top when
//! such a re-validation fails; restarts are invisible to callers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result};
use parking_lot::MutexGuard;

use crate::config::{
    HASH_SEED, MAX_EPOCH, MAX_OFFSET, MAX_PAGE_IDX, PAGE_SIZE,
};
use crate::entry::{padded_entry_size, EntryHeader, KeydirEntry, ENTRY_HEADER_SIZE};
use crate::fstats::{FileStats, FstatsTable};
use crate::page::{Page, PageCore};
use crate::pool::PagePool;
use crate::scan::{PageSlot, ScanIter};
use crate::swap::SwapFile;

/// Sizing and placement knobs for a directory.
#[derive(Debug, Clone)]
pub struct KeydirOptions {
    /// Number of resident pages, which is also the number of hash slots.
    pub num_pages: u32,
    /// Pages the swap file starts with; it doubles on demand.
    pub initial_swap_pages: u32,
    /// Remove the swap file's directory entry right after creating it. The
    /// open descriptor keeps the backing store alive.
    pub unlink_swap_file: bool,
}

impl Default for KeydirOptions {
    fn default() -> Self {
        Self {
            num_pages: 1024,
            initial_swap_pages: 64,
            unlink_swap_file: false,
        }
    }
}

/// Result of a `put` or `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The mutation is visible to reads at or above the returned epoch.
    Stored(u64),
    /// The compare-and-set precondition did not match the current version;
    /// nothing was changed.
    Modified,
    /// No page could be allocated; nothing was changed.
    OutOfMemory,
}

/// Internal verdicts of chain preparation; `Restart` re-runs the operation
/// with a fresh epoch and is never visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePrepError {
    Restart,
    NoMem,
}

pub struct Keydir {
    pool: PagePool,
    swap: SwapFile,
    epoch: AtomicU64,
    /// Lower bound of epochs still needed by outstanding snapshot readers.
    /// Maintained by the snapshot side; mutations only read it.
    min_epoch: AtomicU64,
    fstats: FstatsTable,
}

impl Keydir {
    /// Opens a directory with `options.num_pages` hash slots and a fresh
    /// swap file under `basedir`.
    pub fn open(basedir: impl AsRef<Path>, options: &KeydirOptions) -> Result<Self> {
        let basedir = basedir.as_ref();
        ensure!(options.num_pages > 0, "keydir needs at least one page");

        let pool = PagePool::new(options.num_pages);
        let swap = SwapFile::create(basedir, options.initial_swap_pages, options.unlink_swap_file)?;

        tracing::debug!(
            basedir = %basedir.display(),
            num_pages = options.num_pages,
            initial_swap_pages = options.initial_swap_pages,
            "opened keydir"
        );

        Ok(Self {
            pool,
            swap,
            epoch: AtomicU64::new(0),
            min_epoch: AtomicU64::new(MAX_EPOCH),
            fstats: FstatsTable::new(),
        })
    }

    /// Looks up `key` as of `epoch` (`MAX_EPOCH` reads the latest version).
    /// Returns `None` when the key has no version at or below the epoch, or
    /// when that version is a tombstone.
    pub fn get(&self, key: &[u8], epoch: u64) -> Option<KeydirEntry> {
        assert!(!key.is_empty(), "keydir keys must be non-empty");

        let iter = self.scan_for_key(key, epoch).ok()?;
        if !iter.found {
            return None;
        }

        let entry = KeydirEntry::from_header(&iter.header());
        drop(iter);

        if entry.is_tombstone() {
            None
        } else {
            Some(entry)
        }
    }

    /// Inserts or updates `key`. When `old` is given the operation is a
    /// compare-and-set: it succeeds only while the current version still
    /// carries that `(file_id, offset)` pair. The stored epoch is stamped
    /// by the directory and returned in the outcome.
    pub fn put(&self, key: &[u8], entry: KeydirEntry, old: Option<(u32, u64)>) -> PutOutcome {
        assert!(!key.is_empty(), "keydir keys must be non-empty");
        let key_size = match u32::try_from(key.len()) {
            Ok(size) => size,
            Err(_) => return PutOutcome::OutOfMemory,
        };

        loop {
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let mut iter = match self.scan_for_key(key, epoch) {
                Ok(iter) => iter,
                Err(_) => return PutOutcome::OutOfMemory,
            };

            if iter.found {
                let current = iter.header();
                if let Some((old_file_id, old_offset)) = old {
                    if current.file_id() != old_file_id || current.offset() != old_offset {
                        return PutOutcome::Modified;
                    }
                }

                if self.min_epoch.load(Ordering::Acquire) > epoch {
                    // No snapshot can still need the current version.
                    iter.update_header(|header| {
                        header.set_file_id(entry.file_id);
                        header.set_total_size(entry.total_size);
                        header.set_offset(entry.offset);
                        header.set_timestamp(entry.timestamp);
                        header.set_epoch(epoch);
                    });
                } else {
                    match self.write_prep(&mut iter, 0) {
                        Err(WritePrepError::NoMem) => return PutOutcome::OutOfMemory,
                        Err(WritePrepError::Restart) => continue,
                        Ok(append_at) => {
                            iter.update_header(|header| header.set_next(append_at));
                            iter.offset = append_at;
                            iter.write_header(&EntryHeader::version(&entry, epoch));
                            iter.pages[0].guard.dead_bytes +=
                                padded_entry_size(current.key_size()) as u32;
                        }
                    }
                }
            } else if old.is_some() {
                // Conditional write, but the key is gone.
                return PutOutcome::Modified;
            } else {
                match self.write_prep(&mut iter, key_size) {
                    Err(WritePrepError::NoMem) => return PutOutcome::OutOfMemory,
                    Err(WritePrepError::Restart) => continue,
                    Ok(append_at) => {
                        iter.offset = append_at;
                        iter.write_header(&EntryHeader::first(&entry, epoch, key_size));
                        iter.write_key(key);
                    }
                }
            }

            return PutOutcome::Stored(epoch);
        }
    }

    /// Deletes `key` by writing a tombstone, with the same compare-and-set
    /// convention as [`Keydir::put`]. Removing an absent key without a
    /// precondition succeeds without changing state.
    pub fn remove(&self, key: &[u8], old: Option<(u32, u64)>) -> PutOutcome {
        assert!(!key.is_empty(), "keydir keys must be non-empty");

        loop {
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let mut iter = match self.scan_for_key(key, epoch) {
                Ok(iter) => iter,
                Err(_) => return PutOutcome::OutOfMemory,
            };

            if iter.found {
                let current = iter.header();
                if let Some((old_file_id, old_offset)) = old {
                    if current.file_id() != old_file_id || current.offset() != old_offset {
                        return PutOutcome::Modified;
                    }
                }

                if self.min_epoch.load(Ordering::Acquire) > epoch {
                    iter.update_header(|header| {
                        header.set_offset(MAX_OFFSET);
                        header.set_epoch(epoch);
                    });
                } else {
                    match self.write_prep(&mut iter, 0) {
                        Err(WritePrepError::NoMem) => return PutOutcome::OutOfMemory,
                        Err(WritePrepError::Restart) => continue,
                        Ok(append_at) => {
                            iter.update_header(|header| header.set_next(append_at));
                            iter.offset = append_at;
                            iter.write_header(&EntryHeader::tombstone(epoch));
                            iter.pages[0].guard.dead_bytes +=
                                padded_entry_size(current.key_size()) as u32;
                        }
                    }
                }
            } else if old.is_some() {
                return PutOutcome::Modified;
            }

            return PutOutcome::Stored(epoch);
        }
    }

    /// Applies per-file counter deltas. Counters for an unknown file are
    /// created only when `should_create` is set; otherwise the update is
    /// silently dropped, which keeps decrement paths quiet after a file
    /// has been pruned.
    #[allow(clippy::too_many_arguments)]
    pub fn update_fstats(
        &self,
        file_id: u32,
        tstamp: u32,
        expiration_epoch: u64,
        live_keys_delta: i64,
        total_keys_delta: i64,
        live_bytes_delta: i64,
        total_bytes_delta: i64,
        should_create: bool,
    ) {
        self.fstats.update(
            file_id,
            tstamp,
            expiration_epoch,
            live_keys_delta,
            total_keys_delta,
            live_bytes_delta,
            total_bytes_delta,
            should_create,
        );
    }

    /// Current counters for one data file, if any were ever recorded.
    pub fn fstats(&self, file_id: u32) -> Option<FileStats> {
        self.fstats.get(file_id)
    }

    /// Epoch of the most recent mutation.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn min_epoch(&self) -> u64 {
        self.min_epoch.load(Ordering::Acquire)
    }

    /// Publishes the snapshot watermark. Writers stop updating versions in
    /// place whose epochs a snapshot at `epoch` could still observe.
    pub fn set_min_epoch(&self, epoch: u64) {
        self.min_epoch.store(epoch, Ordering::Release);
    }

    /// Number of resident pages (and hash slots).
    pub fn num_pages(&self) -> u32 {
        self.pool.len()
    }

    /// Current number of swap pages; grows in doublings.
    pub fn num_swap_pages(&self) -> u32 {
        self.swap.num_pages()
    }

    /// Current size of the swap file in bytes.
    pub fn swap_file_size(&self) -> u64 {
        self.swap.file_len()
    }

    /// Chain storage accounting, summed over the resident chain heads:
    /// total bytes occupied by records and, of those, bytes owned by
    /// superseded versions. Useful input for merge scheduling.
    pub fn chain_bytes(&self) -> (u64, u64) {
        let mut used = 0u64;
        let mut dead = 0u64;
        for idx in 0..self.pool.len() {
            let core = self.pool.page(idx).lock();
            if core.size > 0 {
                used += core.size as u64;
                dead += core.dead_bytes as u64;
            }
        }
        (used, dead)
    }

    fn base_index(&self, key: &[u8]) -> u32 {
        let mut cursor = std::io::Cursor::new(key);
        // INVARIANT: reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_32(&mut cursor, HASH_SEED).expect("in-memory hash");
        hash % self.pool.len()
    }

    /// Resolves a unified page index: resident pages first, swap pages
    /// above them.
    fn page(&self, idx: u32) -> &Page {
        if idx < self.pool.len() {
            self.pool.page(idx)
        } else {
            self.swap.page(idx - self.pool.len())
        }
    }

    /// Allocates a page for chain growth, preferring the resident pool and
    /// falling back to swap. The page is returned locked.
    fn allocate_page(&self) -> Option<(u32, MutexGuard<'_, PageCore>)> {
        if let Some((idx, guard)) = self.pool.allocate() {
            return Some((idx, guard));
        }
        self.swap
            .allocate()
            .map(|(idx, guard)| (self.pool.len() + idx, guard))
    }

    /// Locks the chain head for `key` and scans for the version closest to
    /// but not above `epoch`. On return the iterator's `found` flag tells
    /// whether such a version exists; if set, the iterator's offset points
    /// at it.
    fn scan_for_key<'k>(&'k self, key: &[u8], epoch: u64) -> Result<ScanIter<'k>, WritePrepError> {
        let base_idx = self.base_index(key);
        let base_guard = self.pool.page(base_idx).lock();

        let head = if base_guard.alt_idx == MAX_PAGE_IDX {
            PageSlot {
                idx: base_idx,
                guard: base_guard,
            }
        } else {
            // The slot spilled: its chain now starts on a swap page. Lock
            // it before letting go of the base so the head cannot move
            // underneath us.
            let alt_global = self.pool.len() + base_guard.alt_idx;
            let alt_guard = self.swap.page(base_guard.alt_idx).lock();
            drop(base_guard);
            PageSlot {
                idx: alt_global,
                guard: alt_guard,
            }
        };

        let mut iter = ScanIter::new(head);
        self.scan_pages(&mut iter, key, epoch)?;
        Ok(iter)
    }

    /// Walks the chain record by record looking for `key`.
    fn scan_pages<'k>(
        &'k self,
        iter: &mut ScanIter<'k>,
        key: &[u8],
        epoch: u64,
    ) -> Result<(), WritePrepError> {
        let data_size = iter.pages[0].guard.size;
        if data_size == 0 {
            return Ok(());
        }

        loop {
            let header = self.lock_pages_for_record(iter)?;

            if iter.keys_equal(header.key_size(), key) {
                if header.epoch() > epoch {
                    // Key written after the requested snapshot entirely.
                    return Ok(());
                }
                return self.scan_to_epoch(iter, epoch);
            }

            iter.offset += padded_entry_size(header.key_size()) as u32;
            if iter.offset >= data_size {
                return Ok(());
            }
        }
    }

    /// Follows the version links from the current record to the version
    /// with the largest epoch at or below `epoch`, setting the iterator's
    /// `found` flag when one exists.
    fn scan_to_epoch<'k>(&'k self, iter: &mut ScanIter<'k>, epoch: u64) -> Result<(), WritePrepError> {
        let mut header = iter.header();
        if header.epoch() >= epoch {
            iter.found = header.epoch() == epoch;
            return Ok(());
        }

        // At least one version sits below the epoch.
        iter.found = true;
        let mut last_offset = iter.offset;
        let mut next = header.next();

        while next != 0 {
            iter.offset = next;
            header = self.lock_pages_for_record(iter)?;

            if header.epoch() == epoch {
                return Ok(());
            }
            if header.epoch() > epoch {
                // Overshot; the previous version was the newest visible.
                iter.offset = last_offset;
                return Ok(());
            }

            last_offset = iter.offset;
            next = header.next();
        }

        Ok(())
    }

    /// Ensures the iterator holds every page covering the record at its
    /// offset (header first, then the key once its length is known) and
    /// returns the record header.
    fn lock_pages_for_record<'k>(
        &'k self,
        iter: &mut ScanIter<'k>,
    ) -> Result<EntryHeader, WritePrepError> {
        let needed = pages_to_cover(iter.offset as u64 + ENTRY_HEADER_SIZE as u64);
        if needed > iter.num_pages() {
            self.extend_chain(iter, (needed - iter.num_pages()) as u32)?;
        }

        let header = iter.header();

        let needed = pages_to_cover(
            iter.offset as u64 + ENTRY_HEADER_SIZE as u64 + header.key_size() as u64,
        );
        if needed > iter.num_pages() {
            self.extend_chain(iter, (needed - iter.num_pages()) as u32)?;
        }

        Ok(header)
    }

    /// Grows the iterator's locked span by `n` pages: first by following
    /// links that already exist, then by allocating fresh pages past the
    /// end of the chain.
    fn extend_chain<'k>(&'k self, iter: &mut ScanIter<'k>, mut n: u32) -> Result<(), WritePrepError> {
        while n > 0 {
            let last = iter.pages.last().expect("scan always holds the chain head");
            let next = last.guard.next;
            if next == MAX_PAGE_IDX {
                break;
            }
            let guard = self.page(next).lock();
            iter.pages.push(PageSlot { idx: next, guard });
            n -= 1;
        }

        while n > 0 {
            let (idx, mut guard) = self.allocate_page().ok_or(WritePrepError::NoMem)?;
            let last = iter
                .pages
                .last_mut()
                .expect("scan always holds the chain head");
            last.guard.next = idx;
            guard.prev = last.idx;
            guard.next = MAX_PAGE_IDX;
            iter.pages.push(PageSlot { idx, guard });
            n -= 1;
        }

        Ok(())
    }

    /// Prepares the chain for one appended record of `key_size` key bytes:
    /// claims an idle base page, evicts a borrower, grows the chain, and
    /// commits the new chain size. Returns the append offset (the old
    /// size).
    fn write_prep<'k>(&'k self, iter: &mut ScanIter<'k>, key_size: u32) -> Result<u32, WritePrepError> {
        let old_size = iter.pages[0].guard.size;
        let new_size = old_size as u64 + padded_entry_size(key_size);
        if new_size > u32::MAX as u64 {
            // Chain offsets are u32; a chain this large cannot be addressed.
            return Err(WritePrepError::NoMem);
        }
        let new_size = new_size as u32;

        let head_idx = iter.pages[0].idx;
        if head_idx < self.pool.len() {
            let head_page = self.pool.page(head_idx);
            if head_page.is_free.load(Ordering::Acquire) {
                // Occupying our own idle base page. It may still be
                // threaded on the free list; allocators skip it once the
                // flag is clear.
                head_page.is_free.store(false, Ordering::Release);
            }

            if iter.pages[0].guard.size == 0 && iter.pages[0].guard.is_borrowed {
                self.reclaim_borrowed(iter)?;
            }
        }

        let wanted_pages = new_size.div_ceil(PAGE_SIZE as u32) as usize;
        if wanted_pages > iter.num_pages() {
            self.extend_chain(iter, (wanted_pages - iter.num_pages()) as u32)?;
        }

        iter.pages[0].guard.size = new_size;
        Ok(old_size)
    }

    /// Relocates the borrower occupying this slot's base page so the slot
    /// can root its own chain. On success the base page is detached and
    /// still locked by the iterator; the borrower's chain threads through a
    /// replacement page instead.
    fn reclaim_borrowed<'k>(&'k self, iter: &mut ScanIter<'k>) -> Result<(), WritePrepError> {
        debug_assert_eq!(iter.num_pages(), 1, "reclaim runs before any chain extension");

        let base_idx = iter.pages[0].idx;
        let prev_idx = iter.pages[0].guard.prev;
        debug_assert_ne!(prev_idx, MAX_PAGE_IDX, "a borrowed page is never a chain head");

        let prev_page = self.page(prev_idx);
        let base_page = self.pool.page(base_idx);

        // Chain order is prev -> base but we hold base. Optimistically
        // try-lock; on contention release the base, retake both in order,
        // and re-validate the chain before touching it.
        let mut prev_guard = match prev_page.try_lock() {
            Some(guard) => guard,
            None => {
                let slot = iter.pages.pop().expect("scan holds the base page");
                drop(slot);

                let prev_guard = prev_page.lock();
                if prev_guard.next != base_idx {
                    // The chain moved while the base was unlocked.
                    return Err(WritePrepError::Restart);
                }
                let base_guard = base_page.lock();
                iter.pages.push(PageSlot {
                    idx: base_idx,
                    guard: base_guard,
                });
                prev_guard
            }
        };

        let (replacement_idx, mut replacement_guard) =
            self.allocate_page().ok_or(WritePrepError::NoMem)?;

        let next_idx = iter.pages[0].guard.next;
        let mut next_guard = if next_idx != MAX_PAGE_IDX {
            Some(self.page(next_idx).lock())
        } else {
            None
        };

        // Move the borrower's bytes and links onto the replacement page.
        {
            let base_core = &iter.pages[0].guard;
            replacement_guard.data_mut().copy_from_slice(base_core.data());
            replacement_guard.prev = base_core.prev;
            replacement_guard.next = base_core.next;
        }
        if let Some(next_core) = next_guard.as_mut() {
            next_core.prev = replacement_idx;
        }
        prev_guard.next = replacement_idx;

        // The slot owns its page again; detach it from the borrower's
        // chain.
        let base_core = &mut iter.pages[0].guard;
        base_core.prev = MAX_PAGE_IDX;
        base_core.next = MAX_PAGE_IDX;
        base_core.is_borrowed = false;

        Ok(())
    }
}

/// Pages needed to cover chain bytes `[0, end)`.
fn pages_to_cover(end: u64) -> usize {
    end.div_ceil(PAGE_SIZE as u64) as usize
}
