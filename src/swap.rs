//! # Swap-File Manager
//!
//! When the resident pool runs dry, chains overflow into pages backed by a
//! private swap file. The file lives at `<basedir>/bitcask.swap`, is
//! created mode 0600, and its contents are never durable: it is truncated
//! on open and truncated to zero on drop so dirty mapped pages are not
//! flushed at teardown.
//!
//! ## Mapping Granularity
//!
//! Each 4 KiB range of the file is mapped individually as its own shared
//! read-write view. Page-sized mappings keep expansion simple: existing
//! views stay valid while the file grows, so readers never observe a
//! remap.
//!
//! ## Segments
//!
//! Pages are held in an append-only list of segments. The swap index space
//! is global: segment 0 covers indices `0..len0`, segment 1 covers
//! `len0..len0+len1`, and so on. A lookup walks the segments, subtracting
//! sizes. Segments are boxed and never removed before drop, so a page
//! reference handed out by [`SwapFile::page`] stays valid for the life of
//! the manager.
//!
//! ## Expansion
//!
//! When the free list empties, allocation doubles the file under a grow
//! mutex. The expander re-checks the page count the caller observed so
//! only one of several racing allocators does the work, maps the new range
//! page by page, publishes the segment, and CAS-splices the new run onto
//! the free-list head. If some pages fail to map, whatever mapped is
//! published; expansion fails only when not a single page mapped.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapOptions;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::{MAX_PAGE_IDX, PAGE_SIZE, SWAP_FILE_NAME};
use crate::page::{Page, PageCore, PageData};

struct SwapSegment {
    pages: Box<[Page]>,
}

pub(crate) struct SwapFile {
    file: File,
    segments: RwLock<Vec<Box<SwapSegment>>>,
    num_pages: AtomicU32,
    free_head: AtomicU32,
    grow_lock: Mutex<()>,
}

impl SwapFile {
    pub(crate) fn create(basedir: &Path, initial_pages: u32, unlink: bool) -> Result<Self> {
        ensure!(initial_pages > 0, "swap file needs at least one page");

        let path = basedir.join(SWAP_FILE_NAME);
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .wrap_err_with(|| format!("failed to create swap file '{}'", path.display()))?;

        if unlink {
            // The open descriptor keeps the pages alive; only the directory
            // entry goes away.
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to unlink swap file '{}'", path.display()))?;
        }

        let file_size = initial_pages as u64 * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size swap file to {} bytes", file_size))?;

        let mut pages = Vec::with_capacity(initial_pages as usize);
        for i in 0..initial_pages {
            let map = map_page(&file, i)
                .wrap_err_with(|| format!("failed to map initial swap page {}", i))?;
            let page = Page::new(PageData::Swapped(map));
            let next = if i + 1 < initial_pages { i + 1 } else { MAX_PAGE_IDX };
            page.next_free.store(next, Ordering::Relaxed);
            pages.push(page);
        }

        tracing::debug!(
            path = %path.display(),
            pages = initial_pages,
            "created swap file"
        );

        Ok(Self {
            file,
            segments: RwLock::new(vec![Box::new(SwapSegment {
                pages: pages.into_boxed_slice(),
            })]),
            num_pages: AtomicU32::new(initial_pages),
            free_head: AtomicU32::new(0),
            grow_lock: Mutex::new(()),
        })
    }

    pub(crate) fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Resolves a swap-relative index to its page. Segments are append-only
    /// and boxed, so the reference outlives the internal read lock.
    pub(crate) fn page(&self, mut idx: u32) -> &Page {
        let segments = self.segments.read();
        let mut seg_no = 0;
        loop {
            let segment = &segments[seg_no];
            let len = segment.pages.len() as u32;
            if idx < len {
                let page: *const Page = &segment.pages[idx as usize];
                // SAFETY: the segment is heap-allocated behind a Box whose
                // address never changes, segments are only appended, and
                // they are dropped only when the SwapFile itself is dropped
                // (which requires exclusive access). The reference is
                // therefore valid for the `&self` borrow even after the
                // read guard is released.
                return unsafe { &*page };
            }
            idx -= len;
            seg_no += 1;
        }
    }

    /// Pops a free swap page, expanding the file when the list is empty.
    /// Returns the page locked. `None` means the swap file could not grow.
    pub(crate) fn allocate(&self) -> Option<(u32, MutexGuard<'_, PageCore>)> {
        loop {
            let observed_pages = self.num_pages.load(Ordering::Acquire);

            // The page count must be read before the list head so an empty
            // head is judged against a count at least as old; the expansion
            // re-check depends on it.
            fence(Ordering::SeqCst);
            let head = self.free_head.load(Ordering::Acquire);

            if head == MAX_PAGE_IDX {
                if let Err(err) = self.expand(observed_pages) {
                    tracing::warn!(error = %err, "swap file expansion failed");
                    return None;
                }
                continue;
            }

            let page = self.page(head);
            let next = page.next_free.load(Ordering::Acquire);

            if self
                .free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let core = page.lock();
                page.is_free.store(false, Ordering::Release);
                return Some((head, core));
            }
        }
    }

    /// Doubles the swap file, mapping the new half as a fresh segment.
    /// `observed_pages` is the total the caller saw before finding the free
    /// list empty; if the count has moved on, another thread already grew
    /// the file and there is nothing to do.
    fn expand(&self, observed_pages: u32) -> Result<()> {
        let _grow = self.grow_lock.lock();

        if self.num_pages.load(Ordering::Acquire) != observed_pages {
            return Ok(());
        }

        let new_total = observed_pages
            .checked_mul(2)
            .ok_or_else(|| eyre::eyre!("swap page count would overflow"))?;
        let new_size = new_total as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow swap file to {} bytes", new_size))?;

        let mut pages = Vec::with_capacity(observed_pages as usize);
        for i in 0..observed_pages {
            let global = observed_pages + i;
            match map_page(&self.file, global) {
                Ok(map) => {
                    let page = Page::new(PageData::Swapped(map));
                    page.next_free.store(global + 1, Ordering::Relaxed);
                    pages.push(page);
                }
                Err(err) => {
                    // Keep whatever mapped; the rest of the range is
                    // abandoned until the next expansion attempt.
                    tracing::warn!(page = global, error = %err, "partial swap mapping");
                    break;
                }
            }
        }

        ensure!(!pages.is_empty(), "no swap pages could be mapped");
        let added = pages.len() as u32;

        self.segments.write().push(Box::new(SwapSegment {
            pages: pages.into_boxed_slice(),
        }));
        self.num_pages
            .store(observed_pages + added, Ordering::Release);

        // Splice the new run onto the free list: the run's last page picks
        // up the old head, then the head swings to the run's first page.
        let new_head = observed_pages;
        let last = self.page(observed_pages + added - 1);
        loop {
            let old_head = self.free_head.load(Ordering::Acquire);
            last.next_free.store(old_head, Ordering::Release);
            if self
                .free_head
                .compare_exchange(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        tracing::debug!(
            pages = observed_pages + added,
            bytes = new_size,
            "expanded swap file"
        );

        Ok(())
    }

    /// Current size of the backing file in bytes.
    pub(crate) fn file_len(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        // Unmap before truncating so no dirty mapped page outlives the
        // backing range.
        self.segments.get_mut().clear();
        if let Err(err) = self.file.set_len(0) {
            tracing::warn!(error = %err, "failed to truncate swap file on drop");
        }
    }
}

fn map_page(file: &File, page_no: u32) -> Result<memmap2::MmapMut> {
    let offset = page_no as u64 * PAGE_SIZE as u64;
    // SAFETY: the mapping covers a range this process just allocated inside
    // its private swap file. The file is not shared with other processes
    // and every access to the mapped bytes goes through the owning page's
    // mutex.
    unsafe {
        MmapOptions::new()
            .offset(offset)
            .len(PAGE_SIZE)
            .map_mut(file)
            .wrap_err("mmap failed")
    }
}
