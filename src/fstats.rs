//! # Per-File Statistics
//!
//! The directory keeps live/total counters for every data file so the
//! surrounding engine can decide which files are worth merging. Callers
//! report deltas as records move between live and dead states; the table
//! itself never inspects chains.

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::MAX_EPOCH;

/// Counters for one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub file_id: u32,
    pub live_keys: u64,
    pub total_keys: u64,
    pub live_bytes: u64,
    pub total_bytes: u64,
    /// Smallest record timestamp seen; zero until a nonzero timestamp is
    /// reported.
    pub oldest_tstamp: u32,
    /// Largest record timestamp seen; zero until a nonzero timestamp is
    /// reported.
    pub newest_tstamp: u32,
    /// Smallest expiration epoch reported for the file.
    pub expiration_epoch: u64,
}

impl FileStats {
    fn new(file_id: u32) -> Self {
        Self {
            file_id,
            live_keys: 0,
            total_keys: 0,
            live_bytes: 0,
            total_bytes: 0,
            oldest_tstamp: 0,
            newest_tstamp: 0,
            expiration_epoch: MAX_EPOCH,
        }
    }
}

pub(crate) struct FstatsTable {
    inner: Mutex<HashMap<u32, FileStats>>,
}

impl FstatsTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Applies one batch of deltas to a file's counters. Unknown files are
    /// created only when `should_create` is set; otherwise the update is
    /// dropped, which keeps decrement paths quiet after a file has been
    /// pruned.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn update(
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
        let mut table = self.inner.lock();

        let stats = if should_create {
            table.entry(file_id).or_insert_with(|| FileStats::new(file_id))
        } else {
            match table.get_mut(&file_id) {
                Some(stats) => stats,
                None => return,
            }
        };

        stats.live_keys = stats.live_keys.saturating_add_signed(live_keys_delta);
        stats.total_keys = stats.total_keys.saturating_add_signed(total_keys_delta);
        stats.live_bytes = stats.live_bytes.saturating_add_signed(live_bytes_delta);
        stats.total_bytes = stats.total_bytes.saturating_add_signed(total_bytes_delta);

        if expiration_epoch < stats.expiration_epoch {
            stats.expiration_epoch = expiration_epoch;
        }

        if tstamp != 0 && (stats.oldest_tstamp == 0 || tstamp < stats.oldest_tstamp) {
            stats.oldest_tstamp = tstamp;
        }
        if tstamp != 0 && (stats.newest_tstamp == 0 || tstamp > stats.newest_tstamp) {
            stats.newest_tstamp = tstamp;
        }
    }

    pub(crate) fn get(&self, file_id: u32) -> Option<FileStats> {
        self.inner.lock().get(&file_id).copied()
    }
}
