//! # Concurrent Keydir Workloads
//!
//! These tests drive one shared directory from several OS threads and check
//! the guarantees the keydir makes under contention:
//!
//! 1. **Per-key atomicity**: every thread's writes are fully visible after a
//!    join, regardless of how chains interleaved.
//! 2. **Epoch uniqueness**: each successful mutation carries a distinct,
//!    monotonically assigned epoch.
//! 3. **Monotonic reads**: a reader polling one hot key never observes time
//!    going backwards.
//! 4. **Snapshot stability**: an epoch-bounded reader keeps seeing its
//!    snapshot while writers append newer versions.
//!
//! Thread counts and key sizes are chosen to force chain growth, borrowing,
//! and swap spill on small directories rather than to benchmark anything.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Barrier};
use std::thread;

use caskdir::{Keydir, KeydirEntry, KeydirOptions, PutOutcome, MAX_EPOCH};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn open_keydir(num_pages: u32, initial_swap_pages: u32) -> (tempfile::TempDir, Arc<Keydir>) {
    let dir = tempdir().expect("failed to create temp dir");
    let keydir = Keydir::open(
        dir.path(),
        &KeydirOptions {
            num_pages,
            initial_swap_pages,
            unlink_swap_file: false,
        },
    )
    .expect("failed to open keydir");
    (dir, Arc::new(keydir))
}

fn entry(file_id: u32, offset: u64) -> KeydirEntry {
    KeydirEntry {
        file_id,
        total_size: 64,
        offset,
        timestamp: 1,
        epoch: 0,
    }
}

fn thread_key(thread: usize, i: usize, len: usize) -> Vec<u8> {
    let mut key = format!("t{thread}-key-{i:05}").into_bytes();
    key.resize(len, b'.');
    key
}

#[test]
fn disjoint_writers_all_become_visible() {
    const THREADS: usize = 4;
    const KEYS_PER_THREAD: usize = 250;

    let (_dir, keydir) = open_keydir(64, 8);
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let keydir = Arc::clone(&keydir);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut epochs = Vec::with_capacity(KEYS_PER_THREAD);
            for i in 0..KEYS_PER_THREAD {
                let key = thread_key(t, i, 64);
                match keydir.put(&key, entry(t as u32, i as u64), None) {
                    PutOutcome::Stored(epoch) => epochs.push(epoch),
                    other => panic!("put failed: {other:?}"),
                }
            }
            epochs
        }));
    }

    let mut all_epochs = HashSet::new();
    for handle in handles {
        for epoch in handle.join().unwrap() {
            assert!(all_epochs.insert(epoch), "epoch {epoch} issued twice");
        }
    }
    assert_eq!(all_epochs.len(), THREADS * KEYS_PER_THREAD);

    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = thread_key(t, i, 64);
            let found = keydir
                .get(&key, MAX_EPOCH)
                .unwrap_or_else(|| panic!("key of thread {t} index {i} missing"));
            assert_eq!(found.file_id, t as u32);
            assert_eq!(found.offset, i as u64);
        }
    }
}

#[test]
fn hot_key_reader_never_sees_time_move_backwards() {
    const WRITES: u64 = 2_000;

    let (_dir, keydir) = open_keydir(16, 4);
    keydir.put(b"hot", entry(1, 0), None);

    let writer = {
        let keydir = Arc::clone(&keydir);
        thread::spawn(move || {
            for offset in 1..=WRITES {
                assert!(matches!(
                    keydir.put(b"hot", entry(1, offset), None),
                    PutOutcome::Stored(_)
                ));
            }
        })
    };

    let reader = {
        let keydir = Arc::clone(&keydir);
        thread::spawn(move || {
            let mut last_offset = 0;
            let mut last_epoch = 0;
            for _ in 0..10_000 {
                let found = keydir.get(b"hot", MAX_EPOCH).expect("hot key vanished");
                assert!(
                    found.offset >= last_offset,
                    "offset went backwards: {} after {}",
                    found.offset,
                    last_offset
                );
                assert!(found.epoch >= last_epoch, "epoch went backwards");
                last_offset = found.offset;
                last_epoch = found.epoch;
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(keydir.get(b"hot", MAX_EPOCH).unwrap().offset, WRITES);
}

#[test]
fn two_slot_directory_survives_contended_borrowing() {
    const THREADS: usize = 4;
    const KEYS_PER_THREAD: usize = 100;

    // Two resident pages means nearly every chain extension borrows the
    // other slot's base page or spills to swap, and inserts into the other
    // slot keep reclaiming it back.
    let (_dir, keydir) = open_keydir(2, 2);
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let keydir = Arc::clone(&keydir);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..KEYS_PER_THREAD {
                let key = thread_key(t, i, 120);
                assert!(matches!(
                    keydir.put(&key, entry(t as u32, i as u64), None),
                    PutOutcome::Stored(_)
                ));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..THREADS {
        for i in 0..KEYS_PER_THREAD {
            let key = thread_key(t, i, 120);
            let found = keydir.get(&key, MAX_EPOCH).expect("key lost in the scramble");
            assert_eq!((found.file_id, found.offset), (t as u32, i as u64));
        }
    }
}

#[test]
fn snapshot_reader_is_stable_while_writers_advance() {
    const KEYS: usize = 100;

    let (_dir, keydir) = open_keydir(32, 8);
    keydir.set_min_epoch(1);

    for i in 0..KEYS {
        keydir.put(&thread_key(0, i, 48), entry(1, i as u64), None);
    }
    let snapshot = keydir.epoch();

    let writer = {
        let keydir = Arc::clone(&keydir);
        thread::spawn(move || {
            for round in 0..5u64 {
                for i in 0..KEYS {
                    let key = thread_key(0, i, 48);
                    keydir.put(&key, entry(2, 1_000 + round * KEYS as u64 + i as u64), None);
                }
            }
        })
    };

    let reader = {
        let keydir = Arc::clone(&keydir);
        thread::spawn(move || {
            for _ in 0..50 {
                for i in 0..KEYS {
                    let key = thread_key(0, i, 48);
                    let found = keydir.get(&key, snapshot).expect("snapshot version missing");
                    assert_eq!(found.file_id, 1);
                    assert_eq!(found.offset, i as u64);
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    for i in 0..KEYS {
        let found = keydir.get(&thread_key(0, i, 48), MAX_EPOCH).unwrap();
        assert_eq!(found.file_id, 2);
    }
}

#[test]
fn random_workload_matches_a_reference_model() {
    const THREADS: usize = 3;
    const OPS: usize = 600;
    const KEYS: usize = 50;

    let (_dir, keydir) = open_keydir(16, 4);
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let keydir = Arc::clone(&keydir);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            // Each thread owns a disjoint keyspace, so its model is exact.
            let mut rng = StdRng::seed_from_u64(t as u64);
            let mut model: HashMap<usize, u64> = HashMap::new();
            barrier.wait();

            for op in 0..OPS {
                let i = rng.gen_range(0..KEYS);
                let key = thread_key(t, i, 40);
                match rng.gen_range(0..3) {
                    0 => {
                        let offset = op as u64;
                        assert!(matches!(
                            keydir.put(&key, entry(t as u32, offset), None),
                            PutOutcome::Stored(_)
                        ));
                        model.insert(i, offset);
                    }
                    1 => {
                        assert!(matches!(keydir.remove(&key, None), PutOutcome::Stored(_)));
                        model.remove(&i);
                    }
                    _ => {
                        let found = keydir.get(&key, MAX_EPOCH).map(|e| e.offset);
                        assert_eq!(found, model.get(&i).copied(), "thread {t} key {i}");
                    }
                }
            }

            for (i, offset) in model {
                let key = thread_key(t, i, 40);
                assert_eq!(keydir.get(&key, MAX_EPOCH).map(|e| e.offset), Some(offset));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
