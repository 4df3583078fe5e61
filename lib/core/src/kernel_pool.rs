// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cross-process coordination for parallel kernel builds.
//!
//! Cooperating OS processes agree on which kernels are pending, being built
//! and finished without a central server: a file-backed shared mapping holds
//! a fixed-capacity arena of tagged slots, every read-modify-write happens
//! under an advisory file lock, and completion is observed by bounded
//! polling (no condition variable can span processes).
//!
//! Work-item ids are stable content hashes, so two processes building the
//! same logical kernel agree on its identifier. A slot moves
//! `ToDo -> Doing -> Done` only; claiming a slot establishes
//! at-most-one-builder ownership.
//!
//! There is no recovery for a builder that dies mid-claim; its `Doing`
//! entries eventually surface as a wait timeout in the surviving processes.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use memmap2::MmapMut;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::KernelPoolConfig;

const POOL_MAGIC: u64 = 0x4752_444d_5348_504c;
const POOL_VERSION: u32 = 1;

/// magic u64 + version u32 + capacity u32
const HEADER_SIZE: usize = 16;
/// id u64 + state u64
const SLOT_SIZE: usize = 16;

const STATE_EMPTY: u64 = 0;
const STATE_TODO: u64 = 1;
const STATE_DOING: u64 = 2;
const STATE_DONE: u64 = 3;

/// Shared-pool status codes. Failures must be diagnosable from a different
/// process than the one that caused them, so everything is an explicit
/// status, never a panic.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("shared pool capacity {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("could not acquire the pool lock within {0} attempts")]
    LockBusy(u32),

    #[error("shared pool region is corrupt: {0}")]
    Corrupt(String),

    #[error("timed out after {0:?} waiting for kernels to finish")]
    WaitTimeout(Duration),

    #[error("pool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable identifier for a kernel description.
pub fn kernel_id(description: &str) -> u64 {
    xxh3_64(description.as_bytes())
}

/// Handle onto the shared build pool.
///
/// The first process to open the region zero-initializes it and becomes the
/// creator, responsible for removing the file on drop; later processes
/// attach and validate the header.
#[derive(Debug)]
pub struct KernelPool {
    file: File,
    map: MmapMut,
    path: PathBuf,
    capacity: usize,
    is_creator: bool,
    /// Ids this process knows how to build.
    registered: HashSet<u64>,
    /// Ids this process moved ToDo -> Doing.
    claimed: HashSet<u64>,
    config: KernelPoolConfig,
}

impl KernelPool {
    /// Opens (or creates) the shared region and registers `items` as
    /// pending work. Ids already present in the region (registered by
    /// another process) are left untouched.
    pub fn init<S: AsRef<str>>(config: KernelPoolConfig, items: &[S]) -> Result<Self, PoolError> {
        let path = config.pool_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let region_len = HEADER_SIZE + config.capacity * SLOT_SIZE;

        let (map, is_creator) = {
            let _lock = PoolLock::acquire(&file, &config)?;
            let current_len = file.metadata()?.len() as usize;
            let is_creator = current_len == 0;
            if is_creator {
                file.set_len(region_len as u64)?;
            } else if current_len != region_len {
                return Err(PoolError::Corrupt(format!(
                    "region is {current_len} bytes, expected {region_len}"
                )));
            }
            // Safety: the region is only ever accessed under the advisory
            // lock, and its length was just validated.
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            if is_creator {
                write_header(&mut map, config.capacity);
                map.flush()?;
                tracing::info!(path = %path.display(), capacity = config.capacity, "created shared build pool");
            } else {
                validate_header(&map, config.capacity)?;
                tracing::debug!(path = %path.display(), "attached to shared build pool");
            }
            (map, is_creator)
        };

        let mut pool = KernelPool {
            file,
            map,
            path,
            capacity: config.capacity,
            is_creator,
            registered: HashSet::new(),
            claimed: HashSet::new(),
            config,
        };
        pool.register(items)?;
        Ok(pool)
    }

    fn register<S: AsRef<str>>(&mut self, items: &[S]) -> Result<(), PoolError> {
        let _lock = PoolLock::acquire(&self.file, &self.config)?;
        for item in items {
            let id = kernel_id(item.as_ref());
            self.registered.insert(id);
            if find_slot(&self.map, self.capacity, id).is_some() {
                continue;
            }
            match first_empty(&self.map, self.capacity) {
                Some(index) => write_slot(&mut self.map, index, id, STATE_TODO),
                None => {
                    tracing::error!(
                        capacity = self.capacity,
                        "shared build pool is full; refusing to overflow"
                    );
                    return Err(PoolError::CapacityExceeded {
                        capacity: self.capacity,
                    });
                }
            }
        }
        Ok(())
    }

    /// Claims every registered kernel still pending by moving it
    /// `ToDo -> Doing`, and returns the claimed set. Kernels already being
    /// built (or finished) by another process are skipped.
    pub fn fetch_kernels(&mut self) -> Result<HashSet<u64>, PoolError> {
        let _lock = PoolLock::acquire(&self.file, &self.config)?;
        let mut fetched = HashSet::new();
        for index in 0..self.capacity {
            let (id, state) = read_slot(&self.map, index);
            if state == STATE_TODO && self.registered.contains(&id) {
                write_slot(&mut self.map, index, id, STATE_DOING);
                fetched.insert(id);
            }
        }
        self.claimed.extend(fetched.iter().copied());
        tracing::debug!(count = fetched.len(), "claimed kernels for building");
        Ok(fetched)
    }

    /// Marks `built` kernels as done, then polls until every registered
    /// kernel, including those claimed by other processes, is done or the
    /// wait budget is exhausted.
    pub fn update_and_wait(&mut self, built: &HashSet<u64>) -> Result<(), PoolError> {
        {
            let _lock = PoolLock::acquire(&self.file, &self.config)?;
            for &id in built {
                match find_slot(&self.map, self.capacity, id) {
                    Some(index) => {
                        let (_, state) = read_slot(&self.map, index);
                        if state == STATE_DOING {
                            write_slot(&mut self.map, index, id, STATE_DONE);
                        } else {
                            tracing::warn!(
                                kernel_id = id,
                                state,
                                "finished kernel was not in the doing state"
                            );
                        }
                    }
                    None => {
                        tracing::warn!(kernel_id = id, "finished kernel not present in the pool")
                    }
                }
                self.claimed.remove(&id);
            }
        }

        let deadline = Instant::now() + self.config.wait_timeout();
        loop {
            let all_done = {
                let _lock = PoolLock::acquire(&self.file, &self.config)?;
                self.registered.iter().all(|&id| {
                    find_slot(&self.map, self.capacity, id)
                        .map(|index| read_slot(&self.map, index).1 == STATE_DONE)
                        .unwrap_or(false)
                })
            };
            if all_done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!(
                    timeout = %humantime::format_duration(self.config.wait_timeout()),
                    "gave up waiting for other builders"
                );
                return Err(PoolError::WaitTimeout(self.config.wait_timeout()));
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    /// Ids this process registered.
    pub fn registered(&self) -> &HashSet<u64> {
        &self.registered
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }
}

impl Drop for KernelPool {
    fn drop(&mut self) {
        if self.is_creator {
            if let Err(err) = fs::remove_file(&self.path) {
                tracing::warn!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to remove shared build pool region"
                );
            }
        }
    }
}

/// Advisory lock guard over the region file. Acquisition is a bounded
/// try-lock with backoff; the lock is released on drop.
struct PoolLock<'a> {
    file: &'a File,
}

impl<'a> PoolLock<'a> {
    fn acquire(file: &'a File, config: &KernelPoolConfig) -> Result<Self, PoolError> {
        for attempt in 0..config.lock_attempts {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(PoolLock { file }),
                Err(err) => {
                    if attempt + 1 == config.lock_attempts {
                        tracing::warn!(error = %err, attempts = config.lock_attempts, "pool lock is busy");
                    } else {
                        thread::sleep(config.lock_backoff());
                    }
                }
            }
        }
        Err(PoolError::LockBusy(config.lock_attempts))
    }
}

impl Drop for PoolLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(self.file) {
            tracing::warn!(error = %err, "failed to release pool lock");
        }
    }
}

fn write_header(map: &mut MmapMut, capacity: usize) {
    map[0..8].copy_from_slice(&POOL_MAGIC.to_le_bytes());
    map[8..12].copy_from_slice(&POOL_VERSION.to_le_bytes());
    map[12..16].copy_from_slice(&(capacity as u32).to_le_bytes());
}

fn validate_header(map: &MmapMut, capacity: usize) -> Result<(), PoolError> {
    let magic = u64::from_le_bytes(map[0..8].try_into().unwrap());
    if magic != POOL_MAGIC {
        return Err(PoolError::Corrupt(format!("bad magic {magic:#x}")));
    }
    let version = u32::from_le_bytes(map[8..12].try_into().unwrap());
    if version != POOL_VERSION {
        return Err(PoolError::Corrupt(format!("unsupported version {version}")));
    }
    let stored = u32::from_le_bytes(map[12..16].try_into().unwrap()) as usize;
    if stored != capacity {
        return Err(PoolError::Corrupt(format!(
            "region capacity {stored} does not match configured capacity {capacity}"
        )));
    }
    Ok(())
}

fn slot_offset(index: usize) -> usize {
    HEADER_SIZE + index * SLOT_SIZE
}

fn read_slot(map: &MmapMut, index: usize) -> (u64, u64) {
    let offset = slot_offset(index);
    let id = u64::from_le_bytes(map[offset..offset + 8].try_into().unwrap());
    let state = u64::from_le_bytes(map[offset + 8..offset + 16].try_into().unwrap());
    (id, state)
}

fn write_slot(map: &mut MmapMut, index: usize, id: u64, state: u64) {
    let offset = slot_offset(index);
    map[offset..offset + 8].copy_from_slice(&id.to_le_bytes());
    map[offset + 8..offset + 16].copy_from_slice(&state.to_le_bytes());
}

fn find_slot(map: &MmapMut, capacity: usize, id: u64) -> Option<usize> {
    (0..capacity).find(|&index| {
        let (slot_id, state) = read_slot(map, index);
        state != STATE_EMPTY && slot_id == id
    })
}

fn first_empty(map: &MmapMut, capacity: usize) -> Option<usize> {
    (0..capacity).find(|&index| read_slot(map, index).1 == STATE_EMPTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(dir: &tempfile::TempDir, capacity: usize) -> KernelPoolConfig {
        KernelPoolConfig {
            dir: dir.path().to_path_buf(),
            capacity,
            poll_interval_ms: 10,
            wait_timeout_secs: 2,
            lock_attempts: 50,
            lock_backoff_ms: 1,
        }
    }

    fn kernel_names(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("fused_matmul_relu_{i}")).collect()
    }

    #[test]
    fn test_creator_initializes_and_attacher_validates() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(4);

        let creator = KernelPool::init(pool_config(&dir, 16), &items).unwrap();
        assert!(creator.is_creator());

        let attacher = KernelPool::init(pool_config(&dir, 16), &items).unwrap();
        assert!(!attacher.is_creator());
        assert_eq!(attacher.registered().len(), 4);
    }

    #[test]
    fn test_attach_rejects_capacity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(2);
        let _creator = KernelPool::init(pool_config(&dir, 16), &items).unwrap();

        let err = KernelPool::init(pool_config(&dir, 8), &items).unwrap_err();
        assert!(matches!(err, PoolError::Corrupt(_)));
    }

    #[test]
    fn test_attach_rejects_garbage_region() {
        let dir = tempfile::tempdir().unwrap();
        let config = pool_config(&dir, 4);
        let region_len = HEADER_SIZE + 4 * SLOT_SIZE;
        fs::write(config.pool_path(), vec![0xAB; region_len]).unwrap();

        let err = KernelPool::init(config, &kernel_names(1)).unwrap_err();
        assert!(matches!(err, PoolError::Corrupt(_)));
    }

    /// Two attached processes claiming an overlapping ten-kernel set: the
    /// union of the claims equals the set and no kernel is claimed twice.
    #[test]
    fn test_claims_are_disjoint_and_cover_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(10);
        let expected: HashSet<u64> = items.iter().map(|s| kernel_id(s)).collect();

        let mut first = KernelPool::init(pool_config(&dir, 16), &items).unwrap();
        let mut second = KernelPool::init(pool_config(&dir, 16), &items).unwrap();

        let claimed_by_first = first.fetch_kernels().unwrap();
        let claimed_by_second = second.fetch_kernels().unwrap();

        assert!(claimed_by_first.is_disjoint(&claimed_by_second));
        let union: HashSet<u64> = claimed_by_first
            .union(&claimed_by_second)
            .copied()
            .collect();
        assert_eq!(union, expected);

        // the first claimer builds everything; both waits then resolve
        first.update_and_wait(&claimed_by_first).unwrap();
        second.update_and_wait(&claimed_by_second).unwrap();
    }

    /// Each process registers its own half of the work; claims stay within
    /// what a process knows how to build.
    #[test]
    fn test_split_registration_splits_the_claims() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(10);

        let mut first = KernelPool::init(pool_config(&dir, 16), &items[..5]).unwrap();
        let mut second = KernelPool::init(pool_config(&dir, 16), &items[5..]).unwrap();

        let claimed_by_first = first.fetch_kernels().unwrap();
        let claimed_by_second = second.fetch_kernels().unwrap();

        assert_eq!(claimed_by_first.len(), 5);
        assert_eq!(claimed_by_second.len(), 5);
        assert!(claimed_by_first.is_disjoint(&claimed_by_second));

        first.update_and_wait(&claimed_by_first).unwrap();
        second.update_and_wait(&claimed_by_second).unwrap();
    }

    /// Capacity is a hard ceiling: registration beyond it reports an
    /// explicit error instead of overflowing the arena.
    #[test]
    fn test_capacity_exceeded_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let _creator = KernelPool::init(pool_config(&dir, 2), &kernel_names(2)).unwrap();

        let err = KernelPool::init(pool_config(&dir, 2), &["one_kernel_too_many"]).unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { capacity: 2 }));
    }

    /// A kernel left in the doing state by a vanished builder surfaces as a
    /// wait timeout, not a hang.
    #[test]
    fn test_unfinished_kernel_times_out_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(2);
        let mut pool = KernelPool::init(pool_config(&dir, 4), &items).unwrap();

        let claimed = pool.fetch_kernels().unwrap();
        assert_eq!(claimed.len(), 2);

        // report only one of the two as built
        let one: HashSet<u64> = claimed.iter().take(1).copied().collect();
        let started = Instant::now();
        let err = pool.update_and_wait(&one).unwrap_err();
        assert!(matches!(err, PoolError::WaitTimeout(_)));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn test_fetch_skips_kernels_done_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let items = kernel_names(3);

        let mut first = KernelPool::init(pool_config(&dir, 8), &items).unwrap();
        let claimed = first.fetch_kernels().unwrap();
        first.update_and_wait(&claimed).unwrap();

        // a process arriving after the fact has nothing left to claim
        let mut late = KernelPool::init(pool_config(&dir, 8), &items).unwrap();
        assert!(late.fetch_kernels().unwrap().is_empty());
        late.update_and_wait(&HashSet::new()).unwrap();
    }

    #[test]
    fn test_creator_removes_region_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let config = pool_config(&dir, 4);
        let path = config.pool_path();

        let creator = KernelPool::init(config, &kernel_names(1)).unwrap();
        assert!(path.exists());
        drop(creator);
        assert!(!path.exists());
    }

    #[test]
    fn test_kernel_id_is_stable() {
        assert_eq!(kernel_id("conv2d_nhwc"), kernel_id("conv2d_nhwc"));
        assert_ne!(kernel_id("conv2d_nhwc"), kernel_id("conv2d_nchw"));
    }
}
