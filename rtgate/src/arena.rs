//! # Arena Allocator
//!
//! Bump allocation over anonymous `mmap` blocks, used to buffer records while
//! the world is stopped. Nothing here touches the global heap on the fast
//! path: a reservation is one atomic `fetch_add` on the newest block's cursor.
//!
//! ## Block Pool
//!
//! ```text
//!  slots:   [ 0 ]      [ 1 ]      [ 2 ]      [ 3 ]
//!            │           │           │          (free)
//!            ▼           ▼           ▼
//!          block#0 ◀──▶ block#2 ◀──▶ block#3      newest = slot 2
//!          (seq 0)     (seq 1)     (seq 2)
//! ```
//!
//! Blocks live in an index-addressed pool; `prev`/`next` links are slot
//! indices and outside references are generation-tagged [`BlockHandle`]s, so
//! a bulk free can never leave a dangling pointer behind.
//!
//! ## Concurrency
//!
//! - Reservations hold the pool's read lock for as long as the caller writes
//!   into them, so many GC workers can allocate and copy in parallel.
//! - Growing, freeing and replay take the write lock, which also waits out
//!   every in-progress write.
//! - A reservation that overflows its block folds its start offset into the
//!   block's `last_used` with `fetch_min`. The smallest failing offset is
//!   exactly the end of the last successful reservation, which makes it the
//!   block's high-water mark.
//! - If the block that should follow cannot be mapped, the cursor is rolled
//!   back to that mark so smaller records still fit the tail.

#![allow(unsafe_code)] // mmap/munmap and writes into mapped blocks

use log::debug;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::ArenaConfig;
use crate::domain::ArenaError;
use rtgate_common::{align_record, BLOCK_HEADER_SIZE};

/// Generation-tagged reference to a block in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Diagnostics snapshot of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub handle: BlockHandle,
    pub sequence: u64,
    /// Mapping size, header included
    pub size: usize,
    /// Bytes in use after the header
    pub used: usize,
}

/// Counters accumulated over the life of an arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArenaStats {
    pub blocks_mapped: u64,
    pub blocks_unmapped: u64,
    pub failed_allocations: u64,
    pub live_blocks: usize,
    pub mapped_bytes: usize,
}

// ============================================================================
// OS Mapping
// ============================================================================

/// Owned anonymous private mapping, unmapped on drop
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent access
// is coordinated by the block cursor (disjoint reservations) and the pool lock.
unsafe impl Send for Mapping {}
// SAFETY: see above.
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(len: usize) -> Result<Self, ArenaError> {
        // SAFETY: anonymous private mapping with no address hint; the result
        // is checked against MAP_FAILED before use.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(ArenaError::MapFailed { size: len, source: std::io::Error::last_os_error() });
        }
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or(ArenaError::MapFailed { size: len, source: std::io::Error::last_os_error() })?;
        Ok(Self { ptr, len })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned and nothing borrows
        // the mapping once its owner is being dropped.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// ============================================================================
// Blocks
// ============================================================================

/// One mapped block with an embedded bump cursor
struct ArenaBlock {
    mapping: Mapping,
    sequence: u64,
    /// Next free offset relative to the end of the block header
    cursor: AtomicUsize,
    /// Frozen high-water mark; `usize::MAX` while the block is still open
    last_used: AtomicUsize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl ArenaBlock {
    fn new(mapping: Mapping, sequence: u64) -> Self {
        Self {
            mapping,
            sequence,
            cursor: AtomicUsize::new(0),
            last_used: AtomicUsize::new(usize::MAX),
            prev: None,
            next: None,
        }
    }

    /// Usable bytes after the block header
    fn capacity(&self) -> usize {
        self.mapping.len - BLOCK_HEADER_SIZE
    }

    fn try_reserve(&self, size: usize) -> Option<usize> {
        let offset = self.cursor.fetch_add(size, Ordering::AcqRel);
        if offset.saturating_add(size) <= self.capacity() {
            Some(offset)
        } else {
            self.last_used.fetch_min(offset, Ordering::AcqRel);
            None
        }
    }

    /// Bytes of fully reserved records, from offset 0
    fn high_water(&self) -> usize {
        self.last_used
            .load(Ordering::Acquire)
            .min(self.cursor.load(Ordering::Acquire))
            .min(self.capacity())
    }

    fn retire(&self) {
        let end = self.cursor.load(Ordering::Acquire).min(self.capacity());
        self.last_used.fetch_min(end, Ordering::AcqRel);
    }

    fn fits(&self, size: usize) -> bool {
        self.cursor.load(Ordering::Acquire).saturating_add(size) <= self.capacity()
    }

    /// Undo a failed overflow so smaller reservations can still use the tail
    fn reopen(&mut self) {
        let end = self.high_water();
        *self.cursor.get_mut() = end;
        *self.last_used.get_mut() = usize::MAX;
    }

    fn reset(&mut self) {
        *self.cursor.get_mut() = 0;
        *self.last_used.get_mut() = usize::MAX;
        self.prev = None;
        self.next = None;
    }

    /// Used region of the block
    ///
    /// Only sound while no reservation is being written, which callers
    /// guarantee by holding the pool write lock.
    fn used_bytes(&self) -> &[u8] {
        let used = self.high_water();
        // SAFETY: `used` never exceeds capacity, the region lies inside the
        // mapping and the caller holds the write lock (no concurrent writers).
        unsafe { std::slice::from_raw_parts(self.mapping.as_ptr().add(BLOCK_HEADER_SIZE), used) }
    }
}

struct Slot {
    generation: u32,
    block: Option<ArenaBlock>,
}

#[derive(Default)]
struct BlockPool {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    newest: Option<usize>,
    mapped_bytes: usize,
    next_sequence: u64,
}

impl BlockPool {
    fn block(&self, index: usize) -> Option<&ArenaBlock> {
        self.slots.get(index).and_then(|slot| slot.block.as_ref())
    }

    fn block_mut(&mut self, index: usize) -> Option<&mut ArenaBlock> {
        self.slots.get_mut(index).and_then(|slot| slot.block.as_mut())
    }

    fn handle(&self, index: usize) -> BlockHandle {
        BlockHandle {
            slot: u32::try_from(index).unwrap_or(u32::MAX),
            generation: self.slots.get(index).map_or(0, |slot| slot.generation),
        }
    }

    fn insert(&mut self, block: ArenaBlock) -> usize {
        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.block = Some(block);
            index
        } else {
            self.slots.push(Slot { generation: 0, block: Some(block) });
            self.slots.len() - 1
        }
    }

    fn release(&mut self, index: usize) -> Option<ArenaBlock> {
        let block = self.slots.get_mut(index)?.block.take()?;
        self.free_slots.push(index);
        self.mapped_bytes -= block.mapping.len;
        Some(block)
    }

    /// Slot indices from oldest to newest
    fn order(&self) -> Vec<usize> {
        let Some(mut oldest) = self.newest else {
            return Vec::new();
        };
        while let Some(prev) = self.block(oldest).and_then(|b| b.prev) {
            oldest = prev;
        }

        let mut order = Vec::new();
        let mut cursor = Some(oldest);
        while let Some(index) = cursor {
            order.push(index);
            cursor = self.block(index).and_then(|b| b.next);
        }
        order
    }
}

/// A reserved, exclusively writable region inside an arena block
///
/// Holds the pool read lock, so the block cannot be freed while the region
/// is being written.
pub struct Reservation<'a> {
    pool: RwLockReadGuard<'a, BlockPool>,
    slot: usize,
    offset: usize,
    len: usize,
}

impl Reservation<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the block the region lives in
    #[must_use]
    pub fn block(&self) -> BlockHandle {
        self.pool.handle(self.slot)
    }

    /// Offset of the region from the end of the block header
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The reserved bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let Some(block) = self.pool.block(self.slot) else {
            return &mut [];
        };
        // SAFETY: `fetch_add` on the block cursor handed this [offset, offset+len)
        // range to this reservation alone, the range is inside the mapping
        // (checked in `try_reserve`), and the read guard keeps the block mapped.
        unsafe {
            std::slice::from_raw_parts_mut(
                block.mapping.as_ptr().add(BLOCK_HEADER_SIZE + self.offset),
                self.len,
            )
        }
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Multi-producer bump allocator over mapped blocks
pub struct Arena {
    config: ArenaConfig,
    pool: RwLock<BlockPool>,
    blocks_mapped: AtomicU64,
    blocks_unmapped: AtomicU64,
    failed: AtomicU64,
}

impl Arena {
    #[must_use]
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(BlockPool::default()),
            blocks_mapped: AtomicU64::new(0),
            blocks_unmapped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes (rounded up to the record alignment)
    ///
    /// Only valid while the owning gate is paused; the buffered log checks
    /// that before calling.
    ///
    /// # Errors
    /// Returns an error if a new block was needed and could not be mapped,
    /// either because `mmap` failed or the configured budget is exhausted.
    pub fn alloc(&self, size: usize) -> Result<Reservation<'_>, ArenaError> {
        let size = align_record(size.max(1));
        loop {
            let pool = self.pool.read();
            let observed = pool.newest.map(|index| pool.handle(index));
            if let Some(index) = pool.newest {
                if let Some(offset) = pool.block(index).and_then(|b| b.try_reserve(size)) {
                    return Ok(Reservation { pool, slot: index, offset, len: size });
                }
            }
            drop(pool);

            let mut pool = self.pool.write();
            let current = pool.newest.map(|index| pool.handle(index));
            if current != observed {
                // Another thread already linked a fresh block
                continue;
            }
            if observed.and_then(|handle| pool.block(handle.slot as usize)).is_some_and(|b| b.fits(size)) {
                // Reopened after another thread's failed grow
                continue;
            }
            if let Err(err) = self.grow(&mut pool, size) {
                // Only this reservation is dropped; the current block stays open
                if let Some(block) = observed.and_then(|handle| pool.block_mut(handle.slot as usize)) {
                    block.reopen();
                }
                self.failed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        }
    }

    fn grow(&self, pool: &mut BlockPool, size: usize) -> Result<(), ArenaError> {
        let block_size = self.config.block_size;
        let needed = size.checked_add(BLOCK_HEADER_SIZE).ok_or(ArenaError::SizeOverflow(size))?;
        let map_len = needed
            .div_ceil(block_size)
            .checked_mul(block_size)
            .ok_or(ArenaError::SizeOverflow(size))?
            .max(block_size);

        if let Some(limit) = self.config.max_bytes {
            if pool.mapped_bytes + map_len > limit {
                return Err(ArenaError::BudgetExhausted {
                    mapped: pool.mapped_bytes,
                    requested: map_len,
                    limit,
                });
            }
        }

        let mapping = Mapping::map(map_len)?;
        let sequence = pool.next_sequence;
        pool.next_sequence += 1;

        let mut block = ArenaBlock::new(mapping, sequence);
        let previous = pool.newest;
        block.prev = previous;
        let index = pool.insert(block);

        if let Some(prev) = previous {
            if let Some(old) = pool.block_mut(prev) {
                old.retire();
                old.next = Some(index);
            }
        }

        pool.newest = Some(index);
        pool.mapped_bytes += map_len;
        self.blocks_mapped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Visit every block's used bytes from oldest to newest
    ///
    /// Holds the write lock for the whole walk, so no reservation can be in
    /// progress while `f` reads.
    pub fn for_each_block<F>(&self, mut f: F)
    where
        F: FnMut(BlockInfo, &[u8]),
    {
        let pool = self.pool.write();
        for index in pool.order() {
            if let Some(block) = pool.block(index) {
                let info = BlockInfo {
                    handle: pool.handle(index),
                    sequence: block.sequence,
                    size: block.mapping.len,
                    used: block.high_water(),
                };
                f(info, block.used_bytes());
            }
        }
    }

    /// Snapshot of every live block in allocation order
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        self.for_each_block(|info, _| blocks.push(info));
        blocks
    }

    /// Whether `handle` still names a live block
    #[must_use]
    pub fn is_live(&self, handle: BlockHandle) -> bool {
        let pool = self.pool.read();
        pool.slots
            .get(handle.slot as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.block.is_some())
    }

    /// Unmap every block
    pub fn free_all(&self) {
        let mut pool = self.pool.write();
        let indices = pool.order();
        let freed = indices.len();
        for index in indices {
            drop(pool.release(index));
        }
        pool.newest = None;
        self.blocks_unmapped.fetch_add(freed as u64, Ordering::Relaxed);
        if freed > 0 {
            debug!("arena: unmapped {freed} blocks");
        }
    }

    /// Keep only the newest block (emptied) and unmap the rest
    ///
    /// Keeps one warm block across GC cycles instead of remapping every time.
    pub fn free_all_but_current(&self) {
        let mut pool = self.pool.write();
        let Some(newest) = pool.newest else {
            return;
        };
        let older: Vec<usize> = pool.order().into_iter().filter(|index| *index != newest).collect();
        let freed = older.len();
        for index in older {
            drop(pool.release(index));
        }
        if let Some(block) = pool.block_mut(newest) {
            block.reset();
        }
        self.blocks_unmapped.fetch_add(freed as u64, Ordering::Relaxed);
        if freed > 0 {
            debug!("arena: unmapped {freed} blocks, kept block #{newest}");
        }
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let pool = self.pool.read();
        ArenaStats {
            blocks_mapped: self.blocks_mapped.load(Ordering::Relaxed),
            blocks_unmapped: self.blocks_unmapped.load(Ordering::Relaxed),
            failed_allocations: self.failed.load(Ordering::Relaxed),
            live_blocks: pool.slots.iter().filter(|slot| slot.block.is_some()).count(),
            mapped_bytes: pool.mapped_bytes,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.free_all();
    }
}
