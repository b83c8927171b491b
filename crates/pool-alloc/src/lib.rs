//! Fixed-capacity arena allocator serving the inference stage's scratch
//! buffers.
//!
//! Blocks are carved from the arena tail (bump allocation, O(1)) and carry an
//! inline header holding a validation tag, the payload size, the allocation
//! timestamp and two links: one into the list of live blocks (used for leak
//! sweeps) and one to the block physically below (used to roll the tail back).
//!
//! Freed space is only reused when it sits on top of the arena: releasing the
//! topmost block rolls the tail back over every contiguous freed block below
//! it, so per-frame scratch released in LIFO order leaves the arena empty at
//! the end of each cycle. Holes in the middle of the arena are reclaimed only
//! by [`PoolAllocator::init`].

pub mod clock;
mod scratch;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use scratch::ScratchBuffer;

/// Tag stamped into every live block header.
pub const BLOCK_MAGIC: u32 = 0xABCD_EF01;
/// Payload sizes are rounded up to this boundary.
pub const BLOCK_ALIGN: usize = 8;
/// Inline header bytes preceding every payload.
pub const HEADER_SIZE: usize = 24;
/// Live blocks older than this are reported by [`PoolAllocator::check_leaks`].
pub const LEAK_AGE_MS: u64 = 30_000;

const NO_LINK: u32 = u32::MAX;

const MAGIC_AT: usize = 0;
const SIZE_AT: usize = 4;
const NEXT_AT: usize = 8;
const BELOW_AT: usize = 12;
const STAMP_AT: usize = 16;

/// Pool shared between the inference task and the monitor.
pub type SharedPool = Arc<Mutex<PoolAllocator>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("zero-sized allocation requested")]
    ZeroSize,
    #[error("pool exhausted: {allocated} + {requested} > {capacity} bytes")]
    OutOfMemory {
        requested: usize,
        allocated: usize,
        capacity: usize,
    },
    #[error("arena tail exhausted: block of {requested} bytes does not fit at offset {tail}")]
    Fragmented { requested: usize, tail: usize },
    #[error("pool capacity {0} is not addressable by block headers")]
    InvalidCapacity(usize),
    #[error("block at payload offset {0} has an invalid tag")]
    CorruptBlock(usize),
    #[error("block at payload offset {0} is not in the live list")]
    UnknownBlock(usize),
    #[error("payload holds {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("pool lock poisoned")]
    Poisoned,
}

/// Handle to a payload inside the arena.
///
/// Handles are plain offsets and may be copied; freeing the same handle twice
/// is detected through the header tag and counted as a leak event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    payload: usize,
}

impl BlockRef {
    /// Build a handle from a raw payload offset.
    pub fn from_offset(payload: usize) -> Self {
        Self { payload }
    }

    pub fn offset(self) -> usize {
        self.payload
    }
}

/// Allocator-wide counters, reset only by [`PoolAllocator::init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub allocated_size: usize,
    pub peak_usage: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    pub leak_count: u64,
}

impl PoolStats {
    pub fn used_bytes(&self) -> usize {
        self.allocated_size
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity - self.allocated_size
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_usage
    }

    pub fn usage_percent(&self) -> u32 {
        if self.capacity == 0 {
            return 0;
        }
        ((self.allocated_size as u64 * 100) / self.capacity as u64) as u32
    }
}

pub struct PoolAllocator {
    arena: Box<[u8]>,
    tail: usize,
    head: Option<usize>,
    top: Option<usize>,
    stats: PoolStats,
    clock: SharedClock,
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("capacity", &self.arena.len())
            .field("tail", &self.tail)
            .field("stats", &self.stats)
            .finish()
    }
}

impl PoolAllocator {
    /// Create an empty pool with a fixed capacity.
    pub fn new(capacity: usize, clock: SharedClock) -> Result<Self, AllocError> {
        if capacity < HEADER_SIZE || capacity >= NO_LINK as usize {
            return Err(AllocError::InvalidCapacity(capacity));
        }
        Ok(Self {
            arena: vec![0u8; capacity].into_boxed_slice(),
            tail: 0,
            head: None,
            top: None,
            stats: PoolStats {
                capacity,
                ..PoolStats::default()
            },
            clock,
        })
    }

    /// Convenience wrapper returning the pool behind its mutex.
    pub fn shared(capacity: usize, clock: SharedClock) -> Result<SharedPool, AllocError> {
        Ok(Arc::new(Mutex::new(Self::new(capacity, clock)?)))
    }

    /// Reset the arena to empty, dropping every live block and all counters.
    pub fn init(&mut self) {
        self.arena.fill(0);
        self.tail = 0;
        self.head = None;
        self.top = None;
        self.stats = PoolStats {
            capacity: self.arena.len(),
            ..PoolStats::default()
        };
        debug!(capacity = self.arena.len(), "pool allocator initialised");
    }

    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Carve a block holding at least `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Result<BlockRef, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let capacity = self.arena.len();
        let payload = size
            .checked_add(BLOCK_ALIGN - 1)
            .map(|s| s & !(BLOCK_ALIGN - 1))
            .ok_or(AllocError::OutOfMemory {
                requested: size,
                allocated: self.stats.allocated_size,
                capacity,
            })?;
        let total = HEADER_SIZE.saturating_add(payload);

        if self.stats.allocated_size.saturating_add(total) > capacity {
            debug!(
                requested = total,
                allocated = self.stats.allocated_size,
                capacity,
                "pool allocation refused"
            );
            return Err(AllocError::OutOfMemory {
                requested: total,
                allocated: self.stats.allocated_size,
                capacity,
            });
        }
        if self.tail.saturating_add(total) > capacity {
            return Err(AllocError::Fragmented {
                requested: total,
                tail: self.tail,
            });
        }

        let offset = self.tail;
        let now = self.clock.now_ms();
        self.write_u32(offset + MAGIC_AT, BLOCK_MAGIC);
        self.write_u32(offset + SIZE_AT, payload as u32);
        self.write_link(offset + NEXT_AT, self.head);
        self.write_link(offset + BELOW_AT, self.top);
        self.write_u64(offset + STAMP_AT, now);

        self.head = Some(offset);
        self.top = Some(offset);
        self.tail += total;

        self.stats.allocated_size += total;
        self.stats.allocation_count += 1;
        if self.stats.allocated_size > self.stats.peak_usage {
            self.stats.peak_usage = self.stats.allocated_size;
        }

        Ok(BlockRef {
            payload: offset + HEADER_SIZE,
        })
    }

    /// Release a block. Invalid or unknown handles only bump the leak counter.
    pub fn free(&mut self, block: BlockRef) -> Result<(), AllocError> {
        let Some(offset) = self.header_of(block) else {
            warn!(payload = block.payload, "free of block with invalid tag");
            self.stats.leak_count += 1;
            return Err(AllocError::CorruptBlock(block.payload));
        };

        if !self.unlink(offset) {
            warn!(payload = block.payload, "free of block missing from live list");
            self.stats.leak_count += 1;
            return Err(AllocError::UnknownBlock(block.payload));
        }

        let total = HEADER_SIZE + self.read_u32(offset + SIZE_AT) as usize;
        self.stats.allocated_size -= total;
        self.stats.free_count += 1;
        self.write_u32(offset + MAGIC_AT, 0);

        if self.top == Some(offset) {
            self.roll_back_tail(offset);
        }
        Ok(())
    }

    /// Count live blocks older than [`LEAK_AGE_MS`]. Nothing is freed.
    pub fn check_leaks(&mut self) -> u32 {
        let now = self.clock.now_ms();
        let mut leaks = 0u32;
        let mut cursor = self.head;
        while let Some(offset) = cursor {
            let age = now.saturating_sub(self.read_u64(offset + STAMP_AT));
            if age > LEAK_AGE_MS {
                warn!(
                    payload = offset + HEADER_SIZE,
                    size = self.read_u32(offset + SIZE_AT),
                    age_ms = age,
                    "potential pool leak"
                );
                leaks += 1;
            }
            cursor = self.read_link(offset + NEXT_AT);
        }
        self.stats.leak_count += u64::from(leaks);
        leaks
    }

    /// Number of blocks currently in the live list.
    pub fn live_blocks(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(offset) = cursor {
            count += 1;
            cursor = self.read_link(offset + NEXT_AT);
        }
        count
    }

    pub fn payload(&self, block: BlockRef) -> Option<&[u8]> {
        let offset = self.header_of(block)?;
        let len = self.read_u32(offset + SIZE_AT) as usize;
        self.arena.get(block.payload..block.payload + len)
    }

    pub fn payload_mut(&mut self, block: BlockRef) -> Option<&mut [u8]> {
        let offset = self.header_of(block)?;
        let len = self.read_u32(offset + SIZE_AT) as usize;
        self.arena.get_mut(block.payload..block.payload + len)
    }

    /// Borrow one payload for reading and another for writing at the same time.
    pub fn payload_pair(&mut self, src: BlockRef, dst: BlockRef) -> Option<(&[u8], &mut [u8])> {
        let src_len = self.read_u32(self.header_of(src)? + SIZE_AT) as usize;
        let dst_len = self.read_u32(self.header_of(dst)? + SIZE_AT) as usize;
        if src.payload == dst.payload {
            return None;
        }
        if src.payload < dst.payload {
            let (low, high) = self.arena.split_at_mut(dst.payload);
            Some((
                &low[src.payload..src.payload + src_len],
                &mut high[..dst_len],
            ))
        } else {
            let (low, high) = self.arena.split_at_mut(src.payload);
            Some((&high[..src_len], &mut low[dst.payload..dst.payload + dst_len]))
        }
    }

    fn header_of(&self, block: BlockRef) -> Option<usize> {
        let offset = block.payload.checked_sub(HEADER_SIZE)?;
        if block.payload >= self.tail || offset % BLOCK_ALIGN != 0 {
            return None;
        }
        (self.read_u32(offset + MAGIC_AT) == BLOCK_MAGIC).then_some(offset)
    }

    fn unlink(&mut self, offset: usize) -> bool {
        let next = self.read_link(offset + NEXT_AT);
        if self.head == Some(offset) {
            self.head = next;
            return true;
        }
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let following = self.read_link(current + NEXT_AT);
            if following == Some(offset) {
                self.write_link(current + NEXT_AT, next);
                return true;
            }
            cursor = following;
        }
        false
    }

    fn roll_back_tail(&mut self, mut offset: usize) {
        loop {
            self.tail = offset;
            self.top = self.read_link(offset + BELOW_AT);
            match self.top {
                Some(below) if self.read_u32(below + MAGIC_AT) == 0 => offset = below,
                _ => break,
            }
        }
    }

    fn read_u32(&self, at: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.arena[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, at: usize, value: u32) {
        self.arena[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.arena[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, at: usize, value: u64) {
        self.arena[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_link(&self, at: usize) -> Option<usize> {
        match self.read_u32(at) {
            NO_LINK => None,
            link => Some(link as usize),
        }
    }

    fn write_link(&mut self, at: usize, link: Option<usize>) {
        self.write_u32(at, link.map_or(NO_LINK, |l| l as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> (PoolAllocator, ManualClock) {
        let clock = ManualClock::new();
        let pool = PoolAllocator::new(capacity, Arc::new(clock.clone())).unwrap();
        (pool, clock)
    }

    #[test]
    fn rounds_sizes_to_alignment() {
        let (mut pool, _) = pool(1024);
        let block = pool.allocate(5).unwrap();
        assert_eq!(pool.payload(block).unwrap().len(), 8);
        assert_eq!(pool.stats().allocated_size, HEADER_SIZE + 8);
    }

    #[test]
    fn zero_size_is_rejected_without_side_effects() {
        let (mut pool, _) = pool(1024);
        assert_eq!(pool.allocate(0), Err(AllocError::ZeroSize));
        assert_eq!(pool.stats().allocation_count, 0);
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        let (mut pool, _) = pool(128);
        pool.allocate(64).unwrap();
        let before = pool.stats();
        let err = pool.allocate(64).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn exact_fit_succeeds() {
        let (mut pool, _) = pool(HEADER_SIZE + 40);
        pool.allocate(40).unwrap();
        assert_eq!(pool.stats().free_bytes(), 0);
    }

    #[test]
    fn double_free_counts_as_leak_event() {
        let (mut pool, _) = pool(256);
        let _keep = pool.allocate(16).unwrap();
        let block = pool.allocate(16).unwrap();
        pool.free(block).unwrap();
        assert!(pool.free(block).is_err());
        assert_eq!(pool.stats().leak_count, 1);
        assert_eq!(pool.stats().free_count, 1);
    }

    #[test]
    fn forged_handle_is_rejected() {
        let (mut pool, _) = pool(256);
        pool.allocate(32).unwrap();
        assert_eq!(
            pool.free(BlockRef::from_offset(HEADER_SIZE + 8)),
            Err(AllocError::CorruptBlock(HEADER_SIZE + 8))
        );
        assert_eq!(pool.stats().leak_count, 1);
    }

    #[test]
    fn freeing_interior_block_walks_the_list() {
        let (mut pool, _) = pool(1024);
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        let c = pool.allocate(16).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.live_blocks(), 2);
        pool.free(b).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.live_blocks(), 0);
    }

    #[test]
    fn lifo_release_rewinds_the_tail() {
        let (mut pool, _) = pool(HEADER_SIZE * 2 + 64);
        for _ in 0..10 {
            let a = pool.allocate(32).unwrap();
            let b = pool.allocate(32).unwrap();
            pool.free(b).unwrap();
            pool.free(a).unwrap();
        }
        assert_eq!(pool.stats().allocated_size, 0);
        assert_eq!(pool.stats().allocation_count, 20);
    }

    #[test]
    fn freeing_top_rewinds_over_freed_interior_blocks() {
        let (mut pool, _) = pool(HEADER_SIZE * 2 + 64);
        let a = pool.allocate(32).unwrap();
        let b = pool.allocate(32).unwrap();
        pool.free(a).unwrap();
        assert!(matches!(
            pool.allocate(32),
            Err(AllocError::Fragmented { .. })
        ));
        pool.free(b).unwrap();
        assert!(pool.allocate(32).is_ok());
    }

    #[test]
    fn payload_pair_splits_disjoint_blocks() {
        let (mut pool, _) = pool(1024);
        let src = pool.allocate(8).unwrap();
        let dst = pool.allocate(8).unwrap();
        pool.payload_mut(src).unwrap().copy_from_slice(&[7; 8]);
        let (from, to) = pool.payload_pair(src, dst).unwrap();
        to.copy_from_slice(from);
        assert_eq!(pool.payload(dst).unwrap(), &[7; 8]);
        assert!(pool.payload_pair(src, src).is_none());
    }

    #[test]
    fn init_clears_blocks_and_counters() {
        let (mut pool, _) = pool(512);
        pool.allocate(100).unwrap();
        pool.init();
        assert_eq!(pool.stats(), PoolStats { capacity: 512, ..PoolStats::default() });
        assert_eq!(pool.live_blocks(), 0);
    }

    #[test]
    fn invalid_capacity_is_rejected() {
        let clock: SharedClock = Arc::new(ManualClock::new());
        assert!(PoolAllocator::new(4, clock).is_err());
    }
}
