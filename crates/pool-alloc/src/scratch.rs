use std::sync::Mutex;

use tracing::warn;

use crate::{AllocError, BlockRef, PoolAllocator};

/// Pool block released automatically when the guard goes out of scope.
///
/// The pool lock is only held while a closure passed to [`ScratchBuffer::with`]
/// or its siblings runs, never for the guard's whole lifetime.
pub struct ScratchBuffer<'p> {
    pool: &'p Mutex<PoolAllocator>,
    block: BlockRef,
    len: usize,
}

impl<'p> ScratchBuffer<'p> {
    pub fn acquire(pool: &'p Mutex<PoolAllocator>, len: usize) -> Result<Self, AllocError> {
        let block = pool
            .lock()
            .map_err(|_| AllocError::Poisoned)?
            .allocate(len)?;
        Ok(Self { pool, block, len })
    }

    /// Requested length; the underlying block may be slightly larger.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block(&self) -> BlockRef {
        self.block
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, AllocError> {
        let guard = self.pool.lock().map_err(|_| AllocError::Poisoned)?;
        let bytes = guard
            .payload(self.block)
            .ok_or(AllocError::CorruptBlock(self.block.offset()))?;
        Ok(f(&bytes[..self.len]))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, AllocError> {
        let mut guard = self.pool.lock().map_err(|_| AllocError::Poisoned)?;
        let bytes = guard
            .payload_mut(self.block)
            .ok_or(AllocError::CorruptBlock(self.block.offset()))?;
        Ok(f(&mut bytes[..self.len]))
    }

    /// Copy the payload into `out`, replacing its contents.
    pub fn read_into(&self, out: &mut Vec<u8>) -> Result<(), AllocError> {
        self.with(|bytes| {
            out.clear();
            out.extend_from_slice(bytes);
        })
    }

    /// Overwrite the payload with `src`, which must be exactly [`len`](Self::len) bytes.
    pub fn write_from(&self, src: &[u8]) -> Result<(), AllocError> {
        if src.len() != self.len {
            return Err(AllocError::LengthMismatch {
                expected: self.len,
                actual: src.len(),
            });
        }
        self.with_mut(|bytes| bytes.copy_from_slice(src))
    }

    /// Read this buffer while writing `dst`, under a single lock acquisition.
    ///
    /// Keep `f` short: every other pool user waits for it.
    pub fn with_pair<R>(
        &self,
        dst: &ScratchBuffer<'_>,
        f: impl FnOnce(&[u8], &mut [u8]) -> R,
    ) -> Result<R, AllocError> {
        let mut guard = self.pool.lock().map_err(|_| AllocError::Poisoned)?;
        let (src, out) = guard
            .payload_pair(self.block, dst.block)
            .ok_or(AllocError::CorruptBlock(dst.block.offset()))?;
        Ok(f(&src[..self.len], &mut out[..dst.len]))
    }
}

impl Drop for ScratchBuffer<'_> {
    fn drop(&mut self) {
        match self.pool.lock() {
            Ok(mut pool) => {
                if let Err(err) = pool.free(self.block) {
                    warn!("scratch release failed: {err}");
                }
            }
            Err(_) => warn!("scratch release skipped: pool lock poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ManualClock;

    #[test]
    fn guard_releases_on_drop() {
        let pool = PoolAllocator::shared(1024, Arc::new(ManualClock::new())).unwrap();
        {
            let scratch = ScratchBuffer::acquire(&pool, 10).unwrap();
            scratch.with_mut(|bytes| bytes.fill(3)).unwrap();
            assert_eq!(scratch.with(|bytes| bytes.to_vec()).unwrap(), vec![3; 10]);
            assert_eq!(pool.lock().unwrap().live_blocks(), 1);
        }
        let stats = pool.lock().unwrap().stats();
        assert_eq!(stats.allocated_size, 0);
        assert_eq!(stats.free_count, 1);
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn fails(pool: &Mutex<PoolAllocator>) -> Result<(), AllocError> {
            let _first = ScratchBuffer::acquire(pool, 64)?;
            let _second = ScratchBuffer::acquire(pool, 4096)?;
            Ok(())
        }
        let pool = PoolAllocator::shared(512, Arc::new(ManualClock::new())).unwrap();
        assert!(fails(&pool).is_err());
        assert_eq!(pool.lock().unwrap().stats().allocated_size, 0);
    }

    #[test]
    fn pair_copies_between_buffers() {
        let pool = PoolAllocator::shared(1024, Arc::new(ManualClock::new())).unwrap();
        let src = ScratchBuffer::acquire(&pool, 4).unwrap();
        let dst = ScratchBuffer::acquire(&pool, 4).unwrap();
        src.with_mut(|b| b.copy_from_slice(&[1, 2, 3, 4])).unwrap();
        src.with_pair(&dst, |from, to| to.copy_from_slice(from)).unwrap();
        assert_eq!(dst.with(|b| b.to_vec()).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn staged_copies_leave_the_pool_unlocked() {
        let pool = PoolAllocator::shared(1024, Arc::new(ManualClock::new())).unwrap();
        let scratch = ScratchBuffer::acquire(&pool, 3).unwrap();
        scratch.write_from(&[7, 8, 9]).unwrap();
        let mut staged = vec![0xFF; 16];
        scratch.read_into(&mut staged).unwrap();
        assert_eq!(staged, vec![7, 8, 9]);
        assert!(pool.try_lock().is_ok());
        assert!(scratch.write_from(&[1, 2]).is_err());
    }
}
