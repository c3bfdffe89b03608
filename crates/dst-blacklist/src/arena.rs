//! Bounded shared memory arena
//!
//! Models the shared memory pool the blacklist draws its storage from. The
//! arena only does the accounting: a successful [`ShmArena::alloc`] hands back
//! an [`ArenaBlock`] token that must be returned through [`ShmArena::free`].
//! Tokens are move-only, so a block cannot be returned twice.
//!
//! Allocation never blocks: the used counter is updated with a
//! compare-and-swap loop and a request that does not fit fails immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{BlacklistError, Result};

#[derive(Debug)]
struct ArenaInner {
    capacity: usize,
    used: AtomicUsize,
    blocks: AtomicUsize,
}

/// Bounded pool of bytes shared by every clone of the handle
#[derive(Debug, Clone)]
pub struct ShmArena {
    inner: Arc<ArenaInner>,
}

/// Proof of a live allocation of `size` bytes
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an arena block leaks unless it is returned with ShmArena::free"]
pub struct ArenaBlock {
    size: usize,
}

impl ArenaBlock {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl ShmArena {
    /// Create an arena holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                capacity,
                used: AtomicUsize::new(0),
                blocks: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an arena sized in KiB
    pub fn with_kb(kb: usize) -> Self {
        Self::new(kb << 10)
    }

    /// Reserve `size` bytes
    pub fn alloc(&self, size: usize) -> Result<ArenaBlock> {
        let mut used = self.inner.used.load(Ordering::Relaxed);
        loop {
            let available = self.inner.capacity.saturating_sub(used);
            if size > available {
                return Err(BlacklistError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
            match self.inner.used.compare_exchange_weak(
                used,
                used + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => used = current,
            }
        }
        self.inner.blocks.fetch_add(1, Ordering::Relaxed);
        Ok(ArenaBlock { size })
    }

    /// Return a block to the pool
    pub fn free(&self, block: ArenaBlock) {
        let previous = self.inner.used.fetch_sub(block.size, Ordering::AcqRel);
        assert!(
            previous >= block.size,
            "arena accounting corrupted: freeing {} bytes with {} in use",
            block.size,
            previous
        );
        self.inner.blocks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bytes currently allocated
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.capacity.saturating_sub(self.used())
    }

    /// Number of live blocks
    pub fn blocks(&self) -> usize {
        self.inner.blocks.load(Ordering::Relaxed)
    }
}
