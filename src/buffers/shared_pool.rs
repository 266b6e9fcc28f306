use std::sync::{Mutex, MutexGuard, PoisonError};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

/// Free blocks that are not assigned to any channel, one free list per block size.
///
/// This is shared by all channels of a process (or of a server), and it is passed to each
///  channel explicitly. Moving blocks between a channel and this pool requires holding the
///  pool's lock, see [SharedBlockPool::lock].
#[derive(Default)]
pub struct SharedBlockPool {
    free_lists: Mutex<FxHashMap<usize, Vec<BytesMut>>>,
}

impl SharedBlockPool {
    pub fn new() -> SharedBlockPool {
        SharedBlockPool::default()
    }

    /// NB: the pool is never left in an inconsistent state while the lock is held, so a poisoned
    ///  lock is recovered rather than propagated
    pub fn lock(&self) -> SharedPoolGuard<'_> {
        SharedPoolGuard {
            free_lists: self.free_lists.lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn num_free(&self, block_size: usize) -> usize {
        self.lock().num_free(block_size)
    }
}

/// Exclusive access to the shared pool for a sequence of grow / shrink steps
pub struct SharedPoolGuard<'a> {
    free_lists: MutexGuard<'a, FxHashMap<usize, Vec<BytesMut>>>,
}

impl <'a> SharedPoolGuard<'a> {
    /// Returns a block of the given size, creating a new one if the pool has none
    pub fn take(&mut self, block_size: usize) -> BytesMut {
        if let Some(block) = self.free_lists.get_mut(&block_size).and_then(|l| l.pop()) {
            trace!("returning block of {} bytes from shared pool", block_size);
            return block;
        }

        debug!("no block of {} bytes in shared pool: creating new block", block_size);
        BytesMut::zeroed(block_size)
    }

    pub fn put(&mut self, block: BytesMut) {
        let block_size = block.len();
        trace!("returning block of {} bytes to shared pool", block_size);
        self.free_lists.entry(block_size)
            .or_default()
            .push(block);
    }

    pub fn num_free(&self, block_size: usize) -> usize {
        self.free_lists.get(&block_size)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}
