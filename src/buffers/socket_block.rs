use bytes::BytesMut;
use tracing::{debug, trace};
use crate::buffers::shared_pool::SharedBlockPool;

/// Identifies a block that is (or was) in use by a channel. The generation is incremented every
///  time the block's slot is recycled, so a stale id never matches a block that has since been
///  reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

struct BlockSlot {
    generation: u32,
    /// the part of the block that was not yet sliced; None if the slot is vacant
    block: Option<BytesMut>,
    outstanding_slices: usize,
    /// taken from the shared pool on top of the guaranteed blocks
    borrowed: bool,
}

/// A channel's output blocks: the arena of blocks currently in use, plus the free guaranteed
///  blocks.
///
/// Each block is either free (in `available`, or in the shared pool), or in use in exactly one
///  slot. A block in use is recycled when its last slice is returned, unless it is the current
///  block that new slices are being cut from.
pub struct SocketBlocks {
    block_size: usize,
    slots: Vec<BlockSlot>,
    vacant_slots: Vec<u32>,
    available: Vec<BytesMut>,
    current: Option<u32>,
    guaranteed: usize,
    max: usize,
    used: usize,
    borrow_from_shared: bool,
}

impl SocketBlocks {
    /// `borrow_from_shared` allows taking blocks from the shared pool (up to `max` blocks in use)
    ///  when all guaranteed blocks are in use. This is the behavior for server side channels.
    pub fn new(block_size: usize, max: usize, borrow_from_shared: bool) -> SocketBlocks {
        SocketBlocks {
            block_size,
            slots: Vec::new(),
            vacant_slots: Vec::new(),
            available: Vec::new(),
            current: None,
            guaranteed: 0,
            max,
            used: 0,
            borrow_from_shared,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// number of blocks in use, i.e. with outstanding slices or being sliced
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn guaranteed(&self) -> usize {
        self.guaranteed
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn num_available(&self) -> usize {
        self.available.len()
    }

    /// The maximum is never below the number of guaranteed blocks. Returns the effective value.
    pub fn set_max(&mut self, max: usize) -> usize {
        self.max = max.max(self.guaranteed);
        self.max
    }

    /// Moves blocks from the shared pool to this channel's guaranteed blocks
    pub fn grow_guaranteed(&mut self, num_blocks: usize, shared: &SharedBlockPool) {
        if num_blocks == 0 {
            return;
        }

        let mut guard = shared.lock();
        for _ in 0..num_blocks {
            self.available.push(guard.take(self.block_size));
        }
        self.guaranteed += num_blocks;
        if self.max < self.guaranteed {
            self.max = self.guaranteed;
        }
        debug!("grew guaranteed blocks by {} to {}", num_blocks, self.guaranteed);
    }

    /// Moves up to `num_blocks` *free* guaranteed blocks back to the shared pool. Blocks that are
    ///  in use are never touched. Returns the number of blocks that were moved.
    pub fn shrink_guaranteed(&mut self, num_blocks: usize, shared: &SharedBlockPool) -> usize {
        let num_moved = num_blocks.min(self.available.len());
        if num_moved > 0 {
            let mut guard = shared.lock();
            for block in self.available.drain(self.available.len() - num_moved..) {
                guard.put(block);
            }
        }
        self.guaranteed -= num_moved;
        debug!("shrank guaranteed blocks by {} to {}", num_moved, self.guaranteed);
        num_moved
    }

    /// Adjusts the number of guaranteed blocks, returning the resulting number. This may be more
    ///  than requested when shrinking if blocks are in use.
    pub fn set_guaranteed(&mut self, num_blocks: usize, shared: &SharedBlockPool) -> usize {
        if num_blocks > self.guaranteed {
            self.grow_guaranteed(num_blocks - self.guaranteed, shared);
        }
        else if num_blocks < self.guaranteed {
            self.shrink_guaranteed(self.guaranteed - num_blocks, shared);
        }
        self.guaranteed
    }

    /// Cuts a slice of `len` bytes, moving on to a new block if the current block has too little
    ///  space left. Returns `None` if no block is available.
    pub fn slice(&mut self, len: usize, shared: &SharedBlockPool) -> Option<(BytesMut, BlockId)> {
        if len > self.block_size {
            return None;
        }

        if let Some(current) = self.current {
            if let Some(result) = self.slice_from(current, len) {
                return Some(result);
            }

            // does not fit: stop slicing this block, and recycle it if nothing is outstanding
            self.current = None;
            if self.slots[current as usize].outstanding_slices == 0 {
                self.recycle(current, shared);
            }
        }

        let (block, borrowed) = self.next_free_block(shared)?;
        let index = self.occupy_slot(block, borrowed);
        self.current = Some(index);
        self.used += 1;
        trace!("starting new block, {} blocks in use", self.used);

        self.slice_from(index, len)
    }

    fn slice_from(&mut self, index: u32, len: usize) -> Option<(BytesMut, BlockId)> {
        let slot = &mut self.slots[index as usize];
        let block = slot.block.as_mut()?;
        if block.len() < len {
            return None;
        }

        slot.outstanding_slices += 1;
        Some((block.split_to(len), BlockId { index, generation: slot.generation }))
    }

    fn next_free_block(&mut self, shared: &SharedBlockPool) -> Option<(BytesMut, bool)> {
        if let Some(block) = self.available.pop() {
            return Some((block, false));
        }
        if self.borrow_from_shared && self.used < self.max {
            return Some((shared.lock().take(self.block_size), true));
        }
        debug!("no free block: {} blocks in use", self.used);
        None
    }

    fn occupy_slot(&mut self, block: BytesMut, borrowed: bool) -> u32 {
        if let Some(index) = self.vacant_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.block = Some(block);
            slot.outstanding_slices = 0;
            slot.borrowed = borrowed;
            index
        }
        else {
            self.slots.push(BlockSlot {
                generation: 0,
                block: Some(block),
                outstanding_slices: 0,
                borrowed,
            });
            (self.slots.len() - 1) as u32
        }
    }

    /// Returns a slice to its block. The slice's memory must have been dropped by the caller
    ///  before, so that the block's memory can be reclaimed. Returns `false` if the block id is
    ///  stale, i.e. the slice does not belong to a block currently in use.
    pub fn release(&mut self, id: BlockId, shared: &SharedBlockPool) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.block.is_none() || slot.outstanding_slices == 0 {
            return false;
        }

        slot.outstanding_slices -= 1;
        if slot.outstanding_slices == 0 && self.current != Some(id.index) {
            self.recycle(id.index, shared);
        }
        true
    }

    fn recycle(&mut self, index: u32, shared: &SharedBlockPool) {
        let slot = &mut self.slots[index as usize];
        let Some(block) = slot.block.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        let borrowed = slot.borrowed;
        self.vacant_slots.push(index);
        self.used -= 1;

        let block = reclaim(block, self.block_size);
        if borrowed {
            shared.lock().put(block);
        }
        else {
            self.available.push(block);
        }
        trace!("recycled block, {} blocks in use", self.used);
    }

    /// Returns all blocks to the shared pool. Blocks with slices outstanding are dropped rather
    ///  than pooled: their memory is freed when the last slice is dropped, and releasing such a
    ///  slice later on is a no-op since all block ids are stale after this call.
    pub fn release_all(&mut self, shared: &SharedBlockPool) {
        let mut guard = shared.lock();

        for slot in self.slots.iter_mut() {
            slot.generation = slot.generation.wrapping_add(1);
            if let Some(block) = slot.block.take() {
                if slot.outstanding_slices == 0 {
                    guard.put(reclaim(block, self.block_size));
                }
            }
            slot.outstanding_slices = 0;
        }
        self.vacant_slots = (0..self.slots.len() as u32).collect();
        self.current = None;
        self.used = 0;

        for block in self.available.drain(..) {
            guard.put(block);
        }
        self.guaranteed = 0;
        debug!("returned all blocks to the shared pool");
    }
}

/// Restores a block that had slices cut from it to its full size. If the block's slices are all
///  dropped, this reuses the original allocation.
fn reclaim(mut block: BytesMut, block_size: usize) -> BytesMut {
    block.clear();
    block.reserve(block_size);
    block.resize(block_size, 0);
    block
}
