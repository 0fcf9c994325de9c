//! Buffer Pool.
//!
//! A fixed-count set of DMA buffer objects, each tracked by an `in_use` flag
//! reflecting kernel-driver ownership. The pool owns
//! all CPU-side mapping/unmapping and all device-side request/release calls;
//! callers never touch a `BufferObject`'s fd lifecycle directly.

use log::debug;

use crate::dma_heap::{BufferObject, DmaHeapAllocator};
use crate::error::{PlayerError, Result};
use crate::v4l2::{Device, Queue};

pub struct BufferPool {
    queue: Queue,
    count: usize,
    buffers: Vec<BufferObject>,
    in_use: Vec<bool>,
    cursor: usize,
}

impl BufferPool {
    pub fn new(queue: Queue, count: usize) -> Self {
        BufferPool {
            queue,
            count,
            buffers: Vec::new(),
            in_use: Vec::new(),
            cursor: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Pre-allocates and CPU-maps all `count` slots at `buffer_size` bytes.
    /// On partial failure, everything allocated so far is torn back down —
    /// the pool is either fully allocated or empty, never partial.
    pub fn allocate(&mut self, allocator: &DmaHeapAllocator, buffer_size: usize) -> Result<()> {
        self.deallocate(allocator);

        let mut buffers = Vec::with_capacity(self.count);
        for i in 0..self.count {
            let mut object = allocator.allocate(buffer_size)?;
            if let Err(e) = allocator.map(&mut object) {
                for mut leftover in buffers {
                    allocator.release(&mut leftover);
                }
                return Err(e);
            }
            allocator.set_name(&mut object, &format!("{:?}-slot{}", self.queue, i));
            buffers.push(object);
        }

        self.in_use = vec![false; self.count];
        self.buffers = buffers;
        self.cursor = 0;
        Ok(())
    }

    /// Unmaps and releases every slot, then clears the pool. Idempotent.
    pub fn deallocate(&mut self, allocator: &DmaHeapAllocator) {
        for object in &mut self.buffers {
            allocator.release(object);
        }
        self.buffers.clear();
        self.in_use.clear();
        self.cursor = 0;
    }

    /// Asks the kernel to prepare `count` shared-memory slots on this queue.
    pub fn request_on_device(&self, device: &mut Device) -> Result<()> {
        let granted = device.request_buffers(self.queue, self.count as u32)?;
        if (granted as usize) < self.count {
            debug!(
                "{:?} queue granted only {} of {} requested buffers",
                self.queue, granted, self.count
            );
        }
        Ok(())
    }

    /// Asks the kernel to release all buffers on this queue (request 0).
    pub fn release_on_device(&self, device: &mut Device) {
        if let Err(e) = device.request_buffers(self.queue, 0) {
            debug!("releasing {:?} queue buffers on device failed: {e}", self.queue);
        }
    }

    /// Pure peek: the next free slot starting at `cursor`, distributing
    /// reuse round-robin. Does not mutate state.
    pub fn get_free_buffer_index(&self) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        (0..self.count)
            .map(|i| (self.cursor + i) % self.count)
            .find(|&idx| !self.in_use[idx])
    }

    /// Commits a slot to driver ownership. Advances the cursor only when
    /// `index` equals the current cursor, matching the round-robin
    /// invariant. Out-of-range indices are silent no-ops.
    pub fn mark_in_use(&mut self, index: usize) {
        if index >= self.count {
            return;
        }
        self.in_use[index] = true;
        if index == self.cursor {
            self.cursor = (self.cursor + 1) % self.count;
        }
    }

    /// Returns a slot to userspace ownership. Out-of-range indices are
    /// silent no-ops.
    pub fn mark_free(&mut self, index: usize) {
        if index >= self.count {
            return;
        }
        self.in_use[index] = false;
    }

    pub fn is_in_use(&self, index: usize) -> bool {
        self.in_use.get(index).copied().unwrap_or(false)
    }

    pub fn slot(&self, index: usize) -> Option<&BufferObject> {
        self.buffers.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut BufferObject> {
        self.buffers.get_mut(index)
    }

    /// Writes the pre-paint sentinel (`{luma=16, chroma=128}`) across every
    /// slot so the presenter's content-liveness heuristic has something to
    /// detect on genuinely untouched buffers.
    pub fn pre_paint_420(&mut self, width: u32, height: u32) {
        let luma_len = (width as usize) * (height as usize);
        for object in &mut self.buffers {
            let buf = object.as_mut_slice();
            if buf.is_empty() {
                continue;
            }
            let luma_end = luma_len.min(buf.len());
            buf[..luma_end].fill(16);
            if luma_end < buf.len() {
                buf[luma_end..].fill(128);
            }
        }
    }

    pub fn get_slot_size(&self, index: usize) -> Result<usize> {
        self.buffers
            .get(index)
            .map(|b| b.size())
            .ok_or(PlayerError::DecoderRejected { index })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn empty_pool(count: usize) -> BufferPool {
        let mut pool = BufferPool::new(Queue::Input, count);
        pool.in_use = vec![false; count];
        pool.buffers = Vec::new();
        pool
    }

    #[test]
    fn free_index_is_pure_peek() {
        let pool = empty_pool(4);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
        assert_eq!(pool.get_free_buffer_index(), Some(0));
    }

    #[test]
    fn cursor_advances_round_robin_on_commit() {
        let mut pool = empty_pool(3);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
        pool.mark_in_use(0);
        assert_eq!(pool.get_free_buffer_index(), Some(1));
        pool.mark_in_use(1);
        assert_eq!(pool.get_free_buffer_index(), Some(2));
        pool.mark_free(0);
        // cursor is now 2; 0 is free again but cursor skips to it only after 2.
        assert_eq!(pool.get_free_buffer_index(), Some(2));
    }

    #[test]
    fn marking_out_of_range_is_a_silent_noop() {
        let mut pool = empty_pool(2);
        pool.mark_in_use(99);
        pool.mark_free(99);
        assert_eq!(pool.get_free_buffer_index(), Some(0));
    }

    #[test]
    fn exhausted_pool_reports_no_free_slot() {
        let mut pool = empty_pool(2);
        pool.mark_in_use(0);
        pool.mark_in_use(1);
        assert_eq!(pool.get_free_buffer_index(), None);
    }

    #[test]
    fn empty_pool_reports_no_free_slot() {
        let pool = empty_pool(0);
        assert_eq!(pool.get_free_buffer_index(), None);
    }
}
