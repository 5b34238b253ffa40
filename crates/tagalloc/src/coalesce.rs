//! Merging of adjacent free blocks.

use crate::{
    Allocator,
    block::{BlockPtr, Tag},
};

impl<P> Allocator<P> {
    /// Merges the free block `block` with its free physical neighbors.
    ///
    /// `block` must already carry free tags and must not be on the free list.
    /// Neighbors that get absorbed are unlinked from the free list. The
    /// returned block is the merged one and is *not* inserted; the caller
    /// does that.
    ///
    /// | prev  | next  | result                    |
    /// |-------|-------|---------------------------|
    /// | alloc | alloc | `block` unchanged         |
    /// | alloc | free  | `block` absorbs next      |
    /// | free  | alloc | prev absorbs `block`      |
    /// | free  | free  | prev absorbs both         |
    ///
    /// The sentinels are allocated, so the neighbor lookups never leave the
    /// heap.
    pub(crate) unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        unsafe {
            let prev_allocated = block.prev_footer().is_allocated();
            let next = block.next();
            let next_allocated = next.is_allocated();
            let mut size = block.size();

            match (prev_allocated, next_allocated) {
                (true, true) => block,
                (true, false) => {
                    self.free_list.remove(next);
                    size += next.size();
                    block.set_tags(Tag::pack(size, false));
                    block
                }
                (false, true) => {
                    let prev = block.prev();
                    self.free_list.remove(prev);
                    size += prev.size();
                    prev.set_tags(Tag::pack(size, false));
                    prev
                }
                (false, false) => {
                    let prev = block.prev();
                    self.free_list.remove(prev);
                    self.free_list.remove(next);
                    size += prev.size() + next.size();
                    prev.set_tags(Tag::pack(size, false));
                    prev
                }
            }
        }
    }
}
