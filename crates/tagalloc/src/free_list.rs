//! Explicit free list.
//!
//! An unordered, doubly-linked list of free blocks. The links live in the
//! first two words of each free block's payload (see [`block`](crate::block)),
//! so the list needs no storage of its own apart from the head pointer.
//!
//! ```text
//!  head
//!   |
//!   v
//! +------+      +------+      +------+
//! | next | ---> | next | ---> | next | ---> None
//! | prev |      | prev |      | prev |
//! +------+ <--- +------+ <--- +------+
//!   |
//!   v
//!  None
//! ```
//!
//! Newly freed blocks are pushed at the head, so the most recently freed block
//! is found first by the fit search. The order carries no other meaning.

use crate::block::BlockPtr;

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<BlockPtr>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    pub(crate) const fn head(&self) -> Option<BlockPtr> {
        self.head
    }

    /// Pushes `block` at the head of the list.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `block` is a free block inside the managed heap
    /// - `block` is not already in the list
    pub(crate) unsafe fn insert(&mut self, block: BlockPtr) {
        unsafe {
            block.set_prev_free(None);
            block.set_next_free(self.head);
            if let Some(head) = self.head {
                head.set_prev_free(Some(block));
            }
        }
        self.head = Some(block);
    }

    /// Unlinks `block` from the list.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `block` is currently in the list.
    pub(crate) unsafe fn remove(&mut self, block: BlockPtr) {
        unsafe {
            let prev = block.prev_free();
            let next = block.next_free();
            match prev {
                Some(prev) => prev.set_next_free(next),
                None => self.head = next,
            }
            if let Some(next) = next {
                next.set_prev_free(prev);
            }
        }
    }

    /// Returns an iterator over the blocks in the list, head first.
    ///
    /// # Safety
    ///
    /// The list must not be modified while the iterator is alive, and every
    /// block in the list must still be a valid free block.
    pub(crate) unsafe fn iter(&self) -> Iter {
        Iter { next: self.head }
    }
}

#[derive(Debug)]
pub(crate) struct Iter {
    next: Option<BlockPtr>,
}

impl Iterator for Iter {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        self.next = unsafe { block.next_free() };
        Some(block)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;
    use core::{alloc::Layout, ptr::NonNull};

    use super::*;
    use crate::block::{DOUBLE_WORD_SIZE, Tag};

    /// Lays out `count` free blocks of 32 bytes back to back and hands them to
    /// `test_fn`.
    fn with_test_blocks<F>(count: usize, test_fn: F)
    where
        F: FnOnce(&[BlockPtr]),
    {
        unsafe {
            let heap_size = DOUBLE_WORD_SIZE + count * 32;
            let layout = Layout::from_size_align(heap_size, 16).unwrap();
            let heap_start = NonNull::new(alloc::alloc::alloc_zeroed(layout)).unwrap();

            let mut blocks = Vec::new();
            let mut block = BlockPtr::from_payload(heap_start.add(DOUBLE_WORD_SIZE));
            for _ in 0..count {
                block.set_tags(Tag::pack(32, false));
                blocks.push(block);
                block = block.next();
            }
            test_fn(&blocks);

            alloc::alloc::dealloc(heap_start.as_ptr(), layout);
        }
    }

    fn collect(list: &FreeList) -> Vec<BlockPtr> {
        unsafe { list.iter().collect() }
    }

    #[test]
    fn test_empty() {
        let list = FreeList::new();
        assert!(list.head().is_none());
        assert!(collect(&list).is_empty());
    }

    #[test]
    fn test_insert_pushes_at_head() {
        with_test_blocks(3, |blocks| unsafe {
            let mut list = FreeList::new();
            for &block in blocks {
                list.insert(block);
            }
            assert_eq!(list.head(), Some(blocks[2]));
            assert_eq!(collect(&list), [blocks[2], blocks[1], blocks[0]]);

            assert_eq!(blocks[2].prev_free(), None);
            assert_eq!(blocks[1].prev_free(), Some(blocks[2]));
            assert_eq!(blocks[0].prev_free(), Some(blocks[1]));
            assert_eq!(blocks[0].next_free(), None);
        });
    }

    #[test]
    fn test_remove_head() {
        with_test_blocks(3, |blocks| unsafe {
            let mut list = FreeList::new();
            for &block in blocks {
                list.insert(block);
            }
            list.remove(blocks[2]);
            assert_eq!(list.head(), Some(blocks[1]));
            assert_eq!(blocks[1].prev_free(), None);
            assert_eq!(collect(&list), [blocks[1], blocks[0]]);
        });
    }

    #[test]
    fn test_remove_tail() {
        with_test_blocks(3, |blocks| unsafe {
            let mut list = FreeList::new();
            for &block in blocks {
                list.insert(block);
            }
            list.remove(blocks[0]);
            assert_eq!(blocks[1].next_free(), None);
            assert_eq!(collect(&list), [blocks[2], blocks[1]]);
        });
    }

    #[test]
    fn test_remove_middle() {
        with_test_blocks(3, |blocks| unsafe {
            let mut list = FreeList::new();
            for &block in blocks {
                list.insert(block);
            }
            list.remove(blocks[1]);
            assert_eq!(blocks[2].next_free(), Some(blocks[0]));
            assert_eq!(blocks[0].prev_free(), Some(blocks[2]));
            assert_eq!(collect(&list), [blocks[2], blocks[0]]);
        });
    }

    #[test]
    fn test_remove_only_node() {
        with_test_blocks(1, |blocks| unsafe {
            let mut list = FreeList::new();
            list.insert(blocks[0]);
            list.remove(blocks[0]);
            assert!(list.head().is_none());

            // can be reinserted afterwards
            list.insert(blocks[0]);
            assert_eq!(collect(&list), [blocks[0]]);
        });
    }
}
