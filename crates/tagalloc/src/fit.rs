//! Block sizing, fit search and placement.

use core::num::NonZeroUsize;

use snafu::OptionExt as _;

use crate::{
    Allocator,
    block::{ALIGNMENT, BlockPtr, DOUBLE_WORD_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TAG_OVERHEAD, Tag},
    error::{CapacityError, RequestTooLargeSnafu},
    provider::AddressSpace,
};

/// Converts a requested payload size into a block size.
///
/// The block must hold the payload plus its two tags, be a multiple of 8, and
/// be no smaller than [`MIN_BLOCK_SIZE`].
pub(crate) fn adjust_size(size: usize) -> Result<usize, CapacityError> {
    if size <= DOUBLE_WORD_SIZE {
        return Ok(MIN_BLOCK_SIZE);
    }
    let asize = size
        .checked_add(TAG_OVERHEAD)
        .and_then(|size| size.checked_next_multiple_of(ALIGNMENT))
        .filter(|&size| size <= MAX_BLOCK_SIZE)
        .context(RequestTooLargeSnafu { requested: size })?;
    Ok(asize.max(MIN_BLOCK_SIZE))
}

/// Counts consecutive requests for the same block size.
#[derive(Debug, Default)]
pub(crate) struct RepeatTracker {
    last_size: usize,
    count: usize,
}

impl RepeatTracker {
    pub(crate) const fn new() -> Self {
        Self {
            last_size: 0,
            count: 0,
        }
    }

    /// Records a request for `asize` and returns `true` if it has now been
    /// requested more than `threshold` times in a row.
    fn observe(&mut self, asize: usize, threshold: Option<NonZeroUsize>) -> bool {
        let Some(threshold) = threshold else {
            return false;
        };
        if asize == self.last_size {
            self.count = self.count.saturating_add(1);
        } else {
            self.last_size = asize;
            self.count = 0;
        }
        self.count >= threshold.get()
    }
}

impl<P> Allocator<P>
where
    P: AddressSpace,
{
    /// Returns the first free block of at least `asize` bytes.
    ///
    /// With a repeat threshold configured, a long run of identical requests
    /// skips the search and grows the heap instead. If that growth fails the
    /// search runs as usual.
    pub(crate) fn find_fit(&mut self, asize: usize) -> Option<BlockPtr> {
        if self.repeat.observe(asize, self.config.repeat_threshold) {
            if let Ok(block) = self.extend_heap(asize) {
                return Some(block);
            }
        }
        unsafe { self.free_list.iter() }.find(|&block| unsafe { block.size() } >= asize)
    }

    /// Marks `asize` bytes at the start of the free block `block` as
    /// allocated.
    ///
    /// The block is unlinked from the free list. If the remainder can hold a
    /// minimum block it is split off and put back on the free list; otherwise
    /// the whole block is handed out.
    pub(crate) unsafe fn place(&mut self, block: BlockPtr, asize: usize) {
        unsafe {
            let size = block.size();
            debug_assert!(size >= asize);
            self.free_list.remove(block);

            let remainder = size - asize;
            if remainder >= MIN_BLOCK_SIZE {
                block.set_tags(Tag::pack(asize, true));
                let rest = block.next();
                rest.set_tags(Tag::pack(remainder, false));
                self.free_list.insert(rest);
            } else {
                block.set_tags(Tag::pack(size, true));
            }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{Config, testing::with_test_allocator};

    #[test]
    fn test_adjust_size() {
        assert_eq!(adjust_size(1).unwrap(), 24);
        assert_eq!(adjust_size(8).unwrap(), 24);
        assert_eq!(adjust_size(9).unwrap(), 24);
        assert_eq!(adjust_size(16).unwrap(), 24);
        assert_eq!(adjust_size(17).unwrap(), 32);
        assert_eq!(adjust_size(32).unwrap(), 40);
        assert_eq!(adjust_size(100).unwrap(), 112);
        assert_eq!(adjust_size(4096).unwrap(), 4104);
    }

    #[test]
    fn test_adjust_size_too_large() {
        assert_eq!(
            adjust_size(MAX_BLOCK_SIZE - TAG_OVERHEAD).unwrap(),
            MAX_BLOCK_SIZE
        );
        assert!(matches!(
            adjust_size(MAX_BLOCK_SIZE),
            Err(CapacityError::RequestTooLarge { .. })
        ));
        assert!(matches!(
            adjust_size(usize::MAX),
            Err(CapacityError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_repeat_tracker() {
        let threshold = NonZeroUsize::new(2);
        let mut tracker = RepeatTracker::new();
        assert!(!tracker.observe(32, threshold));
        assert!(!tracker.observe(32, threshold));
        assert!(tracker.observe(32, threshold));
        assert!(tracker.observe(32, threshold));
        assert!(!tracker.observe(40, threshold));
        assert!(!tracker.observe(32, threshold));

        let mut tracker = RepeatTracker::new();
        for _ in 0..10 {
            assert!(!tracker.observe(32, None));
        }
    }

    #[test]
    fn test_place_splits() {
        with_test_allocator(1 << 16, Config::new().with_chunk_size(4096), |allocator| {
            let ptr = allocator.allocate(100).unwrap();
            let heap = allocator.inner();
            let block = BlockPtr::from_payload(ptr);
            unsafe {
                assert_eq!(block.header(), Tag::pack(112, true));
                assert_eq!(block.footer(), Tag::pack(112, true));
                let rest = block.next();
                assert_eq!(rest.header(), Tag::pack(4096 - 112, false));
                assert_eq!(heap.free_list.head(), Some(rest));
            }
            allocator.release(ptr, 100);
        });
    }

    #[test]
    fn test_place_without_split() {
        with_test_allocator(1 << 16, Config::new().with_chunk_size(4096), |allocator| {
            let a = allocator.allocate(32).unwrap();
            let b = allocator.allocate(32).unwrap();
            allocator.release(a, 32);

            // a 40-byte block serving a 24-byte request leaves 16 bytes,
            // too little for a block of its own
            let c = allocator.allocate(16).unwrap();
            assert_eq!(c, a);
            let block = BlockPtr::from_payload(c);
            unsafe {
                assert_eq!(block.header(), Tag::pack(40, true));
                assert_eq!(block.next(), BlockPtr::from_payload(b));
            }

            allocator.release(b, 32);
            allocator.release(c, 16);
        });
    }

    #[test]
    fn test_first_fit_prefers_recently_freed() {
        with_test_allocator(1 << 16, Config::new().with_chunk_size(4096), |allocator| {
            let ptrs = (0..6)
                .map(|_| allocator.allocate(64).unwrap())
                .collect::<Vec<_>>();
            allocator.release(ptrs[1], 64);
            allocator.release(ptrs[3], 64);

            assert_eq!(allocator.allocate(64), Some(ptrs[3]));
            assert_eq!(allocator.allocate(64), Some(ptrs[1]));

            for ptr in ptrs {
                allocator.release(ptr, 64);
            }
        });
    }

    #[test]
    fn test_repeat_threshold_bypasses_search() {
        let config = Config::new()
            .with_chunk_size(4096)
            .with_repeat_threshold(NonZeroUsize::new(3));
        with_test_allocator(1 << 16, config, |allocator| {
            let mut ptrs = Vec::new();
            for _ in 0..3 {
                ptrs.push(allocator.allocate(32).unwrap());
            }
            let heap_size = allocator.inner().heap_size();

            // the fourth identical request grows the heap even though the
            // first chunk still has room
            ptrs.push(allocator.allocate(32).unwrap());
            assert_eq!(allocator.inner().heap_size(), heap_size + 40);

            for ptr in ptrs {
                allocator.release(ptr, 32);
            }
            assert_eq!(allocator.inner().check_heap(false).free_blocks, 1);
        });
    }

    #[test]
    fn test_repeat_threshold_falls_back_to_search() {
        let config = Config::new()
            .with_chunk_size(4096)
            .with_repeat_threshold(NonZeroUsize::new(1));
        with_test_allocator(16 + 4096, config, |allocator| {
            let a = allocator.allocate(32).unwrap();
            let b = allocator.allocate(32).unwrap();
            // the address space is exhausted, so the bypass fails
            assert_eq!(allocator.inner().heap_size(), 16 + 4096);
            assert_eq!(b.addr().get() - a.addr().get(), 40);

            allocator.release(a, 32);
            allocator.release(b, 32);
        });
    }
}
