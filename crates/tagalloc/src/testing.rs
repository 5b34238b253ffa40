use core::ptr::NonNull;

use crate::{Allocator, Config, provider::OwnedRegion};

/// Byte written to every payload handed out by [`TestAllocator`].
pub(crate) const PATTERN: u8 = 0x33;

/// Byte written to every payload before it is released.
pub(crate) const POISON: u8 = 0x55;

/// Wraps an [`Allocator`], fills payloads with [`PATTERN`], checks the
/// pattern survived before releasing, and validates the heap after each
/// operation.
pub(crate) struct TestAllocator {
    allocator: Allocator<OwnedRegion>,
}

impl TestAllocator {
    pub(crate) fn inner(&self) -> &Allocator<OwnedRegion> {
        &self.allocator
    }

    pub(crate) fn inner_mut(&mut self) -> &mut Allocator<OwnedRegion> {
        &mut self.allocator
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocator.allocate(size)?;
        unsafe {
            assert!(self.allocator.usable_size(ptr) >= size);
            ptr.write_bytes(PATTERN, size);
        }
        self.allocator.check_heap(false);
        Some(ptr)
    }

    pub(crate) fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe {
            for i in 0..size {
                assert_eq!(ptr.add(i).read(), PATTERN);
            }
            ptr.write_bytes(POISON, size);
            self.allocator.release(ptr.as_ptr());
        }
        self.allocator.check_heap(false);
    }
}

pub(crate) fn with_test_allocator<F>(capacity: usize, config: Config, test_fn: F)
where
    F: FnOnce(&mut TestAllocator),
{
    let region = OwnedRegion::new(capacity).unwrap();
    let mut allocator = Allocator::new(region, config);
    allocator.init().unwrap();
    test_fn(&mut TestAllocator { allocator });
}
