//! [`GlobalAlloc`] adapter.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use log::warn;
use spin::Mutex;

use crate::{Allocator, Config, block::ALIGNMENT, provider::AddressSpace};

/// An [`Allocator`] behind a spin lock, usable as a `#[global_allocator]`.
///
/// Requests for an alignment greater than 8 bytes cannot be served and fail
/// with a null pointer.
///
/// Nothing is logged while the lock is held, so a logger may allocate from
/// the same `LockedAllocator`.
///
/// # Examples
///
/// ```
/// use core::alloc::{GlobalAlloc as _, Layout};
///
/// use tagalloc::{Config, LockedAllocator, provider::OwnedRegion};
///
/// let allocator = LockedAllocator::new(OwnedRegion::new(1 << 20).unwrap(), Config::new());
/// let layout = Layout::from_size_align(64, 8).unwrap();
/// unsafe {
///     let ptr = allocator.alloc(layout);
///     assert!(!ptr.is_null());
///     allocator.dealloc(ptr, layout);
/// }
/// ```
pub struct LockedAllocator<P> {
    allocator: Mutex<Allocator<P>>,
}

impl<P> LockedAllocator<P> {
    #[must_use]
    pub const fn new(space: P, config: Config) -> Self {
        Self {
            allocator: Mutex::new(Allocator::new(space, config)),
        }
    }

    /// Runs `f` with exclusive access to the wrapped allocator.
    pub fn with_allocator<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Allocator<P>) -> T,
    {
        f(&mut self.allocator.lock())
    }

    #[must_use]
    pub fn into_inner(self) -> Allocator<P> {
        self.allocator.into_inner()
    }
}

unsafe impl<P> GlobalAlloc for LockedAllocator<P>
where
    P: AddressSpace + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            warn!("unsupported alignment: {}", layout.align());
            return ptr::null_mut();
        }
        if layout.size() == 0 {
            return ptr::null_mut();
        }
        let res = self.allocator.lock().try_allocate(layout.size());
        match res {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                warn!("failed to allocate {} bytes: {err}", layout.size());
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        let released = unsafe { self.allocator.lock().release_block(payload) };
        if !released {
            warn!("ignoring release of {ptr:p} before the heap was initialized");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let res = unsafe { self.allocator.lock().resize(ptr, new_size) };
        match res {
            Ok(new_ptr) => new_ptr.as_ptr(),
            Err(err) => {
                warn!("failed to reallocate {ptr:p} to {new_size} bytes: {err}");
                ptr::null_mut()
            }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use log::{LevelFilter, Log, Metadata, Record};

    use super::*;
    use crate::provider::OwnedRegion;

    fn locked() -> LockedAllocator<OwnedRegion> {
        LockedAllocator::new(
            OwnedRegion::new(1 << 20).unwrap(),
            Config::new().with_chunk_size(4096),
        )
    }

    #[test]
    fn test_alloc_dealloc() {
        let allocator = locked();
        let layout = Layout::from_size_align(100, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % 8, 0);
            ptr.write_bytes(0x33, 100);
            allocator.dealloc(ptr, layout);
        }
        let summary = allocator.with_allocator(|heap| heap.check_heap(false));
        assert_eq!(summary.free_blocks, 1);
    }

    #[test]
    fn test_over_aligned() {
        let allocator = locked();
        let layout = Layout::from_size_align(64, 16).unwrap();
        assert!(unsafe { allocator.alloc(layout) }.is_null());
    }

    #[test]
    fn test_realloc() {
        let allocator = locked();
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            for i in 0..16 {
                ptr.add(i).write(u8::try_from(i).unwrap());
            }
            let new_ptr = allocator.realloc(ptr, layout, 256);
            assert!(!new_ptr.is_null());
            for i in 0..16 {
                assert_eq!(new_ptr.add(i).read(), u8::try_from(i).unwrap());
            }
            allocator.dealloc(new_ptr, Layout::from_size_align(256, 8).unwrap());
        }
        allocator.with_allocator(|heap| heap.check_heap(false));
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        let allocator = locked();
        let layout = Layout::from_size_align(16, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(allocator.realloc(ptr, layout, 2 << 20).is_null());
            allocator.dealloc(ptr, layout);
        }
        allocator.with_allocator(|heap| heap.check_heap(false));
    }

    #[test]
    fn test_shared_between_threads() {
        let allocator = Arc::new(locked());
        let handles = (0..4)
            .map(|n| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    let layout = Layout::from_size_align(32 + n * 8, 8).unwrap();
                    let ptrs = (0..64)
                        .map(|_| unsafe { allocator.alloc(layout) })
                        .collect::<Vec<_>>();
                    for ptr in ptrs {
                        assert!(!ptr.is_null());
                        unsafe { allocator.dealloc(ptr, layout) };
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        let summary = allocator.with_allocator(|heap| heap.check_heap(false));
        assert_eq!(summary.free_blocks, 1);
    }

    /// Allocates from the allocator it logs about.
    struct AllocatingLogger {
        allocator: &'static LockedAllocator<OwnedRegion>,
        records: AtomicUsize,
    }

    impl Log for AllocatingLogger {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, _record: &Record) {
            let layout = Layout::from_size_align(32, 8).unwrap();
            unsafe {
                let ptr = self.allocator.alloc(layout);
                assert!(!ptr.is_null());
                self.allocator.dealloc(ptr, layout);
            }
            self.records.fetch_add(1, Ordering::Relaxed);
        }

        fn flush(&self) {}
    }

    #[test]
    fn test_logger_allocating_from_same_allocator() {
        let allocator: &'static _ = Box::leak(Box::new(locked()));
        let logger: &'static _ = Box::leak(Box::new(AllocatingLogger {
            allocator,
            records: AtomicUsize::new(0),
        }));
        log::set_logger(logger).unwrap();
        log::set_max_level(LevelFilter::Trace);

        let small = Layout::from_size_align(16, 8).unwrap();
        let huge = Layout::from_size_align(4 << 20, 8).unwrap();
        unsafe {
            assert!(allocator.alloc(huge).is_null());
            let ptr = allocator.alloc(small);
            assert!(!ptr.is_null());
            assert!(allocator.realloc(ptr, small, huge.size()).is_null());
            allocator.dealloc(ptr, small);
        }
        // at least the two failures were logged
        assert!(logger.records.load(Ordering::Relaxed) >= 2);
        allocator.with_allocator(|heap| heap.check_heap(false));
    }
}
