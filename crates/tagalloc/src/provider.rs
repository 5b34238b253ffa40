//! Address-space providers.
//!
//! The allocator never maps memory itself. It grows its heap by asking an
//! [`AddressSpace`] for more bytes at the end of a single contiguous region,
//! in the manner of `sbrk(2)`.
//!
//! Two providers are included:
//!
//! - [`FixedRegion`] moves a break pointer through a region reserved up front
//!   by the caller.
//! - [`OwnedRegion`] is a [`FixedRegion`] whose memory is taken from the
//!   global allocator and given back on drop.

use core::{alloc::Layout, ptr::NonNull};

use crate::block::ALIGNMENT;

/// A contiguous, growable address range.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - every successful [`extend`](Self::extend) returns the previous end of the
///   region, so consecutive extensions are contiguous
/// - the first extension returns a pointer aligned to 8 bytes
/// - memory handed out stays valid, writable and unused by anyone else for as
///   long as the provider is alive
pub unsafe trait AddressSpace {
    /// Grows the region by exactly `bytes` bytes.
    ///
    /// Returns the old end of the region (the start of the new bytes), or
    /// `None` if no more address space is available.
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Returns the address of the first byte of the region.
    fn low_address(&self) -> *const u8;

    /// Returns the address of the last byte of the region.
    ///
    /// For an empty region this is one byte before
    /// [`low_address`](Self::low_address).
    fn high_address(&self) -> *const u8;

    /// Returns the number of bytes handed out so far.
    fn heap_size(&self) -> usize;
}

/// A pre-reserved region with a moving break.
///
/// # Examples
///
/// ```
/// use core::ptr::NonNull;
///
/// use tagalloc::provider::{AddressSpace as _, FixedRegion};
///
/// #[repr(align(8))]
/// struct Arena([u8; 256]);
///
/// let mut arena = Arena([0; 256]);
/// let start = NonNull::from(&mut arena.0).cast::<u8>();
/// let mut region = unsafe { FixedRegion::new(start, 256) };
///
/// assert_eq!(region.extend(64), Some(start));
/// assert_eq!(region.heap_size(), 64);
/// assert!(region.extend(256).is_none());
/// ```
#[derive(Debug)]
pub struct FixedRegion {
    start: NonNull<u8>,
    brk: usize,
    capacity: usize,
}

unsafe impl Send for FixedRegion {}

impl FixedRegion {
    /// Creates a provider over `start..start + capacity` with an empty heap.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the memory region `start..start + capacity` is valid and writable
    /// - the memory region is not used by anything else while the provider
    ///   (or an allocator built on it) is alive
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to 8 bytes.
    #[must_use]
    pub unsafe fn new(start: NonNull<u8>, capacity: usize) -> Self {
        assert!(
            start.addr().get().is_multiple_of(ALIGNMENT),
            "region start must be 8-byte aligned"
        );
        Self {
            start,
            brk: 0,
            capacity,
        }
    }

    /// Returns the total number of bytes the region can hand out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves the break back to the start of the region.
    ///
    /// Anything previously built on the region must be discarded.
    pub fn reset(&mut self) {
        self.brk = 0;
    }
}

unsafe impl AddressSpace for FixedRegion {
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let new_brk = self.brk.checked_add(bytes)?;
        if new_brk > self.capacity {
            return None;
        }
        let old_end = unsafe { self.start.add(self.brk) };
        self.brk = new_brk;
        Some(old_end)
    }

    fn low_address(&self) -> *const u8 {
        self.start.as_ptr()
    }

    fn high_address(&self) -> *const u8 {
        self.start.as_ptr().wrapping_add(self.brk).wrapping_sub(1)
    }

    fn heap_size(&self) -> usize {
        self.brk
    }
}

/// A [`FixedRegion`] backed by memory from the global allocator.
///
/// The backing memory is zeroed, page aligned, and released when the value is
/// dropped.
///
/// # Examples
///
/// ```
/// use tagalloc::provider::{AddressSpace as _, OwnedRegion};
///
/// let mut region = OwnedRegion::new(4096).unwrap();
/// assert_eq!(region.capacity(), 4096);
/// assert!(region.extend(4096).is_some());
/// assert!(region.extend(8).is_none());
/// ```
#[derive(Debug)]
pub struct OwnedRegion {
    region: FixedRegion,
    layout: Layout,
}

impl OwnedRegion {
    const ALIGN: usize = 4096;

    /// Reserves `capacity` bytes.
    ///
    /// Returns `None` if `capacity` is zero or the memory cannot be obtained.
    #[must_use]
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let layout = Layout::from_size_align(capacity, Self::ALIGN).ok()?;
        let start = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })?;
        let region = unsafe { FixedRegion::new(start, capacity) };
        Some(Self { region, layout })
    }

    /// Returns the total number of bytes the region can hand out.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Moves the break back to the start of the region.
    ///
    /// Anything previously built on the region must be discarded.
    pub fn reset(&mut self) {
        self.region.reset();
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.region.start.as_ptr(), self.layout) }
    }
}

unsafe impl AddressSpace for OwnedRegion {
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.region.extend(bytes)
    }

    fn low_address(&self) -> *const u8 {
        self.region.low_address()
    }

    fn high_address(&self) -> *const u8 {
        self.region.high_address()
    }

    fn heap_size(&self) -> usize {
        self.region.heap_size()
    }
}
