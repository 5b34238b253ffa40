//! The allocator facade.

use core::ptr::{self, NonNull};

use log::{debug, trace, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    block::{ALIGNMENT, BlockPtr, DOUBLE_WORD_SIZE, TAG_OVERHEAD, Tag, WORD_SIZE},
    config::Config,
    error::{AddressSpaceExhaustedSnafu, AllocateSnafu, CapacityError, ResizeError, ZeroSizeSnafu},
    fit::{self, RepeatTracker},
    free_list::FreeList,
    provider::AddressSpace,
};

/// Bytes requested by `init` for the padding word, the prologue and the
/// epilogue.
pub(crate) const SENTINEL_BYTES: usize = 4 * WORD_SIZE;

#[derive(Debug, Clone, Copy, derive_more::IsVariant)]
pub(crate) enum State {
    Uninitialized,
    Ready { prologue: BlockPtr },
}

/// A first-fit allocator with boundary-tag coalescing over a single growable
/// heap.
///
/// The heap is obtained from an [`AddressSpace`] and laid out as:
///
/// ```text
/// +-----+----------+----------+------------------------+----------+
/// | pad | hdr(8:a) | ftr(8:a) | zero or more blocks... | hdr(0:a) |
/// +-----+----------+----------+------------------------+----------+
///       |      prologue       |                        | epilogue |
/// ```
///
/// The prologue and epilogue are permanently allocated sentinels, so every
/// real block has an allocated-or-real neighbor on both sides.
///
/// # Thread Safety
///
/// The allocator is `Send` (when its provider is) but not `Sync`. Wrap it in
/// [`LockedAllocator`](crate::LockedAllocator) or another lock to share it.
pub struct Allocator<P> {
    pub(crate) space: P,
    pub(crate) config: Config,
    pub(crate) state: State,
    pub(crate) free_list: FreeList,
    pub(crate) repeat: RepeatTracker,
}

unsafe impl<P> Send for Allocator<P> where P: Send {}

impl<P> Allocator<P> {
    /// Creates an uninitialized allocator over `space`.
    ///
    /// No memory is requested until [`init`](Self::init) or the first
    /// allocation.
    #[must_use]
    pub const fn new(space: P, config: Config) -> Self {
        Self {
            space,
            config,
            state: State::Uninitialized,
            free_list: FreeList::new(),
            repeat: RepeatTracker::new(),
        }
    }

    /// Returns the configuration the allocator was built with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns `true` once the sentinels have been laid out.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.state.is_ready()
    }

    /// Returns a reference to the address-space provider.
    #[must_use]
    pub const fn space(&self) -> &P {
        &self.space
    }

    /// Consumes the allocator and returns its address-space provider.
    ///
    /// Every pointer handed out by the allocator becomes dangling as far as
    /// the allocator is concerned.
    #[must_use]
    pub fn into_inner(self) -> P {
        self.space
    }

    /// Returns the usable payload size of an allocated block.
    ///
    /// This is at least the size that was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not released since.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { BlockPtr::from_payload(ptr).size() - TAG_OVERHEAD }
    }
}

impl<P> Allocator<P>
where
    P: AddressSpace,
{
    /// Returns the number of bytes obtained from the address space so far.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.space.heap_size()
    }

    /// Lays out the sentinels and performs the initial heap extension.
    ///
    /// Calling `init` on an initialized allocator does nothing. If the
    /// sentinels were laid out but the initial extension failed, the
    /// allocator stays initialized with an empty heap and later allocations
    /// retry the extension.
    pub fn init(&mut self) -> Result<(), CapacityError> {
        if self.state.is_ready() {
            return Ok(());
        }
        self.init_heap()?;
        debug!("heap initialized: heap_size={}", self.heap_size());
        Ok(())
    }

    fn init_heap(&mut self) -> Result<(), CapacityError> {
        let start = self
            .space
            .extend(SENTINEL_BYTES)
            .context(AddressSpaceExhaustedSnafu {
                requested: SENTINEL_BYTES,
            })?;
        assert!(
            start.addr().get().is_multiple_of(ALIGNMENT),
            "address space must be 8-byte aligned"
        );

        let prologue = unsafe {
            start.cast::<u32>().write(0);
            let prologue = BlockPtr::from_payload(start.add(DOUBLE_WORD_SIZE));
            prologue.set_tags(Tag::PROLOGUE);
            prologue.next().set_header(Tag::EPILOGUE);
            prologue
        };
        self.state = State::Ready { prologue };
        self.free_list = FreeList::new();
        self.repeat = RepeatTracker::new();

        self.extend_heap(self.config.chunk_size)?;
        Ok(())
    }

    /// Allocates a block with at least `size` bytes of payload.
    ///
    /// The returned pointer is aligned to 8 bytes. Returns `None` if `size`
    /// is zero or the heap cannot grow enough.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagalloc::{Allocator, Config, provider::OwnedRegion};
    ///
    /// let mut allocator = Allocator::new(OwnedRegion::new(1 << 20).unwrap(), Config::new());
    /// let ptr = allocator.allocate(100).unwrap();
    /// assert_eq!(ptr.addr().get() % 8, 0);
    /// unsafe { allocator.release(ptr.as_ptr()) };
    /// ```
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let heap_size = self.heap_size();
        match self.try_allocate(size) {
            Ok(ptr) => {
                if self.heap_size() != heap_size {
                    trace!("heap grew: heap_size={}", self.heap_size());
                }
                trace!("allocated {size} bytes at {ptr:p}");
                Some(ptr)
            }
            Err(err) => {
                warn!("failed to allocate {size} bytes: {err}");
                None
            }
        }
    }

    /// Allocates without logging, initializing the heap on first use.
    ///
    /// [`LockedAllocator`](crate::LockedAllocator) calls this under its lock,
    /// where a logger that allocates would deadlock.
    pub(crate) fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, CapacityError> {
        if self.state.is_uninitialized() {
            self.init_heap()?;
        }

        let asize = fit::adjust_size(size)?;
        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => {
                let extend_size = asize.max(self.config.chunk_size);
                self.extend_heap(extend_size)?
            }
        };
        unsafe { self.place(block, asize) };
        Ok(block.payload())
    }

    /// Releases a block previously returned by this allocator.
    ///
    /// A null `ptr` is ignored. The freed block is merged with free
    /// neighbors before it is put back on the free list.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` is null or was returned by this allocator
    /// - `ptr` has not been released since it was returned
    /// - the payload is not accessed after this call
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        if unsafe { self.release_block(payload) } {
            trace!("released {ptr:p}");
        } else {
            warn!("ignoring release of {ptr:p} before the heap was initialized");
        }
    }

    /// Frees the block of `payload` without logging.
    ///
    /// Returns `false` and does nothing if the heap is not initialized.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release).
    pub(crate) unsafe fn release_block(&mut self, payload: NonNull<u8>) -> bool {
        if self.state.is_uninitialized() {
            return false;
        }
        unsafe {
            let block = BlockPtr::from_payload(payload);
            let size = block.size();
            block.set_tags(Tag::pack(size, false));
            let block = self.coalesce(block);
            self.free_list.insert(block);
        }
        true
    }

    /// Moves an allocation into a new block of `new_size` bytes.
    ///
    /// The first `min(new_size, old payload size)` bytes are copied, the old
    /// block is released, and the new pointer is returned. The block is always
    /// moved, even when shrinking.
    ///
    /// On error the old block is left untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this allocator
    /// - `ptr` has not been released since it was returned
    pub unsafe fn resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, ResizeError> {
        ensure!(new_size > 0, ZeroSizeSnafu);
        let new_ptr = self
            .try_allocate(new_size)
            .context(AllocateSnafu { new_size })?;

        unsafe {
            let copy_size = new_size.min(self.usable_size(ptr));
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_size);
            self.release_block(ptr);
        }
        Ok(new_ptr)
    }
}
