//! Heap growth.

use snafu::{OptionExt as _, ensure};

use crate::{
    Allocator,
    allocator::SENTINEL_BYTES,
    block::{ALIGNMENT, BlockPtr, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Tag},
    error::{
        AddressSpaceExhaustedSnafu, CapacityError, HeapLimitExceededSnafu, RequestTooLargeSnafu,
    },
    provider::AddressSpace,
};

/// Largest heap whose blocks can still merge into one block.
const MAX_HEAP_SIZE: usize = MAX_BLOCK_SIZE.saturating_add(SENTINEL_BYTES);

impl<P> Allocator<P>
where
    P: AddressSpace,
{
    /// Grows the heap by at least `min_bytes` and returns the resulting free
    /// block.
    ///
    /// The new bytes become a free block whose header overwrites the old
    /// epilogue, and a fresh epilogue is written after it. The block is merged
    /// with a free block that ended the old heap, so the returned block may
    /// start before the new bytes. It is already on the free list.
    ///
    /// The heap never grows past [`MAX_BLOCK_SIZE`] bytes of blocks, so no
    /// merge can produce a size a tag cannot hold.
    ///
    /// The heap must be initialized.
    pub(crate) fn extend_heap(&mut self, min_bytes: usize) -> Result<BlockPtr, CapacityError> {
        let size = min_bytes
            .checked_next_multiple_of(ALIGNMENT)
            .filter(|&size| size <= MAX_BLOCK_SIZE)
            .context(RequestTooLargeSnafu {
                requested: min_bytes,
            })?
            .max(MIN_BLOCK_SIZE);
        let heap_size = self.space.heap_size();
        ensure!(
            heap_size
                .checked_add(size)
                .is_some_and(|total| total <= MAX_HEAP_SIZE),
            HeapLimitExceededSnafu {
                requested: size,
                heap_size,
            }
        );

        let start = self
            .space
            .extend(size)
            .context(AddressSpaceExhaustedSnafu { requested: size })?;

        unsafe {
            // `start` is where the old epilogue's payload would begin, so the
            // new header lands on the old epilogue.
            let block = BlockPtr::from_payload(start);
            block.set_tags(Tag::pack(size, false));
            block.next().set_header(Tag::EPILOGUE);

            let block = self.coalesce(block);
            self.free_list.insert(block);
            Ok(block)
        }
    }
}
