//! Heap introspection and consistency checking.

use core::{iter::FusedIterator, marker::PhantomData};

use log::debug;
use snafu::ensure;

use crate::{
    Allocator,
    allocator::State,
    block::{ALIGNMENT, BlockPtr, DOUBLE_WORD_SIZE, MIN_BLOCK_SIZE, Tag, WORD_SIZE},
    error::{
        AllocatedInFreeListSnafu, BadEpilogueSnafu, BadPrologueSnafu, BrokenBackLinkSnafu,
        CorruptionError, FreeCountMismatchSnafu, InvalidSizeSnafu, MisalignedSnafu,
        MisplacedEpilogueSnafu, OutOfBoundsSnafu, TagMismatchSnafu, UncoalescedSnafu,
    },
    free_list,
    provider::AddressSpace,
};

/// A block as seen by the heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address of the block.
    pub address: usize,
    /// Block size including the header and footer.
    pub size: usize,
    /// Whether the allocated bit is set.
    pub allocated: bool,
}

impl BlockInfo {
    fn from_block(block: BlockPtr) -> Self {
        let tag = unsafe { block.header() };
        Self {
            address: block.addr(),
            size: tag.size(),
            allocated: tag.is_allocated(),
        }
    }
}

/// Totals gathered by a successful heap check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapSummary {
    /// Bytes obtained from the address space, sentinels included.
    pub heap_size: usize,
    /// Number of blocks between the sentinels.
    pub blocks: usize,
    /// Number of free blocks, equal to the free list length.
    pub free_blocks: usize,
    /// Total size of the free blocks, tags included.
    pub free_bytes: usize,
    /// Total size of the allocated blocks, tags included.
    pub allocated_bytes: usize,
}

/// Iterator over every block in address order, returned by
/// [`Allocator::blocks`].
#[derive(Debug)]
pub struct Blocks<'a> {
    next: Option<BlockPtr>,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        let info = BlockInfo::from_block(block);
        if info.size == 0 {
            self.next = None;
            return None;
        }
        self.next = Some(unsafe { block.next() });
        Some(info)
    }
}

impl FusedIterator for Blocks<'_> {}

/// Iterator over the free list, most recently freed first, returned by
/// [`Allocator::free_blocks`].
#[derive(Debug)]
pub struct FreeBlocks<'a> {
    inner: free_list::Iter,
    _heap: PhantomData<&'a ()>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(BlockInfo::from_block)
    }
}

fn check_bounds(
    address: usize,
    size: usize,
    low: usize,
    high: usize,
) -> Result<(), CorruptionError> {
    let in_bounds = address >= low.saturating_add(WORD_SIZE)
        && address
            .checked_add(size)
            .is_some_and(|end| end <= high.wrapping_add(1));
    ensure!(in_bounds, OutOfBoundsSnafu { address, low, high });
    Ok(())
}

impl<P> Allocator<P>
where
    P: AddressSpace,
{
    /// Returns an iterator over every block between the sentinels.
    ///
    /// The walk trusts the tags; run [`verify`](Self::verify) first on a heap
    /// that may be corrupted.
    pub fn blocks(&self) -> Blocks<'_> {
        let next = match self.state {
            State::Uninitialized => None,
            State::Ready { prologue } => Some(unsafe { prologue.next() }),
        };
        Blocks {
            next,
            _heap: PhantomData,
        }
    }

    /// Returns an iterator over the free list.
    ///
    /// The walk trusts the links; run [`verify`](Self::verify) first on a
    /// heap that may be corrupted.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            inner: unsafe { self.free_list.iter() },
            _heap: PhantomData,
        }
    }

    /// Checks the heap for structural inconsistencies.
    ///
    /// The following are verified:
    ///
    /// - the prologue and epilogue tags, and the epilogue sits at the end of
    ///   the heap
    /// - every block lies inside the heap, is 8-byte aligned, is at least the
    ///   minimum block size, and has matching header and footer
    /// - no two free blocks are adjacent
    /// - every free-list entry is a free block inside the heap with a correct
    ///   back link
    /// - the free list holds exactly the free blocks of the heap
    ///
    /// An uninitialized heap is trivially consistent.
    pub fn verify(&self) -> Result<HeapSummary, CorruptionError> {
        self.walk(false)
    }

    /// Checks the heap and panics on the first inconsistency.
    ///
    /// With `verbose`, every block is logged at debug level.
    ///
    /// # Panics
    ///
    /// Panics if [`verify`](Self::verify) would return an error.
    #[track_caller]
    pub fn check_heap(&self, verbose: bool) -> HeapSummary {
        match self.walk(verbose) {
            Ok(summary) => summary,
            Err(err) => panic!("heap is corrupted: {err}"),
        }
    }

    fn walk(&self, verbose: bool) -> Result<HeapSummary, CorruptionError> {
        let State::Ready { prologue } = self.state else {
            return Ok(HeapSummary::default());
        };
        let low = self.space.low_address().addr();
        let high = self.space.high_address().addr();
        let end = high.wrapping_add(1);

        let mut summary = HeapSummary {
            heap_size: self.space.heap_size(),
            ..HeapSummary::default()
        };
        if verbose {
            debug!("heap ({low:#x}..={high:#x}):");
        }

        unsafe {
            let first = BlockPtr::from_payload(prologue.payload().add(DOUBLE_WORD_SIZE));
            let header = prologue.header();
            let footer = first.prev_footer();
            if verbose {
                debug!("{:#x}: header {header} footer {footer}", prologue.addr());
            }
            ensure!(
                header == Tag::PROLOGUE && footer == Tag::PROLOGUE,
                BadPrologueSnafu { header, footer }
            );

            let mut block = first;
            let mut prev_free = None;
            loop {
                let address = block.addr();
                check_bounds(address, 0, low, high)?;
                let header = block.header();

                if header.size() == 0 {
                    if verbose {
                        debug!("{address:#x}: EOL {header}");
                    }
                    ensure!(header == Tag::EPILOGUE, BadEpilogueSnafu { address, header });
                    ensure!(
                        address == end,
                        MisplacedEpilogueSnafu {
                            address,
                            expected: end,
                        }
                    );
                    break;
                }

                ensure!(address.is_multiple_of(ALIGNMENT), MisalignedSnafu { address });
                let size = header.size();
                ensure!(size >= MIN_BLOCK_SIZE, InvalidSizeSnafu { address, size });
                check_bounds(address, size, low, high)?;

                let footer = block.footer();
                if verbose {
                    debug!("{address:#x}: header {header} footer {footer}");
                }
                ensure!(
                    header == footer,
                    TagMismatchSnafu {
                        address,
                        header,
                        footer,
                    }
                );

                summary.blocks += 1;
                if header.is_allocated() {
                    summary.allocated_bytes += size;
                    prev_free = None;
                } else {
                    if let Some(prev) = prev_free {
                        return UncoalescedSnafu {
                            address: prev,
                            next: address,
                        }
                        .fail();
                    }
                    summary.free_blocks += 1;
                    summary.free_bytes += size;
                    prev_free = Some(address);
                }
                block = block.next();
            }

            let mut count = 0;
            let mut expected_prev = None;
            for block in self.free_list.iter() {
                // more entries than free blocks means a stray entry or a cycle
                ensure!(
                    count < summary.free_blocks,
                    FreeCountMismatchSnafu {
                        heap: summary.free_blocks,
                        free_list: count + 1,
                    }
                );

                let address = block.addr();
                ensure!(address.is_multiple_of(ALIGNMENT), MisalignedSnafu { address });
                check_bounds(address, MIN_BLOCK_SIZE, low, high)?;
                let header = block.header();
                check_bounds(address, header.size(), low, high)?;
                let footer = block.footer();
                ensure!(
                    header == footer,
                    TagMismatchSnafu {
                        address,
                        header,
                        footer,
                    }
                );
                ensure!(!header.is_allocated(), AllocatedInFreeListSnafu { address });

                let found = block.prev_free();
                ensure!(
                    found == expected_prev,
                    BrokenBackLinkSnafu {
                        address,
                        expected: expected_prev.map_or(0, BlockPtr::addr),
                        found: found.map_or(0, BlockPtr::addr),
                    }
                );
                expected_prev = Some(block);
                count += 1;
            }
            ensure!(
                count == summary.free_blocks,
                FreeCountMismatchSnafu {
                    heap: summary.free_blocks,
                    free_list: count,
                }
            );
        }

        if verbose {
            debug!(
                "{} blocks, {} free ({} bytes), {} bytes allocated",
                summary.blocks, summary.free_blocks, summary.free_bytes, summary.allocated_bytes
            );
        }
        Ok(summary)
    }
}
