//! Error types.

use snafu::{Location, Snafu};

use crate::block::Tag;

/// The heap could not be grown.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CapacityError {
    #[snafu(display("address space exhausted: requested={requested} bytes"))]
    AddressSpaceExhausted {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request too large for a single block: requested={requested} bytes"))]
    RequestTooLarge {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "heap would outgrow the largest block size: requested={requested} bytes, heap_size={heap_size}"
    ))]
    HeapLimitExceeded {
        requested: usize,
        heap_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A resize could not obtain its new block.
///
/// The old block is left untouched and still owned by the caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResizeError {
    #[snafu(display("cannot resize a block to zero bytes"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate the resized block: new_size={new_size}"))]
    Allocate {
        new_size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: CapacityError,
    },
}

/// A structural inconsistency found by the heap checker.
///
/// Addresses are block (payload) addresses.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CorruptionError {
    #[snafu(display("bad prologue: header={header}, footer={footer}"))]
    BadPrologue { header: Tag, footer: Tag },
    #[snafu(display("bad epilogue at {address:#x}: header={header}"))]
    BadEpilogue { address: usize, header: Tag },
    #[snafu(display("epilogue at {address:#x} is not at the end of the heap: expected={expected:#x}"))]
    MisplacedEpilogue { address: usize, expected: usize },
    #[snafu(display("block {address:#x} lies outside the heap: heap={low:#x}..={high:#x}"))]
    OutOfBounds {
        address: usize,
        low: usize,
        high: usize,
    },
    #[snafu(display("block {address:#x} is not 8-byte aligned"))]
    Misaligned { address: usize },
    #[snafu(display("block {address:#x} header does not match footer: header={header}, footer={footer}"))]
    TagMismatch {
        address: usize,
        header: Tag,
        footer: Tag,
    },
    #[snafu(display("block {address:#x} has an invalid size: size={size}"))]
    InvalidSize { address: usize, size: usize },
    #[snafu(display("adjacent free blocks were not coalesced: {address:#x} and {next:#x}"))]
    Uncoalesced { address: usize, next: usize },
    #[snafu(display("allocated block {address:#x} found in the free list"))]
    AllocatedInFreeList { address: usize },
    #[snafu(display("free list back link of {address:#x} is broken: expected={expected:#x}, found={found:#x}"))]
    BrokenBackLink {
        address: usize,
        expected: usize,
        found: usize,
    },
    #[snafu(display("free block count mismatch: heap={heap}, free_list={free_list}"))]
    FreeCountMismatch { heap: usize, free_list: usize },
}
