//! A boundary-tag heap allocator with an explicit free list.
//!
//! The allocator manages one contiguous heap that grows at its end, in the
//! manner of `sbrk(2)`. Every block carries a 4-byte header and a 4-byte
//! footer encoding its size and allocation state, which lets a freed block
//! find and merge with both physical neighbors in constant time. Free blocks
//! are threaded on an unordered doubly-linked list whose links live inside
//! the free payloads.
//!
//! # Algorithm
//!
//! - **Allocation**: the request is rounded up to a block size and the free
//!   list is scanned first-fit. If nothing fits, the heap is extended by at
//!   least [`Config::chunk_size`] bytes. An oversized block is split when the
//!   remainder can hold a block of its own.
//! - **Release**: the block is marked free, merged with free neighbors, and
//!   pushed at the head of the free list.
//! - **Resize**: always moves the block. A new block is allocated, the payload
//!   is copied, and the old block is released.
//!
//! # Memory Layout
//!
//! ```text
//! +-----+----------+----------+------------------------------+----------+
//! | pad | prologue | prologue | hdr | payload | ftr | hdr ... | epilogue |
//! |     |  header  |  footer  |                               |  header  |
//! +-----+----------+----------+------------------------------+----------+
//! ```
//!
//! Payloads are aligned to 8 bytes. The smallest block is
//! [`MIN_BLOCK_SIZE`](block::MIN_BLOCK_SIZE) bytes, enough for the two tags
//! and the two free-list links.
//!
//! # Usage
//!
//! ```rust
//! use tagalloc::{Allocator, Config, provider::OwnedRegion};
//!
//! let region = OwnedRegion::new(1 << 20).unwrap();
//! let mut allocator = Allocator::new(region, Config::new().with_chunk_size(4096));
//!
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe {
//!     ptr.write_bytes(0xAB, 100);
//!     let ptr = allocator.resize(ptr, 300).unwrap();
//!     assert_eq!(ptr.read(), 0xAB);
//!     allocator.release(ptr.as_ptr());
//! }
//!
//! let summary = allocator.verify().unwrap();
//! assert_eq!(summary.free_blocks, 1);
//! ```
//!
//! # Thread Safety
//!
//! [`Allocator`] is `Send` but not `Sync`. [`LockedAllocator`] wraps it in a
//! spin lock and implements [`GlobalAlloc`](core::alloc::GlobalAlloc).

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    allocator::Allocator,
    check::{BlockInfo, Blocks, FreeBlocks, HeapSummary},
    config::{Config, DEFAULT_CHUNK_SIZE},
    error::{CapacityError, CorruptionError, ResizeError},
    locked::LockedAllocator,
};

mod allocator;
pub mod block;
mod check;
mod coalesce;
mod config;
mod error;
mod extend;
mod fit;
mod free_list;
mod locked;
pub mod provider;
#[cfg(test)]
mod testing;
