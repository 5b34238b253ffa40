//! Boundary-tag block encoding.
//!
//! Every block in the heap is bracketed by two identical 32-bit tags, a
//! header in front of the payload and a footer in its last word:
//!
//! ```text
//!  31                               3   2   1   0
//! +----------------------------------+---+---+---+
//! | s  s  s  s  ...  s  s  s  s  s  | 0 | 0 | a |
//! +----------------------------------+---+---+---+
//! ```
//!
//! The size is always a multiple of 8, so the low three bits of the tag are
//! free for flags. Only bit 0 (`a`, allocated) is used; bits 1 and 2 are
//! reserved and always zero.
//!
//! ```text
//!                  block pointer
//!                       |
//!                       v
//!          +--------+-------------------------------+--------+
//!          | header | payload                       | footer |
//!          +--------+-------------------------------+--------+
//!          <------------------- block size ------------------>
//!
//! free:    | header | next | prev | (unused)        | footer |
//! ```
//!
//! A block is identified by its payload address, the same address that is
//! handed out to callers. While a block is free, the first two machine words
//! of its payload hold the free-list links, so the free list costs no space
//! beyond the minimum block size.

use core::{fmt, ptr::NonNull};

use bitflags::bitflags;

/// Size of a header or footer tag in bytes.
pub const WORD_SIZE: usize = size_of::<u32>();

/// Size of a double word in bytes.
pub const DOUBLE_WORD_SIZE: usize = 2 * WORD_SIZE;

/// Alignment of every block pointer (and every payload handed out).
pub const ALIGNMENT: usize = DOUBLE_WORD_SIZE;

/// Bytes taken by the header and footer of a block.
pub const TAG_OVERHEAD: usize = 2 * WORD_SIZE;

/// Smallest block the allocator ever creates.
///
/// A free block must hold its header, its footer and two free-list links.
pub const MIN_BLOCK_SIZE: usize = 24;

/// Largest block size that fits in a tag.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & Tag::SIZE_MASK) as usize;

const _: () = assert!(TAG_OVERHEAD + 2 * size_of::<Option<BlockPtr>>() <= MIN_BLOCK_SIZE);
const _: () = assert!(MIN_BLOCK_SIZE.is_multiple_of(ALIGNMENT));

bitflags! {
    /// Flag bits stored in the low bits of a tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u32 {
        /// The block is allocated.
        const ALLOCATED = 0b001;
    }
}

/// A header or footer word.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(u32);

impl Tag {
    const SIZE_MASK: u32 = !0b111;

    /// Tag of the prologue sentinel (header and footer).
    pub const PROLOGUE: Self = Self::pack(DOUBLE_WORD_SIZE, true);

    /// Tag of the epilogue sentinel (header only).
    pub const EPILOGUE: Self = Self::pack(0, true);

    /// Packs a block size and an allocation state into a tag.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of 8 or does not fit in a tag.
    #[must_use]
    pub const fn pack(size: usize, allocated: bool) -> Self {
        assert!(size.is_multiple_of(ALIGNMENT), "block size must be 8-byte aligned");
        assert!(size <= MAX_BLOCK_SIZE, "block size must fit in a tag");
        #[expect(clippy::cast_possible_truncation)]
        let size = size as u32;
        let flags = if allocated {
            TagFlags::ALLOCATED.bits()
        } else {
            0
        };
        Self(size | flags)
    }

    /// Reinterprets a raw word as a tag.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw word.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the block size encoded in the tag.
    #[must_use]
    pub const fn size(self) -> usize {
        (self.0 & Self::SIZE_MASK) as usize
    }

    /// Returns the flag bits of the tag.
    #[must_use]
    pub const fn flags(self) -> TagFlags {
        TagFlags::from_bits_retain(self.0 & !Self::SIZE_MASK)
    }

    /// Returns `true` if the tag marks an allocated block.
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        self.0 & TagFlags::ALLOCATED.bits() != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_allocated() { 'a' } else { 'f' };
        write!(f, "[{}:{state}]", self.size())
    }
}

/// Handle to a block in the heap, pointing at its payload.
///
/// All accessors are `unsafe`: the handle does not know whether the memory
/// around it still holds a block. Callers must guarantee that the tags the
/// accessor touches lie inside the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    pub(crate) const fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    pub(crate) const fn payload(self) -> NonNull<u8> {
        self.0
    }

    pub(crate) fn addr(self) -> usize {
        self.0.addr().get()
    }

    unsafe fn header_ptr(self) -> NonNull<u32> {
        unsafe { self.0.sub(WORD_SIZE).cast() }
    }

    unsafe fn footer_ptr(self) -> NonNull<u32> {
        unsafe { self.0.add(self.size()).sub(DOUBLE_WORD_SIZE).cast() }
    }

    fn links_ptr(self) -> NonNull<Option<Self>> {
        self.0.cast()
    }

    pub(crate) unsafe fn header(self) -> Tag {
        unsafe { Tag::from_bits(self.header_ptr().read()) }
    }

    pub(crate) unsafe fn footer(self) -> Tag {
        unsafe { Tag::from_bits(self.footer_ptr().read()) }
    }

    pub(crate) unsafe fn size(self) -> usize {
        unsafe { self.header().size() }
    }

    pub(crate) unsafe fn is_allocated(self) -> bool {
        unsafe { self.header().is_allocated() }
    }

    /// Writes `tag` to the header only.
    ///
    /// Used for the epilogue, which has no footer.
    pub(crate) unsafe fn set_header(self, tag: Tag) {
        unsafe { self.header_ptr().write(tag.bits()) }
    }

    /// Writes `tag` to both the header and the footer.
    ///
    /// The footer position is derived from the new size.
    pub(crate) unsafe fn set_tags(self, tag: Tag) {
        unsafe {
            self.set_header(tag);
            self.footer_ptr().write(tag.bits());
        }
    }

    /// Returns the tag stored in the footer of the preceding block.
    pub(crate) unsafe fn prev_footer(self) -> Tag {
        unsafe { Tag::from_bits(self.0.sub(DOUBLE_WORD_SIZE).cast::<u32>().read()) }
    }

    /// Returns the block physically following this one.
    pub(crate) unsafe fn next(self) -> Self {
        unsafe { Self(self.0.add(self.size())) }
    }

    /// Returns the block physically preceding this one.
    pub(crate) unsafe fn prev(self) -> Self {
        unsafe { Self(self.0.sub(self.prev_footer().size())) }
    }

    pub(crate) unsafe fn next_free(self) -> Option<Self> {
        unsafe { self.links_ptr().read() }
    }

    pub(crate) unsafe fn prev_free(self) -> Option<Self> {
        unsafe { self.links_ptr().add(1).read() }
    }

    pub(crate) unsafe fn set_next_free(self, next: Option<Self>) {
        unsafe { self.links_ptr().write(next) }
    }

    pub(crate) unsafe fn set_prev_free(self, prev: Option<Self>) {
        unsafe { self.links_ptr().add(1).write(prev) }
    }
}
