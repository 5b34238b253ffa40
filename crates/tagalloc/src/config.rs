//! Allocator tuning knobs.

use core::num::NonZeroUsize;

/// Default amount the heap grows by when no free block fits (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 16;

/// Tuning parameters of an [`Allocator`](crate::Allocator).
///
/// # Examples
///
/// ```
/// use core::num::NonZeroUsize;
///
/// use tagalloc::Config;
///
/// let config = Config::new()
///     .with_chunk_size(4096)
///     .with_repeat_threshold(NonZeroUsize::new(40));
/// assert_eq!(config.chunk_size, 4096);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes requested from the address space on every heap
    /// extension, including the one performed by `init`.
    pub chunk_size: usize,
    /// Skip the free-list search once the same adjusted size has been
    /// requested more than this many times in a row, and extend the heap
    /// instead.
    ///
    /// This only trades heap growth for search time on traces that repeat one
    /// size; it never changes which requests succeed. `None` disables it.
    pub repeat_threshold: Option<NonZeroUsize>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Returns the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            repeat_threshold: None,
        }
    }

    #[must_use]
    pub const fn with_chunk_size(self, chunk_size: usize) -> Self {
        Self { chunk_size, ..self }
    }

    #[must_use]
    pub const fn with_repeat_threshold(self, repeat_threshold: Option<NonZeroUsize>) -> Self {
        Self {
            repeat_threshold,
            ..self
        }
    }
}
