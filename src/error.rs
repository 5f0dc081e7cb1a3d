//! Error types.
//!
//! Bootstrap failures are returned as a `Result` rather than terminating the
//! process, since a library can't exit its host. Per-cache/per-size-class
//! diagnostics use a single overwritten "last error" word, exposed through
//! [`ErrorCode`].

use thiserror::Error;

/// Fatal failures that can occur while bringing up the allocator.
///
/// A null-handle dereference has no construction-time analogue; it shows up
/// in this crate as a panic from [`crate::CacheHandle`] methods called after
/// [`crate::Allocator::destroy_cache`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    /// `block_num >= 2^N`; the arena is larger than this allocator's address
    /// space of orders can describe.
    #[error("block count {block_num} exceeds maximum of 2^{max_order} - 1")]
    BlockCountExceeded { block_num: usize, max_order: u32 },
    /// The bootstrap "cache for caches" could not be carved out of the arena.
    #[error("failed to bootstrap the cache-for-caches allocator")]
    CacheForCachesFailed,
    /// The bootstrap "cache for handles" could not be carved out of the arena.
    #[error("failed to bootstrap the cache-for-handles allocator")]
    CacheForHandlesFailed,
}

/// The per-cache / per-size-class last-error slot.
///
/// Overwritten on every new error, never accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    None = 0,
    NoMemory = 1,
    FreeingObject = 2,
    DeletingSlab = 3,
    ShrinkingAvoided = 4,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            ErrorCode::None => "no error",
            ErrorCode::NoMemory => "no memory available",
            ErrorCode::FreeingObject => "error freeing object",
            ErrorCode::DeletingSlab => "error deleting slab",
            ErrorCode::ShrinkingAvoided => "shrinking avoided",
        };
        f.write_str(msg)
    }
}
