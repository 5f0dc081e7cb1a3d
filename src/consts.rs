//! Compile-time constants for the allocator's layout and sizing.

/// Bytes per buddy block.
pub const BLOCK_SIZE: usize = 4096;

/// Number of buddy orders. The arena is capped at `2^N - 1` blocks.
pub const N: usize = 10;

/// Number of built-in size-class caches for the generic allocator.
pub const SIZES: usize = 13;

/// Smallest size-class upper bound, in bytes. Size classes are
/// `MIN_SIZE_POWER_OF_2_BYTES * 2^k` for `k` in `0..SIZES`.
pub const MIN_SIZE_POWER_OF_2_BYTES: usize = 32;

/// Maximum cache name length, including the nul terminator slot.
pub const NAME_LENGTH: usize = 20;

/// Caps how many buddy orders `optimal_slots_per_slab` will walk before
/// settling for the best ratio seen so far.
pub const MAX_N_OPTIMAL: usize = 6;

/// Target machine's L1 cache line size, used for slab colour offsets.
pub const CACHE_L1_LINE_SIZE: usize = 64;
