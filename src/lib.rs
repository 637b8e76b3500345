/*!
Deterministic, fixed-capacity memory pools for microcontrollers.

Two pools carve blocks out of a single [`Arena`] that never grows:

- [`VariableBlockPool`] hands out variably sized blocks. It searches its
  free list first-fit, splits oversized blocks on allocation and merges
  neighbouring free blocks on deallocation.
- [`FixedBlockPool`] pre-partitions the arena into `BLOCK_NUMBER` blocks of
  `BLOCK_SIZE` bytes. Allocation and deallocation are a single list pop/push.

[`PoolAllocator`] puts an allocate/construct/destroy/deallocate interface on
top of either pool, or on top of a [`Fallback`] allocator when no pool is bound.

Nothing in this crate locks, blocks or panics on exhaustion: every failure is
returned as an [`Error`]. The pools are meant for a single-threaded control
loop and are neither `Send` nor `Sync`.
*/

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

use core::ptr::NonNull;

mod types;
mod utils;
mod arena;
mod block;
mod free;
mod variable;
mod fixed;
mod fallback;
mod allocator;

#[cfg(test)]
mod tests;

pub use types::{
    BlockLoc, Error, Result, ALIGN, BLOCK_NULL, HEADER_SIZE, MAX_ARENA_SIZE, MIN_ARENA_SIZE,
    MIN_PAYLOAD, MIN_SPLIT_REMAINDER,
};
pub use arena::{Arena, ArenaBuf};
pub use block::{BlockInfo, BlockType};
pub use variable::{Blocks, DisplayPool, FreeBlocks, PoolStats, VariableBlockPool};
pub use fixed::{fixed_arena_size, FixedBlockPool};
pub use fallback::{DefaultFallback, Fallback, NoFallback};
#[cfg(feature = "alloc")]
pub use fallback::Global;
pub use allocator::PoolAllocator;

/// The interface every pool offers to [`PoolAllocator`].
pub trait MemoryPool {
    /// Allocate at least `size` bytes, aligned to [`ALIGN`].
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>>;

    /// Return a region to the pool.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this same pool and not
    /// released since. The caller gives up every access to the region.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<()>;

    /// Discard every outstanding allocation. Pointers handed out before the
    /// reset must not be used afterwards.
    fn reset(&mut self);

    /// whether `ptr` points into this pool's arena
    fn contains(&self, ptr: NonNull<u8>) -> bool;

    /// size of the arena in bytes
    fn total_size(&self) -> usize;

    /// bytes currently handed out, including per-block overhead
    fn used_size(&self) -> usize;

    fn free_size(&self) -> usize {
        self.total_size() - self.used_size()
    }
}
