use core::mem;

use super::block::BlockHeader;

/// byte offset of a block inside an arena
pub type BlockLoc = u32;
pub const BLOCK_NULL: BlockLoc = BlockLoc::MAX;
pub const BLOCK_HIGH_BIT: BlockLoc = !(BlockLoc::MAX >> 1);
pub const BLOCK_BITMAP: BlockLoc = !BLOCK_HIGH_BIT;

/// alignment of every address handed out by a pool
pub const ALIGN: usize = 8;

/// size of the in-band header in front of every variable block
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// smallest payload a free block is allowed to carry
pub const MIN_PAYLOAD: usize = 8;

/// a free block is only split when the tail left over is at least this big
pub const MIN_SPLIT_REMAINDER: usize = HEADER_SIZE + MIN_PAYLOAD;

/// smallest arena a `VariableBlockPool` accepts
pub const MIN_ARENA_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

/// largest arena a pool can address
pub const MAX_ARENA_SIZE: usize = BLOCK_BITMAP as usize;

/// memory error codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The pool has run out of memory
    #[error("pool has no free block large enough")]
    OutOfMemory,
    /// The pool has enough free bytes in total, but no single
    /// free block is large enough.
    #[error("pool has enough free memory but it is fragmented")]
    Fragmented,
    /// the amount of memory requested is zero or too large
    #[error("requested size is zero or too large")]
    InvalidSize,
    /// the requested type needs a stricter alignment than the pool gives
    #[error("requested alignment exceeds the pool alignment")]
    InvalidAlignment,
    /// the pointer does not address a block payload of this pool
    #[error("pointer does not belong to this pool")]
    InvalidPointer,
    /// the block has already been returned to the pool
    #[error("block is already free")]
    DoubleFree,
    /// the pool has no arena bound to it
    #[error("pool has no arena")]
    Uninitialized,
    /// the pool is borrowed elsewhere and cannot be changed right now
    #[error("pool is already borrowed")]
    Busy,
}

pub type Result<T> = core::result::Result<T, Error>;

#[test]
fn test_bitmaps() {
    let highbit: BlockLoc = 1 << ((mem::size_of::<BlockLoc>() * 8) - 1);
    assert_eq!(BLOCK_HIGH_BIT, highbit, "{:b} != {:b}", BLOCK_HIGH_BIT, highbit);
    assert_eq!(BLOCK_BITMAP, !highbit, "{:b} != {:b}", BLOCK_BITMAP, !highbit);
    assert_eq!(BLOCK_NULL & BLOCK_BITMAP, BLOCK_BITMAP);
}

#[test]
fn test_policy_constants() {
    assert_eq!(HEADER_SIZE, 8);
    assert_eq!(HEADER_SIZE % ALIGN, 0);
    assert_eq!(MIN_SPLIT_REMAINDER, 16);
    assert!(ALIGN.is_power_of_two());
}
