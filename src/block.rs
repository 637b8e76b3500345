//! contains the in-band header stored at the start of every
//! block of a `VariableBlockPool`

use core::fmt;

use super::arena::Arena;
use super::types::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockType {
    Free,
    Full,
}

/// The BlockHeader is written in front of every block, free or full.
/// The high bit of `_size` is 1 for Full blocks.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct BlockHeader {
    _size: BlockLoc, // size of the block, header included
    _next: BlockLoc, // offset of the next free block, only valid while free
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let isvalid = if self.is_valid() { " " } else { "!" };
        match self.ty() {
            BlockType::Free => {
                let next: isize = match self.next() {
                    Some(n) => n as isize,
                    None => -1,
                };
                write!(f, "Free{}{{size: {}, next: {}}}{}", isvalid, self.size(), next, isvalid)
            }
            BlockType::Full => write!(f, "Full{}{{size: {}}}{}", isvalid, self.size(), isvalid),
        }
    }
}

impl BlockHeader {
    /// header of a free block linked to `next`
    pub fn free(size: usize, next: Option<usize>) -> BlockHeader {
        debug_assert!(size <= MAX_ARENA_SIZE);
        BlockHeader {
            _size: size as BlockLoc,
            _next: next.map_or(BLOCK_NULL, |n| n as BlockLoc),
        }
    }

    /// header of an allocated block
    pub fn full(size: usize) -> BlockHeader {
        debug_assert!(size <= MAX_ARENA_SIZE);
        BlockHeader {
            _size: size as BlockLoc | BLOCK_HIGH_BIT,
            _next: BLOCK_NULL,
        }
    }

    /// size accessor, handling the bitmap
    pub fn size(&self) -> usize {
        (self._size & BLOCK_BITMAP) as usize
    }

    pub fn ty(&self) -> BlockType {
        if self._size & BLOCK_HIGH_BIT == 0 {
            BlockType::Free
        } else {
            BlockType::Full
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.ty() == BlockType::Full
    }

    /// next accessor, `None` at the end of the free list
    pub fn next(&self) -> Option<usize> {
        if self._next == BLOCK_NULL {
            None
        } else {
            Some(self._next as usize)
        }
    }

    pub fn set_next(&mut self, next: Option<usize>) {
        self._next = next.map_or(BLOCK_NULL, |n| n as BlockLoc);
    }

    /// a header must at least cover itself
    pub fn is_valid(&self) -> bool {
        self.size() >= HEADER_SIZE
    }

    /// Load the header of the block at `offset`.
    ///
    /// # Safety
    /// `offset` must be the start of a block of the pool that owns `arena`.
    pub unsafe fn load(arena: &Arena, offset: usize) -> BlockHeader {
        arena.read(offset)
    }

    /// Store this header at `offset`.
    ///
    /// # Safety
    /// `offset` must be the start of a block whose header bytes no caller
    /// is using.
    pub unsafe fn store(self, arena: &Arena, offset: usize) {
        arena.write(offset, self)
    }
}

/// A block as seen when walking the arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// offset of the header from the start of the arena
    pub offset: usize,
    /// size of the block, header included
    pub size: usize,
    pub ty: BlockType,
}

impl BlockInfo {
    /// offset of the first payload byte
    pub fn payload(&self) -> usize {
        self.offset + HEADER_SIZE
    }

    /// offset one past the last byte of the block
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[test]
fn test_basic() {
    // Full.size() cancels out the high bit
    let f = BlockHeader::full(4096);
    assert_eq!(f.size(), 4096);
    assert_eq!(f._size, BLOCK_HIGH_BIT | 4096);
    assert_eq!(f.ty(), BlockType::Full);
    assert_eq!(f.next(), None);

    let mut f = BlockHeader::free(64, Some(128));
    assert_eq!(f.size(), 64);
    assert_eq!(f.ty(), BlockType::Free);
    assert_eq!(f.next(), Some(128));
    f.set_next(None);
    assert_eq!(f._next, BLOCK_NULL);
    assert!(f.is_valid());
    assert!(!BlockHeader::free(4, None).is_valid());
}

#[test]
fn test_header_size() {
    assert_eq!(core::mem::size_of::<BlockHeader>(), HEADER_SIZE);
    assert!(core::mem::align_of::<BlockHeader>() <= ALIGN);
}

#[test]
fn test_load_store() {
    let mut buf = super::arena::ArenaBuf::<32>::new();
    let arena = buf.arena();
    unsafe {
        BlockHeader::full(24).store(&arena, 8);
        let h = BlockHeader::load(&arena, 8);
        assert!(h.is_allocated());
        assert_eq!(h.size(), 24);
    }
    assert_eq!(format!("{:?}", BlockHeader::free(16, None)), "Free {size: 16, next: -1} ");
}
