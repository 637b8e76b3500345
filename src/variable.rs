/*
Contains all the logic related to the VariableBlockPool. The pool keeps every
block, free or full, behind an in-band header; the headers partition the
arena with no gaps, so walking from offset 0 by `size` visits every block.
*/

use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace, warn};

use super::arena::Arena;
use super::block::{BlockHeader, BlockInfo, BlockType};
use super::free::{FreeIter, FreeList};
use super::types::*;
use super::utils::{align_up, is_aligned};
use super::MemoryPool;

/// `VariableBlockPool` manages one arena as variably sized blocks.
///
/// Allocation is first-fit over the free list. A block is split when the
/// tail left over is at least `MIN_SPLIT_REMAINDER` bytes, otherwise the
/// whole block is handed out. Freed blocks are merged with a free neighbour
/// on each side before going back on the head of the free list.
///
/// `used_size` counts whole blocks, headers included, so
/// `used_size() + free_size() == total_size()` always holds.
pub struct VariableBlockPool<'a> {
    arena: Option<Arena<'a>>,
    free: FreeList,
    used_size: usize,
    alloc_count: usize,
    live_count: usize,
}

impl<'a> Default for VariableBlockPool<'a> {
    fn default() -> VariableBlockPool<'a> {
        VariableBlockPool::new()
    }
}

impl<'a> VariableBlockPool<'a> {
    /// An unbound pool. Every `allocate` fails with
    /// `Error::Uninitialized` until `init` succeeds.
    pub const fn new() -> VariableBlockPool<'a> {
        VariableBlockPool {
            arena: None,
            free: FreeList::new(),
            used_size: 0,
            alloc_count: 0,
            live_count: 0,
        }
    }

    /// get a pool bound to `arena`
    pub fn from_arena(arena: Arena<'a>) -> Result<VariableBlockPool<'a>> {
        let mut pool = VariableBlockPool::new();
        pool.init(arena)?;
        Ok(pool)
    }

    /// Bind `arena` to the pool and make it one free block.
    ///
    /// Fails with `Error::InvalidSize` when the arena is smaller than
    /// `MIN_ARENA_SIZE` or larger than `MAX_ARENA_SIZE`; the pool is left as
    /// it was. Calling `init` on a pool with live allocations drops the old
    /// arena and invalidates every pointer handed out from it.
    pub fn init(&mut self, arena: Arena<'a>) -> Result<()> {
        let size = arena.len();
        if !(MIN_ARENA_SIZE..=MAX_ARENA_SIZE).contains(&size) {
            warn!("init: arena of {} bytes rejected", size);
            return Err(Error::InvalidSize);
        }
        self.arena = Some(arena);
        self.reset();
        debug!("init: bound arena of {} bytes", size);
        Ok(())
    }

    /// Allocate at least `size` bytes.
    ///
    /// The returned address is aligned to `ALIGN`. Fails with
    /// `Error::InvalidSize` for zero-sized requests, `Error::OutOfMemory` when
    /// there are not enough free bytes and `Error::Fragmented` when there are
    /// but no single free block can hold the request.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let arena = self.arena.as_ref().ok_or(Error::Uninitialized)?;
        if size == 0 || size > MAX_ARENA_SIZE {
            return Err(Error::InvalidSize);
        }
        let required = align_up(size, ALIGN)
            .and_then(|s| s.checked_add(HEADER_SIZE))
            .ok_or(Error::InvalidSize)?;

        let mut prev = None;
        let mut cursor = self.free.root();
        while let Some(block) = cursor {
            // SAFETY: the free list only holds block starts of this arena
            let header = unsafe { BlockHeader::load(arena, block) };
            debug_assert!(!header.is_allocated(), "{:?} on the free list", header);
            if header.size() < required {
                prev = Some(block);
                cursor = header.next();
                continue;
            }

            // SAFETY: `block` is free and `prev` is its list predecessor
            let granted = unsafe {
                if header.size() - required >= MIN_SPLIT_REMAINDER {
                    // the tail takes the block's place in the list
                    let tail = block + required;
                    BlockHeader::free(header.size() - required, header.next()).store(arena, tail);
                    self.free.relink(arena, prev, Some(tail));
                    required
                } else {
                    self.free.unlink(arena, prev, header.next());
                    header.size()
                }
            };
            // SAFETY: the block was just taken off the list
            unsafe { BlockHeader::full(granted).store(arena, block) };
            self.used_size += granted;
            self.alloc_count += 1;
            self.live_count += 1;
            trace!("allocate({}): block {} of {} bytes", size, block, granted);
            return Ok(arena.ptr_at(block + HEADER_SIZE));
        }

        let err = if self.free_size() >= required {
            Error::Fragmented
        } else {
            Error::OutOfMemory
        };
        debug!("allocate({}): {} ({} bytes free)", size, err, self.free_size());
        Err(err)
    }

    /// Return a block to the pool.
    ///
    /// Pointers outside the arena, or inside it but not at a block payload,
    /// fail with `Error::InvalidPointer`. Freeing a block that is already
    /// free fails with `Error::DoubleFree`. In both cases the pool is left
    /// unchanged.
    ///
    /// # Safety
    /// The bounds and double-free checks only read the header in front of
    /// `ptr`. `ptr` must have been returned by `allocate` on this pool since
    /// the last `init`/`reset`, and the caller must not touch the block
    /// after it is released.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let arena = self.arena.as_ref().ok_or(Error::InvalidPointer)?;
        let block = match arena.offset_of(ptr) {
            Some(offset) if offset >= HEADER_SIZE && is_aligned(offset - HEADER_SIZE) => {
                offset - HEADER_SIZE
            }
            _ => {
                warn!("deallocate: {:p} is not a block of this pool", ptr);
                return Err(Error::InvalidPointer);
            }
        };

        let header = BlockHeader::load(arena, block);
        if !header.is_allocated() {
            warn!("deallocate: block {} is already free", block);
            return Err(Error::DoubleFree);
        }
        let size = header.size();
        if !header.is_valid() || block + size > arena.len() {
            warn!("deallocate: block {} has a corrupt header {:?}", block, header);
            return Err(Error::InvalidPointer);
        }

        // stale pointers to this block now read as free
        BlockHeader::free(size, None).store(arena, block);
        self.used_size -= size;
        self.live_count -= 1;

        let (start, merged) = self.free.coalesce(arena, block, size);
        self.free.push(arena, start, merged);
        trace!("deallocate: block {} of {} bytes, free block {} of {} bytes",
               block, size, start, merged);
        Ok(())
    }

    /// Make the whole arena one free block again.
    ///
    /// Every pointer handed out before the reset becomes invalid; it is up to
    /// the caller to only reset at a point where none are in use.
    pub fn reset(&mut self) {
        self.used_size = 0;
        self.alloc_count = 0;
        self.live_count = 0;
        self.free.clear();
        if let Some(arena) = self.arena.as_ref() {
            // SAFETY: nothing in the arena is in use anymore
            unsafe { self.free.push(arena, 0, arena.len()) };
            debug!("reset: {} bytes free", arena.len());
        }
    }

    // public safe API

    pub fn is_initialized(&self) -> bool {
        self.arena.is_some()
    }

    /// arena size in bytes
    pub fn total_size(&self) -> usize {
        self.arena.as_ref().map_or(0, Arena::len)
    }

    /// bytes in allocated blocks, headers included
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// bytes in free blocks (fragmented or not)
    pub fn free_size(&self) -> usize {
        self.total_size() - self.used_size
    }

    /// number of allocations made since the last `init`/`reset`
    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    /// number of allocations not yet deallocated
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.arena.as_ref().is_some_and(|a| a.contains(ptr))
    }

    /// offset of the payload at `ptr` from the start of the arena
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.arena.as_ref()?.offset_of(ptr)
    }

    /// address of the payload byte at `offset`
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        let arena = self.arena.as_ref()?;
        if offset < arena.len() {
            Some(arena.ptr_at(offset))
        } else {
            None
        }
    }

    /// walk every block of the arena in address order
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: self.arena.as_ref(),
            offset: 0,
        }
    }

    /// walk the free list in list order
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            inner: self.arena.as_ref().map(|a| self.free.iter(a)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (mut free_blocks, mut largest_free_block) = (0, 0);
        for block in self.free_blocks() {
            free_blocks += 1;
            largest_free_block = largest_free_block.max(block.size);
        }
        PoolStats {
            total_size: self.total_size(),
            used_size: self.used_size,
            free_size: self.free_size(),
            alloc_count: self.alloc_count,
            live_count: self.live_count,
            free_blocks,
            largest_free_block,
        }
    }

    /// call this to be able to printout the status of the pool
    pub fn display(&self) -> DisplayPool<'_, 'a> {
        DisplayPool { pool: self }
    }
}

impl<'a> MemoryPool for VariableBlockPool<'a> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        VariableBlockPool::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<()> {
        VariableBlockPool::deallocate(self, ptr)
    }

    fn reset(&mut self) {
        VariableBlockPool::reset(self)
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        VariableBlockPool::contains(self, ptr)
    }

    fn total_size(&self) -> usize {
        VariableBlockPool::total_size(self)
    }

    fn used_size(&self) -> usize {
        self.used_size
    }
}

/// Pool statistics
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_size: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub alloc_count: usize,
    pub live_count: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
}

/// iterator over every block of a pool, see `VariableBlockPool::blocks`
pub struct Blocks<'p> {
    arena: Option<&'p Arena<'p>>,
    offset: usize,
}

impl<'p> Iterator for Blocks<'p> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let arena = self.arena?;
        if self.offset >= arena.len() {
            return None;
        }
        // SAFETY: headers partition the arena, so `offset` is a block start
        let header = unsafe { BlockHeader::load(arena, self.offset) };
        if !header.is_valid() {
            // a corrupt header would loop forever
            self.arena = None;
            return None;
        }
        let info = BlockInfo {
            offset: self.offset,
            size: header.size(),
            ty: header.ty(),
        };
        self.offset += info.size;
        Some(info)
    }
}

/// iterator over the free list, see `VariableBlockPool::free_blocks`
pub struct FreeBlocks<'p> {
    inner: Option<FreeIter<'p>>,
}

impl<'p> Iterator for FreeBlocks<'p> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let (offset, header) = self.inner.as_mut()?.next()?;
        Some(BlockInfo {
            offset,
            size: header.size(),
            ty: BlockType::Free,
        })
    }
}

pub struct DisplayPool<'p, 'a> {
    pool: &'p VariableBlockPool<'a>,
}

impl<'p, 'a> fmt::Display for DisplayPool<'p, 'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.pool;
        writeln!(f, "VariableBlockPool {{")?;
        match p.arena.as_ref() {
            Some(arena) => writeln!(f, "  * arena: {:?}", arena)?,
            None => writeln!(f, "  * arena: UNBOUND")?,
        }
        writeln!(f, "  * Sizes: total: {}, used: {}, free: {}",
                 p.total_size(), p.used_size(), p.free_size())?;
        writeln!(f, "  * Allocations: made: {}, live: {}", p.alloc_count, p.live_count)?;
        writeln!(f, "  * Blocks:")?;
        for block in p.blocks() {
            writeln!(f, "      {:<6}: {:?} {}", block.offset, block.ty, block.size)?;
        }
        write!(f, "  * Free List (len: {}): ", p.free.len())?;
        for block in p.free_blocks() {
            write!(f, "{} ", block.offset)?;
        }
        write!(f, "\n}}")
    }
}

// ##################################################
// # Internal Tests

#[cfg(test)]
fn pool(buf: &mut [u8]) -> VariableBlockPool<'_> {
    VariableBlockPool::from_arena(Arena::new(buf)).unwrap()
}

#[test]
fn test_init() {
    let mut small = super::arena::ArenaBuf::<{ MIN_ARENA_SIZE - 1 }>::new();
    let mut buf = super::arena::ArenaBuf::<MIN_ARENA_SIZE>::new();

    let mut unbound = VariableBlockPool::new();
    assert_eq!(unbound.allocate(8).unwrap_err(), Error::Uninitialized);
    assert_eq!(unbound.total_size(), 0);
    assert_eq!(unbound.init(small.arena()).unwrap_err(), Error::InvalidSize);
    assert!(!unbound.is_initialized());
    assert_eq!(unbound.allocate(8).unwrap_err(), Error::Uninitialized);

    let mut p = VariableBlockPool::new();
    p.init(buf.arena()).unwrap();
    assert_eq!(p.total_size(), MIN_ARENA_SIZE);
    assert!(p.is_empty());
    let ptr = p.allocate(MIN_PAYLOAD).unwrap();
    assert_eq!(p.used_size(), MIN_ARENA_SIZE);
    assert_eq!(p.allocate(1).unwrap_err(), Error::OutOfMemory);
    unsafe { p.deallocate(ptr).unwrap() };
    assert!(p.is_empty());
}

#[test]
fn test_round_trip() {
    let mut buf = super::arena::ArenaBuf::<1024>::new();
    let mut p = pool(&mut buf.0);

    let p1 = p.allocate(100).unwrap();
    let p2 = p.allocate(200).unwrap();
    let o1 = p.offset_of(p1).unwrap();
    let o2 = p.offset_of(p2).unwrap();
    assert_eq!(o1, HEADER_SIZE);
    // 100 rounds to 104, plus a header
    assert_eq!(o2, o1 + 104 + HEADER_SIZE);
    assert_eq!(p.used_size(), 112 + 208);
    assert_eq!(p.alloc_count(), 2);

    unsafe { p.deallocate(p1).unwrap() };
    // 96 + 8 fits in the old 112 byte block without a split
    let p3 = p.allocate(90).unwrap();
    assert_eq!(p3, p1);
    assert_eq!(p.used_size(), 112 + 208);

    unsafe { p.deallocate(p2).unwrap() };
    p.reset();
    assert!(p.is_empty());
    assert_eq!(p.alloc_count(), 0);
    let big = p.allocate(1000).unwrap();
    assert_eq!(p.offset_of(big), Some(HEADER_SIZE));
}

#[test]
fn test_split_threshold() {
    let mut buf = super::arena::ArenaBuf::<256>::new();
    let mut p = pool(&mut buf.0);

    // the tail would be exactly MIN_SPLIT_REMAINDER: split
    let a = p.allocate(256 - HEADER_SIZE - MIN_SPLIT_REMAINDER).unwrap();
    assert_eq!(p.used_size(), 256 - MIN_SPLIT_REMAINDER);
    assert_eq!(p.stats().free_blocks, 1);
    unsafe { p.deallocate(a).unwrap() };

    // the tail would be one ALIGN short of MIN_SPLIT_REMAINDER: no split
    let b = p.allocate(256 - HEADER_SIZE - MIN_SPLIT_REMAINDER + ALIGN).unwrap();
    assert_eq!(p.used_size(), 256);
    assert_eq!(p.stats().free_blocks, 0);
    assert_eq!(p.allocate(1).unwrap_err(), Error::OutOfMemory);
    unsafe { p.deallocate(b).unwrap() };
    assert_eq!(p.stats().largest_free_block, 256);
}

#[test]
fn test_coalesce_either_order() {
    for order in [[0, 1], [1, 0]] {
        let mut buf = super::arena::ArenaBuf::<1024>::new();
        let mut p = pool(&mut buf.0);
        let ab = [p.allocate(8).unwrap(), p.allocate(8).unwrap()];
        // fill the rest so the pair can only merge with each other
        let rest = p.allocate(1024 - 32 - HEADER_SIZE).unwrap();
        assert_eq!(p.free_size(), 0);

        unsafe {
            p.deallocate(ab[order[0]]).unwrap();
            p.deallocate(ab[order[1]]).unwrap();
        }
        assert_eq!(p.stats().free_blocks, 1);
        assert_eq!(p.stats().largest_free_block, 32);

        // 25 bytes need 32 + 8: one byte too many
        assert_eq!(p.allocate(25).unwrap_err(), Error::OutOfMemory);
        assert_eq!(p.allocate(24).unwrap(), ab[0]);
        unsafe { p.deallocate(rest).unwrap() };
    }
}

#[test]
fn test_coalesce_three_way() {
    let mut buf = super::arena::ArenaBuf::<512>::new();
    let mut p = pool(&mut buf.0);
    let a = p.allocate(64).unwrap();
    let b = p.allocate(64).unwrap();
    let c = p.allocate(64).unwrap();
    let _guard = p.allocate(64).unwrap();
    unsafe {
        p.deallocate(a).unwrap();
        p.deallocate(c).unwrap();
        assert_eq!(p.stats().free_blocks, 3);
        p.deallocate(b).unwrap();
    }
    // a, b and c are one block again, next to the tail after the guard
    let blocks: std::vec::Vec<_> = p.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0], BlockInfo { offset: 0, size: 3 * 72, ty: BlockType::Free });
    assert_eq!(blocks[1].ty, BlockType::Full);
    assert_eq!(p.stats().free_blocks, 2);
}

#[test]
fn test_double_free() {
    let mut buf = super::arena::ArenaBuf::<256>::new();
    let mut p = pool(&mut buf.0);
    let a = p.allocate(16).unwrap();
    let b = p.allocate(16).unwrap();
    unsafe {
        assert_eq!(p.deallocate(a), Ok(()));
        let before = p.stats();
        assert_eq!(p.deallocate(a), Err(Error::DoubleFree));
        assert_eq!(p.stats(), before);
    }
    let c = p.allocate(16).unwrap();
    let d = p.allocate(16).unwrap();
    assert_eq!(c, a);
    assert_ne!(d, b);
    assert_ne!(d, c);
}

#[test]
fn test_invalid_pointer() {
    let mut buf = super::arena::ArenaBuf::<256>::new();
    let mut p = pool(&mut buf.0);
    let a = p.allocate(16).unwrap();
    let before = p.stats();

    let mut outside = [0u64; 2];
    let foreign = NonNull::from(&mut outside[..]).cast::<u8>();
    unsafe {
        assert_eq!(p.deallocate(foreign), Err(Error::InvalidPointer));
        // not at a payload boundary
        assert_eq!(p.deallocate(p.ptr_at(HEADER_SIZE + 1).unwrap()), Err(Error::InvalidPointer));
        // the very first byte has no header in front of it
        assert_eq!(p.deallocate(p.ptr_at(0).unwrap()), Err(Error::InvalidPointer));
    }
    assert_eq!(p.stats(), before);
    unsafe { p.deallocate(a).unwrap() };
}

#[test]
fn test_fragmented() {
    let mut buf = super::arena::ArenaBuf::<256>::new();
    let mut p = pool(&mut buf.0);
    let mut ptrs = std::vec::Vec::new();
    while let Ok(ptr) = p.allocate(24) {
        ptrs.push(ptr);
    }
    assert_eq!(p.free_size(), 256 % 32);
    // free every other block: plenty of bytes, no room for 48
    for ptr in ptrs.iter().step_by(2) {
        unsafe { p.deallocate(*ptr).unwrap() };
    }
    assert!(p.free_size() >= 56);
    assert_eq!(p.allocate(48).unwrap_err(), Error::Fragmented);
}

#[test]
fn test_alignment_and_sizes() {
    let mut buf = super::arena::ArenaBuf::<1024>::new();
    let mut p = pool(&mut buf.0);
    for size in 1..40 {
        let ptr = p.allocate(size).unwrap();
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
        unsafe { p.deallocate(ptr).unwrap() };
    }
    assert_eq!(p.allocate(0).unwrap_err(), Error::InvalidSize);
    assert_eq!(p.allocate(usize::MAX).unwrap_err(), Error::InvalidSize);
    assert!(p.is_empty());
}

#[test]
fn test_payload_offset_round_trip() {
    let mut buf = super::arena::ArenaBuf::<256>::new();
    let mut p = pool(&mut buf.0);
    let ptr = p.allocate(32).unwrap();
    let offset = p.offset_of(ptr).unwrap();
    assert_eq!(p.ptr_at(offset), Some(ptr));
    assert_eq!(p.ptr_at(256), None);
    assert!(p.contains(ptr));
}

#[test]
fn test_display() {
    let mut buf = super::arena::ArenaBuf::<128>::new();
    let mut p = pool(&mut buf.0);
    let _a = p.allocate(16).unwrap();
    let out = format!("{}", p.display());
    assert!(out.contains("total: 128, used: 24, free: 104"), "{}", out);
    assert!(out.contains("Full 24"), "{}", out);
    assert!(out.contains("Free List (len: 1): 24"), "{}", out);
}
