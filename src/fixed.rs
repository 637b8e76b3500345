//! contains the FixedBlockPool, O(1) allocation of congruent blocks

use core::array;
use core::fmt;
use core::ptr::NonNull;

use log::{debug, trace, warn};

use super::arena::Arena;
use super::types::*;
use super::utils::ceil;
use super::MemoryPool;

/// bytes an arena needs to hold `block_number` blocks of `block_size` bytes
pub const fn fixed_arena_size(block_size: usize, block_number: usize) -> usize {
    stride(block_size) * block_number
}

/// link of a block that is handed out, distinct from the list end
const BLOCK_FULL: BlockLoc = BLOCK_NULL - 1;

/// distance between two block starts: the payload rounded up to `ALIGN`
const fn stride(block_size: usize) -> usize {
    let payload = if block_size == 0 { 1 } else { block_size };
    ceil(payload, ALIGN) * ALIGN
}

/**
`FixedBlockPool` splits its arena into `BLOCK_NUMBER` blocks of `BLOCK_SIZE`
bytes (rounded up to `ALIGN`).

The free list is an array of block indexes kept outside the arena: `next[i]`
is the block that follows block `i` on the list, or `BLOCK_FULL` while block
`i` is handed out. Allocation pops the head and
deallocation pushes onto it, so both are constant time, and the last block
freed is the first one handed out again.
*/
pub struct FixedBlockPool<'a, const BLOCK_SIZE: usize, const BLOCK_NUMBER: usize> {
    arena: Arena<'a>,
    next: [BlockLoc; BLOCK_NUMBER],
    head: BlockLoc,
    free_count: usize,
}

impl<'a, const BLOCK_SIZE: usize, const BLOCK_NUMBER: usize> FixedBlockPool<'a, BLOCK_SIZE, BLOCK_NUMBER> {
    /// distance between two block starts
    pub const STRIDE: usize = stride(BLOCK_SIZE);

    /// bytes of arena the pool needs, see `fixed_arena_size`
    pub const ARENA_SIZE: usize = fixed_arena_size(BLOCK_SIZE, BLOCK_NUMBER);

    /// Lay the blocks out over `arena` and link them in address order.
    ///
    /// Fails with `Error::InvalidSize` if the arena is smaller than
    /// `ARENA_SIZE`, or if there are more blocks than a `BlockLoc` can index.
    pub fn new(arena: Arena<'a>) -> Result<FixedBlockPool<'a, BLOCK_SIZE, BLOCK_NUMBER>> {
        if arena.len() < Self::ARENA_SIZE || BLOCK_NUMBER >= BLOCK_FULL as usize {
            return Err(Error::InvalidSize);
        }
        let mut pool = FixedBlockPool {
            arena,
            next: [BLOCK_NULL; BLOCK_NUMBER],
            head: BLOCK_NULL,
            free_count: 0,
        };
        pool.reset();
        Ok(pool)
    }

    /// Pop a block off the free list. Fails with `Error::OutOfMemory` when
    /// all `BLOCK_NUMBER` blocks are handed out.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        if self.head == BLOCK_NULL {
            trace!("allocate: all {} blocks in use", BLOCK_NUMBER);
            return Err(Error::OutOfMemory);
        }
        let index = self.head as usize;
        self.head = self.next[index];
        self.next[index] = BLOCK_FULL;
        self.free_count -= 1;
        trace!("allocate: block {}", index);
        Ok(self.block_ptr(index))
    }

    /// Push a block back on the free list.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this pool and not been
    /// deallocated since. Nothing checks this: a foreign or repeated pointer
    /// silently corrupts the free list.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.arena.as_ptr() as usize);
        debug_assert!(offset % Self::STRIDE == 0, "{:p} is not a block start", ptr);
        debug_assert!(self.free_count < BLOCK_NUMBER, "more frees than blocks");
        let index = offset / Self::STRIDE;
        debug_assert!(self.next[index] == BLOCK_FULL, "block {} is already free", index);
        self.next[index] = self.head;
        self.head = index as BlockLoc;
        self.free_count += 1;
        trace!("deallocate: block {}", index);
    }

    /// Relink every block in address order, discarding all allocations.
    pub fn reset(&mut self) {
        self.next = array::from_fn(|i| {
            if i + 1 < BLOCK_NUMBER {
                (i + 1) as BlockLoc
            } else {
                BLOCK_NULL
            }
        });
        self.head = if BLOCK_NUMBER == 0 { BLOCK_NULL } else { 0 };
        self.free_count = BLOCK_NUMBER;
        debug!("reset: {} blocks of {} bytes", BLOCK_NUMBER, Self::STRIDE);
    }

    /// address of block `index`
    pub fn block_ptr(&self, index: usize) -> NonNull<u8> {
        assert!(index < BLOCK_NUMBER, "block {} out of {}", index, BLOCK_NUMBER);
        self.arena.ptr_at(index * Self::STRIDE)
    }

    /// index of the block starting at `ptr`, if it is one of ours
    pub fn block_index(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = self.arena.offset_of(ptr)?;
        let index = offset / Self::STRIDE;
        if offset % Self::STRIDE == 0 && index < BLOCK_NUMBER {
            Some(index)
        } else {
            None
        }
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.block_index(ptr).is_some()
    }

    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    pub fn block_number(&self) -> usize {
        BLOCK_NUMBER
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn used_count(&self) -> usize {
        BLOCK_NUMBER - self.free_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_count == 0
    }
}

#[cfg(feature = "alloc")]
impl<const BLOCK_SIZE: usize, const BLOCK_NUMBER: usize> FixedBlockPool<'static, BLOCK_SIZE, BLOCK_NUMBER> {
    /// get a pool over a freshly allocated arena of `ARENA_SIZE` bytes
    pub fn with_capacity() -> Result<FixedBlockPool<'static, BLOCK_SIZE, BLOCK_NUMBER>> {
        FixedBlockPool::new(Arena::with_capacity(Self::ARENA_SIZE)?)
    }
}

impl<'a, const BLOCK_SIZE: usize, const BLOCK_NUMBER: usize> MemoryPool
    for FixedBlockPool<'a, BLOCK_SIZE, BLOCK_NUMBER>
{
    /// Any request of at most `BLOCK_SIZE` bytes takes one whole block.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 || size > BLOCK_SIZE {
            return Err(Error::InvalidSize);
        }
        FixedBlockPool::allocate(self)
    }

    /// Unlike the inherent `deallocate`, pointers that are not a block
    /// start of this pool are rejected with `Error::InvalidPointer`, and
    /// blocks that are not handed out with `Error::DoubleFree`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let index = match self.block_index(ptr) {
            Some(i) => i,
            None => {
                warn!("deallocate: {:p} is not a block of this pool", ptr);
                return Err(Error::InvalidPointer);
            }
        };
        if self.next[index] != BLOCK_FULL {
            warn!("deallocate: block {} is already free", index);
            return Err(Error::DoubleFree);
        }
        FixedBlockPool::deallocate(self, ptr);
        Ok(())
    }

    fn reset(&mut self) {
        FixedBlockPool::reset(self)
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        FixedBlockPool::contains(self, ptr)
    }

    fn total_size(&self) -> usize {
        Self::ARENA_SIZE
    }

    fn used_size(&self) -> usize {
        self.used_count() * Self::STRIDE
    }
}

impl<'a, const BLOCK_SIZE: usize, const BLOCK_NUMBER: usize> fmt::Debug
    for FixedBlockPool<'a, BLOCK_SIZE, BLOCK_NUMBER>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBlockPool<{}, {}>{{free: {}, head: ", BLOCK_SIZE, BLOCK_NUMBER, self.free_count)?;
        if self.head == BLOCK_NULL {
            write!(f, "-1}}")
        } else {
            write!(f, "{}}}", self.head)
        }
    }
}

#[cfg(test)]
use super::arena::ArenaBuf;

#[cfg(test)]
type Pool16x4<'a> = FixedBlockPool<'a, 16, 4>;

#[test]
fn test_geometry() {
    assert_eq!(stride(0), ALIGN);
    assert_eq!(stride(1), ALIGN);
    assert_eq!(stride(16), 16);
    assert_eq!(stride(17), 24);
    assert_eq!(fixed_arena_size(16, 4), 64);
    assert_eq!(Pool16x4::ARENA_SIZE, 64);
}

#[test]
fn test_exhaust_and_reuse() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(16, 4) }>::new();
    let mut pool = Pool16x4::new(buf.arena()).unwrap();

    let ptrs: std::vec::Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    for (i, a) in ptrs.iter().enumerate() {
        assert_eq!(a.as_ptr() as usize % ALIGN, 0);
        for b in &ptrs[i + 1..] {
            assert_ne!(a, b);
            // no two blocks overlap
            let (a, b) = (a.as_ptr() as usize, b.as_ptr() as usize);
            assert!(a.abs_diff(b) >= 16);
        }
    }
    assert!(pool.is_exhausted());
    assert_eq!(pool.allocate().unwrap_err(), Error::OutOfMemory);

    unsafe { pool.deallocate(ptrs[2]) };
    assert_eq!(pool.free_count(), 1);
    assert_eq!(pool.used_count(), 3);
    // last in, first out
    assert_eq!(pool.allocate().unwrap(), ptrs[2]);
    assert_eq!(pool.allocate().unwrap_err(), Error::OutOfMemory);
}

#[test]
fn test_lifo_order() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(8, 3) }>::new();
    let mut pool = FixedBlockPool::<8, 3>::new(buf.arena()).unwrap();
    let a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    // fresh blocks come out in address order
    assert_eq!(pool.block_index(a), Some(0));
    assert_eq!(pool.block_index(b), Some(1));
    unsafe {
        pool.deallocate(a);
        pool.deallocate(b);
    }
    assert_eq!(pool.allocate().unwrap(), b);
    assert_eq!(pool.allocate().unwrap(), a);
    let c = pool.allocate().unwrap();
    assert_eq!(pool.block_index(c), Some(2));
}

#[test]
fn test_index_round_trip() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(24, 5) }>::new();
    let pool = FixedBlockPool::<24, 5>::new(buf.arena()).unwrap();
    for i in 0..5 {
        let ptr = pool.block_ptr(i);
        assert_eq!(pool.block_index(ptr), Some(i));
    }
    // inside a block but not at its start
    let inner = pool.arena.ptr_at(1);
    assert_eq!(pool.block_index(inner), None);
}

#[test]
fn test_reset_and_small_arena() {
    let mut small = ArenaBuf::<{ fixed_arena_size(16, 4) - 1 }>::new();
    assert_eq!(Pool16x4::new(small.arena()).unwrap_err(), Error::InvalidSize);

    let mut buf = ArenaBuf::<{ fixed_arena_size(16, 4) }>::new();
    let mut pool = Pool16x4::new(buf.arena()).unwrap();
    while pool.allocate().is_ok() {}
    pool.reset();
    assert_eq!(pool.free_count(), 4);
    let first = pool.allocate().unwrap();
    assert_eq!(pool.block_index(first), Some(0));
    assert_eq!(format!("{:?}", pool), "FixedBlockPool<16, 4>{free: 3, head: 1}");
}

#[test]
fn test_memory_pool_trait() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(16, 2) }>::new();
    let mut pool = FixedBlockPool::<16, 2>::new(buf.arena()).unwrap();
    assert_eq!(MemoryPool::allocate(&mut pool, 17).unwrap_err(), Error::InvalidSize);
    let a = MemoryPool::allocate(&mut pool, 16).unwrap();
    assert_eq!(MemoryPool::used_size(&pool), 16);
    assert_eq!(MemoryPool::free_size(&pool), 16);

    let mut outside = [0u64; 2];
    let foreign = NonNull::from(&mut outside[..]).cast::<u8>();
    unsafe {
        assert_eq!(MemoryPool::deallocate(&mut pool, foreign), Err(Error::InvalidPointer));
        assert_eq!(MemoryPool::deallocate(&mut pool, a), Ok(()));
    }
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn test_memory_pool_double_free() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(16, 4) }>::new();
    let mut pool = Pool16x4::new(buf.arena()).unwrap();
    let a = MemoryPool::allocate(&mut pool, 8).unwrap();
    let b = MemoryPool::allocate(&mut pool, 8).unwrap();
    let last = pool.block_ptr(3);
    unsafe {
        assert_eq!(MemoryPool::deallocate(&mut pool, a), Ok(()));
        assert_eq!(MemoryPool::deallocate(&mut pool, a), Err(Error::DoubleFree));
        // never handed out at all
        assert_eq!(MemoryPool::deallocate(&mut pool, last), Err(Error::DoubleFree));
    }
    assert_eq!(pool.free_count(), 3);

    // the rejected free did not put `a` on the list twice
    let x = pool.allocate().unwrap();
    let y = pool.allocate().unwrap();
    let z = pool.allocate().unwrap();
    assert_eq!(x, a);
    assert_ne!(x, y);
    assert_ne!(y, z);
    assert_ne!(x, z);
    assert!(![x, y, z].contains(&b));
    assert!(pool.is_exhausted());
}

#[cfg(feature = "alloc")]
#[test]
fn test_with_capacity() {
    let mut pool = FixedBlockPool::<32, 8>::with_capacity().unwrap();
    let ptr = pool.allocate().unwrap();
    unsafe {
        ptr.as_ptr().write_bytes(0xab, 32);
        pool.deallocate(ptr);
    }
    assert_eq!(pool.free_count(), 8);
}
