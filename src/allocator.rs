use core::alloc::Layout;
use core::cell::RefCell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use log::{debug, trace};

use super::fallback::{DefaultFallback, Fallback};
use super::types::*;
use super::MemoryPool;

/**
`PoolAllocator` hands out storage for `T` values from a shared pool.

The pool is only borrowed for the duration of one `allocate` or
`deallocate`. If the caller is holding a borrow of the `RefCell` at that
point, the call fails with `Error::Busy` and the pool is left untouched.

It does not own the pool: it holds a `&RefCell<P>`, so any number of
allocators (for any element type, see `rebind`) can share one pool inside a
single-threaded control loop. An allocator without a pool forwards to its
`Fallback` strategy instead.

A bound allocator never falls back: when the pool is exhausted the error is
returned to the caller, so pool pressure stays visible.

Memory must be released through the same allocator path that produced it.
Handing a fallback pointer to a bound allocator (or the other way around) is
undefined behaviour.
*/
pub struct PoolAllocator<'a, T, P, F = DefaultFallback> {
    pool: Option<&'a RefCell<P>>,
    fallback: F,
    _type: PhantomData<fn() -> T>,
}

impl<'a, T, P, F: Default> PoolAllocator<'a, T, P, F> {
    /// an allocator drawing from `pool`
    pub fn new(pool: &'a RefCell<P>) -> PoolAllocator<'a, T, P, F> {
        PoolAllocator::with_fallback(Some(pool), F::default())
    }

    /// an allocator that only uses the fallback strategy
    pub fn unbound() -> PoolAllocator<'a, T, P, F> {
        PoolAllocator::with_fallback(None, F::default())
    }
}

impl<'a, T, P, F> PoolAllocator<'a, T, P, F> {
    pub fn with_fallback(pool: Option<&'a RefCell<P>>, fallback: F) -> PoolAllocator<'a, T, P, F> {
        PoolAllocator {
            pool,
            fallback,
            _type: PhantomData,
        }
    }

    /// the same allocator, for another element type
    pub fn rebind<U>(&self) -> PoolAllocator<'a, U, P, F>
    where
        F: Clone,
    {
        PoolAllocator::with_fallback(self.pool, self.fallback.clone())
    }

    pub fn pool(&self) -> Option<&'a RefCell<P>> {
        self.pool
    }

    pub fn is_bound(&self) -> bool {
        self.pool.is_some()
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    /// Place `value` at `ptr` without reading what was there.
    ///
    /// # Safety
    /// `ptr` must be valid for writes and aligned for `T`, e.g. come from
    /// `allocate`.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        ptr.as_ptr().write(value)
    }

    /// Run the destructor of the value at `ptr`. The storage stays allocated.
    ///
    /// # Safety
    /// `ptr` must point to a live `T`, which must not be used afterwards.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr())
    }
}

impl<'a, T, P: MemoryPool, F: Fallback> PoolAllocator<'a, T, P, F> {
    /// Allocate uninitialized storage for `n` values of `T`.
    ///
    /// Zero-sized requests return a dangling, aligned pointer and touch
    /// neither the pool nor the fallback. A bound pool only guarantees
    /// `ALIGN`; types with a stricter alignment fail with
    /// `Error::InvalidAlignment`.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>> {
        let layout = Layout::array::<T>(n).map_err(|_| Error::InvalidSize)?;
        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }
        match self.pool {
            Some(pool) => {
                if layout.align() > ALIGN {
                    return Err(Error::InvalidAlignment);
                }
                let mut pool = pool.try_borrow_mut().map_err(|_| Error::Busy)?;
                let ptr = pool.allocate(layout.size()).map_err(|e| {
                    debug!("pool allocation of {} bytes failed: {}", layout.size(), e);
                    e
                })?;
                Ok(ptr.cast())
            }
            None => {
                trace!("fallback allocation of {} bytes", layout.size());
                self.fallback.allocate(layout).map(NonNull::cast)
            }
        }
    }

    /// Release storage for `n` values of `T`. The values must already be
    /// destroyed.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(n)` on an allocator equal to this one
    /// (same pool, or both unbound with the same fallback) and must not be
    /// used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) -> Result<()> {
        let layout = Layout::array::<T>(n).map_err(|_| Error::InvalidSize)?;
        if layout.size() == 0 {
            return Ok(());
        }
        match self.pool {
            Some(pool) => pool
                .try_borrow_mut()
                .map_err(|_| Error::Busy)?
                .deallocate(ptr.cast()),
            None => {
                self.fallback.deallocate(ptr.cast(), layout);
                Ok(())
            }
        }
    }
}

impl<'a, T, P, F: Default> Default for PoolAllocator<'a, T, P, F> {
    fn default() -> PoolAllocator<'a, T, P, F> {
        PoolAllocator::unbound()
    }
}

impl<'a, T, P, F: Clone> Clone for PoolAllocator<'a, T, P, F> {
    fn clone(&self) -> PoolAllocator<'a, T, P, F> {
        PoolAllocator::with_fallback(self.pool, self.fallback.clone())
    }
}

impl<'a, T, P, F: Copy> Copy for PoolAllocator<'a, T, P, F> {}

/// Allocators are equal when they draw from the same pool instance, or are
/// both unbound; the element type does not matter.
impl<'a, 'b, T, U, P, F, G> PartialEq<PoolAllocator<'b, U, P, G>> for PoolAllocator<'a, T, P, F> {
    fn eq(&self, other: &PoolAllocator<'b, U, P, G>) -> bool {
        match (self.pool, other.pool) {
            (Some(a), Some(b)) => ptr::eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<'a, T, P, F> Eq for PoolAllocator<'a, T, P, F> {}

impl<'a, T, P, F> fmt::Debug for PoolAllocator<'a, T, P, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool {
            Some(pool) => write!(f, "PoolAllocator{{pool: {:p}}}", pool),
            None => write!(f, "PoolAllocator{{pool: UNBOUND}}"),
        }
    }
}

// ##################################################
// # Tests

#[cfg(test)]
use core::cell::Cell;
#[cfg(test)]
use super::arena::ArenaBuf;
#[cfg(test)]
use super::fallback::NoFallback;
#[cfg(test)]
use super::fixed::{fixed_arena_size, FixedBlockPool};
#[cfg(test)]
use super::variable::VariableBlockPool;

/// counts the calls reaching the global allocator
#[cfg(all(test, feature = "alloc"))]
#[derive(Clone)]
struct Counting<'c> {
    calls: &'c Cell<usize>,
}

#[cfg(all(test, feature = "alloc"))]
impl<'c> Fallback for Counting<'c> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.calls.set(self.calls.get() + 1);
        super::fallback::Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        super::fallback::Global.deallocate(ptr, layout)
    }
}

#[cfg(test)]
struct Tracked<'c> {
    value: u32,
    drops: &'c Cell<usize>,
}

#[cfg(test)]
impl<'c> Drop for Tracked<'c> {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn test_construct_destroy() {
    let drops = Cell::new(0);
    let mut buf = ArenaBuf::<512>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let alloc: PoolAllocator<'_, Tracked<'_>, _, NoFallback> = PoolAllocator::new(&pool);

    let ptr = alloc.allocate(3).unwrap();
    assert!(pool.borrow().contains(ptr.cast()));
    unsafe {
        for i in 0..3 {
            alloc.construct(NonNull::new_unchecked(ptr.as_ptr().add(i)), Tracked { value: i as u32 * 10, drops: &drops });
        }
        assert_eq!((*ptr.as_ptr().add(2)).value, 20);
        for i in 0..3 {
            alloc.destroy(NonNull::new_unchecked(ptr.as_ptr().add(i)));
        }
        assert_eq!(drops.get(), 3);
        alloc.deallocate(ptr, 3).unwrap();
    }
    assert!(pool.borrow().is_empty());
}

#[cfg(feature = "alloc")]
#[test]
fn test_exhaustion_is_not_masked() {
    let calls = Cell::new(0);
    let mut buf = ArenaBuf::<64>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let alloc = PoolAllocator::<u64, _, _>::with_fallback(Some(&pool), Counting { calls: &calls });

    assert_eq!(alloc.allocate(16).unwrap_err(), Error::OutOfMemory);
    assert_eq!(calls.get(), 0);
    let ptr = alloc.allocate(4).unwrap();
    unsafe { alloc.deallocate(ptr, 4).unwrap() };
}

#[cfg(feature = "alloc")]
#[test]
fn test_unbound_uses_fallback() {
    let calls = Cell::new(0);
    let alloc = PoolAllocator::<u32, VariableBlockPool, _>::with_fallback(None, Counting { calls: &calls });
    let ptr = alloc.allocate(8).unwrap();
    assert_eq!(calls.get(), 1);
    unsafe {
        for i in 0..8 {
            alloc.construct(NonNull::new_unchecked(ptr.as_ptr().add(i)), i as u32);
        }
        assert_eq!(*ptr.as_ptr().add(7), 7);
        alloc.deallocate(ptr, 8).unwrap();
    }
}

#[test]
fn test_unbound_without_heap() {
    let alloc: PoolAllocator<'_, u32, VariableBlockPool, NoFallback> = PoolAllocator::unbound();
    assert!(!alloc.is_bound());
    assert_eq!(alloc.allocate(1).unwrap_err(), Error::OutOfMemory);
}

#[test]
fn test_equality() {
    let mut buf_a = ArenaBuf::<128>::new();
    let mut buf_b = ArenaBuf::<128>::new();
    let a = RefCell::new(VariableBlockPool::from_arena(buf_a.arena()).unwrap());
    let b = RefCell::new(VariableBlockPool::from_arena(buf_b.arena()).unwrap());

    let a1: PoolAllocator<'_, u8, _, NoFallback> = PoolAllocator::new(&a);
    let a2: PoolAllocator<'_, u64, _, NoFallback> = a1.rebind();
    let b1: PoolAllocator<'_, u8, _, NoFallback> = PoolAllocator::new(&b);
    let none1: PoolAllocator<'_, u8, VariableBlockPool, NoFallback> = PoolAllocator::unbound();
    let none2: PoolAllocator<'_, u16, VariableBlockPool, NoFallback> = PoolAllocator::default();

    assert!(a1 == a2);
    assert!(a1 == a1.clone());
    assert!(a1 != b1);
    assert!(none1 == none2);
    assert!(a1 != none1);
    assert!(core::ptr::eq(a2.pool().unwrap(), &a));
}

#[test]
fn test_zero_sized() {
    let mut buf = ArenaBuf::<64>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let alloc: PoolAllocator<'_, u32, _, NoFallback> = PoolAllocator::new(&pool);
    let ptr = alloc.allocate(0).unwrap();
    assert_eq!(ptr, NonNull::dangling());
    unsafe { alloc.deallocate(ptr, 0).unwrap() };

    let unit: PoolAllocator<'_, (), _, NoFallback> = alloc.rebind();
    assert!(unit.allocate(100).is_ok());
    assert_eq!(pool.borrow().alloc_count(), 0);
}

#[test]
fn test_over_aligned() {
    #[repr(align(16))]
    struct Wide([u8; 16]);

    let mut buf = ArenaBuf::<256>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let alloc: PoolAllocator<'_, Wide, _, NoFallback> = PoolAllocator::new(&pool);
    assert_eq!(alloc.allocate(1).unwrap_err(), Error::InvalidAlignment);
    assert_eq!(alloc.allocate(usize::MAX).unwrap_err(), Error::InvalidSize);
}

#[test]
fn test_fixed_pool_backend() {
    let mut buf = ArenaBuf::<{ fixed_arena_size(16, 2) }>::new();
    let pool = RefCell::new(FixedBlockPool::<16, 2>::new(buf.arena()).unwrap());
    let alloc: PoolAllocator<'_, [u32; 4], _, NoFallback> = PoolAllocator::new(&pool);

    let a = alloc.allocate(1).unwrap();
    let b = alloc.allocate(1).unwrap();
    assert_eq!(alloc.allocate(1).unwrap_err(), Error::OutOfMemory);
    unsafe { alloc.deallocate(b, 1).unwrap() };
    // two arrays do not fit one block
    assert_eq!(alloc.allocate(2).unwrap_err(), Error::InvalidSize);
    unsafe {
        alloc.construct(a, [1, 2, 3, 4]);
        assert_eq!(*a.as_ptr(), [1, 2, 3, 4]);
        alloc.deallocate(a, 1).unwrap();
    }
    assert_eq!(pool.borrow().free_count(), 2);
}

#[test]
fn test_pool_borrowed_elsewhere() {
    let mut buf = ArenaBuf::<256>::new();
    let pool = RefCell::new(VariableBlockPool::from_arena(buf.arena()).unwrap());
    let alloc: PoolAllocator<'_, u64, _, NoFallback> = PoolAllocator::new(&pool);
    let ptr = alloc.allocate(2).unwrap();
    {
        let view = pool.borrow();
        assert_eq!(alloc.allocate(1).unwrap_err(), Error::Busy);
        assert_eq!(unsafe { alloc.deallocate(ptr, 2) }, Err(Error::Busy));
        assert_eq!(view.live_count(), 1);
    }
    unsafe { alloc.deallocate(ptr, 2).unwrap() };
    assert!(pool.borrow().is_empty());
}
