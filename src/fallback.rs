/*!
The allocator a `PoolAllocator` uses when it has no pool bound.

On a microcontroller this is whatever the firmware installs as its global
heap, or nothing at all. It is a type parameter of `PoolAllocator` so tests
and firmware can inject their own.
*/

use core::alloc::Layout;
use core::ptr::NonNull;

use super::types::*;

/// A process-wide allocator strategy.
pub trait Fallback {
    /// Allocate memory for `layout`. `layout` never has a zero size.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Release memory obtained from `allocate`.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this strategy with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Forwards to the global allocator of the program.
#[cfg(feature = "alloc")]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Global;

#[cfg(feature = "alloc")]
impl Fallback for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: callers never pass a zero-sized layout
        NonNull::new(unsafe { alloc::alloc::alloc(layout) }).ok_or(Error::OutOfMemory)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// For targets without a heap: every request fails with `Error::OutOfMemory`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NoFallback;

impl Fallback for NoFallback {
    fn allocate(&self, _layout: Layout) -> Result<NonNull<u8>> {
        Err(Error::OutOfMemory)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // nothing was ever handed out
    }
}

/// the strategy `PoolAllocator` uses unless told otherwise
#[cfg(feature = "alloc")]
pub type DefaultFallback = Global;
#[cfg(not(feature = "alloc"))]
pub type DefaultFallback = NoFallback;

#[test]
fn test_no_fallback() {
    let layout = Layout::new::<u64>();
    assert_eq!(NoFallback.allocate(layout).unwrap_err(), Error::OutOfMemory);
}

#[cfg(feature = "alloc")]
#[test]
fn test_global() {
    let layout = Layout::array::<u32>(4).unwrap();
    let ptr = Global.allocate(layout).unwrap();
    assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
    unsafe {
        ptr.cast::<u32>().as_ptr().write(7);
        Global.deallocate(ptr, layout);
    }
}
