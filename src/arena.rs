/*
The Arena is the one contiguous buffer a pool carves its blocks from. It is
the only place where block offsets are turned into addresses and back, so
every pointer a pool hands out is derived from the same base pointer.
*/

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

#[cfg(feature = "alloc")]
use core::alloc::Layout;

use super::types::*;

/// An `ALIGN`-aligned byte buffer, for placing an arena in a `static`
/// or on the stack without losing bytes to alignment.
#[repr(C, align(8))]
pub struct ArenaBuf<const N: usize>(pub [u8; N]);

impl<const N: usize> ArenaBuf<N> {
    pub const fn new() -> ArenaBuf<N> {
        ArenaBuf([0; N])
    }

    /// borrow the whole buffer as an arena
    pub fn arena(&mut self) -> Arena<'_> {
        Arena::new(&mut self.0)
    }
}

impl<const N: usize> Default for ArenaBuf<N> {
    fn default() -> ArenaBuf<N> {
        ArenaBuf::new()
    }
}

/// Backing storage of a pool: either borrowed from the caller for `'a`
/// or allocated once by [`Arena::with_capacity`].
pub struct Arena<'a> {
    base: NonNull<u8>,
    len: usize,
    #[cfg(feature = "alloc")]
    owned: Option<Layout>,
    _borrow: PhantomData<&'a mut [u8]>,
}

impl<'a> Arena<'a> {
    /// Borrow `memory` as an arena.
    ///
    /// The arena starts at the first `ALIGN`-aligned byte of `memory`, so up
    /// to `ALIGN - 1` leading bytes may go unused.
    pub fn new(memory: &'a mut [u8]) -> Arena<'a> {
        let pad = memory.as_ptr().align_offset(ALIGN).min(memory.len());
        let usable = &mut memory[pad..];
        Arena {
            len: usable.len(),
            base: NonNull::from(usable).cast::<u8>(),
            #[cfg(feature = "alloc")]
            owned: None,
            _borrow: PhantomData,
        }
    }

    /// length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// address of the first byte
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// byte offset of `ptr` from the start of the arena, if it points inside
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        match addr.checked_sub(base) {
            Some(offset) if offset < self.len => Some(offset),
            _ => None,
        }
    }

    /// address of the byte at `offset`
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "offset {} past arena end {}", offset, self.len);
        // SAFETY: offset is within (or one past) the arena allocation
        unsafe { self.base.add(offset) }
    }

    /// Read a `T` stored at `offset`.
    ///
    /// # Safety
    /// The bytes at `offset` must hold a valid, aligned `T` written by `write`.
    pub(crate) unsafe fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + mem::size_of::<T>() <= self.len);
        let src = self.ptr_at(offset).cast::<T>().as_ptr();
        debug_assert!(src.is_aligned());
        ptr::read(src)
    }

    /// Write a `T` at `offset`.
    ///
    /// # Safety
    /// `offset` must be aligned for `T` and no caller may be using those bytes.
    pub(crate) unsafe fn write<T: Copy>(&self, offset: usize, value: T) {
        assert!(offset + mem::size_of::<T>() <= self.len);
        let dst = self.ptr_at(offset).cast::<T>().as_ptr();
        debug_assert!(dst.is_aligned());
        ptr::write(dst, value)
    }
}

#[cfg(feature = "alloc")]
impl Arena<'static> {
    /// Allocate a zeroed arena of `size` bytes from the global allocator.
    /// It is released when the arena is dropped.
    pub fn with_capacity(size: usize) -> Result<Arena<'static>> {
        if size == 0 || size > MAX_ARENA_SIZE {
            return Err(Error::InvalidSize);
        }
        let layout = Layout::from_size_align(size, ALIGN).map_err(|_| Error::InvalidSize)?;
        // SAFETY: layout has a non-zero size
        let base = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
            .ok_or(Error::OutOfMemory)?;
        log::debug!("allocated owned arena of {} bytes at {:p}", size, base);
        Ok(Arena {
            base,
            len: size,
            owned: Some(layout),
            _borrow: PhantomData,
        })
    }
}

#[cfg(feature = "alloc")]
impl<'a> Drop for Arena<'a> {
    fn drop(&mut self) {
        if let Some(layout) = self.owned.take() {
            // SAFETY: base was allocated with exactly this layout in `with_capacity`
            unsafe { alloc::alloc::dealloc(self.base.as_ptr(), layout) }
        }
    }
}

impl<'a> fmt::Debug for Arena<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena{{base: {:p}, len: {}}}", self.base, self.len)
    }
}

#[test]
fn test_arena_buf_alignment() {
    assert_eq!(mem::align_of::<ArenaBuf<3>>(), ALIGN);
    let mut buf = ArenaBuf::<64>::new();
    let arena = buf.arena();
    assert_eq!(arena.len(), 64);
    assert_eq!(arena.as_ptr() as usize % ALIGN, 0);
}

#[test]
fn test_unaligned_slice() {
    let mut buf = ArenaBuf::<64>::new();
    // start one byte into an aligned buffer
    let arena = Arena::new(&mut buf.0[1..]);
    assert_eq!(arena.as_ptr() as usize % ALIGN, 0);
    assert_eq!(arena.len(), 64 - ALIGN);
}

#[test]
fn test_offset_round_trip() {
    let mut buf = ArenaBuf::<128>::new();
    let arena = buf.arena();
    for offset in 0..arena.len() {
        let ptr = arena.ptr_at(offset);
        assert_eq!(arena.offset_of(ptr), Some(offset));
    }
    // one past the end is not inside
    assert_eq!(arena.offset_of(arena.ptr_at(arena.len())), None);
    let mut other = [0u8; 4];
    assert!(!arena.contains(NonNull::from(&mut other[..]).cast()));
}

#[cfg(feature = "alloc")]
#[test]
fn test_owned_arena() {
    let arena = Arena::with_capacity(256).unwrap();
    assert_eq!(arena.len(), 256);
    assert_eq!(arena.as_ptr() as usize % ALIGN, 0);
    unsafe {
        arena.write::<u32>(8, 0xdead_beef);
        assert_eq!(arena.read::<u32>(8), 0xdead_beef);
    }
    assert_eq!(Arena::with_capacity(0).unwrap_err(), Error::InvalidSize);
}
