use super::arena::Arena;
use super::block::BlockHeader;
use super::types::*;

// ##################################################
// # Free List

/// The FreeList is a singly linked list of free blocks, threaded through
/// the `next` field of their in-band headers. Every method taking an
/// `Arena` relies on the list only ever holding block starts of that arena.
#[derive(Debug)]
pub struct FreeList {
    head: BlockLoc,
    len: usize,
}

impl Default for FreeList {
    fn default() -> FreeList {
        FreeList::new()
    }
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: BLOCK_NULL, len: 0 }
    }

    /// offset of the first free block
    pub fn root(&self) -> Option<usize> {
        if self.head == BLOCK_NULL {
            None
        } else {
            Some(self.head as usize)
        }
    }

    /// number of free blocks on the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// forget every entry, without touching the arena
    pub fn clear(&mut self) {
        self.head = BLOCK_NULL;
        self.len = 0;
    }

    pub fn iter<'a>(&self, arena: &'a Arena) -> FreeIter<'a> {
        FreeIter {
            arena,
            cursor: self.root(),
            remaining: self.len,
        }
    }

    /// Write a free header at `offset` and push it on the head of the list.
    ///
    /// # Safety
    /// `offset..offset + size` must be a block of `arena` that nobody is using.
    pub unsafe fn push(&mut self, arena: &Arena, offset: usize, size: usize) {
        BlockHeader::free(size, self.root()).store(arena, offset);
        self.head = offset as BlockLoc;
        self.len += 1;
    }

    /// Point `prev` (or the head when `prev` is `None`) at `to`.
    ///
    /// # Safety
    /// `prev` must be on the list and `to` must be a free block or `None`.
    pub unsafe fn relink(&mut self, arena: &Arena, prev: Option<usize>, to: Option<usize>) {
        match prev {
            Some(p) => {
                let mut header = BlockHeader::load(arena, p);
                header.set_next(to);
                header.store(arena, p);
            }
            None => self.head = to.map_or(BLOCK_NULL, |t| t as BlockLoc),
        }
    }

    /// Take a block off the list when its list predecessor is known.
    ///
    /// # Safety
    /// `prev` must directly precede the removed block, whose successor is `next`.
    pub unsafe fn unlink(&mut self, arena: &Arena, prev: Option<usize>, next: Option<usize>) {
        self.relink(arena, prev, next);
        self.len -= 1;
    }

    /// Search the list for `target` and take it off.
    /// Returns false if `target` is not on the list.
    ///
    /// # Safety
    /// see `FreeList`
    pub unsafe fn remove(&mut self, arena: &Arena, target: usize) -> bool {
        let mut prev = None;
        let mut cursor = self.root();
        while let Some(block) = cursor {
            let header = BlockHeader::load(arena, block);
            if block == target {
                self.unlink(arena, prev, header.next());
                return true;
            }
            prev = Some(block);
            cursor = header.next();
        }
        false
    }

    /// Find the free neighbours of the block `offset..offset + size` and take
    /// them off the list. At most one predecessor and one successor are
    /// absorbed. Returns the offset and size of the merged block, which is
    /// NOT put back on the list.
    ///
    /// # Safety
    /// `offset..offset + size` must be a block of `arena` that is not on the list.
    pub unsafe fn coalesce(&mut self, arena: &Arena, offset: usize, size: usize) -> (usize, usize) {
        let end = offset + size;
        let mut before = None;
        let mut after = None;
        for (block, header) in self.iter(arena) {
            if block + header.size() == offset {
                before = Some((block, header.size()));
            } else if block == end {
                after = Some((block, header.size()));
            }
            if before.is_some() && after.is_some() {
                break;
            }
        }

        let (mut start, mut merged) = (offset, size);
        if let Some((block, blocks)) = before {
            self.remove(arena, block);
            start = block;
            merged += blocks;
        }
        if let Some((block, blocks)) = after {
            self.remove(arena, block);
            merged += blocks;
        }
        (start, merged)
    }
}

/// walks the free list, yielding `(offset, header)`
pub struct FreeIter<'a> {
    arena: &'a Arena<'a>,
    cursor: Option<usize>,
    remaining: usize,
}

impl<'a> Iterator for FreeIter<'a> {
    type Item = (usize, BlockHeader);

    fn next(&mut self) -> Option<(usize, BlockHeader)> {
        // `remaining` bounds the walk even if a stale link closes a cycle
        if self.remaining == 0 {
            return None;
        }
        let block = self.cursor?;
        // SAFETY: the list only holds block starts of this arena
        let header = unsafe { BlockHeader::load(self.arena, block) };
        self.cursor = header.next();
        self.remaining -= 1;
        Some((block, header))
    }
}

#[cfg(test)]
fn collect(list: &FreeList, arena: &Arena) -> std::vec::Vec<usize> {
    list.iter(arena).map(|(b, _)| b).collect()
}

#[test]
fn test_push_remove() {
    let mut buf = super::arena::ArenaBuf::<128>::new();
    let arena = buf.arena();
    let mut list = FreeList::new();
    unsafe {
        list.push(&arena, 0, 32);
        list.push(&arena, 64, 32);
        list.push(&arena, 96, 32);
        assert_eq!(list.len(), 3);
        // LIFO order
        assert_eq!(collect(&list, &arena), vec![96, 64, 0]);

        assert!(list.remove(&arena, 64));
        assert_eq!(collect(&list, &arena), vec![96, 0]);
        assert!(!list.remove(&arena, 64));
        assert!(list.remove(&arena, 96));
        assert_eq!(collect(&list, &arena), vec![0]);
        assert_eq!(list.root(), Some(0));
    }
}

#[test]
fn test_coalesce_both_sides() {
    let mut buf = super::arena::ArenaBuf::<128>::new();
    let arena = buf.arena();
    let mut list = FreeList::new();
    unsafe {
        // [0..32 free][32..64 freed now][64..96 free][96..128 free, not adjacent]
        list.push(&arena, 0, 32);
        list.push(&arena, 64, 32);
        assert_eq!(list.coalesce(&arena, 32, 32), (0, 96));
        assert_eq!(list.len(), 0);

        // nothing adjacent
        list.push(&arena, 0, 16);
        assert_eq!(list.coalesce(&arena, 64, 16), (64, 16));
        assert_eq!(list.len(), 1);
    }
}
