/*!
This test suite drives the pools with long pseudo random sequences of
allocations and deallocations, checking after every step that:
 - the data written to each allocation is still intact
 - no two live allocations overlap
 - the blocks partition the arena and the byte counters add up

It will have:
 - a seeded random number generator, so every run makes the same requests
     (alter the seed to explore other sequences)
 - an "Allocation Array" which tracks and determines which allocations shall be
      made and shadows their contents.
*/

use core::ptr::NonNull;
use core::result;
use core::slice;
use std::string::String;
use std::vec::Vec;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

type Fill = u32;
type TResult<T> = result::Result<T, String>;

const FILL_SIZE: usize = core::mem::size_of::<Fill>();

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Allocation {
    i: usize,
    data: Vec<Fill>,
    ptr: Option<NonNull<Fill>>,
}

impl Allocation {
    fn new(i: usize) -> Allocation {
        Allocation {
            i,
            data: Vec::new(),
            ptr: None,
        }
    }

    fn pdata(&self) -> Option<&[Fill]> {
        // SAFETY: the allocation holds `data.len()` initialized values
        self.ptr.map(|p| unsafe { slice::from_raw_parts(p.as_ptr(), self.data.len()) })
    }

    fn assert_valid(&self) -> TResult<()> {
        let pdata = match self.pdata() {
            Some(p) => p,
            None => return Ok(()),
        };
        for (i, (s, p)) in self.data.iter().zip(pdata.iter()).enumerate() {
            if s != p {
                return Err(format!("alloc {}: values at i={} differ: {} != {}", self.i, i, s, p));
            }
        }
        Ok(())
    }

    /// fill the Allocation up with data, don't check
    fn fill(&mut self, gen: &mut StdRng) {
        let ptr = match self.ptr {
            Some(p) => p,
            None => return,
        };
        for (i, s) in self.data.iter_mut().enumerate() {
            let val = gen.gen::<Fill>();
            *s = val;
            // SAFETY: `i` is within the allocation
            unsafe { ptr.as_ptr().add(i).write(val) };
        }
    }

    /// allocate some new data and fill it
    fn alloc(&mut self, pool: &mut VariableBlockPool, gen: &mut StdRng) -> TResult<()> {
        assert!(self.ptr.is_none());
        let len = gen.gen_range(1..64);
        let ptr = match pool.allocate(len * FILL_SIZE) {
            Ok(p) => p,
            Err(Error::OutOfMemory) | Err(Error::Fragmented) => return Ok(()), // not allocated
            Err(e) => return Err(format!("alloc {}: allocate({}): {}", self.i, len, e)),
        };
        if ptr.as_ptr() as usize % ALIGN != 0 {
            return Err(format!("alloc {}: {:p} is not aligned", self.i, ptr));
        }
        self.ptr = Some(ptr.cast());
        self.data.clear();
        self.data.resize(len, 0);
        self.fill(gen);
        Ok(())
    }

    fn free(&mut self, pool: &mut VariableBlockPool) -> TResult<()> {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: the pointer came from this pool and is dropped here
            unsafe { pool.deallocate(ptr.cast()) }
                .map_err(|e| format!("alloc {}: deallocate: {}", self.i, e))?;
        }
        self.data.clear();
        Ok(())
    }

    /// do something randomly
    fn do_random(&mut self, pool: &mut VariableBlockPool, gen: &mut StdRng) -> TResult<()> {
        self.assert_valid()?;
        match self.ptr {
            // we have data, we need to decide what to do with it
            Some(_) => match gen.gen_range(0..10) {
                0..=2 => self.free(pool)?,
                3..=5 => self.fill(gen),
                _ => {} // do nothing
            },
            // there is no data, should we allocate it?
            None => {
                if gen.gen_range(0..10) < 4 {
                    self.alloc(pool, gen)?;
                }
            }
        }
        self.assert_valid()
    }
}

/// check the block structure of the pool against the live allocations
fn check_pool(pool: &VariableBlockPool, allocs: &[Allocation]) -> TResult<()> {
    let (mut total, mut used, mut full) = (0, 0, 0);
    let mut prev_free = false;
    for block in pool.blocks() {
        if block.offset != total {
            return Err(format!("gap before block {}", block.offset));
        }
        total += block.size;
        match block.ty {
            BlockType::Full => {
                used += block.size;
                full += 1;
                prev_free = false;
            }
            BlockType::Free => {
                if prev_free {
                    return Err(format!("free block {} was not merged\n{}", block.offset, pool.display()));
                }
                prev_free = true;
            }
        }
    }
    if total != pool.total_size() {
        return Err(format!("blocks cover {} of {} bytes", total, pool.total_size()));
    }
    if used != pool.used_size() || used + pool.free_size() != total {
        return Err(format!("used {} but counted {}", pool.used_size(), used));
    }
    let free_listed: usize = pool.free_blocks().map(|b| b.size).sum();
    if free_listed != pool.free_size() {
        return Err(format!("free list holds {} of {} free bytes", free_listed, pool.free_size()));
    }

    let mut live: Vec<(usize, usize)> = allocs
        .iter()
        .filter_map(|a| a.ptr.map(|p| (p.as_ptr() as usize, a.data.len() * FILL_SIZE)))
        .collect();
    if live.len() != full || live.len() != pool.live_count() {
        return Err(format!("{} live allocations, {} full blocks", live.len(), full));
    }
    live.sort();
    for pair in live.windows(2) {
        if pair[0].0 + pair[0].1 > pair[1].0 {
            return Err(format!("allocations at {:#x} and {:#x} overlap", pair[0].0, pair[1].0));
        }
    }
    Ok(())
}

#[test]
fn test_variable_random() {
    init_logger();
    let mut buf = ArenaBuf::<{ 16 * 1024 }>::new();
    let mut pool = VariableBlockPool::from_arena(buf.arena()).unwrap();
    let mut allocs: Vec<_> = (0..200).map(Allocation::new).collect();
    let mut gen = StdRng::seed_from_u64(0x5eed_1234);

    for round in 0..500 {
        for alloc in allocs.iter_mut() {
            alloc.do_random(&mut pool, &mut gen).unwrap();
        }
        if let Err(e) = check_pool(&pool, &allocs) {
            panic!("round {}: {}\n{}", round, e, pool.display());
        }
    }
    assert!(pool.alloc_count() > 0);

    for alloc in allocs.iter_mut() {
        alloc.free(&mut pool).unwrap();
    }
    // everything merges back into one block
    assert!(pool.is_empty());
    let stats = pool.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free_block, pool.total_size());
}

#[test]
fn test_fixed_random() {
    init_logger();
    const SIZE: usize = 24;
    let mut buf = ArenaBuf::<{ fixed_arena_size(SIZE, 32) }>::new();
    let mut pool = FixedBlockPool::<SIZE, 32>::new(buf.arena()).unwrap();
    let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();
    let mut gen = StdRng::seed_from_u64(42);

    for _ in 0..10_000 {
        if gen.gen_bool(0.55) {
            match pool.allocate() {
                Ok(ptr) => {
                    let mark = gen.gen::<u8>();
                    unsafe { ptr.as_ptr().write_bytes(mark, SIZE) };
                    live.push((ptr, mark));
                }
                Err(e) => {
                    assert_eq!(e, Error::OutOfMemory);
                    assert_eq!(live.len(), 32);
                }
            }
        } else if !live.is_empty() {
            let (ptr, mark) = live.swap_remove(gen.gen_range(0..live.len()));
            let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), SIZE) };
            assert!(bytes.iter().all(|b| *b == mark), "block {:?} was overwritten", pool.block_index(ptr));
            unsafe { pool.deallocate(ptr) };
        }
        assert_eq!(pool.used_count(), live.len());
    }
}

/// allocate and free through the trait only, the way generic callers do
fn exercise<P: MemoryPool>(pool: &mut P, size: usize) -> usize {
    let mut ptrs = Vec::new();
    while let Ok(ptr) = pool.allocate(size) {
        assert!(pool.contains(ptr));
        ptrs.push(ptr);
    }
    assert!(pool.used_size() > 0);
    let count = ptrs.len();
    for ptr in ptrs.into_iter().rev() {
        unsafe { pool.deallocate(ptr).unwrap() };
    }
    assert_eq!(pool.used_size(), 0);
    assert_eq!(pool.free_size(), pool.total_size());
    count
}

#[test]
fn test_memory_pool_generic() {
    let mut vbuf = ArenaBuf::<256>::new();
    let mut fbuf = ArenaBuf::<{ fixed_arena_size(16, 8) }>::new();
    let mut variable = VariableBlockPool::from_arena(vbuf.arena()).unwrap();
    let mut fixed = FixedBlockPool::<16, 8>::new(fbuf.arena()).unwrap();

    // 16 byte payload + 8 byte header
    assert_eq!(exercise(&mut variable, 16), 256 / 24);
    assert_eq!(exercise(&mut fixed, 16), 8);
    assert_eq!(exercise(&mut fixed, 1), 8);
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..300).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn prop_variable_conservation(ops in prop::collection::vec(op(), 1..200)) {
        let mut buf = ArenaBuf::<4096>::new();
        let mut pool = VariableBlockPool::from_arena(buf.arena()).unwrap();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(ptr) = pool.allocate(size) {
                        prop_assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
                        live.push((ptr, size));
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let (ptr, _) = live.swap_remove(pick % live.len());
                    prop_assert_eq!(unsafe { pool.deallocate(ptr) }, Ok(()));
                    prop_assert_eq!(unsafe { pool.deallocate(ptr) }, Err(Error::DoubleFree));
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(pool.used_size() + pool.free_size(), pool.total_size());
            prop_assert_eq!(pool.blocks().map(|b| b.size).sum::<usize>(), pool.total_size());
            prop_assert_eq!(pool.live_count(), live.len());

            let mut ranges: Vec<(usize, usize)> = live
                .iter()
                .map(|(p, s)| (p.as_ptr() as usize, *s))
                .collect();
            ranges.sort();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
            }
        }

        for (ptr, _) in live {
            prop_assert_eq!(unsafe { pool.deallocate(ptr) }, Ok(()));
        }
        prop_assert_eq!(pool.free_blocks().count(), 1);
    }

    #[test]
    fn prop_fixed_counts(ops in prop::collection::vec(op(), 1..200)) {
        let mut buf = ArenaBuf::<{ fixed_arena_size(32, 16) }>::new();
        let mut pool = FixedBlockPool::<32, 16>::new(buf.arena()).unwrap();
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => match MemoryPool::allocate(&mut pool, size) {
                    Ok(ptr) => {
                        prop_assert!(size <= 32);
                        prop_assert!(!live.contains(&ptr));
                        live.push(ptr);
                    }
                    Err(Error::InvalidSize) => prop_assert!(size > 32),
                    Err(e) => {
                        prop_assert_eq!(e, Error::OutOfMemory);
                        prop_assert!(pool.is_exhausted());
                    }
                },
                Op::Free(pick) if !live.is_empty() => {
                    let ptr = live.swap_remove(pick % live.len());
                    prop_assert_eq!(unsafe { MemoryPool::deallocate(&mut pool, ptr) }, Ok(()));
                }
                Op::Free(_) => {}
            }
            prop_assert_eq!(pool.free_count() + live.len(), 16);
        }
    }
}
