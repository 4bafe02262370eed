//! Dynamic heap allocator
//!
//! Best-fit allocator over a contiguous virtual window `[start, max_end)`.
//! Only `[start, end)` is backed by frames; the heap grows a page at a time
//! towards `max_end` when nothing fits, and gives tail pages back when they
//! become free, never shrinking below its initial size.
//!
//! Bookkeeping lives outside the managed memory: an address-ordered list of
//! blocks that tiles `[start, end)` exactly, plus a `(size, addr)` ordered
//! index of the free ones. Managed memory is never read or written, so a
//! corrupted allocation cannot corrupt the allocator.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::constants::memory::{HEAP_GRANULE, HEAP_INDEX_CAPACITY, PAGE_SIZE};
use crate::memory::paging::PagingError;
use crate::memory::static_alloc::align_up;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u8 {
        /// Pages are reachable from ring 3
        const USER = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

impl HeapFlags {
    /// Kernel-only, writable
    pub const SUPERVISOR: HeapFlags = HeapFlags::WRITABLE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    ZeroSize,
    Exhausted,
    IndexFull,
    InvalidFree,
    NotInitialized,
    Mapping(PagingError),
}

impl From<PagingError> for HeapError {
    fn from(err: PagingError) -> Self {
        HeapError::Mapping(err)
    }
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeapError::ZeroSize => write!(f, "Zero-sized allocation"),
            HeapError::Exhausted => write!(f, "Heap exhausted"),
            HeapError::IndexFull => write!(f, "Heap block index is full"),
            HeapError::InvalidFree => write!(f, "Address was not allocated from this heap"),
            HeapError::NotInitialized => write!(f, "Kernel heap not initialized"),
            HeapError::Mapping(e) => write!(f, "Heap mapping failed: {}", e),
        }
    }
}

/// Backs and releases the pages of a heap window.
pub trait RegionMapper {
    /// Maps every page in `[start, end)`. Pages already mapped are kept.
    fn map(&mut self, start: usize, end: usize, flags: HeapFlags) -> Result<(), PagingError>;

    /// Unmaps every page in `[start, end)` and returns their frames.
    fn unmap(&mut self, start: usize, end: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    addr: usize,
    size: usize,
    used: bool,
}

/// Free-index key. Field order gives the `(size, addr)` sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Hole {
    size: usize,
    addr: usize,
}

pub struct Heap {
    start: usize,
    end: usize,
    min_end: usize,
    max_end: usize,
    flags: HeapFlags,
    blocks: ArrayVec<Block, HEAP_INDEX_CAPACITY>,
    holes: ArrayVec<Hole, HEAP_INDEX_CAPACITY>,
}

impl Heap {
    /// Creates a heap over `[start, end)` that may grow up to `start + max_size`.
    /// `start` and `end` must be page aligned.
    pub fn create(
        start: usize,
        end: usize,
        max_size: usize,
        flags: HeapFlags,
        mapper: &mut dyn RegionMapper,
    ) -> Result<Heap, HeapError> {
        debug_assert_eq!(start % PAGE_SIZE, 0, "heap start not page aligned");
        debug_assert_eq!(end % PAGE_SIZE, 0, "heap end not page aligned");

        if end <= start {
            return Err(HeapError::ZeroSize);
        }
        let max_end = start.checked_add(max_size).ok_or(HeapError::Exhausted)?;
        if end > max_end {
            return Err(HeapError::Exhausted);
        }

        mapper.map(start, end, flags)?;

        let mut heap = Heap {
            start,
            end,
            min_end: end,
            max_end,
            flags,
            blocks: ArrayVec::new(),
            holes: ArrayVec::new(),
        };
        heap.blocks.push(Block {
            addr: start,
            size: end - start,
            used: false,
        });
        heap.insert_hole(start, end - start);

        log::debug!(
            "heap created: {:#x}..{:#x}, max {:#x}, {:?}",
            start,
            end,
            max_end,
            flags
        );
        Ok(heap)
    }

    /// Allocates `size` bytes, page aligned if asked.
    ///
    /// On failure the heap is left exactly as it was.
    pub fn alloc(
        &mut self,
        size: usize,
        page_align: bool,
        mapper: &mut dyn RegionMapper,
    ) -> Result<usize, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let size = size
            .checked_next_multiple_of(HEAP_GRANULE)
            .ok_or(HeapError::Exhausted)?;

        if let Some((hole, pad)) = self.find_hole(size, page_align) {
            return self.take(hole, pad, size);
        }

        self.grow_for(size, page_align, mapper)?;

        // The grown tail always fits the request
        match self.find_hole(size, page_align) {
            Some((hole, pad)) => self.take(hole, pad, size),
            None => Err(HeapError::Exhausted),
        }
    }

    /// Releases the block starting at `addr`, merging it with free neighbours
    /// and handing tail pages back.
    pub fn free(&mut self, addr: usize, mapper: &mut dyn RegionMapper) -> Result<(), HeapError> {
        let mut index = match self.blocks.binary_search_by_key(&addr, |block| block.addr) {
            Ok(index) if self.blocks[index].used => index,
            _ => {
                debug_assert!(false, "free of unallocated address {:#x}", addr);
                return Err(HeapError::InvalidFree);
            }
        };

        self.blocks[index].used = false;

        if let Some(next) = self.blocks.get(index + 1).copied() {
            if !next.used {
                self.remove_hole(next.addr, next.size);
                self.blocks[index].size += next.size;
                self.blocks.remove(index + 1);
            }
        }

        if index > 0 && !self.blocks[index - 1].used {
            let prev = self.blocks[index - 1];
            self.remove_hole(prev.addr, prev.size);
            self.blocks[index - 1].size += self.blocks[index].size;
            self.blocks.remove(index);
            index -= 1;
        }

        let merged = self.blocks[index];
        self.insert_hole(merged.addr, merged.size);

        self.contract(mapper);
        Ok(())
    }

    /// Unmaps the whole heap.
    pub fn destroy(self, mapper: &mut dyn RegionMapper) {
        log::debug!("heap destroyed: {:#x}..{:#x}", self.start, self.end);
        mapper.unmap(self.start, self.end);
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn max_end(&self) -> usize {
        self.max_end
    }

    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    /// Bytes currently backed by frames.
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    pub fn used_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.used).map(|b| b.size).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.holes.iter().map(|h| h.size).sum()
    }

    /// Whether `addr` lies in the heap's reserved window, mapped or not.
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.max_end).contains(&addr)
    }

    /// Size of the allocation starting at `addr`.
    pub fn allocation_size(&self, addr: usize) -> Option<usize> {
        let index = self.blocks.binary_search_by_key(&addr, |b| b.addr).ok()?;
        let block = self.blocks[index];
        block.used.then_some(block.size)
    }

    /// Smallest hole that fits, with the padding page alignment costs in it.
    fn find_hole(&self, size: usize, page_align: bool) -> Option<(Hole, usize)> {
        let first = self.holes.partition_point(|hole| hole.size < size);
        self.holes[first..].iter().find_map(|&hole| {
            let pad = if page_align {
                align_up(hole.addr, PAGE_SIZE) - hole.addr
            } else {
                0
            };
            (hole.size >= pad + size).then_some((hole, pad))
        })
    }

    /// Splits `hole` into an optional leading free fragment, the used block
    /// and an optional free remainder.
    fn take(&mut self, hole: Hole, pad: usize, size: usize) -> Result<usize, HeapError> {
        let rest = hole.size - pad - size;
        let extra = usize::from(pad > 0) + usize::from(rest > 0);
        if self.blocks.len() + extra > HEAP_INDEX_CAPACITY {
            return Err(HeapError::IndexFull);
        }

        let index = self
            .blocks
            .binary_search_by_key(&hole.addr, |block| block.addr)
            .map_err(|_| HeapError::InvalidFree)?;
        self.remove_hole(hole.addr, hole.size);

        let addr = hole.addr + pad;
        let mut at = index;
        if pad > 0 {
            self.blocks[at].size = pad;
            self.insert_hole(hole.addr, pad);
            at += 1;
            self.blocks.insert(
                at,
                Block {
                    addr,
                    size,
                    used: true,
                },
            );
        } else {
            self.blocks[at] = Block {
                addr,
                size,
                used: true,
            };
        }

        if rest > 0 {
            self.blocks.insert(
                at + 1,
                Block {
                    addr: addr + size,
                    size: rest,
                    used: false,
                },
            );
            self.insert_hole(addr + size, rest);
        }

        Ok(addr)
    }

    /// Extends the heap just far enough for its tail to hold `size` bytes.
    /// Nothing is mapped unless the following `take` is sure to succeed.
    fn grow_for(
        &mut self,
        size: usize,
        page_align: bool,
        mapper: &mut dyn RegionMapper,
    ) -> Result<(), HeapError> {
        let tail_free = self.blocks.last().filter(|block| !block.used).copied();
        let tail_start = tail_free.map_or(self.end, |block| block.addr);
        let aligned = if page_align {
            align_up(tail_start, PAGE_SIZE)
        } else {
            tail_start
        };
        let new_end = aligned
            .checked_add(size)
            .map(|end| align_up(end, PAGE_SIZE))
            .filter(|&end| end <= self.max_end)
            .ok_or(HeapError::Exhausted)?;

        // Blocks the grown tail hole and the split that follows will need
        let pad = aligned - tail_start;
        let rest = new_end - aligned - size;
        let extra = usize::from(tail_free.is_none()) + usize::from(pad > 0) + usize::from(rest > 0);
        if self.blocks.len() + extra > HEAP_INDEX_CAPACITY {
            return Err(HeapError::IndexFull);
        }

        mapper.map(self.end, new_end, self.flags)?;
        log::trace!("heap grown: {:#x} -> {:#x}", self.end, new_end);

        let grown = new_end - self.end;
        match tail_free {
            Some(tail) => {
                self.remove_hole(tail.addr, tail.size);
                if let Some(last) = self.blocks.last_mut() {
                    last.size += grown;
                }
                self.insert_hole(tail.addr, tail.size + grown);
            }
            None => {
                self.blocks.push(Block {
                    addr: self.end,
                    size: grown,
                    used: false,
                });
                self.insert_hole(self.end, grown);
            }
        }
        self.end = new_end;
        Ok(())
    }

    /// Unmaps whole free pages at the tail, down to the initial size.
    fn contract(&mut self, mapper: &mut dyn RegionMapper) {
        let Some(tail) = self.blocks.last().copied() else {
            return;
        };
        if tail.used || self.end <= self.min_end {
            return;
        }

        let new_end = align_up(tail.addr, PAGE_SIZE).max(self.min_end);
        if new_end >= self.end {
            return;
        }

        mapper.unmap(new_end, self.end);
        log::trace!("heap contracted: {:#x} -> {:#x}", self.end, new_end);

        self.remove_hole(tail.addr, tail.size);
        if new_end == tail.addr {
            self.blocks.pop();
        } else {
            let size = new_end - tail.addr;
            if let Some(last) = self.blocks.last_mut() {
                last.size = size;
            }
            self.insert_hole(tail.addr, size);
        }
        self.end = new_end;
    }

    fn insert_hole(&mut self, addr: usize, size: usize) {
        let hole = Hole { size, addr };
        let at = self.holes.binary_search(&hole).unwrap_or_else(|at| at);
        self.holes.insert(at, hole);
    }

    fn remove_hole(&mut self, addr: usize, size: usize) {
        match self.holes.binary_search(&Hole { size, addr }) {
            Ok(at) => {
                self.holes.remove(at);
            }
            Err(_) => debug_assert!(false, "hole {:#x}+{:#x} missing from index", addr, size),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;

    /// Records which pages are mapped; fails once `budget` pages are in use.
    pub struct FakeMapper {
        pub mapped: Vec<usize>,
        pub budget: usize,
    }

    impl FakeMapper {
        pub fn new() -> Self {
            FakeMapper {
                mapped: Vec::new(),
                budget: usize::MAX,
            }
        }

        pub fn with_budget(pages: usize) -> Self {
            FakeMapper {
                mapped: Vec::new(),
                budget: pages,
            }
        }
    }

    impl RegionMapper for FakeMapper {
        fn map(&mut self, start: usize, end: usize, _flags: HeapFlags) -> Result<(), PagingError> {
            let new: Vec<usize> = (start..end)
                .step_by(PAGE_SIZE)
                .filter(|page| !self.mapped.contains(page))
                .collect();
            if self.mapped.len() + new.len() > self.budget {
                return Err(PagingError::OutOfFrames);
            }
            self.mapped.extend(new);
            Ok(())
        }

        fn unmap(&mut self, start: usize, end: usize) {
            self.mapped.retain(|page| !(start..end).contains(page));
        }
    }

    const START: usize = 0x40_0000;

    fn heap(initial: usize, max: usize, mapper: &mut FakeMapper) -> Heap {
        Heap::create(START, START + initial, max, HeapFlags::SUPERVISOR, mapper).unwrap()
    }

    /// Blocks tile the heap, free neighbours are merged and the index matches.
    fn assert_consistent(heap: &Heap) {
        let mut cursor = heap.start;
        for pair in heap.blocks.windows(2) {
            assert!(pair[0].used || pair[1].used, "adjacent free blocks {:?}", pair);
        }
        for block in &heap.blocks {
            assert_eq!(block.addr, cursor);
            assert!(block.size > 0);
            cursor += block.size;
        }
        assert_eq!(cursor, heap.end);

        let mut free: Vec<Hole> = heap
            .blocks
            .iter()
            .filter(|b| !b.used)
            .map(|b| Hole {
                size: b.size,
                addr: b.addr,
            })
            .collect();
        free.sort();
        assert_eq!(free.as_slice(), heap.holes.as_slice());
        assert_eq!(heap.used_bytes() + heap.free_bytes(), heap.capacity());
    }

    #[test]
    fn create_maps_the_initial_window() {
        let mut mapper = FakeMapper::new();
        let heap = heap(0x4000, 0x10000, &mut mapper);

        assert_eq!(mapper.mapped.len(), 4);
        assert_eq!(heap.free_bytes(), 0x4000);
        assert!(heap.contains(START + 0xFFFF));
        assert!(!heap.contains(START + 0x10000));
        assert_consistent(&heap);
    }

    #[test]
    fn create_rejects_bad_windows() {
        let mut mapper = FakeMapper::new();
        assert_eq!(
            Heap::create(START, START, 0x1000, HeapFlags::SUPERVISOR, &mut mapper).err(),
            Some(HeapError::ZeroSize)
        );
        assert_eq!(
            Heap::create(START, START + 0x2000, 0x1000, HeapFlags::SUPERVISOR, &mut mapper).err(),
            Some(HeapError::Exhausted)
        );
    }

    #[test]
    fn allocations_are_disjoint_and_inside_the_heap() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x10000, 0x10000, &mut mapper);

        let sizes = [1, 16, 17, 100, 4096, 33, 250];
        let mut taken: Vec<(usize, usize)> = Vec::new();
        for size in sizes {
            let addr = heap.alloc(size, false, &mut mapper).unwrap();
            assert_eq!(addr % HEAP_GRANULE, 0);
            assert!(addr >= heap.start() && addr + size <= heap.end());
            for &(other, other_size) in &taken {
                assert!(addr + size <= other || other + other_size <= addr);
            }
            taken.push((addr, size));
            assert_consistent(&heap);
        }

        assert_eq!(heap.allocation_size(taken[2].0), Some(32));
    }

    #[test]
    fn best_fit_prefers_the_smallest_hole() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x1000, &mut mapper);

        let a = heap.alloc(64, false, &mut mapper).unwrap();
        let _b = heap.alloc(16, false, &mut mapper).unwrap();
        let c = heap.alloc(32, false, &mut mapper).unwrap();
        let _d = heap.alloc(16, false, &mut mapper).unwrap();

        heap.free(a, &mut mapper).unwrap();
        heap.free(c, &mut mapper).unwrap();

        // 32-byte hole fits better than the 64-byte one or the tail
        assert_eq!(heap.alloc(20, false, &mut mapper).unwrap(), c);
        assert_consistent(&heap);
    }

    #[test]
    fn page_aligned_allocation_leaves_a_leading_fragment() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x4000, 0x4000, &mut mapper);

        let small = heap.alloc(48, false, &mut mapper).unwrap();
        let page = heap.alloc(0x1000, true, &mut mapper).unwrap();
        assert_eq!(page % PAGE_SIZE, 0);
        assert_eq!(page, START + PAGE_SIZE);
        assert_consistent(&heap);

        // The fragment in front of the page is still usable
        let filler = heap.alloc(64, false, &mut mapper).unwrap();
        assert_eq!(filler, small + 48);
    }

    #[test]
    fn free_order_does_not_matter() {
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        for order in orders {
            let mut mapper = FakeMapper::new();
            let mut heap = heap(0x2000, 0x2000, &mut mapper);
            let addrs: Vec<usize> = [100, 200, 300, 400]
                .iter()
                .map(|&size| heap.alloc(size, false, &mut mapper).unwrap())
                .collect();

            for index in order {
                heap.free(addrs[index], &mut mapper).unwrap();
                assert_consistent(&heap);
            }

            assert_eq!(heap.blocks.len(), 1);
            assert_eq!(heap.holes.as_slice(), &[Hole { size: 0x2000, addr: START }]);
        }
    }

    #[test]
    fn grows_on_demand_and_contracts_back() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x10000, &mut mapper);

        let first = heap.alloc(0x800, false, &mut mapper).unwrap();
        let big = heap.alloc(0x2000, false, &mut mapper).unwrap();
        assert_eq!(big, first + 0x800);
        assert_eq!(heap.end(), START + 0x3000);
        assert_eq!(mapper.mapped.len(), 3);
        assert_consistent(&heap);

        heap.free(big, &mut mapper).unwrap();
        assert_eq!(heap.end(), START + 0x1000);
        assert_eq!(mapper.mapped.len(), 1);
        assert_consistent(&heap);

        // Never below the initial size
        heap.free(first, &mut mapper).unwrap();
        assert_eq!(heap.end(), START + 0x1000);
        assert_consistent(&heap);
    }

    #[test]
    fn exhaustion_leaves_the_heap_untouched() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x2000, &mut mapper);
        heap.alloc(0x800, false, &mut mapper).unwrap();

        let end = heap.end();
        let free = heap.free_bytes();
        assert_eq!(heap.alloc(0x2000, false, &mut mapper), Err(HeapError::Exhausted));
        assert_eq!(heap.end(), end);
        assert_eq!(heap.free_bytes(), free);
        assert_eq!(mapper.mapped.len(), 1);
    }

    #[test]
    fn mapping_failure_is_reported() {
        let mut mapper = FakeMapper::with_budget(1);
        let mut heap = heap(0x1000, 0x4000, &mut mapper);

        assert_eq!(
            heap.alloc(0x1800, false, &mut mapper),
            Err(HeapError::Mapping(PagingError::OutOfFrames))
        );
        assert_eq!(heap.end(), START + 0x1000);
        assert_consistent(&heap);
    }

    #[test]
    fn full_index_stops_growth_before_mapping() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x2000, 0x10000, &mut mapper);

        for _ in 0..510 {
            heap.alloc(16, false, &mut mapper).unwrap();
        }
        heap.alloc(32, false, &mut mapper).unwrap();
        assert_eq!(heap.blocks.len(), HEAP_INDEX_CAPACITY - 1);

        let end = heap.end();
        assert_eq!(heap.alloc(32, false, &mut mapper), Err(HeapError::IndexFull));
        assert_eq!(heap.end(), end);
        assert_eq!(mapper.mapped.len(), 2);
        assert_eq!(heap.blocks.len(), HEAP_INDEX_CAPACITY - 1);
        assert_consistent(&heap);
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x1000, &mut mapper);
        assert_eq!(heap.alloc(0, false, &mut mapper), Err(HeapError::ZeroSize));
    }

    #[test]
    fn index_capacity_is_enforced() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x10000, 0x10000, &mut mapper);

        let mut count = 0;
        loop {
            match heap.alloc(16, false, &mut mapper) {
                Ok(_) => count += 1,
                Err(err) => {
                    assert_eq!(err, HeapError::IndexFull);
                    break;
                }
            }
        }
        assert_eq!(count, HEAP_INDEX_CAPACITY - 1);
        assert_consistent(&heap);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "free of unallocated address")]
    fn double_free_is_a_contract_violation() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x1000, &mut mapper);
        let addr = heap.alloc(64, false, &mut mapper).unwrap();
        heap.free(addr, &mut mapper).unwrap();
        let _ = heap.free(addr, &mut mapper);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn double_free_is_rejected() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x1000, 0x1000, &mut mapper);
        let addr = heap.alloc(64, false, &mut mapper).unwrap();
        heap.free(addr, &mut mapper).unwrap();
        assert_eq!(heap.free(addr, &mut mapper), Err(HeapError::InvalidFree));
    }

    #[test]
    fn destroy_unmaps_everything() {
        let mut mapper = FakeMapper::new();
        let mut heap = heap(0x2000, 0x8000, &mut mapper);
        heap.alloc(0x3000, false, &mut mapper).unwrap();
        heap.destroy(&mut mapper);
        assert!(mapper.mapped.is_empty());
    }
}
