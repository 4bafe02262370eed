//! Static (placement) allocator
//!
//! - Carves permanent kernel memory out of the region directly above the
//!   loaded kernel image and boot modules
//! - Only ever moves its cursor forward; nothing it hands out is freed
//! - Backs the frame bitmap and the kernel page directory and tables, which
//!   live for as long as the kernel does

use crate::constants::memory::{MAX_NATURAL_ALIGN, PAGE_SIZE};

/// Alignment requested from [`StaticAllocator::alloc_base`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Aligned to the allocation's own size, capped at 16 bytes
    Natural,
    /// Aligned to a 4 KiB page boundary
    Page,
}

/// A block handed out by the static allocator.
///
/// Early kernel memory is identity mapped, so `phys` always equals `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub addr: usize,
    pub phys: usize,
}

/// Bump allocator over `[base, limit)`
///
/// * `base`: where the first allocation may start
/// * `cursor`: next free address; never decreases
/// * `limit`: end of the identity-mapped window the cursor must stay below
#[derive(Debug)]
pub struct StaticAllocator {
    base: usize,
    cursor: usize,
    limit: usize,
}

pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

impl StaticAllocator {
    /// Places the cursor on the first page boundary past both the kernel image
    /// and the last boot module.
    pub fn new(kernel_end: usize, modules_end: usize, limit: usize) -> Self {
        let base = align_up(kernel_end.max(modules_end), PAGE_SIZE);
        assert!(base <= limit, "kernel image ends past the static allocator limit");

        StaticAllocator {
            base,
            cursor: base,
            limit,
        }
    }

    /// Allocates `size` bytes and returns where they start.
    ///
    /// # Panics
    /// Running past the identity-mapped window is fatal. A zero `size` is a
    /// contract violation and fails a debug assertion.
    pub fn alloc_base(&mut self, size: usize, alignment: Alignment) -> Placement {
        debug_assert!(size > 0, "zero-sized static allocation");

        let align = match alignment {
            Alignment::Page => PAGE_SIZE,
            Alignment::Natural => size.max(1).next_power_of_two().min(MAX_NATURAL_ALIGN),
        };

        let addr = align_up(self.cursor, align);
        let end = addr
            .checked_add(size)
            .filter(|&end| end <= self.limit)
            .unwrap_or_else(|| {
                panic!(
                    "static allocator exhausted: {:#x} bytes at {:#x}, limit {:#x}",
                    size, addr, self.limit
                )
            });

        self.cursor = end;

        Placement { addr, phys: addr }
    }

    /// Naturally aligned allocation.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        self.alloc_base(size, Alignment::Natural).addr as *mut u8
    }

    /// Page-aligned allocation with every byte zeroed.
    ///
    /// # Safety
    /// The allocator's window must be writable memory.
    pub unsafe fn alloc_zeroed_pages(&mut self, size: usize) -> Placement {
        let placement = self.alloc_base(size, Alignment::Page);
        core::ptr::write_bytes(placement.addr as *mut u8, 0, size);
        placement
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes handed out so far, alignment padding included.
    pub fn used(&self) -> usize {
        self.cursor - self.base
    }
}
