//! Memory layout and allocator sizing.

pub const PAGE_SIZE: usize = 0x1000;
pub const FRAME_SIZE: usize = PAGE_SIZE;

/// Entries in a page directory and in each page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Bytes of address space covered by one page table.
pub const TABLE_SPAN: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

// Kernel heap window. Page tables for the whole window are created at boot so
// every process directory can link them.
pub const KHEAP_START: usize = 0xC000_0000;
pub const KHEAP_INITIAL_SIZE: usize = 0x10_0000; // 1 MiB
pub const KHEAP_MAX_SIZE: usize = 0x0100_0000; // 16 MiB

/// Blocks (used + free) a single heap can track.
pub const HEAP_INDEX_CAPACITY: usize = 512;
/// Every heap block size is a multiple of this.
pub const HEAP_GRANULE: usize = 16;

/// Largest alignment the static allocator derives from an allocation's size.
pub const MAX_NATURAL_ALIGN: usize = 16;

pub const BITMAP_ENTRY_SIZE: usize = 32;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;
