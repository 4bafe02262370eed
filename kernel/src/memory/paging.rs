//! Two-level i686 paging structures.
//!
//! A [`PageDirectory`] holds 1024 directory entries, each of which may point at
//! a [`PageTable`] of 1024 [`PageEntry`]s covering 4 MiB. The first half of the
//! directory is the layout the MMU reads; the second half keeps the virtual
//! addresses of the tables so the kernel can walk them.

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::constants::memory::{ENTRIES_PER_TABLE, PAGE_SIZE};
use crate::memory::static_alloc::StaticAllocator;

bitflags! {
    /// Flag bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: usize {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Software bit: the table is owned by the kernel directory and only
        /// borrowed by this one.
        const LINKED = 1 << 9;
    }
}

const FRAME_MASK: usize = !(PAGE_SIZE - 1);
const FLAG_MASK: usize = PAGE_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    OutOfFrames,
    OutOfTableMemory,
    NotMapped,
}

impl core::fmt::Display for PagingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PagingError::OutOfFrames => write!(f, "No free physical frames"),
            PagingError::OutOfTableMemory => write!(f, "Could not allocate a page table"),
            PagingError::NotMapped => write!(f, "Address is not mapped"),
        }
    }
}

/// One page table entry: frame address in the high 20 bits, flags below.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageEntry(usize);

impl PageEntry {
    pub const fn empty() -> Self {
        PageEntry(0)
    }

    pub fn new(frame: usize, flags: PageFlags) -> Self {
        debug_assert_eq!(frame & FLAG_MASK, 0, "frame address not page aligned");
        PageEntry((frame & FRAME_MASK) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn frame(&self) -> usize {
        self.0 & FRAME_MASK
    }

    pub fn set(&mut self, frame: usize, flags: PageFlags) {
        *self = PageEntry::new(frame, flags);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[cfg(target_arch = "x86")]
const _: () = assert!(core::mem::size_of::<PageEntry>() == 4);

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageEntry> {
        self.entries.iter_mut()
    }
}

/// Source of memory for new page tables.
pub trait TableAllocator {
    /// Returns a zeroed, page-aligned table and its physical address.
    fn alloc_table(&mut self) -> Result<(NonNull<PageTable>, usize), PagingError>;

    /// # Safety
    /// `table` must have come from `alloc_table` on this allocator and must no
    /// longer be referenced by any directory.
    unsafe fn free_table(&mut self, table: NonNull<PageTable>);
}

impl TableAllocator for StaticAllocator {
    fn alloc_table(&mut self) -> Result<(NonNull<PageTable>, usize), PagingError> {
        let placement = unsafe { self.alloc_zeroed_pages(core::mem::size_of::<PageTable>()) };
        let table =
            NonNull::new(placement.addr as *mut PageTable).ok_or(PagingError::OutOfTableMemory)?;
        Ok((table, placement.phys))
    }

    // Static memory is never returned.
    unsafe fn free_table(&mut self, _table: NonNull<PageTable>) {}
}

#[repr(C, align(4096))]
pub struct PageDirectory {
    /// Physical table addresses plus flags, as loaded into CR3
    entries: [usize; ENTRIES_PER_TABLE],
    tables: [Option<NonNull<PageTable>>; ENTRIES_PER_TABLE],
    phys: usize,
}

pub const fn table_index(virt: usize) -> usize {
    (virt >> 22) & (ENTRIES_PER_TABLE - 1)
}

pub const fn page_index(virt: usize) -> usize {
    (virt >> 12) & (ENTRIES_PER_TABLE - 1)
}

impl PageDirectory {
    /// Builds an empty directory in place.
    ///
    /// # Safety
    /// `addr` must be page aligned, writable and at least
    /// `size_of::<PageDirectory>()` bytes long; `phys` must be where the MMU
    /// sees the same memory.
    pub unsafe fn init_at(addr: usize, phys: usize) -> NonNull<PageDirectory> {
        debug_assert_eq!(addr % PAGE_SIZE, 0);
        let dir = addr as *mut PageDirectory;
        // All-zero is a valid directory: no entries, no tables
        core::ptr::write_bytes(dir as *mut u8, 0, core::mem::size_of::<PageDirectory>());
        (*dir).phys = phys;
        NonNull::new_unchecked(dir)
    }

    pub fn phys(&self) -> usize {
        self.phys
    }

    /// Returns the entry for `virt`.
    ///
    /// When the covering table is missing it is created through `create`, or
    /// `None` is returned if no allocator was given or it failed.
    pub fn get_page(
        &mut self,
        virt: usize,
        create: Option<&mut dyn TableAllocator>,
    ) -> Option<&mut PageEntry> {
        let index = table_index(virt);

        if self.tables[index].is_none() {
            let allocator = create?;
            match allocator.alloc_table() {
                Ok((table, phys)) => {
                    self.tables[index] = Some(table);
                    self.entries[index] =
                        phys | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
                }
                Err(e) => {
                    log::warn!("page table for {:#x} not created: {}", virt, e);
                    return None;
                }
            }
        }

        let mut table = self.tables[index]?;
        unsafe { Some(&mut table.as_mut().entries[page_index(virt)]) }
    }

    /// Physical address `virt` maps to, if any.
    pub fn translate(&self, virt: usize) -> Option<usize> {
        let table = self.tables[table_index(virt)]?;
        let entry = unsafe { table.as_ref().entries[page_index(virt)] };
        entry
            .is_present()
            .then(|| entry.frame() | (virt & (PAGE_SIZE - 1)))
    }

    pub fn has_table(&self, index: usize) -> bool {
        self.tables[index].is_some()
    }

    pub fn is_linked(&self, index: usize) -> bool {
        self.entries[index] & PageFlags::LINKED.bits() != 0
    }

    /// Shares every table of `kernel` with this directory.
    pub fn link_kernel_tables(&mut self, kernel: &PageDirectory) {
        for index in 0..ENTRIES_PER_TABLE {
            if let Some(table) = kernel.tables[index] {
                self.tables[index] = Some(table);
                self.entries[index] = kernel.entries[index] | PageFlags::LINKED.bits();
            }
        }
    }

    /// Detaches the table at `index`, returning it if this directory owned it.
    ///
    /// Linked tables are forgotten without being handed back.
    pub fn take_table(&mut self, index: usize) -> Option<NonNull<PageTable>> {
        let linked = self.is_linked(index);
        let table = self.tables[index].take();
        self.entries[index] = 0;
        if linked {
            None
        } else {
            table
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    /// Leaks a page-aligned, zeroed host buffer and returns its bounds.
    pub fn leak_pages(pages: usize) -> (usize, usize) {
        let buffer = Box::leak(vec![0u8; (pages + 1) * PAGE_SIZE].into_boxed_slice());
        let start = (buffer.as_ptr() as usize).next_multiple_of(PAGE_SIZE);
        (start, start + pages * PAGE_SIZE)
    }

    fn fresh_directory(placement: &mut StaticAllocator) -> &'static mut PageDirectory {
        let block = unsafe { placement.alloc_zeroed_pages(core::mem::size_of::<PageDirectory>()) };
        unsafe { PageDirectory::init_at(block.addr, block.phys).as_mut() }
    }

    #[test]
    fn entry_packs_frame_and_flags() {
        let mut entry = PageEntry::empty();
        assert!(entry.is_unused());

        entry.set(0x0040_3000, PageFlags::PRESENT | PageFlags::WRITABLE);
        assert!(entry.is_present());
        assert_eq!(entry.frame(), 0x0040_3000);
        assert_eq!(entry.flags(), PageFlags::PRESENT | PageFlags::WRITABLE);

        entry.clear();
        assert!(entry.is_unused());
    }

    #[test]
    fn indices_split_the_address() {
        assert_eq!(table_index(0xC000_0000), 768);
        assert_eq!(page_index(0xC000_0000), 0);
        assert_eq!(table_index(0x0040_5123), 1);
        assert_eq!(page_index(0x0040_5123), 5);
    }

    #[test]
    fn get_page_creates_zeroed_tables_on_request() {
        let (start, end) = leak_pages(16);
        let mut placement = StaticAllocator::new(start, 0, end);
        let dir = fresh_directory(&mut placement);

        assert!(dir.get_page(0xC000_1000, None).is_none());

        let before = placement.cursor();
        let entry = dir
            .get_page(0xC000_1000, Some(&mut placement))
            .expect("table should be created");
        assert!(entry.is_unused());
        entry.set(0x5000, PageFlags::PRESENT);

        assert!(placement.cursor() > before);
        assert!(dir.has_table(table_index(0xC000_1000)));
        assert_eq!(dir.entries[768] & FRAME_MASK, before);

        // Same table is reused for the neighbouring page
        let cursor = placement.cursor();
        assert!(dir.get_page(0xC000_2000, Some(&mut placement)).is_some());
        assert_eq!(placement.cursor(), cursor);
    }

    #[test]
    fn translate_follows_present_entries() {
        let (start, end) = leak_pages(16);
        let mut placement = StaticAllocator::new(start, 0, end);
        let dir = fresh_directory(&mut placement);

        dir.get_page(0x0080_0000, Some(&mut placement))
            .unwrap()
            .set(0x0012_3000, PageFlags::PRESENT | PageFlags::WRITABLE);
        dir.get_page(0x0080_1000, None)
            .unwrap()
            .set(0x0012_4000, PageFlags::WRITABLE);

        assert_eq!(dir.translate(0x0080_0abc), Some(0x0012_3abc));
        assert_eq!(dir.translate(0x0080_1000), None);
        assert_eq!(dir.translate(0x0100_0000), None);
    }

    #[test]
    fn linked_tables_are_shared_but_not_owned() {
        let (start, end) = leak_pages(32);
        let mut placement = StaticAllocator::new(start, 0, end);
        let kernel = fresh_directory(&mut placement);
        let process = fresh_directory(&mut placement);

        kernel
            .get_page(0xC000_0000, Some(&mut placement))
            .unwrap()
            .set(0x9000, PageFlags::PRESENT);
        process.link_kernel_tables(kernel);

        assert!(process.is_linked(768));
        assert_eq!(process.translate(0xC000_0000), Some(0x9000));

        process
            .get_page(0x0040_0000, Some(&mut placement))
            .unwrap()
            .set(0xA000, PageFlags::PRESENT | PageFlags::USER);
        assert!(!process.is_linked(1));

        assert!(process.take_table(768).is_none());
        assert!(process.take_table(1).is_some());
        assert!(kernel.has_table(768));
        assert_eq!(kernel.translate(0xC000_0000), Some(0x9000));
    }
}
