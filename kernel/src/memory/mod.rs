//! Memory management
//!
//! [`MemoryManager`] owns every allocator the kernel has: the static
//! allocator used during boot, the physical frame bitmap, the kernel page
//! directory and, once enabled, the kernel heap behind `kmalloc`.
//!
//! On bare metal a single instance lives in [`MEMORY`] and is only touched
//! with interrupts disabled; it also backs the `alloc` crate through
//! [`KernelAllocator`].

pub mod bitmap_frame_allocator;
pub mod heap;
pub mod paging;
pub mod static_alloc;

use core::ptr::NonNull;

use crate::{
    arch::{flush_page, without_interrupts, Cpu},
    constants::memory::{ENTRIES_PER_TABLE, FRAME_SIZE, PAGE_SIZE, TABLE_SPAN},
    init::BootInfo,
};
use bitmap_frame_allocator::BitmapFrameAllocator;
use heap::{Heap, HeapError, HeapFlags, RegionMapper};
use paging::{PageDirectory, PageTable, PagingError, TableAllocator};
use static_alloc::{align_down, align_up, StaticAllocator};

/// Page fault error code: the faulting page was present
const FAULT_PRESENT: u32 = 1 << 0;

/// State of the `kmalloc` facade. Moves to `Active` exactly once.
pub enum KernelHeap {
    Uninitialized,
    Active(Heap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultError {
    /// Access violated the flags of a present page
    ProtectionViolation(usize),
    /// No mapping exists and none is created on demand here
    Unmapped(usize),
    Mapping(PagingError),
}

impl core::fmt::Display for PageFaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PageFaultError::ProtectionViolation(addr) => {
                write!(f, "Protection violation at {:#x}", addr)
            }
            PageFaultError::Unmapped(addr) => write!(f, "Access to unmapped address {:#x}", addr),
            PageFaultError::Mapping(e) => write!(f, "Demand mapping failed: {}", e),
        }
    }
}

/// A process page directory allocated from the kernel heap.
///
/// Must be handed back through [`MemoryManager::destroy_address_space`];
/// dropping it leaks the directory and its frames.
pub struct AddressSpace {
    directory: NonNull<PageDirectory>,
}

// The directory is only reached through the memory manager, which is
// serialized by the interrupt gate.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Physical address to load into the page directory register.
    pub fn phys(&self) -> usize {
        unsafe { self.directory.as_ref().phys() }
    }

    pub fn translate(&self, virt: usize) -> Option<usize> {
        unsafe { self.directory.as_ref().translate(virt) }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("phys", &format_args!("{:#x}", self.phys()))
            .finish()
    }
}

/// Maps pages of the kernel directory, whose tables already exist.
struct KernelMapper<'a> {
    directory: &'a mut PageDirectory,
    frames: &'a mut BitmapFrameAllocator,
}

impl RegionMapper for KernelMapper<'_> {
    /// Checks tables and frames for the whole range before touching it, so a
    /// failed call maps nothing.
    fn map(&mut self, start: usize, end: usize, flags: HeapFlags) -> Result<(), PagingError> {
        let mut missing = 0;
        for page in (start..end).step_by(PAGE_SIZE) {
            match self.directory.get_page(page, None) {
                Some(entry) if entry.is_present() => {}
                Some(_) => missing += 1,
                None => return Err(PagingError::OutOfTableMemory),
            }
        }
        if missing > self.frames.free_frames() {
            return Err(PagingError::OutOfFrames);
        }

        for page in (start..end).step_by(PAGE_SIZE) {
            if let Some(entry) = self.directory.get_page(page, None) {
                self.frames.frame_alloc(
                    entry,
                    !flags.contains(HeapFlags::USER),
                    flags.contains(HeapFlags::WRITABLE),
                )?;
            }
        }
        Ok(())
    }

    fn unmap(&mut self, start: usize, end: usize) {
        for page in (start..end).step_by(PAGE_SIZE) {
            if let Some(entry) = self.directory.get_page(page, None) {
                self.frames.frame_free(entry);
                flush_page(page);
            }
        }
    }
}

/// Hands out page tables for process directories from the kernel heap.
struct HeapTables<'a> {
    heap: &'a mut Heap,
    kernel: KernelMapper<'a>,
}

impl TableAllocator for HeapTables<'_> {
    fn alloc_table(&mut self) -> Result<(NonNull<PageTable>, usize), PagingError> {
        let size = core::mem::size_of::<PageTable>();
        let addr = self
            .heap
            .alloc(size, true, &mut self.kernel)
            .map_err(|_| PagingError::OutOfTableMemory)?;
        let phys = self
            .kernel
            .directory
            .translate(addr)
            .ok_or(PagingError::NotMapped)?;

        unsafe {
            core::ptr::write_bytes(addr as *mut u8, 0, size);
            Ok((NonNull::new_unchecked(addr as *mut PageTable), phys))
        }
    }

    unsafe fn free_table(&mut self, table: NonNull<PageTable>) {
        if let Err(e) = self.heap.free(table.as_ptr() as usize, &mut self.kernel) {
            log::warn!("page table {:p} not returned: {}", table, e);
        }
    }
}

pub struct MemoryManager {
    placement: StaticAllocator,
    frames: BitmapFrameAllocator,
    kernel_directory: NonNull<PageDirectory>,
    kmalloc: KernelHeap,
}

// Same reasoning as for `AddressSpace`.
unsafe impl Send for MemoryManager {}

impl MemoryManager {
    /// Sets up the static allocator, the frame bitmap and an empty kernel
    /// page directory.
    ///
    /// # Safety
    /// `[kernel_end, placement_limit)` must be writable memory that nothing
    /// else uses.
    pub unsafe fn new(boot: &BootInfo) -> Self {
        let mut placement =
            StaticAllocator::new(boot.kernel_end, boot.modules_end, boot.placement_limit);
        let frames = BitmapFrameAllocator::init(&mut placement, boot.memory_end);

        let block = placement.alloc_zeroed_pages(core::mem::size_of::<PageDirectory>());
        let kernel_directory = PageDirectory::init_at(block.addr, block.phys);

        log::info!(
            "memory: {} frames, static memory from {:#x}, kernel directory at {:#x}",
            frames.total_frames(),
            placement.base(),
            block.phys
        );

        MemoryManager {
            placement,
            frames,
            kernel_directory,
            kmalloc: KernelHeap::Uninitialized,
        }
    }

    /// Identity maps `[start, end)` in the kernel directory and reserves its
    /// frames. Tables come from static memory.
    pub fn identity_map(&mut self, start: usize, end: usize) {
        let start = align_down(start, PAGE_SIZE);
        let end = align_up(end, PAGE_SIZE);
        let directory = unsafe { self.kernel_directory.as_mut() };

        for page in (start..end).step_by(PAGE_SIZE) {
            let entry = directory
                .get_page(page, Some(&mut self.placement))
                .expect("no page table for identity mapping");
            self.frames.map_frame(entry, page, true, true);
        }
    }

    /// Identity maps the whole early window: kernel image, boot modules and
    /// everything the static allocator can still hand out.
    pub fn identity_map_kernel(&mut self) {
        let end = self
            .placement
            .limit()
            .min(self.frames.total_frames() * FRAME_SIZE);
        self.identity_map(0, end);
        log::info!("identity mapped {:#x}..{:#x}", 0, end);
    }

    /// Loads the kernel directory and turns paging on.
    pub fn activate<C: Cpu + ?Sized>(&self, cpu: &C) {
        let phys = self.kernel_directory_phys();
        without_interrupts(cpu, || unsafe {
            cpu.load_page_directory(phys);
            cpu.enable_paging();
        });
        log::info!("paging enabled, directory {:#x}", phys);
    }

    /// Makes the directory at `phys` the active address space.
    pub fn load_directory<C: Cpu + ?Sized>(&self, phys: usize, cpu: &C) {
        without_interrupts(cpu, || unsafe { cpu.load_page_directory(phys) });
    }

    pub fn kernel_directory_phys(&self) -> usize {
        unsafe { self.kernel_directory.as_ref().phys() }
    }

    pub fn placement(&self) -> &StaticAllocator {
        &self.placement
    }

    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    /// Builds a heap over `[start, end)` in the kernel directory, growable to
    /// `start + max_size`.
    ///
    /// Page tables covering the whole window are created up front, so every
    /// address space created later shares them.
    pub fn create_kernel_heap(
        &mut self,
        start: usize,
        end: usize,
        max_size: usize,
        flags: HeapFlags,
    ) -> Result<Heap, HeapError> {
        let limit = start.checked_add(max_size).ok_or(HeapError::Exhausted)?;
        let directory = unsafe { self.kernel_directory.as_mut() };

        for table in (align_down(start, TABLE_SPAN)..limit).step_by(TABLE_SPAN) {
            directory
                .get_page(table, Some(&mut self.placement))
                .ok_or(HeapError::Mapping(PagingError::OutOfTableMemory))?;
        }

        let mut mapper = KernelMapper {
            directory,
            frames: &mut self.frames,
        };
        Heap::create(start, end, max_size, flags, &mut mapper)
    }

    /// Switches `kmalloc` over to `heap`.
    ///
    /// # Panics
    /// If `kmalloc` was already enabled.
    pub fn enable_kmalloc(&mut self, heap: Heap) {
        match self.kmalloc {
            KernelHeap::Uninitialized => {
                log::info!("kmalloc enabled: {:#x}..{:#x}", heap.start(), heap.end());
                self.kmalloc = KernelHeap::Active(heap);
            }
            KernelHeap::Active(_) => panic!("kmalloc already enabled"),
        }
    }

    pub fn kmalloc_enabled(&self) -> bool {
        matches!(self.kmalloc, KernelHeap::Active(_))
    }

    pub fn kernel_heap(&self) -> Option<&Heap> {
        match &self.kmalloc {
            KernelHeap::Active(heap) => Some(heap),
            KernelHeap::Uninitialized => None,
        }
    }

    /// Allocates from the kernel heap, reporting failure to the caller.
    pub fn try_kmalloc(&mut self, size: usize, page_align: bool) -> Result<usize, HeapError> {
        let KernelHeap::Active(heap) = &mut self.kmalloc else {
            return Err(HeapError::NotInitialized);
        };
        let mut mapper = KernelMapper {
            directory: unsafe { self.kernel_directory.as_mut() },
            frames: &mut self.frames,
        };
        heap.alloc(size, page_align, &mut mapper)
    }

    /// # Panics
    /// If `kmalloc` is not enabled yet or the heap cannot satisfy the request.
    pub fn kmalloc(&mut self, size: usize) -> usize {
        self.try_kmalloc(size, false)
            .unwrap_or_else(|e| panic!("kmalloc({:#x}) failed: {}", size, e))
    }

    /// Page-aligned [`kmalloc`](Self::kmalloc).
    pub fn kmalloc_aligned(&mut self, size: usize) -> usize {
        self.try_kmalloc(size, true)
            .unwrap_or_else(|e| panic!("kmalloc_aligned({:#x}) failed: {}", size, e))
    }

    pub fn kfree(&mut self, addr: usize) {
        let KernelHeap::Active(heap) = &mut self.kmalloc else {
            debug_assert!(false, "kfree({:#x}) before kmalloc was enabled", addr);
            return;
        };
        let mut mapper = KernelMapper {
            directory: unsafe { self.kernel_directory.as_mut() },
            frames: &mut self.frames,
        };
        if let Err(e) = heap.free(addr, &mut mapper) {
            log::warn!("kfree({:#x}): {}", addr, e);
        }
    }

    /// Physical address behind a kernel virtual address.
    pub fn virt_to_phys(&self, virt: usize) -> Option<usize> {
        unsafe { self.kernel_directory.as_ref().translate(virt) }
    }

    /// Creates a page directory that shares every kernel table.
    pub fn create_address_space(&mut self) -> Result<AddressSpace, HeapError> {
        let addr = self.try_kmalloc(core::mem::size_of::<PageDirectory>(), true)?;
        let Some(phys) = self.virt_to_phys(addr) else {
            self.kfree(addr);
            return Err(HeapError::Mapping(PagingError::NotMapped));
        };

        let mut directory = unsafe { PageDirectory::init_at(addr, phys) };
        unsafe {
            directory
                .as_mut()
                .link_kernel_tables(self.kernel_directory.as_ref());
        }

        log::debug!("address space created, directory {:#x}", phys);
        Ok(AddressSpace { directory })
    }

    /// Returns a directory's private frames and tables, then the directory
    /// itself. Linked kernel tables are left untouched.
    pub fn destroy_address_space(&mut self, space: AddressSpace) {
        let mut directory = space.directory;
        let dir = unsafe { directory.as_mut() };
        let phys = dir.phys();

        let KernelHeap::Active(heap) = &mut self.kmalloc else {
            debug_assert!(false, "address space {:#x} outlived the kernel heap", phys);
            return;
        };
        let mut tables = HeapTables {
            heap,
            kernel: KernelMapper {
                directory: unsafe { self.kernel_directory.as_mut() },
                frames: &mut self.frames,
            },
        };

        for index in 0..ENTRIES_PER_TABLE {
            if let Some(mut table) = dir.take_table(index) {
                for entry in unsafe { table.as_mut() }.iter_mut() {
                    tables.kernel.frames.frame_free(entry);
                }
                unsafe { tables.free_table(table) };
            }
        }

        self.kfree(directory.as_ptr() as usize);
        log::debug!("address space destroyed, directory {:#x}", phys);
    }

    /// Maps fresh frames over `[start, end)` in a process address space.
    /// The range must lie outside the kernel's tables.
    pub fn map_range(
        &mut self,
        space: &mut AddressSpace,
        start: usize,
        end: usize,
        flags: HeapFlags,
    ) -> Result<(), PagingError> {
        let KernelHeap::Active(heap) = &mut self.kmalloc else {
            return Err(PagingError::OutOfTableMemory);
        };
        let dir = unsafe { space.directory.as_mut() };

        for page in (align_down(start, PAGE_SIZE)..end).step_by(PAGE_SIZE) {
            debug_assert!(
                !dir.is_linked(paging::table_index(page)),
                "private mapping inside a kernel table at {:#x}",
                page
            );

            let mut tables = HeapTables {
                heap: &mut *heap,
                kernel: KernelMapper {
                    directory: unsafe { self.kernel_directory.as_mut() },
                    frames: &mut self.frames,
                },
            };
            let entry = dir
                .get_page(page, Some(&mut tables))
                .ok_or(PagingError::OutOfTableMemory)?;
            self.frames.frame_alloc(
                entry,
                !flags.contains(HeapFlags::USER),
                flags.contains(HeapFlags::WRITABLE),
            )?;
        }
        Ok(())
    }

    /// Unmaps `[start, end)` in a process address space, returning frames.
    pub fn unmap_range(&mut self, space: &mut AddressSpace, start: usize, end: usize) {
        let dir = unsafe { space.directory.as_mut() };
        for page in (align_down(start, PAGE_SIZE)..end).step_by(PAGE_SIZE) {
            if let Some(entry) = dir.get_page(page, None) {
                self.frames.frame_free(entry);
                flush_page(page);
            }
        }
    }

    /// Resolves a page fault at `addr`.
    ///
    /// Not-present faults inside the kernel heap's window get a frame on
    /// demand; everything else is returned to the fault handler.
    pub fn handle_page_fault(&mut self, addr: usize, error: u32) -> Result<(), PageFaultError> {
        if error & FAULT_PRESENT != 0 {
            return Err(PageFaultError::ProtectionViolation(addr));
        }

        let KernelHeap::Active(heap) = &self.kmalloc else {
            return Err(PageFaultError::Unmapped(addr));
        };
        if !heap.contains(addr) {
            return Err(PageFaultError::Unmapped(addr));
        }

        let page = align_down(addr, PAGE_SIZE);
        let flags = heap.flags();
        let mut mapper = KernelMapper {
            directory: unsafe { self.kernel_directory.as_mut() },
            frames: &mut self.frames,
        };
        mapper
            .map(page, page + PAGE_SIZE, flags)
            .map_err(PageFaultError::Mapping)?;

        log::debug!("demand mapped {:#x} for fault at {:#x}", page, addr);
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use global::{page_fault_interrupt, with_memory, KernelAllocator, MEMORY};

#[cfg(target_os = "none")]
mod global {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr::null_mut;

    use spin::Mutex;

    use super::MemoryManager;
    use crate::arch::{
        without_interrupts,
        x86::{read_cr2, CPU},
    };
    use crate::constants::memory::{HEAP_GRANULE, PAGE_SIZE};

    /// The kernel's memory manager, installed once during boot.
    pub static MEMORY: Mutex<Option<MemoryManager>> = Mutex::new(None);

    /// Runs `f` on the memory manager with interrupts disabled.
    pub fn with_memory<F, R>(f: F) -> R
    where
        F: FnOnce(&mut MemoryManager) -> R,
    {
        without_interrupts(&CPU, || {
            let mut guard = MEMORY.lock();
            match guard.as_mut() {
                Some(memory) => f(memory),
                None => panic!("Memory manager does not exist."),
            }
        })
    }

    /// Page fault handler body; `error` is the code the processor pushed.
    #[no_mangle]
    pub extern "C" fn page_fault_interrupt(error: u32) {
        let addr = read_cr2();
        if let Err(e) = with_memory(|memory| memory.handle_page_fault(addr, error)) {
            panic!("Unhandled page fault: {}", e);
        }
    }

    /// Routes `alloc` collections to `kmalloc`.
    pub struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if layout.align() > PAGE_SIZE {
                return null_mut();
            }
            let page_align = layout.align() > HEAP_GRANULE;
            with_memory(|memory| memory.try_kmalloc(layout.size().max(1), page_align))
                .map_or(null_mut(), |addr| addr as *mut u8)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            with_memory(|memory| memory.kfree(ptr as usize));
        }
    }

    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::sim::SimCpu;
    use crate::memory::paging::tests::leak_pages;

    /// Memory manager over leaked host memory with a 1 MiB kernel heap that
    /// may not grow, so everything it hands out is real memory.
    pub fn manager_with_heap() -> MemoryManager {
        let (static_start, static_end) = leak_pages(128);
        let (heap_start, heap_end) = leak_pages(256);

        let boot = BootInfo {
            kernel_end: static_start,
            modules_end: 0,
            placement_limit: static_end,
            memory_end: 0x0200_0000,
            stack_base: 0,
            stack_size: 0,
        };
        let mut memory = unsafe { MemoryManager::new(&boot) };
        let heap = memory
            .create_kernel_heap(heap_start, heap_end, heap_end - heap_start, HeapFlags::SUPERVISOR)
            .unwrap();
        memory.enable_kmalloc(heap);
        memory
    }

    fn bare_manager() -> MemoryManager {
        let (start, end) = leak_pages(64);
        let boot = BootInfo {
            kernel_end: start,
            modules_end: 0,
            placement_limit: end,
            memory_end: 0x0100_0000,
            stack_base: 0,
            stack_size: 0,
        };
        unsafe { MemoryManager::new(&boot) }
    }

    #[test]
    fn boot_structures_come_from_static_memory() {
        let memory = bare_manager();
        assert_eq!(memory.frames().total_frames(), 0x1000);
        assert_eq!(memory.frames().free_frames(), 0x1000);
        assert!(memory.placement().used() > 0);
        assert_eq!(memory.kernel_directory_phys() % PAGE_SIZE, 0);
        assert!(!memory.kmalloc_enabled());
    }

    #[test]
    fn identity_map_reserves_frames() {
        let mut memory = bare_manager();
        memory.identity_map(0, 0x8000);

        assert_eq!(memory.virt_to_phys(0x1234), Some(0x1234));
        assert_eq!(memory.virt_to_phys(0x7FFF), Some(0x7FFF));
        assert_eq!(memory.virt_to_phys(0x8000), None);
        assert!(memory.frames().is_frame_used(0x3000));
        assert_eq!(memory.frames().free_frames(), 0x1000 - 8);
    }

    #[test]
    fn failed_kernel_mapping_keeps_existing_pages() {
        let mut memory = bare_manager();
        memory.identity_map(0x2000, 0x3000);

        for frame in (0..0x0100_0000).step_by(FRAME_SIZE) {
            if memory.frames.free_frames() == 1 {
                break;
            }
            memory.frames.mark_used(frame);
        }

        let mut mapper = KernelMapper {
            directory: unsafe { memory.kernel_directory.as_mut() },
            frames: &mut memory.frames,
        };
        // 0x1000 and 0x3000 need frames, only one is left
        assert_eq!(
            mapper.map(0x1000, 0x4000, HeapFlags::SUPERVISOR),
            Err(PagingError::OutOfFrames)
        );

        assert_eq!(memory.virt_to_phys(0x2000), Some(0x2000));
        assert_eq!(memory.virt_to_phys(0x1000), None);
        assert_eq!(memory.virt_to_phys(0x3000), None);
        assert_eq!(memory.frames().free_frames(), 1);
    }

    #[test]
    fn activate_loads_the_kernel_directory() {
        let memory = bare_manager();
        let cpu = SimCpu::new();
        cpu.enable_interrupts();

        memory.activate(&cpu);

        assert!(cpu.paging_enabled());
        assert_eq!(cpu.active_directory(), Some(memory.kernel_directory_phys()));
        assert!(cpu.interrupts_enabled());
    }

    #[test]
    fn try_kmalloc_before_enable_is_an_error() {
        let mut memory = bare_manager();
        assert_eq!(memory.try_kmalloc(64, false), Err(HeapError::NotInitialized));
    }

    #[test]
    #[should_panic(expected = "kmalloc(0x40) failed")]
    fn kmalloc_before_enable_panics() {
        let mut memory = bare_manager();
        memory.kmalloc(64);
    }

    #[test]
    #[should_panic(expected = "kmalloc already enabled")]
    fn enabling_kmalloc_twice_panics() {
        let mut memory = manager_with_heap();
        let (start, end) = leak_pages(4);
        let second = memory
            .create_kernel_heap(start, end, end - start, HeapFlags::SUPERVISOR)
            .unwrap();
        memory.enable_kmalloc(second);
    }

    #[test]
    fn kernel_heap_pages_are_backed_by_frames() {
        let mut memory = manager_with_heap();
        let heap_start = memory.kernel_heap().unwrap().start();

        assert_eq!(memory.frames().free_frames(), 0x2000 - 256);
        assert!(memory.virt_to_phys(heap_start).is_some());

        let addr = memory.kmalloc_aligned(100);
        assert_eq!(addr % PAGE_SIZE, 0);
        memory.kfree(addr);
    }

    #[test]
    fn exhaustion_panics_once_and_allocates_nothing() {
        let mut memory = manager_with_heap();
        let used = memory.kernel_heap().unwrap().used_bytes();

        assert_eq!(
            memory.try_kmalloc(0x20_0000, false),
            Err(HeapError::Exhausted)
        );
        assert_eq!(memory.kernel_heap().unwrap().used_bytes(), used);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            memory.kmalloc(0x20_0000);
        }));
        assert!(result.is_err());
        assert_eq!(memory.kernel_heap().unwrap().used_bytes(), used);

        // Still usable afterwards
        let addr = memory.kmalloc(64);
        memory.kfree(addr);
    }

    /// Start of a 4 MiB window whose page table the kernel heap cannot share.
    fn private_window(memory: &MemoryManager, offset: usize) -> usize {
        let heap_table = paging::table_index(memory.kernel_heap().unwrap().start());
        ((heap_table + 16 + offset) % ENTRIES_PER_TABLE) * TABLE_SPAN
    }

    #[test]
    fn address_space_shares_kernel_tables() {
        let mut memory = manager_with_heap();
        let heap_start = memory.kernel_heap().unwrap().start();

        let space = memory.create_address_space().unwrap();
        assert_eq!(space.phys() % PAGE_SIZE, 0);
        assert_eq!(space.translate(heap_start), memory.virt_to_phys(heap_start));

        memory.destroy_address_space(space);
    }

    #[test]
    fn destroying_an_address_space_returns_everything() {
        let mut memory = manager_with_heap();
        let frames = memory.frames().free_frames();
        let heap_used = memory.kernel_heap().unwrap().used_bytes();

        let code = private_window(&memory, 0);
        let data = private_window(&memory, 8);

        let mut space = memory.create_address_space().unwrap();
        memory
            .map_range(&mut space, code, code + 0x3000, HeapFlags::USER | HeapFlags::WRITABLE)
            .unwrap();
        memory
            .map_range(&mut space, data, data + 0x1000, HeapFlags::USER)
            .unwrap();
        assert!(space.translate(code + 0x2000).is_some());
        assert_eq!(memory.frames().free_frames(), frames - 4);

        memory.destroy_address_space(space);

        assert_eq!(memory.frames().free_frames(), frames);
        assert_eq!(memory.kernel_heap().unwrap().used_bytes(), heap_used);
    }

    #[test]
    fn unmap_range_returns_frames() {
        let mut memory = manager_with_heap();
        let frames = memory.frames().free_frames();

        let base = private_window(&memory, 0);

        let mut space = memory.create_address_space().unwrap();
        memory
            .map_range(&mut space, base, base + 0x2000, HeapFlags::USER)
            .unwrap();
        memory.unmap_range(&mut space, base, base + 0x1000);

        assert!(space.translate(base).is_none());
        assert!(space.translate(base + 0x1000).is_some());
        assert_eq!(memory.frames().free_frames(), frames - 1);

        memory.destroy_address_space(space);
    }

    #[test]
    fn page_faults_inside_the_heap_window_are_resolved() {
        let (static_start, static_end) = leak_pages(64);
        let boot = BootInfo {
            kernel_end: static_start,
            modules_end: 0,
            placement_limit: static_end,
            memory_end: 0x0100_0000,
            stack_base: 0,
            stack_size: 0,
        };
        let mut memory = unsafe { MemoryManager::new(&boot) };
        let heap = memory
            .create_kernel_heap(0xC000_0000, 0xC000_4000, 0x10_0000, HeapFlags::SUPERVISOR)
            .unwrap();
        memory.enable_kmalloc(heap);

        assert_eq!(memory.virt_to_phys(0xC000_8000), None);
        memory.handle_page_fault(0xC000_8010, 0x2).unwrap();
        assert!(memory.virt_to_phys(0xC000_8010).is_some());

        assert_eq!(
            memory.handle_page_fault(0xC000_8010, 0x3),
            Err(PageFaultError::ProtectionViolation(0xC000_8010))
        );
        assert_eq!(
            memory.handle_page_fault(0x0100_0000, 0x0),
            Err(PageFaultError::Unmapped(0x0100_0000))
        );
    }
}
