//! Boot sequencing: memory first, then the scheduler, then the timer.

use crate::{
    arch::Cpu,
    constants::memory::{KHEAP_INITIAL_SIZE, KHEAP_MAX_SIZE, KHEAP_START},
    memory::{heap::HeapFlags, MemoryManager},
    processes::process::KernelStack,
};

/// What the boot stub knows about the machine, handed over once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// First byte past the loaded kernel image
    pub kernel_end: usize,
    /// First byte past the last boot module, 0 without modules
    pub modules_end: usize,
    /// End of the identity-mapped window the static allocator may use
    pub placement_limit: usize,
    /// Top of usable physical memory
    pub memory_end: usize,
    pub stack_base: usize,
    pub stack_size: usize,
}

impl BootInfo {
    /// The stack the boot thread runs on.
    pub fn bootstrap_stack(&self) -> KernelStack {
        KernelStack::borrowed(self.stack_base, self.stack_size)
    }
}

/// Placement of the kernel heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub start: usize,
    pub initial_size: usize,
    pub max_size: usize,
}

impl HeapLayout {
    pub const KERNEL: HeapLayout = HeapLayout {
        start: KHEAP_START,
        initial_size: KHEAP_INITIAL_SIZE,
        max_size: KHEAP_MAX_SIZE,
    };
}

/// Brings memory management up to the point where `kmalloc` works.
///
/// # Safety
/// See [`MemoryManager::new`].
///
/// # Panics
/// If the kernel heap cannot be created.
pub unsafe fn init_memory<C: Cpu + ?Sized>(boot: &BootInfo, layout: &HeapLayout, cpu: &C) -> MemoryManager {
    let mut memory = MemoryManager::new(boot);

    #[cfg(target_os = "none")]
    memory.identity_map_kernel();

    memory.activate(cpu);

    let heap = memory
        .create_kernel_heap(
            layout.start,
            layout.start + layout.initial_size,
            layout.max_size,
            HeapFlags::SUPERVISOR,
        )
        .expect("Failed to create kernel heap");
    memory.enable_kmalloc(heap);

    memory
}

#[cfg(target_os = "none")]
pub use boot::init;

#[cfg(target_os = "none")]
mod boot {
    use super::{init_memory, BootInfo, HeapLayout};
    use crate::{
        arch::{x86::CPU, Cpu},
        constants::timer::TIMER_HZ,
        devices::pit,
        idle_loop, logging,
        memory::{with_memory, MEMORY},
        processes::{scheduler::Scheduler, CLOCK, SCHEDULER},
    };

    extern "fastcall" fn idle_process(_arg: usize) -> ! {
        idle_loop()
    }

    /// Runs with interrupts disabled and returns with the timer running and
    /// the caller scheduled as the main process.
    pub fn init(boot: &BootInfo) {
        logging::init();
        log::info!("Booting...");

        let memory = unsafe { init_memory(boot, &HeapLayout::KERNEL, &CPU) };
        *MEMORY.lock() = Some(memory);

        // The ready queues come from the kernel heap, so build them before
        // taking the memory lock.
        let mut scheduler = Scheduler::new();
        with_memory(|memory| {
            scheduler.init(memory, boot.bootstrap_stack(), idle_process as usize)
        });
        *SCHEDULER.lock() = Some(scheduler);

        CLOCK.set_hz(TIMER_HZ);
        pit::set_frequency(TIMER_HZ).expect("Failed to program the PIT");

        log::info!("Timer running at {} Hz", TIMER_HZ);
        CPU.enable_interrupts();
    }
}
