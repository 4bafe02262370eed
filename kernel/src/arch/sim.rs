//! Simulated processor for hosted builds and unit tests.
//!
//! Records interrupt-flag changes, halts, page-directory loads and the ring 0
//! stack instead of executing privileged instructions.

use core::cell::Cell;

use super::Cpu;

pub struct SimCpu<'a> {
    interrupts: Cell<bool>,
    paging: Cell<bool>,
    directory: Cell<Option<usize>>,
    directory_loads: Cell<usize>,
    halts: Cell<u64>,
    kernel_stack: Cell<Option<usize>>,
    on_halt: Option<&'a dyn Fn()>,
}

impl SimCpu<'static> {
    /// A processor that boots with interrupts disabled, like real hardware.
    pub const fn new() -> Self {
        Self {
            interrupts: Cell::new(false),
            paging: Cell::new(false),
            directory: Cell::new(None),
            directory_loads: Cell::new(0),
            halts: Cell::new(0),
            kernel_stack: Cell::new(None),
            on_halt: None,
        }
    }
}

impl Default for SimCpu<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> SimCpu<'a> {
    /// Runs `hook` every time the processor halts, standing in for the
    /// interrupt that would wake it.
    pub fn with_halt_hook(hook: &'a dyn Fn()) -> Self {
        Self {
            interrupts: Cell::new(false),
            paging: Cell::new(false),
            directory: Cell::new(None),
            directory_loads: Cell::new(0),
            halts: Cell::new(0),
            kernel_stack: Cell::new(None),
            on_halt: Some(hook),
        }
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    /// Physical address of the last directory loaded.
    pub fn active_directory(&self) -> Option<usize> {
        self.directory.get()
    }

    pub fn directory_loads(&self) -> usize {
        self.directory_loads.get()
    }

    pub fn halts(&self) -> u64 {
        self.halts.get()
    }

    /// Ring 0 stack set for the next ring 3 interrupt.
    pub fn kernel_stack(&self) -> Option<usize> {
        self.kernel_stack.get()
    }
}

impl Cpu for SimCpu<'_> {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    fn enable_interrupts(&self) {
        self.interrupts.set(true);
    }

    fn disable_interrupts(&self) {
        self.interrupts.set(false);
    }

    fn halt(&self) {
        self.halts.set(self.halts.get() + 1);
        if let Some(hook) = self.on_halt {
            hook();
        }
    }

    unsafe fn load_page_directory(&self, phys: usize) {
        self.directory.set(Some(phys));
        self.directory_loads.set(self.directory_loads.get() + 1);
    }

    unsafe fn enable_paging(&self) {
        self.paging.set(true);
    }

    fn set_kernel_stack(&self, top: usize) {
        self.kernel_stack.set(Some(top));
    }
}
