//! Interrupt gate and the other CPU controls the core needs.
//!
//! Everything that touches processor state goes through the [`Cpu`] trait so
//! the memory manager and scheduler can be driven by [`sim::SimCpu`] on a
//! hosted target. On bare-metal i686 the implementation is [`x86::X86Cpu`].
//!
//! Disabling interrupts is the only lock this kernel has: a single CPU with
//! interrupts off cannot be preempted, so [`InterruptGuard`] is the critical
//! section around every mutation of allocator, paging and scheduler state.

#[cfg(not(target_os = "none"))]
pub mod sim;
#[cfg(target_os = "none")]
pub mod x86;

/// Processor operations used by the memory manager and the scheduler.
pub trait Cpu {
    /// Returns whether maskable interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);

    /// Stops the processor until the next interrupt arrives.
    fn halt(&self);

    /// Installs a page directory as the active address space.
    ///
    /// # Safety
    /// `phys` must be the physical address of a page-aligned directory that
    /// maps the currently executing code and stack.
    unsafe fn load_page_directory(&self, phys: usize);

    /// Turns on paging with whatever directory is loaded.
    ///
    /// # Safety
    /// A directory identity-mapping the running kernel must be loaded.
    unsafe fn enable_paging(&self);

    /// Stack the processor switches to when an interrupt arrives in ring 3.
    fn set_kernel_stack(&self, top: usize);
}

/// Drops any cached translation for the page holding `virt`.
#[inline]
pub fn flush_page(virt: usize) {
    #[cfg(target_os = "none")]
    x86::invlpg(virt);
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Scoped critical section.
///
/// Interrupts are disabled while the guard is alive and the previous state is
/// restored when it drops, on every exit path.
pub struct InterruptGuard<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
    was_enabled: bool,
}

impl<'a, C: Cpu + ?Sized> InterruptGuard<'a, C> {
    pub fn new(cpu: &'a C) -> Self {
        let was_enabled = cpu.interrupts_enabled();
        if was_enabled {
            cpu.disable_interrupts();
        }
        Self { cpu, was_enabled }
    }
}

impl<C: Cpu + ?Sized> Drop for InterruptGuard<'_, C> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.cpu.enable_interrupts();
        }
    }
}

/// Executes a closure with interrupts disabled.
///
/// # Arguments
/// * `cpu` - The processor whose interrupt flag is saved and restored
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<C, F, R>(cpu: &C, f: F) -> R
where
    C: Cpu + ?Sized,
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::new(cpu);
    f()
}

/// Executes a closure with interrupts enabled, restoring the previous interrupt state after.
///
/// # Arguments
/// * `cpu` - The processor whose interrupt flag is toggled
/// * `f` - The closure to execute
///
/// # Returns
/// Returns the result of the closure
pub fn with_interrupts<C, F, R>(cpu: &C, f: F) -> R
where
    C: Cpu + ?Sized,
    F: FnOnce() -> R,
{
    let initially_enabled = cpu.interrupts_enabled();
    if !initially_enabled {
        cpu.enable_interrupts();
    }

    let result = f();

    if !initially_enabled {
        cpu.disable_interrupts();
    }

    result
}
