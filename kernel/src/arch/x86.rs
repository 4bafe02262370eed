//! Bare-metal i686 implementation of the interrupt gate and paging controls.

use core::{arch::asm, cell::UnsafeCell};

use super::Cpu;
use crate::constants::{
    ports::{PIC1_COMMAND, PIC_EOI},
    processes::KERNEL_DATA_SELECTOR,
};

const EFLAGS_IF: u32 = 1 << 9;
const CR0_PG: usize = 1 << 31;

pub struct X86Cpu;

/// The processor the kernel runs on.
pub static CPU: X86Cpu = X86Cpu;

/// 32-bit task state segment. Only the ring 0 stack is used; the GDT
/// descriptor for it is loaded with `ltr` by the boot code.
#[derive(Debug)]
#[repr(C)]
pub struct TaskStateSegment {
    prev: u32,
    pub esp0: u32,
    pub ss0: u32,
    _unused: [u32; 22],
    _trap: u16,
    pub iomap_base: u16,
}

#[repr(transparent)]
pub struct Tss(UnsafeCell<TaskStateSegment>);

// Written only by the scheduler with interrupts disabled
unsafe impl Sync for Tss {}

#[no_mangle]
pub static TSS: Tss = Tss(UnsafeCell::new(TaskStateSegment {
    prev: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    _unused: [0; 22],
    _trap: 0,
    iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
}));

impl Cpu for X86Cpu {
    fn interrupts_enabled(&self) -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & EFLAGS_IF != 0
    }

    fn enable_interrupts(&self) {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    fn disable_interrupts(&self) {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }

    fn halt(&self) {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) }
    }

    unsafe fn load_page_directory(&self, phys: usize) {
        asm!("mov cr3, {}", in(reg) phys, options(nostack, preserves_flags));
    }

    unsafe fn enable_paging(&self) {
        let mut cr0: usize;
        asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        cr0 |= CR0_PG;
        asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
    }

    fn set_kernel_stack(&self, top: usize) {
        unsafe { (*TSS.0.get()).esp0 = top as u32 }
    }
}

/// Faulting linear address of the last page fault.
pub fn read_cr2() -> usize {
    let cr2: usize;
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

pub fn invlpg(virt: usize) {
    unsafe {
        asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
}

/// # Safety
/// Writing to an arbitrary port can reprogram hardware.
pub unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

/// Acknowledges an IRQ on the master PIC.
pub fn end_of_interrupt() {
    unsafe { outb(PIC1_COMMAND, PIC_EOI) }
}
