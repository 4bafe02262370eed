use core::mem::size_of;

use bitflags::bitflags;

use crate::{
    constants::processes::{
        INITIAL_EFLAGS, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, PRIORITY_LEVELS,
        USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_STACK_TOP,
    },
    memory::{static_alloc::align_down, AddressSpace},
    processes::registers::Registers,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. A higher number runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    /// Reserved for the idle process
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(8);
    pub const HIGH: Priority = Priority(12);
    pub const MAX: Priority = Priority(PRIORITY_LEVELS as u8 - 1);

    pub const fn new(level: u8) -> Option<Priority> {
        if (level as usize) < PRIORITY_LEVELS {
            Some(Priority(level))
        } else {
            None
        }
    }

    /// Index of the ready queue for this priority.
    pub const fn level(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Terminated,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcessFlags: u8 {
        /// Runs in ring 0 on kernel selectors
        const SUPERVISOR = 1 << 0;
        /// Runs in ring 3 on user selectors
        const USER = 1 << 1;
    }
}

/// Kernel stack of a process.
///
/// `owned` stacks were taken from the kernel heap and go back to it when the
/// process is reaped; the boot stack is borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStack {
    pub base: usize,
    pub size: usize,
    pub owned: bool,
}

impl KernelStack {
    pub fn borrowed(base: usize, size: usize) -> Self {
        KernelStack {
            base,
            size,
            owned: false,
        }
    }

    pub fn owned(base: usize, size: usize) -> Self {
        KernelStack {
            base,
            size,
            owned: true,
        }
    }

    /// Initial stack pointer, 16-byte aligned.
    pub fn top(&self) -> usize {
        align_down(self.base + self.size, 16)
    }

    /// Whether `len` bytes at `addr` lie inside the stack.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.base + self.size)
    }
}

/// Registers a new process starts with.
pub fn initial_registers(entry: usize, arg: usize, flags: ProcessFlags) -> Registers {
    let (code, data) = if flags.contains(ProcessFlags::USER) {
        (USER_CODE_SELECTOR, USER_DATA_SELECTOR)
    } else {
        (KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR)
    };

    Registers {
        ds: data,
        ecx: arg,
        eip: entry,
        cs: code,
        eflags: INITIAL_EFLAGS,
        useresp: if flags.contains(ProcessFlags::USER) {
            USER_STACK_TOP
        } else {
            0
        },
        ss: data,
        ..Registers::new()
    }
}

/// Where the first frame of a process goes on its kernel stack.
///
/// A ring 3 frame ends at the top of the stack. A ring 0 `iret` stops short
/// of `useresp`, so the frame sits low enough that the entry point starts
/// with the alignment of a freshly called function, `useresp` standing in
/// for its return address.
pub fn initial_frame(stack: &KernelStack, flags: ProcessFlags) -> usize {
    if flags.contains(ProcessFlags::USER) {
        stack.top() - Registers::USER_FRAME_SIZE
    } else {
        let entry_esp = stack.top() - 16 - size_of::<usize>();
        entry_esp - Registers::KERNEL_FRAME_SIZE
    }
}

/// Writes the first frame of a process onto its stack and returns the
/// stack pointer the interrupt stub resumes it from.
///
/// # Safety
/// `stack` must be writable memory owned by the new process.
pub unsafe fn build_initial_frame(
    stack: &KernelStack,
    entry: usize,
    arg: usize,
    flags: ProcessFlags,
) -> usize {
    let frame = initial_frame(stack, flags);
    debug_assert!(stack.contains(frame, Registers::USER_FRAME_SIZE));
    core::ptr::write(frame as *mut Registers, initial_registers(entry, arg, flags));
    frame
}

pub struct Process {
    pid: Pid,
    entry: usize,
    pub(super) priority: Priority,
    pub(super) state: ProcessState,
    flags: ProcessFlags,
    stack: KernelStack,
    pub(super) frame: usize,
    address_space: Option<AddressSpace>,
    pub(super) ticks: u64,
}

impl Process {
    /// A ready process that resumes from the register frame at `frame`.
    ///
    /// `frame` is 0 for the boot thread, which is on the CPU and gets a frame
    /// when it is first preempted.
    pub fn new(
        pid: Pid,
        entry: usize,
        priority: Priority,
        stack: KernelStack,
        flags: ProcessFlags,
        address_space: Option<AddressSpace>,
        frame: usize,
    ) -> Self {
        Process {
            pid,
            entry,
            priority,
            state: ProcessState::Ready,
            flags,
            stack,
            frame,
            address_space,
            ticks: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn flags(&self) -> ProcessFlags {
        self.flags
    }

    pub fn stack(&self) -> KernelStack {
        self.stack
    }

    /// Kernel stack pointer of the saved register frame.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Timer ticks spent running.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Directory to load for this process; `kernel` when it has no address
    /// space of its own.
    pub fn directory_phys(&self, kernel: usize) -> usize {
        self.address_space
            .as_ref()
            .map_or(kernel, |space| space.phys())
    }

    pub(super) fn take_address_space(&mut self) -> Option<AddressSpace> {
        self.address_space.take()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("frame", &format_args!("{:#x}", self.frame))
            .field("ticks", &self.ticks)
            .finish()
    }
}
