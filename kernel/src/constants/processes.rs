//! Process table sizing and initial CPU state.

pub const PRIORITY_LEVELS: usize = 16;
pub const MAX_PROCESSES: usize = 64;

pub const BOOT_STACK_SIZE: usize = 0x4000;
pub const DEFAULT_STACK_SIZE: usize = 0x4000;
pub const IDLE_STACK_SIZE: usize = 0x1000;
/// Room for the initial interrupt frame plus a little headroom.
pub const MIN_STACK_SIZE: usize = 0x100;

/// Initial ring 3 stack pointer. Whoever builds a user address space maps
/// the pages below it.
pub const USER_STACK_TOP: usize = 0xC000_0000;

// Flat GDT layout installed by the boot stub.
pub const KERNEL_CODE_SELECTOR: usize = 0x08;
pub const KERNEL_DATA_SELECTOR: usize = 0x10;
pub const USER_CODE_SELECTOR: usize = 0x1B;
pub const USER_DATA_SELECTOR: usize = 0x23;

/// IF set plus the always-one reserved bit.
pub const INITIAL_EFLAGS: usize = 0x202;
