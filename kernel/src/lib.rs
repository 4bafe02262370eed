#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod arch;
pub mod constants;
pub mod devices;
pub mod init;
pub mod logging;
pub mod memory;
pub mod processes;

pub use devices::serial;

pub mod prelude {
    pub use crate::debug_print;
    pub use crate::debug_println;
    pub use crate::serial_print;
    pub use crate::serial_println;
}

#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_print!($($arg)*);
    }
}

#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::serial_println!($($arg)*);
    }
}

/// Halts until the next interrupt, forever.
#[cfg(target_os = "none")]
pub fn idle_loop() -> ! {
    use arch::Cpu;

    loop {
        arch::x86::CPU.halt();
    }
}
