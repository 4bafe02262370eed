#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use pebble::{
        arch::{x86::CPU, Cpu},
        constants::processes::BOOT_STACK_SIZE,
        init::{self, BootInfo},
        prelude::*,
        processes::{self, process::Priority},
    };

    extern "C" {
        static kernel_end: u8;
        static boot_stack_bottom: u8;
    }

    extern "fastcall" fn heartbeat(interval_ms: usize) -> ! {
        loop {
            log::info!("heartbeat, uptime {} ms", processes::CLOCK.uptime_ms());
            processes::sleep_us(interval_ms as u64 * 1000);
        }
    }

    /// Entered from the boot stub with interrupts disabled, the stub's
    /// stack active and the memory size and module end it found.
    #[no_mangle]
    extern "C" fn kmain(memory_end: usize, modules_end: usize, placement_limit: usize) -> ! {
        let boot = unsafe {
            BootInfo {
                kernel_end: &kernel_end as *const u8 as usize,
                modules_end,
                placement_limit,
                memory_end,
                stack_base: &boot_stack_bottom as *const u8 as usize,
                stack_size: BOOT_STACK_SIZE,
            }
        };

        debug_println!("{:#x?}", boot);
        init::init(&boot);

        match processes::spawn(heartbeat, Priority::NORMAL, 1000) {
            Ok(pid) => log::info!("Started heartbeat as pid {}", pid),
            Err(e) => log::error!("Could not start heartbeat: {}", e),
        }

        pebble::idle_loop();
    }

    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        CPU.disable_interrupts();
        serial_println!("Kernel panic: {}", info);
        loop {
            CPU.halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("pebble only runs on bare-metal i686; use `cargo test` on the host");
}
