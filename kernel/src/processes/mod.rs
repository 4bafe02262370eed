pub mod process;
pub mod registers;
pub mod scheduler;
pub mod timer;

#[cfg(target_os = "none")]
pub use global::{
    exit, sleep_us, spawn, timer_interrupt, with_scheduler, ProcessEntry, CLOCK, SCHEDULER,
};

#[cfg(target_os = "none")]
mod global {
    use spin::Mutex;

    use super::{
        process::{Pid, Priority, ProcessFlags},
        scheduler::{Scheduler, SpawnError},
    };
    use crate::{
        arch::{without_interrupts, x86, x86::CPU, Cpu},
        constants::{processes::DEFAULT_STACK_SIZE, timer::TIMER_HZ},
        devices::pit::{usleep, TickClock},
        memory::{with_memory, MEMORY},
    };

    /// Process entry point. The argument arrives in ecx; entries never
    /// return and end with [`exit`].
    pub type ProcessEntry = extern "fastcall" fn(usize) -> !;

    /// Locked after interrupts are disabled and before [`MEMORY`].
    pub static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

    pub static CLOCK: TickClock = TickClock::new(TIMER_HZ);

    pub fn with_scheduler<F, R>(f: F) -> R
    where
        F: FnOnce(&mut Scheduler) -> R,
    {
        without_interrupts(&CPU, || {
            let mut guard = SCHEDULER.lock();
            match guard.as_mut() {
                Some(scheduler) => f(scheduler),
                None => panic!("Scheduler does not exist."),
            }
        })
    }

    /// IRQ0 handler body, called by the interrupt stub with interrupts off.
    ///
    /// `esp` points at the register frame the stub pushed. The stub loads
    /// the returned value into esp before `pop ds; popa; iret`, so the frame
    /// it unwinds belongs to whichever process runs next.
    #[no_mangle]
    pub extern "C" fn timer_interrupt(esp: usize) -> usize {
        CLOCK.tick();

        let mut resume = esp;
        if let Some(scheduler) = SCHEDULER.lock().as_mut() {
            scheduler.on_tick(CLOCK.ms_per_tick() as u64);
            if let Some(memory) = MEMORY.lock().as_mut() {
                resume = scheduler.switch(esp, memory, &CPU);
            }
        }

        x86::end_of_interrupt();
        resume
    }

    /// Starts a kernel process that shares the kernel address space.
    pub fn spawn(entry: ProcessEntry, priority: Priority, arg: usize) -> Result<Pid, SpawnError> {
        with_scheduler(|scheduler| {
            with_memory(|memory| {
                scheduler.spawn(
                    memory,
                    entry as usize,
                    None,
                    priority,
                    arg,
                    DEFAULT_STACK_SIZE,
                    ProcessFlags::SUPERVISOR,
                )
            })
        })
    }

    /// Terminates the calling process.
    pub fn exit() -> ! {
        if let Err(e) = with_scheduler(|scheduler| scheduler.exit_current()) {
            panic!("exit failed: {}", e);
        }
        loop {
            CPU.enable_interrupts();
            CPU.halt();
        }
    }

    /// Blocks the caller for at least `usecs` microseconds, letting other
    /// processes run meanwhile.
    pub fn sleep_us(usecs: u64) {
        without_interrupts(&CPU, || usleep(&CPU, &CLOCK, usecs));
    }
}
