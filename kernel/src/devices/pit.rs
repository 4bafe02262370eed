//! Programmable interval timer (8253/8254) and the tick clock it drives.
//!
//! Channel 0 fires IRQ0 at the configured frequency. Every interrupt advances
//! the [`TickClock`], which is the kernel's only notion of time.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::arch::{with_interrupts, Cpu};
use crate::constants::timer::PIT_BASE_FREQUENCY;

const USECS_PER_SEC: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitError {
    ZeroFrequency,
    FrequencyTooLow,
    FrequencyTooHigh,
}

impl core::fmt::Display for PitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PitError::ZeroFrequency => write!(f, "Timer frequency must be non-zero"),
            PitError::FrequencyTooLow => write!(f, "Timer frequency below what a 16-bit divisor reaches"),
            PitError::FrequencyTooHigh => write!(f, "Timer frequency above the PIT input clock"),
        }
    }
}

/// Computes the channel 0 reload value for `hz` interrupts per second.
pub fn divisor_for(hz: u32) -> Result<u16, PitError> {
    if hz == 0 {
        return Err(PitError::ZeroFrequency);
    }

    let divisor = PIT_BASE_FREQUENCY / hz;
    if divisor == 0 {
        Err(PitError::FrequencyTooHigh)
    } else if divisor > u16::MAX as u32 {
        Err(PitError::FrequencyTooLow)
    } else {
        Ok(divisor as u16)
    }
}

/// Programs channel 0 as a square-wave generator at `hz`.
#[cfg(target_os = "none")]
pub fn set_frequency(hz: u32) -> Result<(), PitError> {
    use crate::arch::x86::outb;
    use crate::constants::ports::{PIT_CHANNEL0, PIT_COMMAND};

    let divisor = divisor_for(hz)?;
    unsafe {
        // Channel 0, access mode LSB/MSB, mode 3 (square wave)
        outb(PIT_COMMAND, 0x36);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    Ok(())
}

/// Monotonic tick counter advanced by the timer interrupt.
pub struct TickClock {
    ticks: AtomicU64,
    hz: AtomicU32,
}

impl TickClock {
    pub const fn new(hz: u32) -> Self {
        assert!(hz > 0);
        Self {
            ticks: AtomicU64::new(0),
            hz: AtomicU32::new(hz),
        }
    }

    pub fn set_hz(&self, hz: u32) {
        assert!(hz > 0, "tick rate must be non-zero");
        self.hz.store(hz, Ordering::Relaxed);
    }

    /// Records one timer interrupt and returns the new tick count.
    pub fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn hz(&self) -> u32 {
        self.hz.load(Ordering::Relaxed)
    }

    /// Milliseconds represented by one tick, never less than one.
    pub fn ms_per_tick(&self) -> u32 {
        (1000 / self.hz()).max(1)
    }

    /// Number of whole ticks needed to cover `usecs` microseconds.
    /// Saturates at `u64::MAX`.
    pub fn ticks_for_usecs(&self, usecs: u64) -> u64 {
        let hz = self.hz() as u64;
        let whole = (usecs / USECS_PER_SEC).saturating_mul(hz);
        let part = (usecs % USECS_PER_SEC * hz).div_ceil(USECS_PER_SEC);
        whole.saturating_add(part)
    }

    pub fn uptime_ms(&self) -> u64 {
        let hz = self.hz() as u64;
        let ticks = self.ticks();
        (ticks / hz).saturating_mul(1000) + ticks % hz * 1000 / hz
    }
}

/// Waits at least `usecs` microseconds.
///
/// Expects to be called with interrupts disabled; each iteration opens an
/// interrupt window, halts until the next interrupt and closes it again. The
/// wait always spans at least one tick.
pub fn usleep<C: Cpu + ?Sized>(cpu: &C, clock: &TickClock, usecs: u64) {
    let target = clock
        .ticks()
        .saturating_add(clock.ticks_for_usecs(usecs).max(1));
    while clock.ticks() < target {
        with_interrupts(cpu, || cpu.halt());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimCpu;

    #[test]
    fn divisor_for_common_rates() {
        assert_eq!(divisor_for(100), Ok(11931));
        assert_eq!(divisor_for(1000), Ok(1193));
        assert_eq!(divisor_for(PIT_BASE_FREQUENCY), Ok(1));
    }

    #[test]
    fn divisor_rejects_out_of_range_rates() {
        assert_eq!(divisor_for(0), Err(PitError::ZeroFrequency));
        assert_eq!(divisor_for(18), Err(PitError::FrequencyTooLow));
        assert_eq!(divisor_for(PIT_BASE_FREQUENCY + 1), Err(PitError::FrequencyTooHigh));
    }

    #[test]
    fn tick_conversions() {
        let clock = TickClock::new(100);
        assert_eq!(clock.ms_per_tick(), 10);
        assert_eq!(clock.ticks_for_usecs(10_000), 1);
        assert_eq!(clock.ticks_for_usecs(10_001), 2);
        assert_eq!(clock.ticks_for_usecs(1_000_000), 100);

        for _ in 0..250 {
            clock.tick();
        }
        assert_eq!(clock.uptime_ms(), 2500);
    }

    #[test]
    fn huge_durations_do_not_overflow() {
        let clock = TickClock::new(100);
        let usecs = u64::MAX / 10;
        let exact = (usecs as u128 * 100).div_ceil(1_000_000) as u64;
        assert_eq!(clock.ticks_for_usecs(usecs), exact);

        let fast = TickClock::new(PIT_BASE_FREQUENCY);
        assert_eq!(fast.ticks_for_usecs(u64::MAX), u64::MAX);
        assert_eq!(fast.ticks_for_usecs(1), 2);
    }

    #[test]
    fn usleep_waits_for_enough_ticks() {
        let clock = TickClock::new(100);
        let on_halt = || {
            clock.tick();
        };
        let cpu = SimCpu::with_halt_hook(&on_halt);

        usleep(&cpu, &clock, 35_000);

        assert_eq!(clock.ticks(), 4);
        assert_eq!(cpu.halts(), 4);
        assert!(!cpu.interrupts_enabled());
    }

    #[test]
    fn usleep_zero_still_yields_one_tick() {
        let clock = TickClock::new(1000);
        let on_halt = || {
            clock.tick();
        };
        let cpu = SimCpu::with_halt_hook(&on_halt);

        usleep(&cpu, &clock, 0);

        assert_eq!(cpu.halts(), 1);
    }
}
