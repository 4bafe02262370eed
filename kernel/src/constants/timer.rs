//! Tick source configuration.

/// Timer interrupt frequency in Hertz.
/// Determines the resolution of tick accounting and of `usleep`.
pub const TIMER_HZ: u32 = 100;

/// Input clock of the 8253/8254 PIT.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// Maximum number of pending timed callbacks.
pub const MAX_TIMERS: usize = 32;
