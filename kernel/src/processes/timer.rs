//! Pending timed callbacks, advanced from the timer interrupt.

use arrayvec::ArrayVec;

use crate::constants::timer::MAX_TIMERS;

/// Runs in interrupt context with the scheduler locked.
pub type TimerCallback = fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    QueueFull,
    ZeroPeriod,
}

impl core::fmt::Display for TimerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TimerError::QueueFull => write!(f, "Timer queue is full"),
            TimerError::ZeroPeriod => write!(f, "Repeating timer needs a non-zero period"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    remaining_ms: u64,
    period_ms: u64,
    repeat: bool,
    callback: TimerCallback,
    arg: usize,
}

/// Timers ordered by time left; equal deadlines fire in insertion order.
pub struct TimerQueue {
    timers: ArrayVec<Timer, MAX_TIMERS>,
    next_id: u32,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub const fn new() -> Self {
        TimerQueue {
            timers: ArrayVec::new_const(),
            next_id: 0,
        }
    }

    /// Arms a timer that fires after `delay_ms`, and every `delay_ms` after
    /// that if `repeat` is set.
    pub fn add(
        &mut self,
        delay_ms: u64,
        callback: TimerCallback,
        arg: usize,
        repeat: bool,
    ) -> Result<TimerId, TimerError> {
        if repeat && delay_ms == 0 {
            return Err(TimerError::ZeroPeriod);
        }
        if self.timers.is_full() {
            return Err(TimerError::QueueFull);
        }

        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        self.insert(Timer {
            id,
            remaining_ms: delay_ms,
            period_ms: delay_ms,
            repeat,
            callback,
            arg,
        });
        Ok(id)
    }

    /// Disarms a timer. Returns false if it already fired or never existed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|timer| timer.id == id) {
            Some(index) => {
                self.timers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Moves time forward by `elapsed_ms` and runs every timer that came due.
    /// A repeating timer runs once for each period that elapsed. Returns the
    /// number of callbacks made.
    pub fn advance(&mut self, elapsed_ms: u64) -> usize {
        let due = self
            .timers
            .iter()
            .take_while(|timer| timer.remaining_ms <= elapsed_ms)
            .count();
        let expired: ArrayVec<Timer, MAX_TIMERS> = self.timers.drain(..due).collect();

        for timer in self.timers.iter_mut() {
            timer.remaining_ms -= elapsed_ms;
        }

        let mut runs: ArrayVec<(Timer, u64), MAX_TIMERS> = ArrayVec::new();
        for timer in expired {
            let overshoot = elapsed_ms - timer.remaining_ms;
            if timer.repeat {
                let times = 1 + overshoot / timer.period_ms;
                self.insert(Timer {
                    remaining_ms: timer.period_ms - overshoot % timer.period_ms,
                    ..timer
                });
                runs.push((timer, times));
            } else {
                runs.push((timer, 1));
            }
        }

        let mut calls = 0;
        for (timer, times) in &runs {
            for _ in 0..*times {
                (timer.callback)(timer.arg);
                calls += 1;
            }
        }
        calls
    }

    /// Milliseconds until the next timer fires.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.first().map(|timer| timer.remaining_ms)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn insert(&mut self, timer: Timer) {
        let at = self
            .timers
            .partition_point(|other| other.remaining_ms <= timer.remaining_ms);
        self.timers.insert(at, timer);
    }
}
