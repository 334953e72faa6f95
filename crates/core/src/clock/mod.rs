use std::{cell::Cell, fmt, rc::Rc, time::Instant};

/// Source of hardware audio time, in seconds.
///
/// The scheduler only ever reads this clock. It is expected to be monotonic
/// but may drift against wall-clock timers.
pub trait AudioClock {
    fn now(&self) -> f64;
}

/// Audio clock backed by the system's monotonic timer.
#[derive(Debug, Clone)]
pub struct SystemAudioClock {
    started: Instant,
}

impl SystemAudioClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemAudioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemAudioClock {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock. Clones share the same time so a test can keep a handle
/// while the scheduler owns another.
#[derive(Clone, Default)]
pub struct ManualClock {
    time: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.time.set(seconds);
    }

    pub fn advance(&self, delta: f64) {
        self.time.set(self.time.get() + delta);
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        self.time.get()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("time", &self.time.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let handle = clock.clone();

        handle.advance(1.5);
        handle.advance(0.5);
        assert_eq!(clock.now(), 2.0);

        clock.set(0.25);
        assert_eq!(handle.now(), 0.25);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemAudioClock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
