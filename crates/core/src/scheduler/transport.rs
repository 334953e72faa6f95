use serde::{Deserialize, Serialize};

use crate::{LooplineError, Result};

/// Loop region `[start, end)`. Without an end, playback is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoopRegion {
    pub start: f64,
    #[serde(default)]
    pub end: Option<f64>,
}

impl LoopRegion {
    pub fn new(start: f64, end: Option<f64>) -> Result<Self> {
        if !start.is_finite() {
            return Err(LooplineError::InvalidInput("loop start must be finite"));
        }
        if let Some(end) = end {
            if !end.is_finite() || end <= start {
                return Err(LooplineError::InvalidLoopRegion { start, end });
            }
        }
        Ok(Self { start, end })
    }

    pub fn open(start: f64) -> Self {
        Self { start, end: None }
    }

    pub fn len(&self) -> Option<f64> {
        self.end.map(|end| end - self.start)
    }

    pub fn is_looping(&self) -> bool {
        self.end.is_some()
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && self.end.map_or(true, |end| time < end)
    }

    /// Loop iteration an unwrapped position belongs to.
    pub(crate) fn iteration(&self, position: f64) -> i64 {
        match self.len() {
            Some(len) => (position / len).floor() as i64,
            None => 0,
        }
    }

    /// Timecode of an unwrapped position.
    pub(crate) fn wrap(&self, position: f64) -> f64 {
        match self.len() {
            Some(len) => self.start + position.rem_euclid(len),
            None => self.start + position,
        }
    }

    /// Unwrapped position a transport resting at `time` resumes from.
    pub(crate) fn phase_of(&self, time: f64) -> f64 {
        if self.contains(time) {
            time - self.start
        } else {
            0.0
        }
    }
}

/// Transport state. Exactly one time base is authoritative in each state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportState {
    Idle {
        time: f64,
    },
    /// `origin` is the hardware time play began at, `phase` the unwrapped
    /// position (relative to the loop start) at that moment.
    Playing {
        origin: f64,
        phase: f64,
    },
    Paused {
        time: f64,
    },
}

impl Default for TransportState {
    fn default() -> Self {
        Self::Idle { time: 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_regions() {
        assert!(matches!(
            LoopRegion::new(4.0, Some(4.0)),
            Err(LooplineError::InvalidLoopRegion { .. })
        ));
        assert!(LoopRegion::new(f64::NAN, None).is_err());
        assert!(LoopRegion::new(-2.0, Some(1.0)).is_ok());
    }

    #[test]
    fn wraps_positions_into_the_region() {
        let region = LoopRegion::new(1.0, Some(5.0)).unwrap();

        assert_eq!(region.wrap(3.0), 4.0);
        assert_eq!(region.wrap(4.0), 1.0);
        assert_eq!(region.wrap(9.5), 2.5);
        assert_eq!(region.iteration(3.9), 0);
        assert_eq!(region.iteration(8.0), 2);
    }

    #[test]
    fn open_regions_never_wrap() {
        let region = LoopRegion::open(2.0);

        assert_eq!(region.wrap(100.0), 102.0);
        assert_eq!(region.iteration(100.0), 0);
        assert_eq!(region.phase_of(1.0), 0.0);
        assert_eq!(region.phase_of(3.0), 1.0);
    }
}
