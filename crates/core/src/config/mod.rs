use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub metronome: MetronomeConfig,
    pub recorder: RecorderConfig,
}

impl AppConfig {
    /// Loads a configuration file. Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Timing knobs of the scheduler clock loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between two clock ticks.
    pub clock_granularity_ms: u64,
    /// Look-ahead window, in seconds, used while playing without a loop end.
    pub schedule_ahead: f64,
}

impl SchedulerConfig {
    pub fn clock_granularity(&self) -> Duration {
        Duration::from_millis(self.clock_granularity_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clock_granularity_ms: 25,
            schedule_ahead: 0.1,
        }
    }
}

/// Configuration of the metronome tick generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    /// Length in seconds of each batch scheduled during open-ended playback.
    pub tick_batch_duration: f64,
    /// Length in seconds of a single tick blip.
    pub tick_duration: f64,
    pub accent_frequency: f32,
    pub beat_frequency: f32,
    pub gain: f32,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            tick_batch_duration: 10.0,
            tick_duration: 0.05,
            accent_frequency: 1000.0,
            beat_frequency: 800.0,
            gain: 0.5,
        }
    }
}

/// Configuration options for the recording subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Size of the chunks appended to the audio store while capturing.
    pub chunk_ms: u64,
    /// Delay between a pause/stop and the final capture flush.
    pub trailing_delay_ms: u64,
}

impl RecorderConfig {
    pub fn chunk(&self) -> Duration {
        Duration::from_millis(self.chunk_ms)
    }

    pub fn trailing_delay(&self) -> Duration {
        Duration::from_millis(self.trailing_delay_ms)
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 100,
            trailing_delay_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "metronome": { "tick_batch_duration": 4.0 } }"#).unwrap();

        assert_eq!(config.metronome.tick_batch_duration, 4.0);
        assert_eq!(config.metronome.tick_duration, 0.05);
        assert_eq!(config.scheduler.clock_granularity(), Duration::from_millis(25));
        assert_eq!(config.recorder.trailing_delay(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_malformed_documents() {
        let err = AppConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::LooplineError::Json(_)));
    }
}
