//! Core library for the Loopline audio timeline.
//!
//! The crate keeps playback of a collaborative timeline in step with the
//! hardware audio clock. Each module owns a distinct subsystem: the transport
//! and event scheduler, event geometry, the tempo map and metronome, capture
//! of new takes, and the adapter that turns timeline data into scheduler
//! events. Audio output and capture devices are reached through small traits
//! so the core stays testable without hardware.

pub mod clock;
pub mod config;
pub mod error;
pub mod geometry;
pub mod metronome;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod tempo;
pub mod timeline;

pub use clock::{AudioClock, ManualClock, SystemAudioClock};
pub use config::{AppConfig, MetronomeConfig, RecorderConfig, SchedulerConfig};
pub use error::{LooplineError, Result};
pub use geometry::{
    active_recording_event_id, calculate_event_scheduling, create_active_recording_event,
    ActiveRecording, ActiveRecordingWindow, ClipBounds, ContentPlacement, ScheduledWindow,
};
pub use metronome::{beats, Beat, Metronome, Tone, ToneSink};
pub use record::{CabMode, MediaCapture, ProgramArgs, RecordedTake, Recorder, RecorderProgram};
pub use scheduler::{
    ActivationKey, AudioNode, Channel, DispatchArgs, Dispatched, EventPatch, LoopRegion,
    NodeCompletion, Scheduler, SchedulerEvent, Subscription, TransportEvent, TransportState,
};
pub use store::{AudioStore, StoredAudio};
pub use tempo::{
    MeasureMap, MeasureMapFn, MeasureStart, MetronomeSound, Section, SectionInfo, TempoMap,
};
pub use timeline::{
    Clip, ClipPlayer, ContentKind, ContentSegment, TakeFollower, TimelineDocument, TimelineSync,
};
