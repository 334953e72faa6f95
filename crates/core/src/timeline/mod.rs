//! Bridges timeline data to scheduler events.
//!
//! Clips and their content segments arrive as plain data from the state layer.
//! [`TimelineSync`] keeps one scheduler event per audible segment and
//! [`TakeFollower`] plays back an in-progress loop recording pass by pass.

use std::{cell::RefCell, collections::BTreeSet, fmt, path::Path, rc::Rc};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    geometry::{
        calculate_event_scheduling, create_active_recording_event, ActiveRecording,
        ClipBounds, ContentPlacement,
    },
    scheduler::{
        Channel, DispatchArgs, Dispatched, LoopRegion, Scheduler, SchedulerEvent, Subscription,
        TransportEvent,
    },
    tempo::TempoMap,
    LooplineError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Audio,
    Midi,
}

/// A piece of source material placed inside a clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSegment {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ContentKind,
    /// Start relative to the clip.
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub audio_store_key: Option<String>,
}

impl ContentSegment {
    fn placement(&self) -> ContentPlacement {
        ContentPlacement {
            start: self.start,
            duration: self.duration,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub content: Vec<ContentSegment>,
}

impl Clip {
    fn bounds(&self) -> ClipBounds {
        ClipBounds {
            start: self.start,
            duration: self.duration,
        }
    }
}

/// Plays stored audio for scheduler dispatches.
pub trait ClipPlayer {
    fn play(&self, audio_store_key: &str, args: &DispatchArgs) -> Dispatched;
}

pub fn content_event_id(clip_id: &str, segment_id: &str) -> String {
    format!("content:{clip_id}:{segment_id}")
}

fn playback_event(
    id: String,
    start: f64,
    audio_store_key: String,
    player: Rc<dyn ClipPlayer>,
) -> SchedulerEvent {
    SchedulerEvent::new(id, start, move |args| player.play(&audio_store_key, args))
}

/// Mirrors a set of clips into scheduler events.
pub struct TimelineSync {
    player: Rc<dyn ClipPlayer>,
    registered: BTreeSet<String>,
}

impl TimelineSync {
    pub fn new(player: Rc<dyn ClipPlayer>) -> Self {
        Self {
            player,
            registered: BTreeSet::new(),
        }
    }

    /// Registers every audible audio segment of `clips` and removes events for
    /// segments that went away or fell outside their clip.
    ///
    /// Every segment is resolved before the scheduler is touched, so a failing
    /// segment leaves the previous registration in place.
    pub fn sync_clips(&mut self, scheduler: &mut Scheduler, clips: &[Clip]) -> Result<()> {
        let mut resolved = Vec::new();
        for clip in clips {
            for segment in &clip.content {
                if segment.kind != ContentKind::Audio {
                    continue;
                }
                let Some(key) = &segment.audio_store_key else {
                    continue;
                };

                let window = calculate_event_scheduling(&segment.placement(), &clip.bounds())?;
                if window.is_audible() {
                    resolved.push((content_event_id(&clip.id, &segment.id), key, window));
                }
            }
        }

        let mut desired = BTreeSet::new();
        for (id, key, window) in resolved {
            let player = self.player.clone();
            let event = playback_event(id.clone(), window.start, key.clone(), player);
            scheduler.add_event(
                event
                    .with_duration(window.duration)
                    .with_offset(window.offset),
            );
            desired.insert(id);
        }

        let stale: Vec<String> = self.registered.difference(&desired).cloned().collect();
        for id in &stale {
            scheduler.remove_event(id);
        }
        debug!(events = desired.len(), removed = stale.len(), "timeline synced");
        self.registered = desired;
        Ok(())
    }

    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.registered.iter().map(String::as_str)
    }

    /// Removes every event this sync registered.
    pub fn clear(&mut self, scheduler: &mut Scheduler) {
        for id in std::mem::take(&mut self.registered) {
            scheduler.remove_event(&id);
        }
    }
}

impl fmt::Debug for TimelineSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineSync")
            .field("registered", &self.registered)
            .finish()
    }
}

/// A pass registered for playback. Looping passes are bound to the loop
/// iteration right after the one they were recorded in.
struct QueuedPass {
    id: String,
    iteration: Option<i64>,
}

struct FollowerState {
    recording: ActiveRecording,
    player: Rc<dyn ClipPlayer>,
    /// Loop iteration pass 0 was recorded in, set once following starts.
    base: Option<i64>,
    halted: bool,
    queued: Vec<QueuedPass>,
}

impl FollowerState {
    fn queue(&mut self, scheduler: &mut Scheduler, pass: u32, iteration: Option<i64>) -> Result<()> {
        let window = create_active_recording_event(&self.recording, pass)?;
        let mut event = playback_event(
            window.id.clone(),
            window.start,
            self.recording.audio_store_key.clone(),
            self.player.clone(),
        )
        .with_offset(window.offset);
        event.duration = window.duration;
        if let Some(iteration) = iteration {
            event = event.in_iteration(iteration);
        }
        scheduler.add_event(event);
        debug!(id = %window.id, ?iteration, "recording pass queued");

        self.queued.push(QueuedPass {
            id: window.id,
            iteration,
        });
        Ok(())
    }

    fn start(&mut self, scheduler: &mut Scheduler) -> Result<()> {
        let base = scheduler.loop_iteration();
        self.base = Some(base);
        self.queue(scheduler, 0, Some(base + 1))
    }

    /// Entering `iteration` drops passes that already played and queues the
    /// pass being recorded now for the iteration after it.
    fn advance(&mut self, scheduler: &mut Scheduler, iteration: i64) -> Result<()> {
        let Some(base) = self.base else {
            return Ok(());
        };

        self.queued.retain(|pass| {
            if pass.iteration.is_some_and(|only| only < iteration) {
                scheduler.remove_event(&pass.id);
                false
            } else {
                true
            }
        });

        let pass = u32::try_from(iteration - base)
            .map_err(|_| LooplineError::InvalidInput("loop iteration precedes the take"))?;
        self.queue(scheduler, pass, Some(iteration + 1))
    }

    fn halt(&mut self, scheduler: &mut Scheduler) {
        for pass in self.queued.drain(..) {
            scheduler.remove_event(&pass.id);
        }
        self.halted = true;
    }
}

/// Plays back the latest completed pass of a loop recording while it is still
/// being captured.
///
/// Each pass is queued one iteration ahead so the scheduler's look-ahead starts
/// it exactly on the loop seam. Following ends at the first pause, stop or
/// seek, since those end the take.
pub struct TakeFollower {
    state: Rc<RefCell<FollowerState>>,
    subscriptions: Vec<Subscription>,
}

impl TakeFollower {
    pub fn attach(
        scheduler: &mut Scheduler,
        recording: ActiveRecording,
        player: Rc<dyn ClipPlayer>,
    ) -> Result<Self> {
        let looping = recording.cab_duration.is_some();
        let state = Rc::new(RefCell::new(FollowerState {
            recording,
            player,
            base: None,
            halted: false,
            queued: Vec::new(),
        }));

        if !looping {
            state.borrow_mut().queue(scheduler, 0, None)?;
            return Ok(Self {
                state,
                subscriptions: Vec::new(),
            });
        }

        if scheduler.is_playing() {
            state.borrow_mut().start(scheduler)?;
        }

        let mut subscriptions = Vec::new();
        for channel in [
            Channel::Play,
            Channel::AfterLoop,
            Channel::Pause,
            Channel::Stop,
            Channel::Seek,
        ] {
            let listener = state.clone();
            subscriptions.push(scheduler.subscribe(channel, move |scheduler, event| {
                let mut state = listener.borrow_mut();
                if state.halted {
                    return;
                }
                let result = match event {
                    TransportEvent::Play { .. } if state.base.is_none() => state.start(scheduler),
                    TransportEvent::AfterLoop { iteration, .. } => {
                        state.advance(scheduler, *iteration)
                    }
                    TransportEvent::Pause { .. } | TransportEvent::Stop | TransportEvent::Seek { .. }
                        if state.base.is_some() =>
                    {
                        state.halt(scheduler);
                        Ok(())
                    }
                    _ => Ok(()),
                };
                if let Err(err) = result {
                    error!(%err, "failed to follow recording pass");
                }
            }));
        }

        Ok(Self {
            state,
            subscriptions,
        })
    }

    /// Event id of the most recently queued pass.
    pub fn current_event(&self) -> Option<String> {
        self.state.borrow().queued.last().map(|pass| pass.id.clone())
    }

    pub fn detach(self, scheduler: &mut Scheduler) {
        for subscription in self.subscriptions {
            scheduler.unsubscribe(subscription);
        }
        self.state.borrow_mut().halt(scheduler);
    }
}

impl fmt::Debug for TakeFollower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TakeFollower")
            .field("key", &state.recording.audio_store_key)
            .field("base", &state.base)
            .field("current", &state.queued.last().map(|pass| &pass.id))
            .finish()
    }
}

/// Timeline description consumed by the command line player.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineDocument {
    pub clips: Vec<Clip>,
    pub tempo: Option<TempoMap>,
    pub loop_region: LoopRegion,
}

impl TimelineDocument {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut document: Self = serde_json::from_str(raw)?;
        if let Some(tempo) = document.tempo.as_mut() {
            tempo.rebuild()?;
        }
        LoopRegion::new(document.loop_region.start, document.loop_region.end)?;
        Ok(document)
    }

    /// The document's tempo map, or 4/4 at 120 BPM when it has none.
    pub fn tempo_map(&self) -> Result<TempoMap> {
        match &self.tempo {
            Some(tempo) => Ok(tempo.clone()),
            None => TempoMap::constant(120.0, 4),
        }
    }
}
