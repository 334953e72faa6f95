//! Transport state machine and event dispatch.
//!
//! The [`Scheduler`] owns the transport, the event registry and the table of
//! dispatched activations. A driver calls [`Scheduler::tick`] on a fixed
//! interval. Each tick reads the hardware clock, derives the timecode and
//! dispatches every event whose window falls inside the look-ahead horizon:
//! the current and the next loop iteration when looping, or
//! `schedule_ahead` seconds when playing open-ended.
//!
//! Positions inside this module are "unwrapped": seconds since the loop start,
//! counting every completed iteration. The timecode is the unwrapped position
//! folded back into the loop region.

mod event;
mod listeners;
mod transport;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
};

use tracing::{debug, trace};

pub use event::{
    ActivationKey, AudioNode, DispatchArgs, Dispatched, EventPatch, NodeCompletion, SchedulerEvent,
};
pub use listeners::{Channel, Subscription, TransportEvent};
pub use transport::{LoopRegion, TransportState};

use crate::{clock::AudioClock, config::SchedulerConfig, Result};
use event::CompletedNode;
use listeners::ListenerRegistry;

const TIME_EPSILON: f64 = 1e-9;

fn same_time(a: f64, b: f64) -> bool {
    (a - b).abs() < TIME_EPSILON
}

/// One dispatched occurrence of an event.
struct Activation {
    cancelled: Arc<AtomicBool>,
    node: Option<Box<dyn AudioNode>>,
    start: f64,
    end: Option<f64>,
    offset: f64,
}

impl Activation {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(mut node) = self.node.take() {
            node.stop();
        }
    }
}

/// Unwrapped window of an event within one loop iteration.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: f64,
    end: Option<f64>,
    offset: f64,
}

fn window(event: &SchedulerEvent, region: &LoopRegion, iteration: i64) -> Option<Window> {
    if !event.plays_in(iteration) {
        return None;
    }

    let relative = event.start - region.start;
    let start = relative.max(0.0);
    let offset = event.offset + (start - relative);

    match region.len() {
        Some(len) => {
            let end = event.duration.map_or(len, |duration| (relative + duration).min(len));
            if end <= start {
                return None;
            }
            let base = iteration as f64 * len;
            Some(Window {
                start: base + start,
                end: Some(base + end),
                offset,
            })
        }
        None => {
            let end = event.duration.map(|duration| relative + duration);
            if end.is_some_and(|end| end <= start) {
                return None;
            }
            Some(Window { start, end, offset })
        }
    }
}

/// Snapshot of a running transport.
#[derive(Debug, Clone, Copy)]
struct Playhead {
    now: f64,
    origin: f64,
    phase: f64,
    position: f64,
}

impl Playhead {
    fn hardware_time(&self, position: f64) -> f64 {
        self.origin + (position - self.phase)
    }
}

/// Software clock that keeps registered events in step with the hardware
/// audio clock.
pub struct Scheduler {
    clock: Box<dyn AudioClock>,
    config: SchedulerConfig,
    transport: TransportState,
    region: LoopRegion,
    iteration: i64,
    events: BTreeMap<String, SchedulerEvent>,
    activations: HashMap<ActivationKey, Activation>,
    completion_tx: Sender<CompletedNode>,
    completion_rx: Receiver<CompletedNode>,
    listeners: ListenerRegistry,
}

impl Scheduler {
    pub fn new(clock: impl AudioClock + 'static, config: SchedulerConfig) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel();
        Self {
            clock: Box::new(clock),
            config,
            transport: TransportState::default(),
            region: LoopRegion::default(),
            iteration: 0,
            events: BTreeMap::new(),
            activations: HashMap::new(),
            completion_tx,
            completion_rx,
            listeners: ListenerRegistry::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.region
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.transport, TransportState::Playing { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.transport, TransportState::Paused { .. })
    }

    /// Current position on the timeline, valid in every transport state.
    pub fn timecode(&self) -> f64 {
        match self.transport {
            TransportState::Idle { time } | TransportState::Paused { time } => time,
            TransportState::Playing { origin, phase } => {
                self.region.wrap(phase + self.clock.now() - origin)
            }
        }
    }

    pub fn has_event(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    pub fn event(&self, id: &str) -> Option<&SchedulerEvent> {
        self.events.get(id)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Number of dispatched nodes currently tracked.
    pub fn live_node_count(&self) -> usize {
        self.activations
            .values()
            .filter(|activation| activation.node.is_some())
            .count()
    }

    /// Loop iteration the transport is in. Restarts at zero on every play.
    pub fn loop_iteration(&self) -> i64 {
        self.iteration
    }

    pub fn is_dispatched(&self, id: &str, iteration: i64) -> bool {
        self.activations.contains_key(&ActivationKey {
            event_id: id.to_string(),
            iteration,
        })
    }

    // -------------------------------
    // MARK: Transport
    // -------------------------------

    /// Starts or resumes playback from the idle or paused position.
    pub fn play(&mut self) {
        self.drain_completions();
        let time = match self.transport {
            TransportState::Playing { .. } => return,
            TransportState::Idle { time } | TransportState::Paused { time } => time,
        };

        // Leftovers of a paused run were timed against the old origin.
        self.cancel_all();

        let phase = self.region.phase_of(time);
        self.transport = TransportState::Playing {
            origin: self.clock.now(),
            phase,
        };
        self.iteration = self.region.iteration(phase);

        let timecode = self.region.wrap(phase);
        debug!(timecode, "play");
        self.schedule();
        self.emit(TransportEvent::Play { timecode });
    }

    /// Freezes the timecode. Nodes that are already sounding ring out, nodes
    /// scheduled to start later are stopped.
    pub fn pause(&mut self) {
        self.drain_completions();
        let Some(head) = self.playhead() else {
            return;
        };

        self.activations.retain(|_, activation| {
            if activation.start > head.position {
                activation.cancel();
                false
            } else {
                true
            }
        });

        let timecode = self.region.wrap(head.position);
        self.transport = TransportState::Paused { time: timecode };
        debug!(timecode, "pause");
        self.emit(TransportEvent::Pause { timecode });
    }

    /// Stops every tracked node and rewinds to the loop start.
    pub fn stop(&mut self) {
        if matches!(self.transport, TransportState::Idle { .. }) {
            return;
        }

        self.drain_completions();
        self.cancel_all();
        self.transport = TransportState::Idle {
            time: self.region.start,
        };
        self.iteration = 0;
        debug!("stop");
        self.emit(TransportEvent::Stop);
    }

    /// Sets the loop region to `[start, end)` and moves the transport there.
    ///
    /// While playing, keeping the loop start and staying inside the new region
    /// repositions in place. Every other change pauses, moves and resumes.
    pub fn seek(&mut self, start: f64, end: Option<f64>) -> Result<()> {
        let region = LoopRegion::new(start, end)?;
        self.drain_completions();

        match self.transport {
            TransportState::Idle { .. } => {
                self.region = region;
                self.transport = TransportState::Idle { time: start };
                self.emit_seek(start);
            }
            TransportState::Paused { .. } => {
                self.region = region;
                self.transport = TransportState::Paused { time: start };
                self.emit_seek(start);
            }
            TransportState::Playing { .. } => {
                let timecode = self.timecode();
                if same_time(region.start, self.region.start) && region.contains(timecode) {
                    self.reposition(region, timecode);
                    self.emit_seek(timecode);
                } else {
                    self.pause();
                    self.region = region;
                    self.transport = TransportState::Paused { time: start };
                    self.emit_seek(start);
                    self.play();
                }
            }
        }

        Ok(())
    }

    /// Clock loop body. Call every [`SchedulerConfig::clock_granularity`].
    pub fn tick(&mut self) {
        self.drain_completions();
        let Some(head) = self.playhead() else {
            return;
        };

        self.prune_finished(head.position);

        let current = self.region.iteration(head.position);
        let timecode = self.region.wrap(head.position);
        for iteration in self.iteration + 1..=current {
            self.iteration = iteration;
            trace!(iteration, timecode, "loop wrapped");
            self.emit(TransportEvent::AfterLoop {
                iteration,
                timecode,
            });
        }

        self.schedule();

        if self.is_playing() {
            let timecode = self.timecode();
            self.emit(TransportEvent::ClockTick { timecode });
        }
    }

    // -------------------------------
    // MARK: Event registry
    // -------------------------------

    /// Registers `event`, replacing any event with the same id.
    ///
    /// Re-adding an event with unchanged timing keeps its dispatched nodes.
    pub fn add_event(&mut self, event: SchedulerEvent) {
        self.drain_completions();
        if let Some(existing) = self.events.get(&event.id) {
            if !existing.same_geometry(&event) {
                self.cancel_activations(&event.id);
            }
        }

        self.events.insert(event.id.clone(), event);
        self.schedule();
    }

    /// Patches the timing of a registered event. Returns `false` for unknown ids.
    ///
    /// A sounding node whose start and offset are unchanged is retimed in
    /// place. Anything else is cancelled and dispatched again.
    pub fn update_event(&mut self, id: &str, patch: EventPatch) -> bool {
        self.drain_completions();
        let Some(event) = self.events.get_mut(id) else {
            debug!(id, "update of unknown event ignored");
            return false;
        };
        patch.apply(event);
        let event = event.clone();

        if let Some(head) = self.playhead() {
            let keys: Vec<ActivationKey> = self
                .activations
                .keys()
                .filter(|key| key.event_id == id)
                .cloned()
                .collect();

            for key in keys {
                let updated = window(&event, &self.region, key.iteration);
                let Some(activation) = self.activations.get_mut(&key) else {
                    continue;
                };

                match updated {
                    Some(updated)
                        if activation.start <= head.position
                            && same_time(updated.start, activation.start)
                            && same_time(updated.offset, activation.offset)
                            && updated.end.map_or(true, |end| end > head.position) =>
                    {
                        if updated.end != activation.end {
                            if let Some(node) = activation.node.as_mut() {
                                node.set_end(updated.end.map(|end| head.hardware_time(end)));
                            }
                            activation.end = updated.end;
                        }
                    }
                    _ => {
                        if let Some(mut activation) = self.activations.remove(&key) {
                            activation.cancel();
                        }
                    }
                }
            }
        }

        self.schedule();
        true
    }

    /// Unregisters an event and stops its nodes. Unknown ids are ignored.
    pub fn remove_event(&mut self, id: &str) {
        self.drain_completions();
        if self.events.remove(id).is_none() {
            trace!(id, "removal of unknown event ignored");
        }
        self.cancel_activations(id);
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
        self.cancel_all();
    }

    // -------------------------------
    // MARK: Listeners
    // -------------------------------

    pub fn subscribe(
        &mut self,
        channel: Channel,
        listener: impl FnMut(&mut Scheduler, &TransportEvent) + 'static,
    ) -> Subscription {
        self.listeners.subscribe(channel, Box::new(listener))
    }

    /// Removes one listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.listeners.unsubscribe(subscription)
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.listeners.len(channel)
    }

    fn emit_seek(&mut self, timecode: f64) {
        let LoopRegion { start, end } = self.region;
        debug!(start, ?end, timecode, "seek");
        self.emit(TransportEvent::Seek {
            start,
            end,
            timecode,
        });
    }

    fn emit(&mut self, event: TransportEvent) {
        let channel = event.channel();
        if self.listeners.is_emitting(channel) {
            debug!(?channel, "re-entrant emission skipped");
            return;
        }

        let mut entries = self.listeners.take(channel);
        for entry in entries.iter_mut() {
            if !self.listeners.is_cancelled(entry) {
                entry.call(self, &event);
            }
        }
        self.listeners.restore(channel, entries);
    }

    // -------------------------------
    // MARK: Dispatch
    // -------------------------------

    fn playhead(&self) -> Option<Playhead> {
        match self.transport {
            TransportState::Playing { origin, phase } => {
                let now = self.clock.now();
                Some(Playhead {
                    now,
                    origin,
                    phase,
                    position: phase + (now - origin),
                })
            }
            _ => None,
        }
    }

    fn schedule(&mut self) {
        let Some(head) = self.playhead() else {
            return;
        };

        let current = self.region.iteration(head.position);
        let (horizon, iterations) = match self.region.len() {
            Some(len) => ((current + 2) as f64 * len, current..=current + 1),
            None => (head.position + self.config.schedule_ahead, 0..=0),
        };

        let mut due = Vec::new();
        for event in self.events.values() {
            for iteration in iterations.clone() {
                let key = ActivationKey {
                    event_id: event.id.clone(),
                    iteration,
                };
                if self.activations.contains_key(&key) {
                    continue;
                }
                let Some(window) = window(event, &self.region, iteration) else {
                    continue;
                };
                if window.start >= horizon || window.end.is_some_and(|end| end <= head.position) {
                    continue;
                }
                due.push((key, window));
            }
        }

        for (key, window) in due {
            self.dispatch(key, window, &head);
        }
    }

    fn dispatch(&mut self, key: ActivationKey, window: Window, head: &Playhead) {
        let Some(event) = self.events.get(&key.event_id) else {
            return;
        };

        let catch_up = (head.position - window.start).max(0.0);
        let when = if catch_up > 0.0 {
            head.now
        } else {
            head.hardware_time(window.start)
        };
        let duration = window.end.map(|end| end - window.start - catch_up);
        let cancelled = Arc::new(AtomicBool::new(false));
        let completion =
            NodeCompletion::new(key.clone(), cancelled.clone(), self.completion_tx.clone());
        let args = DispatchArgs::new(
            head.now,
            when,
            window.offset + catch_up,
            duration,
            completion,
        );

        trace!(
            id = %key.event_id,
            iteration = key.iteration,
            when,
            offset = args.offset,
            ?duration,
            "dispatch"
        );

        let node = match event.dispatch(&args) {
            Dispatched::Node(node) => Some(node),
            Dispatched::Silent | Dispatched::Pending => None,
        };

        self.activations.insert(
            key,
            Activation {
                cancelled,
                node,
                start: window.start,
                end: window.end,
                offset: window.offset,
            },
        );
    }

    /// Moves nodes delivered by asynchronous dispatches into the table.
    fn drain_completions(&mut self) {
        while let Ok((key, cancelled, mut node)) = self.completion_rx.try_recv() {
            let live = self
                .activations
                .values_mut()
                .find(|activation| Arc::ptr_eq(&activation.cancelled, &cancelled));

            match live {
                Some(activation) if !cancelled.load(Ordering::Acquire) => {
                    if let Some(mut previous) = activation.node.replace(node) {
                        previous.stop();
                    }
                }
                _ => {
                    trace!(id = %key.event_id, "late node for cancelled activation stopped");
                    node.stop();
                }
            }
        }
    }

    /// Re-anchors a running transport at `timecode` inside `region` without
    /// interrupting nodes that are already sounding.
    fn reposition(&mut self, region: LoopRegion, timecode: f64) {
        let Some(head) = self.playhead() else {
            return;
        };

        let current = self.region.iteration(head.position);
        let previous_base = self.region.len().map_or(0.0, |len| current as f64 * len);
        let phase = timecode - region.start;

        self.region = region;
        self.transport = TransportState::Playing {
            origin: head.now,
            phase,
        };
        self.iteration = region.iteration(phase);

        let anchored = Playhead {
            now: head.now,
            origin: head.now,
            phase,
            position: phase,
        };

        for (key, mut activation) in std::mem::take(&mut self.activations) {
            let sounding = key.iteration == current && activation.start <= head.position;
            let updated = self
                .events
                .get(&key.event_id)
                .and_then(|event| window(event, &region, self.iteration));

            match updated {
                Some(updated)
                    if sounding
                        && same_time(updated.start, activation.start - previous_base)
                        && updated.end.map_or(true, |end| end > phase) =>
                {
                    let previous_end = activation.end.map(|end| end - previous_base);
                    let unchanged = match (previous_end, updated.end) {
                        (Some(a), Some(b)) => same_time(a, b),
                        (a, b) => a == b,
                    };
                    if !unchanged {
                        if let Some(node) = activation.node.as_mut() {
                            node.set_end(updated.end.map(|end| anchored.hardware_time(end)));
                        }
                    }
                    activation.start = updated.start;
                    activation.end = updated.end;
                    self.activations.insert(
                        ActivationKey {
                            event_id: key.event_id,
                            iteration: self.iteration,
                        },
                        activation,
                    );
                }
                _ => activation.cancel(),
            }
        }

        self.schedule();
    }

    /// Forgets activations whose window has fully elapsed.
    fn prune_finished(&mut self, position: f64) {
        self.activations
            .retain(|_, activation| activation.end.map_or(true, |end| end > position));
    }

    fn cancel_activations(&mut self, id: &str) {
        self.activations.retain(|key, activation| {
            if key.event_id == id {
                activation.cancel();
                false
            } else {
                true
            }
        });
    }

    fn cancel_all(&mut self) {
        for (_, mut activation) in self.activations.drain() {
            activation.cancel();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("transport", &self.transport)
            .field("region", &self.region)
            .field("iteration", &self.iteration)
            .field("events", &self.events.len())
            .field("activations", &self.activations.len())
            .finish()
    }
}
