//! Metronome ticks layered on top of the scheduler.
//!
//! The metronome never reads the clock itself. It reacts to `Seek` by
//! rebuilding its tick events and, while playing open-ended, to `ClockTick` by
//! extending the scheduled range one batch at a time.

use std::{cell::RefCell, collections::BTreeSet, f32::consts::TAU, fmt, rc::Rc};

use tracing::{debug, trace};

use crate::{
    config::MetronomeConfig,
    scheduler::{
        Channel, Dispatched, LoopRegion, Scheduler, SchedulerEvent, Subscription, TransportEvent,
    },
    tempo::{MeasureMap, MeasureMapFn, MetronomeSound},
};

const TICK_PREFIX: &str = "m_click:";

/// A short sine blip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency: f32,
    /// Seconds.
    pub duration: f64,
    pub gain: f32,
}

impl Tone {
    /// Renders the tone as an exponentially decaying sine burst.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let num_samples = (f64::from(sample_rate) * self.duration) as usize;
        (0..num_samples)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let envelope = (-t * 40.0).exp();
                (t * self.frequency * TAU).sin() * envelope * self.gain
            })
            .collect()
    }
}

/// Output the metronome plays its tones through.
pub trait ToneSink {
    /// Plays `tone` at hardware time `when`.
    fn play_tone(&self, tone: &Tone, when: f64) -> Dispatched;
}

pub fn tick_id(measure: i64, beat: u32) -> String {
    format!("{TICK_PREFIX}{measure}.{beat}")
}

/// An audible beat of the measure grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beat {
    pub measure: i64,
    pub index: u32,
    pub time: f64,
}

impl Beat {
    pub fn id(&self) -> String {
        tick_id(self.measure, self.index)
    }

    pub fn is_accent(&self) -> bool {
        self.index == 0
    }
}

/// Beats of `measure_map` that start in `[start, end)`. Measures whose section
/// has the metronome off contribute nothing.
pub fn beats(measure_map: &MeasureMap, start: f64, end: f64) -> Vec<Beat> {
    let mut beats = Vec::new();
    for (&measure, measure_start) in measure_map {
        let section = measure_start.section;
        if section.metronome_sound == MetronomeSound::Off {
            continue;
        }
        for index in 0..section.beats_per_bar {
            let time = measure_start.time_start + f64::from(index) * section.beat_duration();
            if time >= start && time < end {
                beats.push(Beat {
                    measure,
                    index,
                    time,
                });
            }
        }
    }
    beats
}

struct MetronomeState {
    measure_map: MeasureMapFn,
    sink: Rc<dyn ToneSink>,
    config: MetronomeConfig,
    ticks: BTreeSet<String>,
    /// End of the scheduled range while playing open-ended.
    horizon: Option<f64>,
}

impl MetronomeState {
    fn accent(&self) -> Tone {
        Tone {
            frequency: self.config.accent_frequency,
            duration: self.config.tick_duration,
            gain: self.config.gain,
        }
    }

    fn beat(&self) -> Tone {
        Tone {
            frequency: self.config.beat_frequency,
            ..self.accent()
        }
    }

    fn clear(&mut self, scheduler: &mut Scheduler) {
        for id in std::mem::take(&mut self.ticks) {
            scheduler.remove_event(&id);
        }
    }

    /// Rebuilds every tick for a transport sitting at `timecode` in `region`.
    fn reset(&mut self, scheduler: &mut Scheduler, region: LoopRegion, timecode: f64) {
        self.clear(scheduler);
        match region.end {
            Some(end) => {
                self.horizon = None;
                self.schedule_ticks(scheduler, region.start, end);
            }
            None => {
                let horizon = timecode + self.config.tick_batch_duration;
                self.horizon = Some(horizon);
                self.schedule_ticks(scheduler, timecode, horizon);
            }
        }
    }

    fn extend(&mut self, scheduler: &mut Scheduler, timecode: f64) {
        let Some(horizon) = self.horizon else {
            return;
        };
        let batch = self.config.tick_batch_duration;
        if timecode >= horizon - batch {
            self.horizon = Some(horizon + batch);
            self.schedule_ticks(scheduler, horizon, horizon + batch);
        }
    }

    /// Registers a tick for every beat in `[start, end)` that is not already
    /// registered.
    fn schedule_ticks(&mut self, scheduler: &mut Scheduler, start: f64, end: f64) {
        let accent = self.accent();
        let beat = self.beat();
        let mut added = 0usize;

        for tick in beats(&(self.measure_map)(start, end), start, end) {
            let id = tick.id();
            if self.ticks.contains(&id) {
                continue;
            }

            let tone = if tick.is_accent() { accent } else { beat };
            let sink = self.sink.clone();
            let event = SchedulerEvent::new(id.clone(), tick.time, move |args| {
                sink.play_tone(&tone, args.when)
            });
            scheduler.add_event(event.with_duration(tone.duration));
            self.ticks.insert(id);
            added += 1;
        }

        trace!(start, end, added, "metronome ticks scheduled");
    }
}

/// Keeps tick events in the scheduler in step with the transport.
pub struct Metronome {
    state: Rc<RefCell<MetronomeState>>,
    subscriptions: Vec<Subscription>,
}

impl Metronome {
    /// Subscribes to the scheduler and schedules ticks for its current region.
    pub fn attach(
        scheduler: &mut Scheduler,
        measure_map: MeasureMapFn,
        sink: Rc<dyn ToneSink>,
        config: MetronomeConfig,
    ) -> Self {
        let state = Rc::new(RefCell::new(MetronomeState {
            measure_map,
            sink,
            config,
            ticks: BTreeSet::new(),
            horizon: None,
        }));

        let on_seek = {
            let state = state.clone();
            scheduler.subscribe(Channel::Seek, move |scheduler, event| {
                if let TransportEvent::Seek {
                    start,
                    end,
                    timecode,
                } = *event
                {
                    let region = LoopRegion { start, end };
                    state.borrow_mut().reset(scheduler, region, timecode);
                }
            })
        };
        let on_tick = {
            let state = state.clone();
            scheduler.subscribe(Channel::ClockTick, move |scheduler, event| {
                if let TransportEvent::ClockTick { timecode } = *event {
                    state.borrow_mut().extend(scheduler, timecode);
                }
            })
        };

        let region = scheduler.loop_region();
        let timecode = scheduler.timecode();
        state.borrow_mut().reset(scheduler, region, timecode);
        debug!(ticks = state.borrow().ticks.len(), "metronome attached");

        Self {
            state,
            subscriptions: vec![on_seek, on_tick],
        }
    }

    /// Swaps the tempo lookup and reschedules from the current position.
    pub fn update_measure_map(&self, scheduler: &mut Scheduler, measure_map: MeasureMapFn) {
        let region = scheduler.loop_region();
        let timecode = scheduler.timecode();
        let mut state = self.state.borrow_mut();
        state.measure_map = measure_map;
        state.reset(scheduler, region, timecode);
    }

    pub fn tick_count(&self) -> usize {
        self.state.borrow().ticks.len()
    }

    /// Ids of the registered ticks, in lexical order.
    pub fn scheduled_ticks(&self) -> Vec<String> {
        self.state.borrow().ticks.iter().cloned().collect()
    }

    /// Unsubscribes and removes every tick event.
    pub fn detach(self, scheduler: &mut Scheduler) {
        for subscription in &self.subscriptions {
            scheduler.unsubscribe(*subscription);
        }
        self.state.borrow_mut().clear(scheduler);
        debug!("metronome detached");
    }
}

impl fmt::Debug for Metronome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Metronome")
            .field("ticks", &state.ticks.len())
            .field("horizon", &state.horizon)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::SchedulerConfig,
        tempo::{Section, TempoMap},
    };

    #[derive(Default)]
    struct RecordingSink {
        played: RefCell<Vec<(f32, f64)>>,
    }

    impl ToneSink for RecordingSink {
        fn play_tone(&self, tone: &Tone, when: f64) -> Dispatched {
            self.played.borrow_mut().push((tone.frequency, when));
            Dispatched::Silent
        }
    }

    fn setup(
        tempo: TempoMap,
        config: MetronomeConfig,
    ) -> (Scheduler, ManualClock, Metronome, Rc<RecordingSink>) {
        let clock = ManualClock::new();
        let mut scheduler = Scheduler::new(clock.clone(), SchedulerConfig::default());
        let sink = Rc::new(RecordingSink::default());
        let metronome = Metronome::attach(&mut scheduler, tempo.lookup(), sink.clone(), config);
        (scheduler, clock, metronome, sink)
    }

    #[test]
    fn seek_schedules_one_tick_per_beat_of_the_loop() {
        let (mut scheduler, _, metronome, _) =
            setup(TempoMap::constant(120.0, 4).unwrap(), MetronomeConfig::default());

        scheduler.seek(0.0, Some(4.0)).unwrap();

        let expected: Vec<String> = ["0.0", "0.1", "0.2", "0.3", "1.0", "1.1", "1.2", "1.3"]
            .iter()
            .map(|suffix| format!("m_click:{suffix}"))
            .collect();
        assert_eq!(metronome.scheduled_ticks(), expected);
        assert!(expected.iter().all(|id| scheduler.has_event(id)));
        assert!(!scheduler.has_event("m_click:2.0"));
        assert_eq!(scheduler.event_count(), 8);
    }

    #[test]
    fn first_beat_of_each_measure_is_accented() {
        let (mut scheduler, _, _metronome, sink) =
            setup(TempoMap::constant(120.0, 4).unwrap(), MetronomeConfig::default());
        scheduler.seek(0.0, Some(4.0)).unwrap();

        scheduler.play();

        let played = sink.played.borrow();
        assert!(played.contains(&(1000.0, 0.0)));
        assert!(played.contains(&(800.0, 0.5)));
        assert!(played.contains(&(1000.0, 2.0)));
        assert!(played.contains(&(1000.0, 4.0)));
    }

    #[test]
    fn seek_replaces_previous_ticks() {
        let (mut scheduler, _, metronome, _) =
            setup(TempoMap::constant(120.0, 4).unwrap(), MetronomeConfig::default());
        scheduler.seek(0.0, Some(4.0)).unwrap();

        scheduler.seek(2.0, Some(4.0)).unwrap();

        assert_eq!(metronome.tick_count(), 4);
        assert!(!scheduler.has_event("m_click:0.0"));
        assert!(scheduler.has_event("m_click:1.0"));
    }

    #[test]
    fn open_ended_playback_extends_in_batches() {
        let config = MetronomeConfig {
            tick_batch_duration: 4.0,
            ..MetronomeConfig::default()
        };
        let (mut scheduler, clock, metronome, _) =
            setup(TempoMap::constant(120.0, 4).unwrap(), config);
        scheduler.seek(0.0, None).unwrap();
        assert_eq!(metronome.tick_count(), 8);

        scheduler.play();
        clock.set(0.1);
        scheduler.tick();
        assert_eq!(metronome.tick_count(), 16);

        clock.set(1.0);
        scheduler.tick();
        assert_eq!(metronome.tick_count(), 16);

        clock.set(4.0);
        scheduler.tick();
        assert_eq!(metronome.tick_count(), 24);
        assert!(scheduler.has_event("m_click:5.3"));
    }

    #[test]
    fn silent_sections_produce_no_ticks() {
        let tempo = TempoMap::new(
            None,
            vec![Section::new(120.0, 4).silent()],
            Section::new(120.0, 4),
        )
        .unwrap();
        let (mut scheduler, _, metronome, _) = setup(tempo, MetronomeConfig::default());

        scheduler.seek(0.0, Some(4.0)).unwrap();

        assert_eq!(metronome.tick_count(), 4);
        assert!(!scheduler.has_event("m_click:0.0"));
        assert!(scheduler.has_event("m_click:1.0"));
    }

    #[test]
    fn updating_the_measure_map_reschedules() {
        let (mut scheduler, _, metronome, _) =
            setup(TempoMap::constant(120.0, 4).unwrap(), MetronomeConfig::default());
        scheduler.seek(0.0, Some(4.0)).unwrap();

        metronome.update_measure_map(&mut scheduler, TempoMap::constant(60.0, 3).unwrap().lookup());

        assert_eq!(
            metronome.scheduled_ticks(),
            vec!["m_click:0.0", "m_click:0.1", "m_click:0.2", "m_click:1.0"]
        );
        assert!(!scheduler.has_event("m_click:0.3"));
    }

    #[test]
    fn detach_removes_ticks_and_listeners() {
        let (mut scheduler, _, metronome, _) =
            setup(TempoMap::constant(120.0, 4).unwrap(), MetronomeConfig::default());
        scheduler.seek(0.0, Some(4.0)).unwrap();

        metronome.detach(&mut scheduler);

        assert_eq!(scheduler.event_count(), 0);
        assert_eq!(scheduler.listener_count(Channel::Seek), 0);
        assert_eq!(scheduler.listener_count(Channel::ClockTick), 0);
    }

    #[test]
    fn beats_cover_the_requested_range_only() {
        let map = TempoMap::constant(120.0, 4).unwrap().measure_map(1.0, 3.0);

        let grid: Vec<(String, f64)> = beats(&map, 1.0, 3.0)
            .iter()
            .map(|beat| (beat.id(), beat.time))
            .collect();

        assert_eq!(
            grid,
            vec![
                ("m_click:0.2".to_string(), 1.0),
                ("m_click:0.3".to_string(), 1.5),
                ("m_click:1.0".to_string(), 2.0),
                ("m_click:1.1".to_string(), 2.5),
            ]
        );
        assert!(beats(&map, 1.0, 3.0)[2].is_accent());
    }

    #[test]
    fn rendered_tone_decays_within_gain() {
        let tone = Tone {
            frequency: 1000.0,
            duration: 0.05,
            gain: 0.5,
        };

        let samples = tone.render(48_000);

        assert_eq!(samples.len(), 2400);
        assert_eq!(samples[0], 0.0);
        assert!(samples.iter().all(|sample| sample.abs() <= 0.5));
        let head = samples[..240].iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        let tail = samples[2160..].iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        assert!(tail < head);
    }
}
