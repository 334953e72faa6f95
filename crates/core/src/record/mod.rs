//! Microphone capture driven by the scheduler transport.
//!
//! A [`Recorder`] is primed with a program and a completion callback before
//! playback. Capture starts on `Play` and is finalized on `Pause` or `Stop`:
//! after a trailing delay the capture is stopped on a background thread and the
//! callback receives the stored blob together with the primed program.

use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::{
    config::RecorderConfig,
    geometry::ActiveRecording,
    scheduler::{Channel, Scheduler, Subscription},
    store::AudioStore,
    LooplineError, Result,
};

/// Platform capture device.
pub trait MediaCapture: Send {
    /// Starts capturing, appending one chunk to `store` under `recording_id`
    /// every `chunk`.
    fn start(&mut self, recording_id: &str, store: AudioStore, chunk: Duration) -> Result<()>;

    /// Stops capturing. Data buffered so far must be in the store on return.
    fn stop(&mut self) -> Result<()>;
}

/// How the take relates to the loop region it was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabMode {
    #[default]
    Loop,
    Linear,
}

/// Timing supplied when priming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramArgs {
    pub recording_start: f64,
    pub cab_start: f64,
    pub cab_duration: Option<f64>,
    #[serde(default)]
    pub cab_mode: CabMode,
    #[serde(default)]
    pub latency_compensation: f64,
}

/// Everything needed to place a finished take on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderProgram {
    pub recording_id: String,
    pub recording_start: f64,
    pub cab_start: f64,
    pub cab_duration: Option<f64>,
    pub cab_mode: CabMode,
    pub latency_compensation: f64,
}

impl RecorderProgram {
    fn new(recording_id: String, args: ProgramArgs) -> Self {
        Self {
            recording_id,
            recording_start: args.recording_start,
            cab_start: args.cab_start,
            cab_duration: args.cab_duration,
            cab_mode: args.cab_mode,
            latency_compensation: args.latency_compensation,
        }
    }

    /// The take as an in-progress recording that playback can follow.
    pub fn active_recording(&self) -> ActiveRecording {
        ActiveRecording {
            audio_store_key: self.recording_id.clone(),
            cab_start: self.cab_start,
            cab_duration: match self.cab_mode {
                CabMode::Loop => self.cab_duration,
                CabMode::Linear => None,
            },
            recording_start: self.recording_start,
            latency_compensation: self.latency_compensation,
        }
    }
}

/// A finished recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTake {
    pub data: Vec<u8>,
    pub program: RecorderProgram,
}

type OnComplete = Box<dyn FnOnce(RecordedTake) + Send>;

struct Primed {
    program: RecorderProgram,
    on_complete: OnComplete,
}

struct RecorderState<C> {
    capture: Option<Arc<Mutex<C>>>,
    store: AudioStore,
    config: RecorderConfig,
    primed: Option<Primed>,
    /// Cleared by the finalizer once the capture has actually stopped.
    recording: Arc<AtomicBool>,
    finalizers: Vec<JoinHandle<()>>,
}

fn lock_capture<C>(capture: &Mutex<C>) -> Result<MutexGuard<'_, C>> {
    capture
        .lock()
        .map_err(|_| LooplineError::Poisoned("media capture"))
}

impl<C: MediaCapture + 'static> RecorderState<C> {
    fn start_capture(&mut self) -> Result<()> {
        let capture = self
            .capture
            .clone()
            .ok_or(LooplineError::RecorderNotInitialized)?;
        let primed = self.primed.as_ref().ok_or(LooplineError::NotPrimed)?;
        if self.recording.load(Ordering::Acquire) {
            return Err(LooplineError::AlreadyRecording);
        }

        let id = &primed.program.recording_id;
        lock_capture(&capture)?.start(id, self.store.clone(), self.config.chunk())?;
        self.recording.store(true, Ordering::Release);
        debug!(id = %id, "capture started");
        Ok(())
    }

    fn finish_capture(&mut self) -> Result<()> {
        let capture = self
            .capture
            .clone()
            .ok_or(LooplineError::RecorderNotInitialized)?;
        if !self.recording.load(Ordering::Acquire) {
            return Err(LooplineError::NotRecording);
        }
        let Primed {
            program,
            on_complete,
        } = self.primed.take().ok_or(LooplineError::NotPrimed)?;

        let store = self.store.clone();
        let recording = self.recording.clone();
        let delay = self.config.trailing_delay();
        debug!(id = %program.recording_id, ?delay, "finalizing capture");

        let handle = thread::spawn(move || {
            thread::sleep(delay);
            if let Err(err) = lock_capture(&capture).and_then(|mut capture| capture.stop()) {
                error!(%err, id = %program.recording_id, "failed to stop capture");
            }
            recording.store(false, Ordering::Release);

            let data = match store.get(&program.recording_id) {
                Ok(audio) => audio.map(|audio| audio.data).unwrap_or_default(),
                Err(err) => {
                    error!(%err, id = %program.recording_id, "failed to read captured audio");
                    Vec::new()
                }
            };
            on_complete(RecordedTake { data, program });
        });

        self.finalizers.retain(|handle| !handle.is_finished());
        self.finalizers.push(handle);
        Ok(())
    }
}

/// Captures audio for primed takes in step with the transport.
pub struct Recorder<C> {
    state: Rc<RefCell<RecorderState<C>>>,
    subscriptions: Vec<Subscription>,
}

impl<C: MediaCapture + 'static> Recorder<C> {
    /// Wires the recorder to the scheduler.
    ///
    /// `capture` is the result of acquiring the device. A failure is reported
    /// here once and leaves the recorder uninitialized.
    pub fn attach(
        scheduler: &mut Scheduler,
        capture: Result<C>,
        store: AudioStore,
        config: RecorderConfig,
    ) -> Self {
        let capture = match capture {
            Ok(capture) => Some(Arc::new(Mutex::new(capture))),
            Err(err) => {
                warn!(%err, "media capture unavailable, recording disabled");
                None
            }
        };
        let initialized = capture.is_some();

        let state = Rc::new(RefCell::new(RecorderState {
            capture,
            store,
            config,
            primed: None,
            recording: Arc::new(AtomicBool::new(false)),
            finalizers: Vec::new(),
        }));

        let mut subscriptions = Vec::new();
        if initialized {
            let on_play = state.clone();
            subscriptions.push(scheduler.subscribe(Channel::Play, move |_, _| {
                let mut state = on_play.borrow_mut();
                if state.primed.is_none() {
                    return;
                }
                if let Err(err) = state.start_capture() {
                    error!(%err, "capture could not start");
                }
            }));

            for channel in [Channel::Pause, Channel::Stop] {
                let on_halt = state.clone();
                subscriptions.push(scheduler.subscribe(channel, move |_, _| {
                    let mut state = on_halt.borrow_mut();
                    if state.primed.is_none() || !state.recording.load(Ordering::Acquire) {
                        return;
                    }
                    if let Err(err) = state.finish_capture() {
                        error!(%err, "capture could not be finalized");
                    }
                }));
            }
        }

        Self {
            state,
            subscriptions,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().capture.is_some()
    }

    pub fn is_primed(&self) -> bool {
        self.state.borrow().primed.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.state.borrow().recording.load(Ordering::Acquire)
    }

    /// The program of the primed take, if any.
    pub fn program(&self) -> Option<RecorderProgram> {
        self.state
            .borrow()
            .primed
            .as_ref()
            .map(|primed| primed.program.clone())
    }

    /// Prepares the next take and returns its recording id. Capture begins on
    /// the next `Play`.
    pub fn prime(
        &self,
        on_complete: impl FnOnce(RecordedTake) + Send + 'static,
        args: ProgramArgs,
    ) -> Result<String> {
        let mut state = self.state.borrow_mut();
        if state.capture.is_none() {
            return Err(LooplineError::RecorderNotInitialized);
        }

        // The primed take is the one being captured until it is finalized.
        if state.primed.is_some() && state.recording.load(Ordering::Acquire) {
            return Err(LooplineError::AlreadyRecording);
        }

        let recording_id = format!("recording_{:016x}", rand::random::<u64>());
        if state.primed.is_some() {
            debug!(id = %recording_id, "replacing primed take");
        }
        state.primed = Some(Primed {
            program: RecorderProgram::new(recording_id.clone(), args),
            on_complete: Box::new(on_complete),
        });
        debug!(id = %recording_id, "recorder primed");
        Ok(recording_id)
    }

    /// Drops the primed take without calling its completion. A running
    /// capture is stopped and its data discarded.
    pub fn unprime(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let primed = state.primed.take().ok_or(LooplineError::NotPrimed)?;

        if state.recording.load(Ordering::Acquire) {
            if let Some(capture) = &state.capture {
                lock_capture(capture)?.stop()?;
            }
            state.recording.store(false, Ordering::Release);
        }
        state.store.remove(&primed.program.recording_id)?;
        debug!(id = %primed.program.recording_id, "recorder unprimed");
        Ok(())
    }

    /// Waits for every pending finalization to deliver its take.
    pub fn flush(&self) -> Result<()> {
        let finalizers = std::mem::take(&mut self.state.borrow_mut().finalizers);
        for handle in finalizers {
            handle
                .join()
                .map_err(|_| LooplineError::msg("capture finalizer panicked"))?;
        }
        Ok(())
    }

    pub fn detach(self, scheduler: &mut Scheduler) {
        for subscription in &self.subscriptions {
            scheduler.unsubscribe(*subscription);
        }
    }
}

impl<C> fmt::Debug for Recorder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Recorder")
            .field("initialized", &state.capture.is_some())
            .field("primed", &state.primed.is_some())
            .field("recording", &state.recording.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::SchedulerConfig,
        geometry::create_active_recording_event,
    };

    #[derive(Debug, Clone, PartialEq)]
    enum CaptureCall {
        Start(String),
        Stop,
    }

    #[derive(Clone, Default)]
    struct FakeCapture {
        calls: Arc<Mutex<Vec<CaptureCall>>>,
    }

    impl FakeCapture {
        fn calls(&self) -> Vec<CaptureCall> {
            self.calls.lock().unwrap().clone()
        }

        fn starts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, CaptureCall::Start(_)))
                .count()
        }
    }

    impl MediaCapture for FakeCapture {
        fn start(&mut self, recording_id: &str, store: AudioStore, _chunk: Duration) -> Result<()> {
            store.append_chunk(recording_id, b"pcm")?;
            self.calls
                .lock()
                .unwrap()
                .push(CaptureCall::Start(recording_id.to_string()));
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push(CaptureCall::Stop);
            Ok(())
        }
    }

    fn args() -> ProgramArgs {
        ProgramArgs {
            recording_start: 1.0,
            cab_start: 0.0,
            cab_duration: Some(4.0),
            cab_mode: CabMode::Loop,
            latency_compensation: 0.01,
        }
    }

    fn setup(
        trailing_delay_ms: u64,
    ) -> (Scheduler, FakeCapture, AudioStore, Recorder<FakeCapture>) {
        let mut scheduler = Scheduler::new(ManualClock::new(), SchedulerConfig::default());
        let capture = FakeCapture::default();
        let store = AudioStore::new();
        let config = RecorderConfig {
            chunk_ms: 100,
            trailing_delay_ms,
        };
        let recorder = Recorder::attach(&mut scheduler, Ok(capture.clone()), store.clone(), config);
        (scheduler, capture, store, recorder)
    }

    #[test]
    fn primed_take_is_captured_and_delivered_once() {
        let (mut scheduler, capture, _, recorder) = setup(10);
        let (tx, rx) = mpsc::channel();

        let id = recorder.prime(move |take| tx.send(take).unwrap(), args()).unwrap();
        let program = recorder.program().unwrap();
        assert!(id.starts_with("recording_"));

        scheduler.play();
        assert_eq!(capture.starts(), 1);
        assert!(recorder.is_recording());

        scheduler.stop();
        assert!(!recorder.is_primed());

        let take = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(take.program, program);
        assert_eq!(take.program.recording_id, id);
        assert_eq!(take.data, b"pcm".to_vec());

        recorder.flush().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(capture.calls(), vec![CaptureCall::Start(id), CaptureCall::Stop]);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn pause_finalizes_like_stop() {
        let (mut scheduler, capture, _, recorder) = setup(0);
        let (tx, rx) = mpsc::channel();
        recorder.prime(move |take| tx.send(take).unwrap(), args()).unwrap();

        scheduler.play();
        scheduler.pause();
        recorder.flush().unwrap();

        assert!(rx.try_recv().is_ok());
        assert_eq!(capture.calls().last(), Some(&CaptureCall::Stop));
    }

    #[test]
    fn unavailable_capture_leaves_recorder_uninitialized() {
        let mut scheduler = Scheduler::new(ManualClock::new(), SchedulerConfig::default());
        let recorder: Recorder<FakeCapture> = Recorder::attach(
            &mut scheduler,
            Err(LooplineError::msg("permission denied")),
            AudioStore::new(),
            RecorderConfig::default(),
        );

        assert!(!recorder.is_initialized());
        assert!(matches!(
            recorder.prime(|_| {}, args()),
            Err(LooplineError::RecorderNotInitialized)
        ));
        assert_eq!(scheduler.listener_count(Channel::Play), 0);
    }

    #[test]
    fn playback_without_priming_does_not_capture() {
        let (mut scheduler, capture, _, _recorder) = setup(0);

        scheduler.play();
        scheduler.stop();

        assert!(capture.calls().is_empty());
    }

    #[test]
    fn stopping_before_play_keeps_the_take_primed() {
        let (mut scheduler, capture, _, recorder) = setup(0);
        scheduler.play();
        scheduler.pause();
        recorder.prime(|_| {}, args()).unwrap();

        scheduler.stop();

        assert!(recorder.is_primed());
        assert!(capture.calls().is_empty());
    }

    #[test]
    fn restarting_during_trailing_delay_is_rejected() {
        let (mut scheduler, capture, _, recorder) = setup(200);
        recorder.prime(|_| {}, args()).unwrap();
        scheduler.play();
        scheduler.pause();

        recorder.prime(|_| {}, args()).unwrap();
        scheduler.play();

        assert_eq!(capture.starts(), 1);
        recorder.flush().unwrap();
        assert!(recorder.is_primed());
    }

    #[test]
    fn priming_while_capturing_keeps_the_running_take() {
        let (mut scheduler, capture, _, recorder) = setup(0);
        let (tx, rx) = mpsc::channel();

        let first = {
            let tx = tx.clone();
            recorder
                .prime(move |take| tx.send(take).unwrap(), args())
                .unwrap()
        };
        scheduler.play();

        let second = recorder.prime(move |take| tx.send(take).unwrap(), args());
        assert!(matches!(second, Err(LooplineError::AlreadyRecording)));
        assert_eq!(recorder.program().unwrap().recording_id, first);

        scheduler.stop();
        recorder.flush().unwrap();

        let take = rx.try_recv().unwrap();
        assert_eq!(take.program.recording_id, first);
        assert_eq!(take.data, b"pcm");
        assert!(rx.try_recv().is_err());
        assert_eq!(capture.starts(), 1);
    }

    #[test]
    fn unprime_discards_the_take() {
        let (mut scheduler, capture, store, recorder) = setup(0);
        let (tx, rx) = mpsc::channel::<RecordedTake>();
        let id = recorder.prime(move |take| tx.send(take).unwrap(), args()).unwrap();
        scheduler.play();

        recorder.unprime().unwrap();
        scheduler.stop();
        recorder.flush().unwrap();

        assert!(rx.try_recv().is_err());
        assert!(!store.contains(&id).unwrap());
        assert_eq!(capture.calls().last(), Some(&CaptureCall::Stop));
        assert!(matches!(recorder.unprime(), Err(LooplineError::NotPrimed)));
    }

    #[test]
    fn program_describes_the_active_recording() {
        let program = RecorderProgram::new("take".into(), args());

        let first = create_active_recording_event(&program.active_recording(), 0).unwrap();
        assert_eq!(first.id, "active_take_0");
        assert_abs_diff_eq!(first.start, 0.99, epsilon = 1e-9);

        let linear = RecorderProgram::new(
            "take".into(),
            ProgramArgs {
                cab_mode: CabMode::Linear,
                ..args()
            },
        );
        assert_eq!(linear.active_recording().cab_duration, None);
    }
}
