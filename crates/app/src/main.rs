use std::{
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use loopline_core::{
    beats, AppConfig, AudioNode, AudioStore, CabMode, ClipPlayer, DispatchArgs, Dispatched,
    LoopRegion, LooplineError, MediaCapture, Metronome, ProgramArgs, Recorder, Scheduler,
    SystemAudioClock, TakeFollower, TimelineDocument, TimelineSync, Tone, ToneSink,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 48_000;

fn main() -> loopline_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            timeline,
            config,
            loop_start,
            loop_end,
            seconds,
            metronome,
            record,
        } => {
            let options = PlayOptions {
                loop_start,
                loop_end,
                seconds,
                metronome,
                record,
            };
            run_play(&timeline, config.as_deref(), options)
        }
        Commands::Ticks {
            timeline,
            start,
            end,
        } => run_ticks(&timeline, start, end),
    }
}

struct PlayOptions {
    loop_start: Option<f64>,
    loop_end: Option<f64>,
    seconds: f64,
    metronome: bool,
    record: bool,
}

fn run_play(
    timeline: &Path,
    config: Option<&Path>,
    options: PlayOptions,
) -> loopline_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    let document = TimelineDocument::from_json_file(timeline)?;
    info!(?timeline, clips = document.clips.len(), "starting playback");

    let mut scheduler = Scheduler::new(SystemAudioClock::new(), config.scheduler.clone());
    let region = LoopRegion::new(
        options.loop_start.unwrap_or(document.loop_region.start),
        options.loop_end.or(document.loop_region.end),
    )?;
    scheduler.seek(region.start, region.end)?;

    let player: Rc<LoggingPlayer> = Rc::new(LoggingPlayer);
    let mut sync = TimelineSync::new(player.clone());
    sync.sync_clips(&mut scheduler, &document.clips)?;

    let _metronome = if options.metronome {
        let sink = Rc::new(RenderingSink {
            sample_rate: SAMPLE_RATE,
        });
        Some(Metronome::attach(
            &mut scheduler,
            document.tempo_map()?.lookup(),
            sink,
            config.metronome.clone(),
        ))
    } else {
        None
    };

    let store = AudioStore::new();
    let mut recorder = None;
    let mut _follower = None;
    if options.record {
        let capture = Recorder::attach(
            &mut scheduler,
            SilenceCapture::open(),
            store.clone(),
            config.recorder.clone(),
        );
        if capture.is_initialized() {
            let args = ProgramArgs {
                recording_start: scheduler.timecode(),
                cab_start: region.start,
                cab_duration: region.len(),
                cab_mode: if region.is_looping() {
                    CabMode::Loop
                } else {
                    CabMode::Linear
                },
                latency_compensation: 0.0,
            };
            let id = capture.prime(
                |take| {
                    info!(
                        id = %take.program.recording_id,
                        bytes = take.data.len(),
                        "take recorded"
                    )
                },
                args,
            )?;
            if let Some(program) = capture.program() {
                _follower = Some(TakeFollower::attach(
                    &mut scheduler,
                    program.active_recording(),
                    player.clone(),
                )?);
            }
            info!(%id, "recorder primed");
        } else {
            warn!("recording requested but no capture device is available");
        }
        recorder = Some(capture);
    }

    let granularity = scheduler.config().clock_granularity();
    let started = Instant::now();
    scheduler.play();
    while started.elapsed().as_secs_f64() < options.seconds {
        scheduler.tick();
        thread::sleep(granularity);
    }
    scheduler.stop();

    if let Some(recorder) = &recorder {
        recorder.flush()?;
    }
    info!(timecode = scheduler.timecode(), "playback finished");
    Ok(())
}

fn run_ticks(timeline: &Path, start: f64, end: f64) -> loopline_core::Result<()> {
    if !start.is_finite() || !end.is_finite() {
        return Err(LooplineError::InvalidInput("tick range must be finite"));
    }

    let document = TimelineDocument::from_json_file(timeline)?;
    let tempo = document.tempo_map()?;
    info!(?timeline, start, end, "printing metronome grid");

    let measures = tempo.measure_map(start, end);
    for (number, measure) in &measures {
        let section = measure.section;
        println!(
            "measure {number} at {:.3}s ({} bpm, {} beats)",
            measure.time_start, section.bpm, section.beats_per_bar
        );
    }
    for beat in beats(&measures, start, end) {
        let accent = if beat.is_accent() { " accent" } else { "" };
        println!("  {} {:.3}s{accent}", beat.id(), beat.time);
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Stand-in output that logs every playback request.
struct LoggingPlayer;

impl ClipPlayer for LoggingPlayer {
    fn play(&self, audio_store_key: &str, args: &DispatchArgs) -> Dispatched {
        info!(
            key = audio_store_key,
            when = args.when,
            offset = args.offset,
            duration = ?args.duration,
            "play"
        );
        Dispatched::Node(Box::new(LoggingNode {
            key: audio_store_key.to_string(),
        }))
    }
}

struct LoggingNode {
    key: String,
}

impl AudioNode for LoggingNode {
    fn stop(&mut self) {
        debug!(key = %self.key, "node stopped");
    }

    fn set_end(&mut self, end: Option<f64>) {
        debug!(key = %self.key, ?end, "node retimed");
    }
}

struct RenderingSink {
    sample_rate: u32,
}

impl ToneSink for RenderingSink {
    fn play_tone(&self, tone: &Tone, when: f64) -> Dispatched {
        let samples = tone.render(self.sample_rate);
        debug!(
            frequency = tone.frequency,
            when,
            samples = samples.len(),
            "tick"
        );
        Dispatched::Silent
    }
}

/// Capture device that records silence, one chunk per interval.
struct SilenceCapture {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SilenceCapture {
    fn open() -> loopline_core::Result<Self> {
        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }
}

impl MediaCapture for SilenceCapture {
    fn start(
        &mut self,
        recording_id: &str,
        store: AudioStore,
        chunk: Duration,
    ) -> loopline_core::Result<()> {
        let running = self.running.clone();
        running.store(true, Ordering::Release);
        let id = recording_id.to_string();
        // 16-bit mono PCM.
        let chunk_bytes = (f64::from(SAMPLE_RATE) * chunk.as_secs_f64()) as usize * 2;

        self.worker = Some(thread::spawn(move || {
            let silence = vec![0u8; chunk_bytes];
            while running.load(Ordering::Acquire) {
                if let Err(err) = store.append_chunk(&id, &silence) {
                    warn!(%err, "capture chunk dropped");
                    break;
                }
                thread::sleep(chunk);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> loopline_core::Result<()> {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| loopline_core::LooplineError::msg("capture thread panicked"))?;
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Loop-based audio timeline player", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a timeline document against the system clock.
    Play {
        /// Timeline document (JSON).
        timeline: PathBuf,
        /// Optional configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overrides the document's loop start.
        #[arg(long)]
        loop_start: Option<f64>,
        /// Overrides the document's loop end.
        #[arg(long)]
        loop_end: Option<f64>,
        /// How long to run before stopping.
        #[arg(long, default_value_t = 8.0)]
        seconds: f64,
        /// Schedule metronome ticks.
        #[arg(long)]
        metronome: bool,
        /// Record a take while playing.
        #[arg(long)]
        record: bool,
    },
    /// Print the metronome grid of a timeline.
    Ticks {
        /// Timeline document (JSON).
        timeline: PathBuf,
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long, default_value_t = 8.0)]
        end: f64,
    },
}
