//! Player: load, schedule and render a song in real time
//!
//! The control thread talks to [`Player`]; a dedicated audio-loop thread
//! owns the sound manager, mixer, song player and sink. The loop paces
//! itself off the sink's free space, converting it into whole 5-tick
//! refreshes, and drains at most one pedal event per iteration so events
//! never straddle a tick boundary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use stomp_core::{
    tick_to_time_ratio, PartKind, PedalEvent, PlayerError, PlayerStatus, Result, Section,
    SectionKind, TICKS_PER_REFRESH,
};
use tracing::{debug, error, info, warn};

use crate::mixer::Mixer;
use crate::queue::PedalQueue;
use crate::sink::{AudioFormat, AudioSink, CpalSink, SinkState, BYTES_PER_FRAME};
use crate::song_player::SongPlayer;
use crate::sound::SoundManager;
use crate::status::StatusEvent;

/// Buffer window clamp, milliseconds
pub const MIN_BUFFER_MS: u32 = 20;
pub const MAX_BUFFER_MS: u32 = 500;

const DEFAULT_BUFFER_MS: u32 = 50;
const DEFAULT_TEMPO: u16 = 120;
const SAMPLE_RATE: f64 = 44100.0;
const MIXER_DEFAULT_LEVEL: f32 = 1.0;
/// Residual amplitude below which a faded refresh counts as silence
const PREPARE_STOP_THRESHOLD: u16 = 5;
const FADE_FACTOR: f32 = 0.982;
const IDLE_SLEEP: Duration = Duration::from_millis(5);
const STOP_TIMEOUT: Duration = Duration::from_millis(3000);
const PEDAL_QUEUE_DEPTH: usize = 16;

// Memory guards: hard cap per file, reduced headroom for large files,
// and a periodic footprint re-check
const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
const LARGE_FILE_CUTOFF: u64 = 50 * 1024 * 1024;
const MIN_HEADROOM_BYTES: u64 = 20 * 1024 * 1024;
const MAX_FOOTPRINT_BYTES: u64 = 500 * 1024 * 1024;
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

fn samples_per_refresh(bpm: u16) -> f64 {
    TICKS_PER_REFRESH as f64 * tick_to_time_ratio(bpm) * SAMPLE_RATE
}

fn buffer_ms_to_bytes(ms: u32) -> usize {
    ms as usize * SAMPLE_RATE as usize * BYTES_PER_FRAME / 1000
}

/// Converts sink free space into whole 5-tick refreshes, carrying the
/// fractional frame remainder across calls so the long-run output rate
/// matches the tempo exactly.
struct RefreshClock {
    carry: f64,
}

impl RefreshClock {
    fn new() -> Self {
        Self { carry: 0.0 }
    }

    /// Budget for `free_frames` of sink space: (whole refreshes, frames
    /// to produce now).
    fn budget(&mut self, free_frames: usize, bpm: u16) -> (u32, usize) {
        let per_refresh = samples_per_refresh(bpm);
        let count = (free_frames as f64 / per_refresh) as u32;
        self.carry += per_refresh * count as f64;
        let frames = self.carry.floor();
        self.carry -= frames;
        (count, frames as usize)
    }
}

fn status_to_u8(status: PlayerStatus) -> u8 {
    match status {
        PlayerStatus::NoSongLoaded => 0,
        PlayerStatus::Stopped => 1,
        PlayerStatus::Paused => 2,
        PlayerStatus::Intro => 3,
        PlayerStatus::MainTrack => 4,
        PlayerStatus::MainTrackToEnd => 5,
        PlayerStatus::TranfillActive => 6,
        PlayerStatus::TranfillQuiting => 7,
        PlayerStatus::DrumfillActive => 8,
        PlayerStatus::Outro => 9,
        PlayerStatus::SingleTrack => 10,
    }
}

fn status_from_u8(value: u8) -> PlayerStatus {
    match value {
        1 => PlayerStatus::Stopped,
        2 => PlayerStatus::Paused,
        3 => PlayerStatus::Intro,
        4 => PlayerStatus::MainTrack,
        5 => PlayerStatus::MainTrackToEnd,
        6 => PlayerStatus::TranfillActive,
        7 => PlayerStatus::TranfillQuiting,
        8 => PlayerStatus::DrumfillActive,
        9 => PlayerStatus::Outro,
        10 => PlayerStatus::SingleTrack,
        _ => PlayerStatus::NoSongLoaded,
    }
}

/// State shared between the control thread and the audio loop
struct Shared {
    stop: AtomicBool,
    started: AtomicBool,
    /// Tempo in BPM used by the refresh clock; written by `set_tempo`
    /// and by song tempo discovery
    tempo: AtomicU32,
    /// Master tick snapshot
    position: AtomicU64,
    status: AtomicU8,
    part: AtomicUsize,
    queue: PedalQueue,
}

impl Shared {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tempo: AtomicU32::new(DEFAULT_TEMPO as u32),
            position: AtomicU64::new(0),
            status: AtomicU8::new(status_to_u8(PlayerStatus::NoSongLoaded)),
            part: AtomicUsize::new(0),
            queue: PedalQueue::new(PEDAL_QUEUE_DEPTH),
        }
    }
}

#[derive(Clone)]
struct SingleTrackSetup {
    bytes: Vec<u8>,
    track_index: usize,
    kind: SectionKind,
    part_index: usize,
}

/// Factory invoked on the audio thread to open the sink; cpal streams
/// must be created on the thread that services them.
pub type SinkFactory = Arc<dyn Fn(&AudioFormat, usize) -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// The engine's control surface. One audio-loop thread at a time; a
/// second `play` performs stop + wait + play.
pub struct Player {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    done_rx: Option<Receiver<()>>,
    status_tx: Sender<StatusEvent>,
    status_rx: Receiver<StatusEvent>,
    sink_factory: SinkFactory,
    drumset_path: PathBuf,
    song_path: PathBuf,
    effects_path: PathBuf,
    buffer_time_ms: u32,
    auto_pilot: bool,
    single_track: Option<SingleTrackSetup>,
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Player {
    pub fn new() -> Self {
        Self::with_sink_factory(Arc::new(|format, buffer_bytes| {
            CpalSink::open(format, buffer_bytes).map(|s| Box::new(s) as Box<dyn AudioSink>)
        }))
    }

    /// Build a player with a custom sink (offline rendering, tests).
    pub fn with_sink_factory(sink_factory: SinkFactory) -> Self {
        let (status_tx, status_rx) = unbounded();
        Self {
            shared: Arc::new(Shared::new()),
            thread: None,
            done_rx: None,
            status_tx,
            status_rx,
            sink_factory,
            drumset_path: PathBuf::new(),
            song_path: PathBuf::new(),
            effects_path: PathBuf::new(),
            buffer_time_ms: DEFAULT_BUFFER_MS,
            auto_pilot: false,
            single_track: None,
        }
    }

    /// Status event stream. Hand the receiver to one consumer; events
    /// arrive in emission order.
    pub fn status_events(&self) -> Receiver<StatusEvent> {
        self.status_rx.clone()
    }

    pub fn set_drumset(&mut self, path: impl Into<PathBuf>) {
        self.drumset_path = path.into();
        debug!(path = %self.drumset_path.display(), "drumset set");
    }

    pub fn set_song(&mut self, path: impl Into<PathBuf>) {
        self.song_path = path.into();
        self.single_track = None;
        debug!(path = %self.song_path.display(), "song set");
    }

    pub fn set_effects_path(&mut self, path: impl Into<PathBuf>) {
        self.effects_path = path.into();
    }

    /// Diagnostic playback of one section fragment instead of a song.
    pub fn set_single_track(
        &mut self,
        bytes: Vec<u8>,
        track_index: usize,
        kind: SectionKind,
        part_index: usize,
    ) {
        self.single_track = Some(SingleTrackSetup {
            bytes,
            track_index,
            kind,
            part_index,
        });
    }

    pub fn set_auto_pilot(&mut self, auto_pilot: bool) {
        self.auto_pilot = auto_pilot;
    }

    /// Clamped to [`MIN_BUFFER_MS`, `MAX_BUFFER_MS`]; applies on the next
    /// `play`.
    pub fn set_buffer_time_ms(&mut self, ms: u32) {
        self.buffer_time_ms = ms.clamp(MIN_BUFFER_MS, MAX_BUFFER_MS);
    }

    pub fn buffer_time_ms(&self) -> u32 {
        self.buffer_time_ms
    }

    /// Takes effect on the next refresh, overriding any song tempo until
    /// the song discovers a new one.
    pub fn set_tempo(&mut self, bpm: u16) {
        self.shared.tempo.store(bpm.max(1) as u32, Ordering::SeqCst);
    }

    pub fn get_tempo(&self) -> u16 {
        self.shared.tempo.load(Ordering::SeqCst) as u16
    }

    pub fn started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Master tick snapshot written by the audio loop
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> (PlayerStatus, usize) {
        (
            status_from_u8(self.shared.status.load(Ordering::SeqCst)),
            self.shared.part.load(Ordering::SeqCst),
        )
    }

    pub fn pedal_press(&self) {
        self.enqueue(PedalEvent::Press);
    }

    pub fn pedal_release(&self) {
        self.enqueue(PedalEvent::Release);
    }

    pub fn pedal_long_press(&self) {
        self.enqueue(PedalEvent::LongPress);
    }

    pub fn pedal_double_tap(&self) {
        self.enqueue(PedalEvent::MultiTap);
    }

    /// Secondary switch: accent hit
    pub fn effect(&self) {
        self.enqueue(PedalEvent::SecondaryPress);
    }

    fn enqueue(&self, event: PedalEvent) {
        // single-track mode ignores the pedal by contract
        if self.single_track.is_some() {
            return;
        }
        self.shared.queue.enqueue(event);
    }

    /// Start the audio loop. A running player is stopped first.
    pub fn play(&mut self) {
        if self.is_running() {
            info!("play while running: restarting");
            self.stop();
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.queue.clear();
        self.shared.position.store(0, Ordering::SeqCst);

        let ctx = LoopContext {
            shared: Arc::clone(&self.shared),
            status_tx: self.status_tx.clone(),
            sink_factory: Arc::clone(&self.sink_factory),
            drumset_path: self.drumset_path.clone(),
            song_path: self.song_path.clone(),
            effects_path: self.effects_path.clone(),
            buffer_bytes: buffer_ms_to_bytes(self.buffer_time_ms),
            auto_pilot: self.auto_pilot,
            single_track: self.single_track.clone(),
        };

        let (done_tx, done_rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name("stomp-audio".into())
            .spawn(move || {
                run_loop(ctx);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.done_rx = Some(done_rx);
            }
            Err(e) => {
                error!("failed to spawn audio thread: {e}");
                let _ = self
                    .status_tx
                    .send(StatusEvent::Error(format!("failed to spawn audio thread: {e}")));
                let _ = self.status_tx.send(StatusEvent::Stopped);
            }
        }
    }

    /// Request a stop and wait up to 3 s for the loop to wind down.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);

        match self.done_rx.take() {
            Some(done) => match done.recv_timeout(STOP_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    // no safe force-terminate; abandon the thread and let
                    // the stop flag catch it whenever it resurfaces
                    error!("audio loop did not stop within 3 s, abandoning thread");
                    drop(handle);
                }
            },
            None => {
                let _ = handle.join();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the audio thread needs, captured at `play`
struct LoopContext {
    shared: Arc<Shared>,
    status_tx: Sender<StatusEvent>,
    sink_factory: SinkFactory,
    drumset_path: PathBuf,
    song_path: PathBuf,
    effects_path: PathBuf,
    buffer_bytes: usize,
    auto_pilot: bool,
    single_track: Option<SingleTrackSetup>,
}

fn run_loop(ctx: LoopContext) {
    let status_tx = ctx.status_tx.clone();
    let shared = Arc::clone(&ctx.shared);
    match AudioLoop::prepare(ctx) {
        Ok(mut audio_loop) => audio_loop.run(),
        Err(err) => {
            error!(%err, "player failed to start");
            shared.started.store(false, Ordering::SeqCst);
            let _ = status_tx.send(StatusEvent::Error(err.to_string()));
            let _ = status_tx.send(StatusEvent::Stopped);
        }
    }
}

/// The audio loop proper: owns the pipeline for the lifetime of one run
struct AudioLoop {
    shared: Arc<Shared>,
    status_tx: Sender<StatusEvent>,
    sink: Box<dyn AudioSink>,
    sound: SoundManager,
    mixer: Mixer,
    song: SongPlayer,
    clock: RefreshClock,
    buffer_bytes: usize,
    /// Caps effective buffering when the sink allocates more than asked
    sound_card_limit: usize,
    single: Option<(i64, SectionKind)>,
    prepare_stop: bool,
    last_status: PlayerStatus,
    /// Last tempo discovered in the song, for deduplicated emission
    last_song_tempo: u16,
    prev_started: bool,
    prev_part_kind: PartKind,
    prev_part_index: usize,
    prev_sig_num: u8,
    prev_beat: u32,
    prev_tick: Option<u64>,
    pcm: Vec<i16>,
    bytes: Vec<u8>,
    footprint: u64,
    last_memory_check: Instant,
}

impl AudioLoop {
    /// Open the sink and load every bundle. Runs before the hot loop so
    /// the loop itself stays infallible.
    fn prepare(ctx: LoopContext) -> Result<Self> {
        let sink = (ctx.sink_factory)(&AudioFormat::ENGINE, ctx.buffer_bytes)?;
        let sound_card_limit = sink.buffer_size().saturating_sub(ctx.buffer_bytes);

        let mut sound = SoundManager::new();
        let mut song = SongPlayer::new();
        let mut footprint = 0u64;

        let drumset_bytes = load_file_guarded(&ctx.drumset_path, &mut footprint)?;
        sound.load_drumset(&drumset_bytes)?;

        let single = match &ctx.single_track {
            Some(setup) => {
                let section = Section::parse(&setup.bytes)?;
                let offset = SongPlayer::calculate_single_track_offset(
                    section.length_ticks,
                    section.bar_length,
                );
                if offset < 0 {
                    return Err(PlayerError::BadFormat(
                        "single track has no usable bar length".into(),
                    ));
                }
                debug!(
                    track = setup.track_index,
                    part = setup.part_index,
                    offset,
                    "single track configured"
                );
                song.set_single_track(section);
                Some((offset, setup.kind))
            }
            None => {
                let song_bytes = load_file_guarded(&ctx.song_path, &mut footprint)?;
                song.load_song(&song_bytes)?;

                // every instrument the song plays must resolve in the set
                let notes = song.song().map(|s| s.referenced_notes()).unwrap_or_default();
                for note in notes {
                    let known = sound.drumset().is_some_and(|d| d.has_instrument(note));
                    if !known {
                        return Err(PlayerError::BadFormat(format!(
                            "song references instrument {note} missing from the drumset"
                        )));
                    }
                }

                // accent-hit effects are resolved next to the song
                let names: Vec<String> = song
                    .song()
                    .map(|s| s.parts.iter().map(|p| p.effect_name.clone()).collect())
                    .unwrap_or_default();
                for (part, name) in names.iter().enumerate() {
                    if name.is_empty() {
                        sound.load_effect(None, part)?;
                    } else {
                        let path = ctx.effects_path.join(name);
                        let effect_bytes = load_file_guarded(&path, &mut footprint)?;
                        sound.load_effect(Some(&effect_bytes), part)?;
                    }
                }

                song.set_auto_pilot(ctx.auto_pilot);
                song.external_start();
                None
            }
        };

        Ok(Self {
            shared: ctx.shared,
            status_tx: ctx.status_tx,
            sink,
            sound,
            mixer: Mixer::new(),
            song,
            clock: RefreshClock::new(),
            buffer_bytes: ctx.buffer_bytes,
            sound_card_limit,
            single,
            prepare_stop: false,
            last_status: PlayerStatus::Stopped,
            last_song_tempo: 0,
            prev_started: false,
            prev_part_kind: PartKind::Stopped,
            prev_part_index: 0,
            prev_sig_num: 0,
            prev_beat: 0,
            prev_tick: None,
            pcm: Vec::new(),
            bytes: Vec::new(),
            footprint,
            last_memory_check: Instant::now(),
        })
    }

    fn emit(&self, event: StatusEvent) {
        let _ = self.status_tx.send(event);
    }

    fn run(&mut self) {
        self.shared.started.store(true, Ordering::SeqCst);
        self.emit(StatusEvent::Started);
        self.update_status(true);
        info!(buffer_bytes = self.buffer_bytes, "audio loop running");

        while !self.shared.stop.load(Ordering::SeqCst) {
            if self.last_memory_check.elapsed() >= MEMORY_CHECK_INTERVAL {
                self.last_memory_check = Instant::now();
                if self.footprint > MAX_FOOTPRINT_BYTES {
                    error!(footprint = self.footprint, "buffer footprint over budget");
                    self.emit(StatusEvent::Error(
                        PlayerError::OutOfMemory("buffer footprint exceeds 500 MB".into())
                            .to_string(),
                    ));
                    break;
                }
            }

            // the sink's free window is the clock of the whole loop
            let mut frames = 0usize;
            if self.sink.state() != SinkState::Stopped {
                let mut free = self.sink.bytes_free().saturating_sub(self.sound_card_limit);
                if free > self.buffer_bytes {
                    self.sound_card_limit += free - self.buffer_bytes;
                    free = self.buffer_bytes;
                }
                frames = free / BYTES_PER_FRAME;
            }

            if frames > 0 {
                frames = self.process_time(frames);
            }
            if frames > 0 {
                self.process_audio(frames);
            }

            self.process_event();
            self.update_status(false);

            if frames == 0 {
                thread::sleep(IDLE_SLEEP);
            }
        }

        self.update_status(false);
        if self.single.is_none() {
            self.song.external_stop();
        }
        self.sound.clear();
        self.sink.stop();
        self.shared.started.store(false, Ordering::SeqCst);
        self.emit(StatusEvent::Stopped);
        info!("audio loop exited");
    }

    /// Convert free frames into refreshes, advance the transport, and
    /// react to status transitions. Returns the frames actually due.
    fn process_time(&mut self, free_frames: usize) -> usize {
        let bpm = self.shared.tempo.load(Ordering::SeqCst).max(1) as u16;
        let (refreshes, frames) = self.clock.budget(free_frames, bpm);
        if frames == 0 {
            return 0;
        }

        let ratio = tick_to_time_ratio(bpm);
        let ticks = refreshes * TICKS_PER_REFRESH;
        match self.single {
            Some((offset, _)) => {
                self.song
                    .process_single_track(ratio, ticks, offset, &mut self.sound)
            }
            None => self.song.process_song(ratio, ticks, &mut self.sound),
        }

        let (status, part, drumfill) = self.song.get_player_status();
        self.shared.status.store(status_to_u8(status), Ordering::SeqCst);
        self.shared.part.store(part, Ordering::SeqCst);

        if status != self.last_status {
            match status {
                PlayerStatus::NoSongLoaded => {
                    warn!("transport lost its song, stopping");
                    self.shared.stop.store(true, Ordering::SeqCst);
                }
                PlayerStatus::Stopped => self.prepare_stop = true,
                PlayerStatus::Intro => self.emit(StatusEvent::PlayingIntro),
                PlayerStatus::MainTrack => {
                    self.update_tempo();
                    self.emit(StatusEvent::PlayingMainTrack(part));
                }
                PlayerStatus::Outro => self.emit(StatusEvent::PlayingOutro),
                PlayerStatus::TranfillActive => self.emit(StatusEvent::PlayingTranfill(part)),
                PlayerStatus::DrumfillActive => {
                    self.emit(StatusEvent::PlayingDrumfill(part, drumfill))
                }
                PlayerStatus::Paused
                | PlayerStatus::MainTrackToEnd
                | PlayerStatus::TranfillQuiting
                | PlayerStatus::SingleTrack => {}
            }
            if !matches!(status, PlayerStatus::Stopped | PlayerStatus::NoSongLoaded) {
                // a restart during the fadeout plays at full strength
                self.prepare_stop = false;
                self.mixer.set_output_level(MIXER_DEFAULT_LEVEL);
            }
            self.last_status = status;
        }

        frames
    }

    /// Drain the mixer into the sink; drive the prepare-stop fade.
    fn process_audio(&mut self, frames: usize) {
        let samples = frames * 2;
        if self.pcm.len() < samples {
            self.pcm.resize(samples, 0);
        }
        self.mixer
            .read_output_stream(&mut self.sound, &mut self.pcm[..samples]);

        self.bytes.clear();
        for sample in &self.pcm[..samples] {
            self.bytes.extend_from_slice(&sample.to_le_bytes());
        }
        let written = self.sink.write(&self.bytes);
        if written < self.bytes.len() {
            warn!(written, expected = self.bytes.len(), "sink accepted a short write");
        }

        self.shared
            .position
            .store(self.song.get_master_tick(), Ordering::SeqCst);

        if self.prepare_stop {
            let silent = self.pcm[..samples]
                .iter()
                .all(|s| s.unsigned_abs() <= PREPARE_STOP_THRESHOLD);
            if silent {
                debug!("fadeout reached silence");
                self.shared.stop.store(true, Ordering::SeqCst);
            }
            let level = self.mixer.get_output_level();
            self.mixer.set_output_level(level * FADE_FACTOR);
        }
    }

    /// At most one pedal event per iteration; a contended lock just waits
    /// for the next cycle.
    fn process_event(&mut self) {
        if let Some(event) = self.shared.queue.try_dequeue() {
            debug!(?event, "pedal event");
            self.song.button_callback(event, &mut self.sound);
        }
    }

    fn update_tempo(&mut self) {
        let bpm = self.song.get_tempo();
        if bpm > 0 && bpm != self.last_song_tempo {
            info!(bpm, "tempo discovered in song");
            self.last_song_tempo = bpm;
            self.shared.tempo.store(bpm as u32, Ordering::SeqCst);
            self.emit(StatusEvent::TempoChangedBySong(bpm));
        }
    }

    /// Emit change-detected status signals; `force` repeats everything.
    fn update_status(&mut self, force: bool) {
        let stopping = self.shared.stop.load(Ordering::SeqCst);
        let started = !stopping;
        if force || started != self.prev_started {
            self.prev_started = started;
            self.emit(StatusEvent::StartedChanged(started));
        }

        let (status, part_index, _) = self.song.get_player_status();
        let part_kind = if stopping {
            PartKind::Stopped
        } else {
            match self.single {
                Some((_, kind)) => {
                    if matches!(status, PlayerStatus::NoSongLoaded | PlayerStatus::Stopped) {
                        PartKind::Stopped
                    } else {
                        kind.part_kind()
                    }
                }
                None => PartKind::from(status),
            }
        };

        if force || part_kind != self.prev_part_kind {
            self.prev_part_kind = part_kind;
            self.emit(StatusEvent::PartChanged(part_kind));
            self.update_tempo();
        } else if part_index != self.prev_part_index && part_index > 0 {
            // part advanced without a coarse kind change
            self.update_tempo();
            self.emit(StatusEvent::PlayingMainTrack(part_index));
        }
        self.prev_part_index = part_index;

        let sig_num = self.song.get_time_signature().num;
        if force || sig_num != self.prev_sig_num {
            self.prev_sig_num = sig_num;
            self.emit(StatusEvent::SigNumChanged(sig_num));
        }

        let (beat, _) = self.song.get_beat_in_bar();
        if force || beat != self.prev_beat {
            self.prev_beat = beat;
            self.emit(StatusEvent::BeatInBarChanged(beat));
        }

        let tick = self.song.get_master_tick();
        if force || self.prev_tick != Some(tick) {
            self.prev_tick = Some(tick);
            self.emit(StatusEvent::Position(tick));
        }
    }
}

/// Read a whole file with the engine's memory guards applied.
fn load_file_guarded(path: &Path, footprint: &mut u64) -> Result<Vec<u8>> {
    let meta = fs::metadata(path)
        .map_err(|e| PlayerError::NotFound(format!("{}: {e}", path.display())))?;
    let size = meta.len();

    if size > MAX_FILE_BYTES {
        return Err(PlayerError::OutOfMemory(format!(
            "{} is {} MB, the cap is {} MB",
            path.display(),
            size / (1024 * 1024),
            MAX_FILE_BYTES / (1024 * 1024)
        )));
    }

    // large files get reduced headroom, small ones a 20 MB floor
    let required = if size > LARGE_FILE_CUTOFF {
        size + size / 10
    } else {
        (size * 2).max(MIN_HEADROOM_BYTES)
    };
    let available = MAX_FOOTPRINT_BYTES.saturating_sub(*footprint);
    if required > available {
        return Err(PlayerError::OutOfMemory(format!(
            "loading {} needs {} MB headroom, {} MB left in budget",
            path.display(),
            required / (1024 * 1024),
            available / (1024 * 1024)
        )));
    }

    let bytes = fs::read(path)
        .map_err(|e| PlayerError::NotFound(format!("{}: {e}", path.display())))?;
    *footprint += bytes.len() as u64;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_clock_keeps_long_run_rate_exact() {
        // tempos whose samples-per-refresh is not a whole frame count
        for bpm in [40u16, 97, 120, 141, 300] {
            let mut clock = RefreshClock::new();
            let per_refresh = samples_per_refresh(bpm);
            let mut refreshes = 0u64;
            let mut produced = 0u64;

            for step in 0..10_000usize {
                // vary the free window like a real sink would
                let free = 1500 + (step % 7) * 311;
                let (count, frames) = clock.budget(free, bpm);
                refreshes += count as u64;
                produced += frames as u64;
                assert!(frames <= free, "never exceed the free window");
            }

            let expected = per_refresh * refreshes as f64;
            let drift = (produced as f64 - expected).abs();
            assert!(
                drift < 1.0,
                "bpm {bpm}: drift {drift} over {refreshes} refreshes"
            );
        }
    }

    #[test]
    fn refresh_clock_carry_accumulates_fractions() {
        // at 97 BPM one refresh is 284.149... frames; the dropped
        // fraction must resurface as an extra frame now and then
        let mut clock = RefreshClock::new();
        let mut produced = 0u64;
        for _ in 0..100 {
            let (count, frames) = clock.budget(300, 97);
            assert_eq!(count, 1);
            assert!(frames == 284 || frames == 285, "got {frames}");
            produced += frames as u64;
        }
        assert_eq!(produced, (100.0 * samples_per_refresh(97)).floor() as u64);
    }

    #[test]
    fn buffer_time_is_clamped() {
        let mut player = Player::with_sink_factory(Arc::new(|_, _| {
            Err(PlayerError::DeviceUnavailable("test".into()))
        }));
        player.set_buffer_time_ms(1);
        assert_eq!(player.buffer_time_ms(), MIN_BUFFER_MS);
        player.set_buffer_time_ms(100_000);
        assert_eq!(player.buffer_time_ms(), MAX_BUFFER_MS);
        player.set_buffer_time_ms(80);
        assert_eq!(player.buffer_time_ms(), 80);
    }

    #[test]
    fn status_snapshot_round_trips() {
        for status in [
            PlayerStatus::NoSongLoaded,
            PlayerStatus::Stopped,
            PlayerStatus::Paused,
            PlayerStatus::Intro,
            PlayerStatus::MainTrack,
            PlayerStatus::MainTrackToEnd,
            PlayerStatus::TranfillActive,
            PlayerStatus::TranfillQuiting,
            PlayerStatus::DrumfillActive,
            PlayerStatus::Outro,
            PlayerStatus::SingleTrack,
        ] {
            assert_eq!(status_from_u8(status_to_u8(status)), status);
        }
    }

    #[test]
    fn fadeout_reaches_threshold_in_bounded_refreshes() {
        // property: level decay crosses 5/32767 within ~470 steps
        let mut level: f32 = 1.0;
        let mut steps = 0;
        while level * 32767.0 > PREPARE_STOP_THRESHOLD as f32 {
            level *= FADE_FACTOR;
            steps += 1;
            assert!(steps < 500, "fade must terminate");
        }
        assert!(steps <= 484, "got {steps}");
    }
}
