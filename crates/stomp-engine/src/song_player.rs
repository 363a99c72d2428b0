//! Song player: transport state machine and tick engine
//!
//! Translates ticks into note triggers against the sound manager and
//! walks the song's sections in response to pedal events. All transitions
//! happen at exact tick boundaries so the master tick stays monotonic.

use std::collections::VecDeque;

use stomp_core::{
    EventKind, PedalEvent, PlayerStatus, Result, Section, Song, TimeSignature, TrackEvent,
    TICKS_PER_BEAT,
};
use tracing::{debug, info, warn};

use crate::sound::SoundManager;

/// Pedal events remembered while a fill or the intro plays
const PENDING_PEDAL_DEPTH: usize = 4;

/// Read position inside a section's event stream
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    /// Ticks into the section
    local: u64,
    /// Index of the next unfired event
    next_event: usize,
}

/// Fire every event up to and including `cur.local + step`, then advance.
fn collect_events(section: &Section, cur: &mut Cursor, step: u64, fired: &mut Vec<TrackEvent>) {
    let end = cur.local + step;
    while let Some(event) = section.events.get(cur.next_event) {
        if event.tick as u64 > end {
            break;
        }
        fired.push(*event);
        cur.next_event += 1;
    }
    cur.local = end;
}

/// Advance past events without firing them (the main grid under a fill).
fn skip_events(section: &Section, cur: &mut Cursor, step: u64) {
    let end = cur.local + step;
    while let Some(event) = section.events.get(cur.next_event) {
        if event.tick as u64 > end {
            break;
        }
        cur.next_event += 1;
    }
    cur.local = end;
}

/// Ticks until the next bar line of a grid, 0 when exactly on one
fn ticks_to_bar(local: u64, bar_length: u64) -> u64 {
    let rem = local % bar_length;
    if rem == 0 { 0 } else { bar_length - rem }
}

/// Drives one loaded song through its sections
pub struct SongPlayer {
    song: Option<Song>,
    single: Option<Section>,
    status: PlayerStatus,
    part_index: usize,
    /// Drum fill currently (or last) played for this part
    drumfill_index: usize,
    /// Drum fill the next pedal press picks
    next_drumfill: usize,
    master_tick: u64,
    bpm: u16,
    time_sig: TimeSignature,
    /// Cursor of the current part's main section; keeps advancing
    /// silently while a drum fill plays so the bar grid never breaks
    main_cur: Cursor,
    /// Cursor of the active non-main section (intro, outro, fills,
    /// single track)
    fill_cur: Cursor,
    /// Completed loops of the current main part
    loops_done: u16,
    /// A long press requested a transition at the next bar line
    tranfill_armed: bool,
    pedal_held: bool,
    pending: VecDeque<PedalEvent>,
    auto_pilot: bool,
}

impl Default for SongPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SongPlayer {
    pub fn new() -> Self {
        Self {
            song: None,
            single: None,
            status: PlayerStatus::NoSongLoaded,
            part_index: 0,
            drumfill_index: 0,
            next_drumfill: 0,
            master_tick: 0,
            bpm: 0,
            time_sig: TimeSignature::default(),
            main_cur: Cursor::default(),
            fill_cur: Cursor::default(),
            loops_done: 0,
            tranfill_armed: false,
            pedal_held: false,
            pending: VecDeque::new(),
            auto_pilot: false,
        }
    }

    /// Parse and adopt a song bundle. The transport lands in `Stopped`.
    pub fn load_song(&mut self, data: &[u8]) -> Result<()> {
        let song = Song::parse(data)?;
        info!(
            parts = song.parts.len(),
            intro = song.intro.is_some(),
            outro = song.outro.is_some(),
            tempo = song.tempo,
            "song loaded"
        );
        self.bpm = song.tempo;
        self.time_sig = song.time_sig;
        self.song = Some(song);
        self.single = None;
        self.master_tick = 0;
        self.status = PlayerStatus::Stopped;
        Ok(())
    }

    pub fn song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    pub fn set_auto_pilot(&mut self, auto_pilot: bool) {
        self.auto_pilot = auto_pilot;
    }

    pub fn get_tempo(&self) -> u16 {
        self.bpm
    }

    pub fn get_time_signature(&self) -> TimeSignature {
        self.time_sig
    }

    pub fn get_master_tick(&self) -> u64 {
        self.master_tick
    }

    pub fn get_player_status(&self) -> (PlayerStatus, usize, usize) {
        (self.status, self.part_index, self.drumfill_index)
    }

    /// Accent-hit effect file name of a part, empty when it has none
    pub fn get_sound_effect_name(&self, part: usize) -> &str {
        self.song
            .as_ref()
            .and_then(|s| s.parts.get(part))
            .map(|p| p.effect_name.as_str())
            .unwrap_or("")
    }

    /// Current beat within the bar and the master tick of the bar's first
    /// beat
    pub fn get_beat_in_bar(&self) -> (u32, u64) {
        let Some((bar_length, num, cur)) = self.active_grid() else {
            return (0, 0);
        };
        let pos_in_bar = cur.local % bar_length;
        let beat = ((pos_in_bar / TICKS_PER_BEAT as u64) % num as u64) as u32;
        (beat, self.master_tick - pos_in_bar)
    }

    /// Start playback from the top: intro when present, else part 0.
    pub fn external_start(&mut self) {
        let Some(song) = self.song.as_ref() else {
            warn!("external_start with no song loaded");
            return;
        };
        self.master_tick = 0;
        self.pending.clear();
        self.tranfill_armed = false;
        self.pedal_held = false;
        self.loops_done = 0;
        self.part_index = 0;

        if let Some(intro) = song.intro.as_ref() {
            self.bpm = if intro.tempo > 0 { intro.tempo } else { song.tempo };
            self.time_sig = intro.time_sig;
            self.fill_cur = Cursor::default();
            self.status = PlayerStatus::Intro;
        } else {
            self.enter_main(0);
        }
    }

    /// Soft stop: the transport halts, the player fades out around it.
    pub fn external_stop(&mut self) {
        if self.status != PlayerStatus::NoSongLoaded {
            self.stop_playback();
        }
    }

    /// Configure diagnostic playback of one section fragment.
    pub fn set_single_track(&mut self, section: Section) {
        self.time_sig = section.time_sig;
        self.single = Some(section);
        self.master_tick = 0;
        self.fill_cur = Cursor::default();
        self.pending.clear();
        self.status = PlayerStatus::SingleTrack;
    }

    /// Leading silent ticks so a fragment's end lands on a bar line, or
    /// -1 for an unusable bar length.
    pub fn calculate_single_track_offset(n_ticks: u32, bar_length: u32) -> i64 {
        if bar_length == 0 {
            return -1;
        }
        ((bar_length - n_ticks % bar_length) % bar_length) as i64
    }

    /// Feed one pedal event into the state machine.
    pub fn button_callback(&mut self, event: PedalEvent, sound: &mut SoundManager) {
        match self.status {
            // Stopped transports stay stopped; single-track ignores pedals
            PlayerStatus::NoSongLoaded
            | PlayerStatus::Stopped
            | PlayerStatus::Paused
            | PlayerStatus::SingleTrack
            | PlayerStatus::Outro => {}
            PlayerStatus::MainTrack => self.pedal_in_main(event, sound),
            PlayerStatus::MainTrackToEnd => {
                if event == PedalEvent::SecondaryPress {
                    sound.play_effect(self.part_index);
                }
            }
            PlayerStatus::Intro
            | PlayerStatus::DrumfillActive
            | PlayerStatus::TranfillActive
            | PlayerStatus::TranfillQuiting => match event {
                PedalEvent::Release => {
                    self.pedal_held = false;
                    if self.status == PlayerStatus::TranfillActive {
                        debug!("transition released early");
                        self.status = PlayerStatus::TranfillQuiting;
                    }
                }
                PedalEvent::SecondaryPress => {
                    sound.play_effect(self.part_index);
                }
                other => {
                    if self.pending.len() < PENDING_PEDAL_DEPTH {
                        self.pending.push_back(other);
                    } else {
                        warn!(?other, "pending pedal queue full, dropping event");
                    }
                }
            },
        }
    }

    /// Advance the transport by `n_ticks`, firing events into the sound
    /// manager. `_ratio` (seconds per tick) is maintained by the caller.
    pub fn process_song(&mut self, _ratio: f64, n_ticks: u32, sound: &mut SoundManager) {
        if self.status == PlayerStatus::SingleTrack || !self.status.is_playing() {
            return;
        }

        // replay one remembered pedal event once back in the main loop
        if self.status == PlayerStatus::MainTrack {
            if let Some(event) = self.pending.pop_front() {
                self.pedal_in_main(event, sound);
            }
        }

        let mut remaining = n_ticks as u64;
        while remaining > 0 && self.status.is_playing() {
            let distance = self.ticks_to_boundary();
            if distance == 0 {
                self.on_boundary();
                continue;
            }
            let step = distance.min(remaining);
            self.advance(step, sound);
            remaining -= step;
            if self.ticks_to_boundary() == 0 {
                self.on_boundary();
            }
        }
    }

    /// Advance single-track playback: `offset` leading silent ticks, then
    /// the fragment once, then `Stopped`.
    pub fn process_single_track(
        &mut self,
        _ratio: f64,
        n_ticks: u32,
        offset: i64,
        sound: &mut SoundManager,
    ) {
        if self.status != PlayerStatus::SingleTrack {
            return;
        }
        let mut fired = Vec::new();
        let mut finished = false;
        let step;
        {
            let Self { single, fill_cur, .. } = self;
            let Some(section) = single.as_ref() else {
                return;
            };
            let offset = offset.max(0) as u64;
            let total = offset + section.length_ticks as u64;
            let end = (fill_cur.local + n_ticks as u64).min(total);

            while let Some(event) = section.events.get(fill_cur.next_event) {
                if offset + event.tick as u64 > end {
                    break;
                }
                fired.push(*event);
                fill_cur.next_event += 1;
            }
            step = end - fill_cur.local;
            fill_cur.local = end;
            if end >= total {
                finished = true;
            }
        }
        self.master_tick += step;
        for event in fired {
            self.emit_event(event, sound);
        }
        if finished {
            info!("single track finished");
            self.status = PlayerStatus::Stopped;
        }
    }

    // --- internals ---

    fn pedal_in_main(&mut self, event: PedalEvent, sound: &mut SoundManager) {
        match event {
            PedalEvent::Press => self.enter_drumfill(),
            PedalEvent::Release => self.pedal_held = false,
            PedalEvent::LongPress => {
                self.tranfill_armed = true;
                self.pedal_held = true;
            }
            PedalEvent::MultiTap => {
                debug!("multi tap: finishing the bar, then outro");
                self.tranfill_armed = false;
                self.status = PlayerStatus::MainTrackToEnd;
            }
            PedalEvent::SecondaryPress => {
                sound.play_effect(self.part_index);
            }
        }
    }

    /// Ticks until something other than plain event playback happens.
    /// 0 means a boundary action is due right now.
    fn ticks_to_boundary(&self) -> u64 {
        let Some(song) = self.song.as_ref() else {
            return u64::MAX;
        };
        match self.status {
            PlayerStatus::Intro => section_remaining(song.intro.as_ref(), self.fill_cur),
            PlayerStatus::MainTrack => {
                let main = &song.parts[self.part_index].main;
                let to_end = (main.length_ticks as u64).saturating_sub(self.main_cur.local);
                if self.tranfill_armed {
                    to_end.min(ticks_to_bar(self.main_cur.local, main.bar_length as u64))
                } else {
                    to_end
                }
            }
            PlayerStatus::MainTrackToEnd => {
                let main = &song.parts[self.part_index].main;
                let to_end = (main.length_ticks as u64).saturating_sub(self.main_cur.local);
                to_end.min(ticks_to_bar(self.main_cur.local, main.bar_length as u64))
            }
            PlayerStatus::DrumfillActive => section_remaining(
                song.parts[self.part_index]
                    .drum_fills
                    .get(self.drumfill_index),
                self.fill_cur,
            ),
            PlayerStatus::TranfillActive => {
                section_remaining(song.parts[self.part_index].transition.as_ref(), self.fill_cur)
            }
            PlayerStatus::TranfillQuiting => {
                match song.parts[self.part_index].transition.as_ref() {
                    Some(fill) => {
                        let to_end =
                            (fill.length_ticks as u64).saturating_sub(self.fill_cur.local);
                        to_end.min(ticks_to_bar(self.fill_cur.local, fill.bar_length as u64))
                    }
                    None => 0,
                }
            }
            PlayerStatus::Outro => section_remaining(song.outro.as_ref(), self.fill_cur),
            _ => u64::MAX,
        }
    }

    /// Act on the boundary `ticks_to_boundary` reported as due.
    fn on_boundary(&mut self) {
        let Some(song) = self.song.as_ref() else {
            return;
        };
        match self.status {
            PlayerStatus::Intro => self.enter_main(0),
            PlayerStatus::MainTrack => {
                let main = &song.parts[self.part_index].main;
                let (len, bar) = (main.length_ticks as u64, main.bar_length as u64);
                let loop_count = song.parts[self.part_index].loop_count;
                if self.tranfill_armed && self.main_cur.local % bar == 0 {
                    self.enter_tranfill();
                } else if self.main_cur.local >= len {
                    // main part wraps
                    self.main_cur = Cursor::default();
                    self.loops_done += 1;
                    if self.auto_pilot && loop_count > 0 && self.loops_done >= loop_count {
                        debug!(part = self.part_index, "auto pilot advances the part");
                        self.enter_tranfill();
                    }
                }
            }
            PlayerStatus::MainTrackToEnd => {
                if song.outro.is_some() {
                    self.enter_outro();
                } else {
                    self.stop_playback();
                }
            }
            PlayerStatus::DrumfillActive => {
                debug!(part = self.part_index, "drum fill done, back to the main loop");
                self.status = PlayerStatus::MainTrack;
            }
            PlayerStatus::TranfillActive => {
                if self.pedal_held {
                    // held transition loops until the pedal is released
                    self.fill_cur = Cursor::default();
                } else {
                    self.advance_part();
                }
            }
            PlayerStatus::TranfillQuiting => self.advance_part(),
            PlayerStatus::Outro => self.stop_playback(),
            _ => {}
        }
    }

    /// Advance cursors by `step` ticks and fire the events passed over.
    fn advance(&mut self, step: u64, sound: &mut SoundManager) {
        let mut fired: Vec<TrackEvent> = Vec::new();
        let status = self.status;
        {
            let Self {
                song,
                part_index,
                drumfill_index,
                main_cur,
                fill_cur,
                loops_done,
                ..
            } = self;
            let Some(song) = song.as_ref() else {
                return;
            };
            match status {
                PlayerStatus::Intro => {
                    if let Some(intro) = song.intro.as_ref() {
                        collect_events(intro, fill_cur, step, &mut fired);
                    }
                }
                PlayerStatus::MainTrack | PlayerStatus::MainTrackToEnd => {
                    collect_events(&song.parts[*part_index].main, main_cur, step, &mut fired);
                }
                PlayerStatus::DrumfillActive => {
                    if let Some(fill) = song.parts[*part_index].drum_fills.get(*drumfill_index) {
                        collect_events(fill, fill_cur, step, &mut fired);
                    }
                    // the main grid continues silently underneath the fill
                    let main = &song.parts[*part_index].main;
                    let len = main.length_ticks as u64;
                    let mut rem = step;
                    while rem > 0 {
                        let sub = (len - main_cur.local).min(rem);
                        skip_events(main, main_cur, sub);
                        rem -= sub;
                        if main_cur.local >= len {
                            *main_cur = Cursor::default();
                            *loops_done += 1;
                        }
                    }
                }
                PlayerStatus::TranfillActive | PlayerStatus::TranfillQuiting => {
                    if let Some(fill) = song.parts[*part_index].transition.as_ref() {
                        collect_events(fill, fill_cur, step, &mut fired);
                    }
                }
                PlayerStatus::Outro => {
                    if let Some(outro) = song.outro.as_ref() {
                        collect_events(outro, fill_cur, step, &mut fired);
                    }
                }
                _ => {}
            }
        }
        self.master_tick += step;
        for event in fired {
            self.emit_event(event, sound);
        }
    }

    fn emit_event(&mut self, event: TrackEvent, sound: &mut SoundManager) {
        match event.kind {
            EventKind::NoteOn { note, velocity } => {
                sound.note_on(note, velocity);
            }
            EventKind::NoteOff { note } => sound.note_off(note),
            EventKind::Tempo(bpm) => {
                if bpm > 0 {
                    debug!(bpm, "tempo change from song event");
                    self.bpm = bpm;
                }
            }
            EventKind::AccentHit => {
                sound.play_effect(self.part_index);
            }
        }
    }

    fn enter_main(&mut self, part: usize) {
        let Some(song) = self.song.as_ref() else {
            return;
        };
        let main = &song.parts[part].main;
        self.bpm = if main.tempo > 0 { main.tempo } else { song.tempo };
        self.time_sig = main.time_sig;
        self.status = PlayerStatus::MainTrack;
        self.part_index = part;
        self.drumfill_index = 0;
        self.next_drumfill = 0;
        self.loops_done = 0;
        self.main_cur = Cursor::default();
        info!(part, bpm = self.bpm, "entering main track");
    }

    fn enter_drumfill(&mut self) {
        let Some(song) = self.song.as_ref() else {
            return;
        };
        let fills = &song.parts[self.part_index].drum_fills;
        if fills.is_empty() {
            debug!(part = self.part_index, "pedal press but the part has no drum fills");
            return;
        }
        let index = self.next_drumfill % fills.len();
        let fill = &fills[index];

        // the fill picks up at the main part's position within the bar so
        // it plays the remainder and hands the grid back intact
        let offset = self.main_cur.local % fill.bar_length as u64;
        if offset >= fill.length_ticks as u64 {
            warn!(part = self.part_index, index, "drum fill shorter than bar position, skipped");
            return;
        }
        self.drumfill_index = index;
        self.next_drumfill = (index + 1) % fills.len();
        self.fill_cur = Cursor {
            local: offset,
            next_event: fill.events.partition_point(|e| (e.tick as u64) < offset),
        };
        self.status = PlayerStatus::DrumfillActive;
        debug!(part = self.part_index, index, offset, "drum fill starts");
    }

    fn enter_tranfill(&mut self) {
        self.tranfill_armed = false;
        let has_fill = self
            .song
            .as_ref()
            .is_some_and(|s| s.parts[self.part_index].transition.is_some());
        if has_fill {
            self.fill_cur = Cursor::default();
            self.status = PlayerStatus::TranfillActive;
            debug!(part = self.part_index, "transition fill starts");
        } else {
            self.advance_part();
        }
    }

    fn enter_outro(&mut self) {
        let Some(song) = self.song.as_ref() else {
            return;
        };
        if let Some(outro) = song.outro.as_ref() {
            if outro.tempo > 0 {
                self.bpm = outro.tempo;
            }
            self.time_sig = outro.time_sig;
        }
        self.fill_cur = Cursor::default();
        self.status = PlayerStatus::Outro;
        info!("entering outro");
    }

    fn advance_part(&mut self) {
        let count = self.song.as_ref().map(|s| s.parts.len()).unwrap_or(1);
        let next = (self.part_index + 1) % count;
        self.enter_main(next);
    }

    fn stop_playback(&mut self) {
        self.status = PlayerStatus::Stopped;
        self.tranfill_armed = false;
        self.pedal_held = false;
        self.pending.clear();
        info!(master_tick = self.master_tick, "transport stopped");
    }

    /// Bar grid of whatever section is audible: (bar length, numerator,
    /// cursor)
    fn active_grid(&self) -> Option<(u64, u8, Cursor)> {
        if self.status == PlayerStatus::SingleTrack {
            let section = self.single.as_ref()?;
            return Some((
                section.bar_length as u64,
                section.time_sig.num,
                self.fill_cur,
            ));
        }
        let song = self.song.as_ref()?;
        let (section, cur) = match self.status {
            PlayerStatus::Intro => (song.intro.as_ref()?, self.fill_cur),
            PlayerStatus::MainTrack | PlayerStatus::MainTrackToEnd => {
                (&song.parts[self.part_index].main, self.main_cur)
            }
            PlayerStatus::DrumfillActive => (
                song.parts[self.part_index]
                    .drum_fills
                    .get(self.drumfill_index)?,
                self.fill_cur,
            ),
            PlayerStatus::TranfillActive | PlayerStatus::TranfillQuiting => {
                (song.parts[self.part_index].transition.as_ref()?, self.fill_cur)
            }
            PlayerStatus::Outro => (song.outro.as_ref()?, self.fill_cur),
            _ => return None,
        };
        Some((section.bar_length as u64, self.time_sig.num, cur))
    }
}

fn section_remaining(section: Option<&Section>, cur: Cursor) -> u64 {
    match section {
        Some(s) => (s.length_ticks as u64).saturating_sub(cur.local),
        // a state pointing at a missing section resolves at once
        None => 0,
    }
}
