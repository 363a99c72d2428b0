//! Sound manager: drumset voices and accent-effect slots

use std::io::Cursor;
use std::sync::Arc;

use stomp_core::{Drumset, PlayerError, Result, MAX_SONG_PARTS};
use tracing::{info, warn};

/// Fixed polyphony of the voice pool
pub const MAX_VOICES: usize = 64;

const ENGINE_SAMPLE_RATE: f64 = 44100.0;

/// Index of a voice in the pool
pub type VoiceId = usize;

/// Where a voice reads its PCM from. Index-based so voices never hold
/// pointers into the drumset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceSource {
    Layer { note: u8, layer: usize },
    Effect { part: usize },
}

/// A live playback of one sample layer or effect slot
#[derive(Debug, Clone)]
struct Voice {
    active: bool,
    source: VoiceSource,
    /// Read cursor in fractional frames
    position: f64,
    /// Cursor increment per output frame (sample rate ratio)
    increment: f64,
    gain_l: f32,
    gain_r: f32,
    looped: bool,
    loop_start: u32,
    loop_end: u32,
    /// Absolute amplitude of the last rendered frame, for eviction
    last_amp: f32,
    /// Allocation order, lower is older
    spawned: u64,
}

impl Voice {
    fn idle() -> Self {
        Self {
            active: false,
            source: VoiceSource::Effect { part: 0 },
            position: 0.0,
            increment: 1.0,
            gain_l: 0.0,
            gain_r: 0.0,
            looped: false,
            loop_start: 0,
            loop_end: 0,
            last_amp: 0.0,
            spawned: 0,
        }
    }
}

/// An accent-hit sample decoded into engine PCM
struct EffectSample {
    channels: u16,
    sample_rate: u32,
    /// Interleaved i16 PCM
    frames: Arc<Vec<i16>>,
}

/// Owns the drumset tables, the fixed voice pool and the per-part effect
/// slots, and renders all active voices into a float accumulator.
pub struct SoundManager {
    drumset: Option<Drumset>,
    voices: Vec<Voice>,
    effects: Vec<Option<EffectSample>>,
    spawn_counter: u64,
}

impl Default for SoundManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundManager {
    pub fn new() -> Self {
        let mut effects = Vec::with_capacity(MAX_SONG_PARTS);
        effects.resize_with(MAX_SONG_PARTS, || None);
        Self {
            drumset: None,
            voices: vec![Voice::idle(); MAX_VOICES],
            effects,
            spawn_counter: 0,
        }
    }

    /// Parse and adopt a drumset bundle, silencing any outstanding voices.
    pub fn load_drumset(&mut self, data: &[u8]) -> Result<()> {
        let drumset = Drumset::parse(data)?;
        info!(instruments = drumset.instrument_count(), "drumset loaded");
        self.clear_voices();
        self.drumset = Some(drumset);
        Ok(())
    }

    pub fn drumset(&self) -> Option<&Drumset> {
        self.drumset.as_ref()
    }

    /// Load an accent-hit effect into a part slot from WAV bytes, or clear
    /// the slot when `data` is None.
    pub fn load_effect(&mut self, data: Option<&[u8]>, part: usize) -> Result<()> {
        if part >= MAX_SONG_PARTS {
            return Err(PlayerError::InternalState(format!(
                "effect slot {part} out of range"
            )));
        }

        let Some(bytes) = data else {
            self.effects[part] = None;
            for voice in &mut self.voices {
                if voice.source == (VoiceSource::Effect { part }) {
                    voice.active = false;
                }
            }
            return Ok(());
        };

        let reader = hound::WavReader::new(Cursor::new(bytes))
            .map_err(|e| PlayerError::BadFormat(format!("effect WAV: {e}")))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.channels > 2 {
            return Err(PlayerError::BadFormat(format!(
                "effect WAV has {} channels",
                spec.channels
            )));
        }

        let frames: Vec<i16> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let shift = spec.bits_per_sample.saturating_sub(16) as u32;
                reader
                    .into_samples::<i32>()
                    .filter_map(std::result::Result::ok)
                    .map(|s| (s >> shift) as i16)
                    .collect()
            }
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(std::result::Result::ok)
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect(),
        };

        if frames.is_empty() {
            return Err(PlayerError::BadFormat("effect WAV has no samples".into()));
        }

        self.effects[part] = Some(EffectSample {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            frames: Arc::new(frames),
        });
        Ok(())
    }

    /// Voice the layer matching `velocity` for the given instrument. Does
    /// not silence previous voices of the same instrument; drum hits ring.
    pub fn note_on(&mut self, note: u8, velocity: u8) -> Option<VoiceId> {
        let drumset = self.drumset.as_ref()?;
        let Some(instrument) = drumset.instrument(note) else {
            warn!(note, "note-on for unknown instrument");
            return None;
        };

        let layer_index = instrument.layer_for_velocity(velocity);
        let sample = &instrument.layers[layer_index].sample;
        let increment = sample.sample_rate as f64 / ENGINE_SAMPLE_RATE;
        let gain = velocity as f32 / 127.0;
        let (looped, loop_start, loop_end) = (sample.looped, sample.loop_start, sample.loop_end);

        let id = self.allocate();
        let voice = &mut self.voices[id];
        voice.active = true;
        voice.source = VoiceSource::Layer { note, layer: layer_index };
        voice.position = 0.0;
        voice.increment = increment;
        voice.gain_l = gain;
        voice.gain_r = gain;
        voice.looped = looped;
        voice.loop_start = loop_start;
        voice.loop_end = loop_end;
        voice.last_amp = f32::MAX; // not evictable before it has sounded
        voice.spawned = self.spawn_counter;
        self.spawn_counter += 1;
        Some(id)
    }

    /// Break the loop of any looped voice on this instrument so it runs to
    /// its sample end. No-op for one-shot voices.
    pub fn note_off(&mut self, note: u8) {
        for voice in &mut self.voices {
            if voice.active
                && voice.looped
                && matches!(voice.source, VoiceSource::Layer { note: n, .. } if n == note)
            {
                voice.looped = false;
            }
        }
    }

    /// Trigger the accent-hit effect loaded for a part, one-shot.
    pub fn play_effect(&mut self, part: usize) -> Option<VoiceId> {
        let effect = self.effects.get(part)?.as_ref()?;
        let increment = effect.sample_rate as f64 / ENGINE_SAMPLE_RATE;

        let id = self.allocate();
        let voice = &mut self.voices[id];
        voice.active = true;
        voice.source = VoiceSource::Effect { part };
        voice.position = 0.0;
        voice.increment = increment;
        voice.gain_l = 1.0;
        voice.gain_r = 1.0;
        voice.looped = false;
        voice.loop_start = 0;
        voice.loop_end = 0;
        voice.last_amp = f32::MAX;
        voice.spawned = self.spawn_counter;
        self.spawn_counter += 1;
        Some(id)
    }

    pub fn has_effect(&self, part: usize) -> bool {
        self.effects.get(part).is_some_and(|e| e.is_some())
    }

    /// Render `frames` stereo frames, accumulating into `buffer` (i16
    /// scale, interleaved L,R) at float precision. The caller clips on
    /// commit.
    pub fn render(&mut self, buffer: &mut [f32], frames: usize) {
        let len = frames * 2;
        debug_assert!(buffer.len() >= len);

        for voice in &mut self.voices {
            if !voice.active {
                continue;
            }
            let Some((data, channels, frame_count)) =
                resolve_source(voice.source, self.drumset.as_ref(), &self.effects)
            else {
                voice.active = false;
                continue;
            };

            for out in buffer[..len].chunks_exact_mut(2) {
                if voice.looped && voice.position >= voice.loop_end as f64 {
                    voice.position -= (voice.loop_end - voice.loop_start) as f64;
                }

                let index = voice.position as usize;
                // interpolation neighbor wraps across the loop seam
                let next = if voice.looped && index + 1 >= voice.loop_end as usize {
                    voice.loop_start as usize
                } else {
                    index + 1
                };
                if index >= frame_count || next >= frame_count {
                    voice.active = false;
                    voice.last_amp = 0.0;
                    break;
                }

                let frac = (voice.position - index as f64) as f32;
                let (l, r) = read_frame(data, channels, index, next, frac);
                let l = l * voice.gain_l;
                let r = r * voice.gain_r;
                out[0] += l;
                out[1] += r;
                voice.last_amp = l.abs().max(r.abs());
                voice.position += voice.increment;
            }
        }
    }

    /// Silence and forget everything: voices, drumset, effect slots.
    pub fn clear(&mut self) {
        self.clear_voices();
        self.drumset = None;
        for slot in &mut self.effects {
            *slot = None;
        }
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn clear_voices(&mut self) {
        for voice in &mut self.voices {
            voice.active = false;
        }
    }

    /// Find a free voice, or evict the quietest (oldest on ties).
    fn allocate(&mut self) -> VoiceId {
        if let Some(free) = self.voices.iter().position(|v| !v.active) {
            return free;
        }
        self.voices
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.last_amp
                    .total_cmp(&b.last_amp)
                    .then(a.spawned.cmp(&b.spawned))
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Resolve a voice source to (interleaved PCM, channels, frame count).
fn resolve_source<'a>(
    source: VoiceSource,
    drumset: Option<&'a Drumset>,
    effects: &'a [Option<EffectSample>],
) -> Option<(&'a [i16], u16, usize)> {
    match source {
        VoiceSource::Layer { note, layer } => {
            let sample = &drumset?.instrument(note)?.layers.get(layer)?.sample;
            Some((sample.frames.as_slice(), sample.channels, sample.frame_count()))
        }
        VoiceSource::Effect { part } => {
            let effect = effects.get(part)?.as_ref()?;
            let frame_count = effect.frames.len() / effect.channels as usize;
            Some((effect.frames.as_slice(), effect.channels, frame_count))
        }
    }
}

/// Linearly interpolated stereo read at a fractional frame index.
fn read_frame(data: &[i16], channels: u16, index: usize, next: usize, frac: f32) -> (f32, f32) {
    let ch = channels as usize;
    let sample = |frame: usize, c: usize| data[frame * ch + c.min(ch - 1)] as f32;
    let lerp = |c: usize| {
        let s0 = sample(index, c);
        let s1 = sample(next, c);
        s0 + frac * (s1 - s0)
    };
    (lerp(0), lerp(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_bytes(min_velocity: u8, flags: u8, frames: &[i16]) -> Vec<u8> {
        let mut out = vec![min_velocity, flags];
        out.extend_from_slice(&44100u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for s in frames {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    fn drumset_bytes(instruments: &[(u8, Vec<(u8, u8, Vec<i16>)>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"STDK");
        out.extend_from_slice(&1u16.to_le_bytes());
        for (note, layers) in instruments {
            let mut payload = vec![*note, layers.len() as u8];
            for (vel, flags, frames) in layers {
                payload.extend_from_slice(&layer_bytes(*vel, *flags, frames));
            }
            out.extend_from_slice(b"INST");
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }

    fn manager_with_kick(frames: Vec<i16>) -> SoundManager {
        let mut sm = SoundManager::new();
        sm.load_drumset(&drumset_bytes(&[(36, vec![(0, 0, frames)])]))
            .unwrap();
        sm
    }

    #[test]
    fn note_on_selects_layer_by_velocity() {
        let mut sm = SoundManager::new();
        sm.load_drumset(&drumset_bytes(&[(
            36,
            vec![(0, 0, vec![10; 8]), (64, 0, vec![20; 8]), (110, 0, vec![30; 8])],
        )]))
        .unwrap();

        for (vel, expected_layer) in [(1u8, 0usize), (63, 0), (64, 1), (109, 1), (127, 2)] {
            let id = sm.note_on(36, vel).unwrap();
            let VoiceSource::Layer { layer, .. } = sm.voices[id].source else {
                panic!("expected a layer voice");
            };
            assert_eq!(layer, expected_layer, "velocity {vel}");
        }
    }

    #[test]
    fn note_on_for_missing_instrument_is_none() {
        let mut sm = manager_with_kick(vec![100; 4]);
        assert!(sm.note_on(99, 100).is_none());
    }

    #[test]
    fn one_shot_voice_ends_at_sample_bounds() {
        let mut sm = manager_with_kick(vec![1000; 8]);
        sm.note_on(36, 127).unwrap();
        assert_eq!(sm.active_voices(), 1);

        let mut buffer = vec![0.0f32; 64];
        sm.render(&mut buffer, 32);
        assert_eq!(sm.active_voices(), 0);
        // frames before the end carry the sample, frames after stay silent
        assert!(buffer[0] != 0.0);
        assert_eq!(buffer[40], 0.0);
    }

    #[test]
    fn new_note_does_not_silence_previous_voice() {
        let mut sm = manager_with_kick(vec![500; 64]);
        sm.note_on(36, 127).unwrap();
        sm.note_on(36, 127).unwrap();
        assert_eq!(sm.active_voices(), 2);

        // two identical full-velocity voices sum to double amplitude
        let mut buffer = vec![0.0f32; 8];
        sm.render(&mut buffer, 4);
        assert!((buffer[2] - 1000.0).abs() < 1.0);
    }

    #[test]
    fn looped_voice_wraps_until_note_off() {
        let mut sm = SoundManager::new();
        sm.load_drumset(&drumset_bytes(&[(40, vec![(0, 1, vec![100; 16])])]))
            .unwrap();
        sm.note_on(40, 127).unwrap();

        let mut buffer = vec![0.0f32; 256];
        sm.render(&mut buffer, 128);
        assert_eq!(sm.active_voices(), 1, "looped voice survives its length");

        sm.note_off(40);
        buffer.fill(0.0);
        sm.render(&mut buffer, 128);
        assert_eq!(sm.active_voices(), 0, "released voice runs to its end");
    }

    #[test]
    fn note_off_is_noop_for_one_shots() {
        let mut sm = manager_with_kick(vec![100; 512]);
        sm.note_on(36, 127).unwrap();
        sm.note_off(36);
        assert_eq!(sm.active_voices(), 1);
    }

    #[test]
    fn pool_overflow_evicts_quietest_voice() {
        let mut sm = manager_with_kick(vec![100; 4096]);

        // fill the pool: one quiet voice among loud ones
        sm.note_on(36, 1).unwrap();
        for _ in 1..MAX_VOICES {
            sm.note_on(36, 127).unwrap();
        }
        assert_eq!(sm.active_voices(), MAX_VOICES);

        // render so per-voice amplitudes are known
        let mut buffer = vec![0.0f32; 8];
        sm.render(&mut buffer, 4);

        let id = sm.note_on(36, 127).unwrap();
        assert_eq!(sm.active_voices(), MAX_VOICES);
        assert_eq!(id, 0, "the quiet voice gets evicted");
    }

    #[test]
    fn effect_slots_load_play_and_clear() {
        let mut sm = manager_with_kick(vec![100; 4]);

        // build a tiny mono 16-bit WAV in memory
        let mut wav = Vec::new();
        {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 44100,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut writer =
                hound::WavWriter::new(Cursor::new(&mut wav), spec).unwrap();
            for _ in 0..32 {
                writer.write_sample(2000i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        sm.load_effect(Some(&wav), 3).unwrap();
        assert!(sm.has_effect(3));
        assert!(sm.play_effect(3).is_some());

        let mut buffer = vec![0.0f32; 8];
        sm.render(&mut buffer, 4);
        assert!((buffer[0] - 2000.0).abs() < 1.0);

        sm.load_effect(None, 3).unwrap();
        assert!(!sm.has_effect(3));
        assert!(sm.play_effect(3).is_none());
    }

    #[test]
    fn clear_resets_everything() {
        let mut sm = manager_with_kick(vec![100; 64]);
        sm.note_on(36, 127).unwrap();
        sm.clear();
        assert_eq!(sm.active_voices(), 0);
        assert!(sm.note_on(36, 127).is_none());
    }
}
