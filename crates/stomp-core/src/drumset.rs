//! Drumset bundle: instruments, velocity layers, PCM sample data

use tracing::warn;

use crate::bytes::ByteReader;
use crate::error::{PlayerError, Result};

/// Magic of a drumset bundle
pub const DRUMSET_MAGIC: [u8; 4] = *b"STDK";

const DRUMSET_VERSION: u16 = 1;
const MIDI_NOTE_COUNT: usize = 128;

/// PCM payload of one velocity layer
#[derive(Clone)]
pub struct SampleData {
    pub sample_rate: u32,
    pub channels: u16,
    pub looped: bool,
    /// Loop bounds in frames, only meaningful when `looped`
    pub loop_start: u32,
    pub loop_end: u32,
    /// Interleaved i16 PCM, `channels` samples per frame
    pub frames: Vec<i16>,
}

impl SampleData {
    pub fn frame_count(&self) -> usize {
        self.frames.len() / self.channels as usize
    }
}

impl std::fmt::Debug for SampleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleData")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("looped", &self.looped)
            .field("frames", &self.frame_count())
            .finish()
    }
}

/// One velocity layer of an instrument
#[derive(Debug, Clone)]
pub struct VelocityLayer {
    pub min_velocity: u8,
    pub sample: SampleData,
}

/// An instrument: ordered velocity layers, ascending `min_velocity`
#[derive(Debug, Clone, Default)]
pub struct Instrument {
    pub layers: Vec<VelocityLayer>,
}

impl Instrument {
    /// Index of the highest layer whose `min_velocity <= velocity`, ties
    /// resolved by later declaration. Falls back to the lowest layer when
    /// the velocity is below every threshold.
    pub fn layer_for_velocity(&self, velocity: u8) -> usize {
        self.layers
            .iter()
            .rposition(|l| l.min_velocity <= velocity)
            .unwrap_or(0)
    }
}

/// Parsed drumset bundle: instrument table indexed by MIDI note
pub struct Drumset {
    instruments: Vec<Option<Instrument>>,
}

impl std::fmt::Debug for Drumset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drumset")
            .field("instruments", &self.instrument_count())
            .finish()
    }
}

impl Drumset {
    /// Parse a drumset bundle. Unknown chunks are skipped; truncated or
    /// inconsistent data is refused before any sample can be voiced.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);

        let magic = r.tag()?;
        if magic != DRUMSET_MAGIC {
            return Err(PlayerError::BadFormat("not a drumset bundle".into()));
        }
        let version = r.u16("drumset version")?;
        if version > DRUMSET_VERSION {
            return Err(PlayerError::BadFormat(format!(
                "unsupported drumset version {version}"
            )));
        }

        let mut instruments: Vec<Option<Instrument>> = vec![None; MIDI_NOTE_COUNT];
        let mut instrument_count = 0usize;

        while !r.is_empty() {
            let (tag, mut payload) = r.chunk()?;
            match &tag {
                b"INST" => {
                    let (note, instrument) = parse_instrument(&mut payload)?;
                    if instruments[note as usize].replace(instrument).is_some() {
                        warn!(note, "duplicate instrument chunk, keeping the later one");
                    } else {
                        instrument_count += 1;
                    }
                }
                _ => {
                    // Unknown chunk: skipped by declared length
                }
            }
        }

        if instrument_count == 0 {
            return Err(PlayerError::BadFormat(
                "drumset declares no instruments".into(),
            ));
        }

        Ok(Self { instruments })
    }

    pub fn instrument(&self, note: u8) -> Option<&Instrument> {
        self.instruments.get(note as usize)?.as_ref()
    }

    pub fn has_instrument(&self, note: u8) -> bool {
        self.instrument(note).is_some()
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.iter().filter(|i| i.is_some()).count()
    }
}

fn parse_instrument(r: &mut ByteReader) -> Result<(u8, Instrument)> {
    let note = r.u8("instrument note")?;
    if note as usize >= MIDI_NOTE_COUNT {
        return Err(PlayerError::BadFormat(format!(
            "instrument note {note} out of MIDI range"
        )));
    }
    let layer_count = r.u8("layer count")?;

    let mut layers = Vec::with_capacity(layer_count as usize);
    let mut prev_velocity = 0u8;
    for i in 0..layer_count {
        let layer = parse_layer(r)?;
        if layer.min_velocity < prev_velocity {
            return Err(PlayerError::BadFormat(format!(
                "instrument {note}: layer {i} breaks ascending velocity order"
            )));
        }
        prev_velocity = layer.min_velocity;
        layers.push(layer);
    }

    if layers.is_empty() {
        return Err(PlayerError::BadFormat(format!(
            "instrument {note} has no velocity layers"
        )));
    }

    Ok((note, Instrument { layers }))
}

fn parse_layer(r: &mut ByteReader) -> Result<VelocityLayer> {
    let min_velocity = r.u8("layer velocity")?;
    let flags = r.u8("layer flags")?;
    let sample_rate = r.u32("sample rate")?;
    let channels = r.u16("channel count")?;
    let loop_start = r.u32("loop start")?;
    let loop_end = r.u32("loop end")?;
    let frame_count = r.u32("frame count")?;

    if channels == 0 || channels > 2 {
        return Err(PlayerError::BadFormat(format!(
            "layer declares {channels} channels"
        )));
    }
    if frame_count == 0 {
        return Err(PlayerError::BadFormat(
            "layer declares a sample of zero length".into(),
        ));
    }

    let looped = flags & 0x01 != 0;
    if looped && (loop_end <= loop_start || loop_end > frame_count) {
        return Err(PlayerError::BadFormat(format!(
            "layer loop bounds {loop_start}..{loop_end} invalid for {frame_count} frames"
        )));
    }

    let sample_count = frame_count as usize * channels as usize;
    let pcm = r.bytes(sample_count * 2, "layer PCM")?;
    let frames = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    Ok(VelocityLayer {
        min_velocity,
        sample: SampleData {
            sample_rate,
            channels,
            looped,
            loop_start,
            loop_end,
            frames,
        },
    })
}
