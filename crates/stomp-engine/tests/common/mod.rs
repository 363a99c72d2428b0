//! In-memory bundle builders shared by the playback tests

/// One 4/4 bar at 480 ticks per beat
pub const BAR: u32 = 1920;

pub fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Section payload: length, bar length, 4/4, tempo, then events as
/// `(tick, kind, a, b, arg)` records.
pub fn section(length: u32, tempo: u16, events: &[(u32, u8, u8, u8, u16)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&BAR.to_le_bytes());
    out.push(4);
    out.push(4);
    out.extend_from_slice(&tempo.to_le_bytes());
    out.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for (tick, kind, a, b, arg) in events {
        out.extend_from_slice(&tick.to_le_bytes());
        out.push(*kind);
        out.push(*a);
        out.push(*b);
        out.extend_from_slice(&arg.to_le_bytes());
    }
    out
}

pub fn note_on(tick: u32, note: u8, velocity: u8) -> (u32, u8, u8, u8, u16) {
    (tick, 0, note, velocity, 0)
}

pub struct PartSpec {
    pub main: Vec<u8>,
    pub fills: Vec<Vec<u8>>,
    pub tran: Option<Vec<u8>>,
    pub loop_count: u16,
    pub effect_name: String,
}

impl PartSpec {
    pub fn new(main: Vec<u8>) -> Self {
        Self {
            main,
            fills: Vec::new(),
            tran: None,
            loop_count: 0,
            effect_name: String::new(),
        }
    }
}

/// Assemble a song bundle with a 120 BPM 4/4 header.
pub fn song_bundle(
    intro: Option<Vec<u8>>,
    outro: Option<Vec<u8>>,
    parts: &[PartSpec],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"STSG");
    out.extend_from_slice(&1u16.to_le_bytes());

    let mut head = 120u16.to_le_bytes().to_vec();
    head.push(4);
    head.push(4);
    out.extend_from_slice(&chunk(b"HEAD", &head));

    if let Some(i) = intro {
        out.extend_from_slice(&chunk(b"INTR", &i));
    }
    if let Some(o) = outro {
        out.extend_from_slice(&chunk(b"OUTR", &o));
    }
    for part in parts {
        let mut payload = chunk(b"LOOP", &part.loop_count.to_le_bytes());
        if !part.effect_name.is_empty() {
            let mut name = vec![part.effect_name.len() as u8];
            name.extend_from_slice(part.effect_name.as_bytes());
            payload.extend_from_slice(&chunk(b"EFFN", &name));
        }
        payload.extend_from_slice(&chunk(b"MAIN", &part.main));
        for fill in &part.fills {
            payload.extend_from_slice(&chunk(b"FILL", fill));
        }
        if let Some(t) = &part.tran {
            payload.extend_from_slice(&chunk(b"TRAN", t));
        }
        out.extend_from_slice(&chunk(b"PART", &payload));
    }
    out
}

/// Drumset bundle with mono 44.1 kHz one-shot instruments:
/// `(note, sample_value, frame_count)` each with a single full-range layer.
pub fn drumset_bundle(instruments: &[(u8, i16, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"STDK");
    out.extend_from_slice(&1u16.to_le_bytes());
    for (note, value, frames) in instruments {
        let mut payload = vec![*note, 1, 0, 0];
        payload.extend_from_slice(&44100u32.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&frames.to_le_bytes());
        payload.extend_from_slice(&frames.to_le_bytes());
        for _ in 0..*frames {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&chunk(b"INST", &payload));
    }
    out
}
