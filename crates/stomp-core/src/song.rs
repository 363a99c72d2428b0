//! Song bundle: sections, parts, and their MIDI-like event streams

use serde::{Deserialize, Serialize};

use crate::bytes::ByteReader;
use crate::error::{PlayerError, Result};
use crate::time::TimeSignature;

/// Magic of a song bundle
pub const SONG_MAGIC: [u8; 4] = *b"STSG";

const SONG_VERSION: u16 = 1;

/// Upper bound on main parts per song
pub const MAX_SONG_PARTS: usize = 32;

/// A timed event inside a section, tick-relative to the section start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackEvent {
    pub tick: u32,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    Tempo(u16),
    AccentHit,
}

/// One playable section: intro, outro, main loop, drum fill or transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub length_ticks: u32,
    pub bar_length: u32,
    pub time_sig: TimeSignature,
    pub tempo: u16,
    pub events: Vec<TrackEvent>,
}

impl Section {
    /// Parse a raw section payload (also the on-wire form of a
    /// single-track fragment).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let section = Self::read(&mut r)?;
        if !r.is_empty() {
            return Err(PlayerError::BadFormat(format!(
                "{} stray bytes after section payload",
                r.remaining()
            )));
        }
        Ok(section)
    }

    fn read(r: &mut ByteReader) -> Result<Self> {
        let length_ticks = r.u32("section length")?;
        let bar_length = r.u32("bar length")?;
        let num = r.u8("time signature numerator")?;
        let den = r.u8("time signature denominator")?;
        let tempo = r.u16("section tempo")?;
        let event_count = r.u32("event count")?;

        if length_ticks == 0 {
            return Err(PlayerError::BadFormat("section of zero length".into()));
        }
        if bar_length == 0 || num == 0 || den == 0 {
            return Err(PlayerError::BadFormat("section with empty bar grid".into()));
        }

        let mut events = Vec::with_capacity(event_count as usize);
        let mut prev_tick = 0u32;
        for _ in 0..event_count {
            let tick = r.u32("event tick")?;
            let kind = r.u8("event kind")?;
            let a = r.u8("event data")?;
            let b = r.u8("event data")?;
            let arg = r.u16("event arg")?;

            if tick > length_ticks {
                return Err(PlayerError::BadFormat(format!(
                    "event at tick {tick} beyond section length {length_ticks}"
                )));
            }
            if tick < prev_tick {
                return Err(PlayerError::BadFormat("events not sorted by tick".into()));
            }
            prev_tick = tick;

            let kind = match kind {
                0 => EventKind::NoteOn { note: a, velocity: b },
                1 => EventKind::NoteOff { note: a },
                2 => EventKind::Tempo(arg),
                3 => EventKind::AccentHit,
                // Unknown event kinds are ignored for forward compat
                _ => continue,
            };
            events.push(TrackEvent { tick, kind });
        }

        Ok(Self {
            length_ticks,
            bar_length,
            time_sig: TimeSignature::new(num, den),
            tempo,
            events,
        })
    }
}

/// A main part with its fills and accent-hit reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub main: Section,
    pub drum_fills: Vec<Section>,
    pub transition: Option<Section>,
    pub loop_count: u16,
    /// Accent-hit effect file name, empty when the part has none
    pub effect_name: String,
}

/// Parsed song bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub tempo: u16,
    pub time_sig: TimeSignature,
    pub intro: Option<Section>,
    pub outro: Option<Section>,
    pub parts: Vec<Part>,
}

impl Song {
    /// Parse a song bundle. Unknown chunks are skipped by declared length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);

        let magic = r.tag()?;
        if magic != SONG_MAGIC {
            return Err(PlayerError::BadFormat("not a song bundle".into()));
        }
        let version = r.u16("song version")?;
        if version > SONG_VERSION {
            return Err(PlayerError::BadFormat(format!(
                "unsupported song version {version}"
            )));
        }

        let mut head: Option<(u16, TimeSignature)> = None;
        let mut intro = None;
        let mut outro = None;
        let mut parts = Vec::new();

        while !r.is_empty() {
            let (tag, mut payload) = r.chunk()?;
            match &tag {
                b"HEAD" => {
                    let tempo = payload.u16("song tempo")?;
                    let num = payload.u8("song signature numerator")?;
                    let den = payload.u8("song signature denominator")?;
                    head = Some((tempo, TimeSignature::new(num, den)));
                }
                b"INTR" => intro = Some(Section::read(&mut payload)?),
                b"OUTR" => outro = Some(Section::read(&mut payload)?),
                b"PART" => parts.push(parse_part(&mut payload)?),
                _ => {
                    // Unknown chunk: skipped
                }
            }
        }

        let (tempo, time_sig) =
            head.ok_or_else(|| PlayerError::BadFormat("song has no header chunk".into()))?;

        if parts.is_empty() {
            return Err(PlayerError::BadFormat("song has no main parts".into()));
        }
        if parts.len() > MAX_SONG_PARTS {
            return Err(PlayerError::BadFormat(format!(
                "song declares {} parts, at most {MAX_SONG_PARTS} supported",
                parts.len()
            )));
        }

        Ok(Self {
            tempo,
            time_sig,
            intro,
            outro,
            parts,
        })
    }

    /// All instrument notes the song's note-on events reference, for
    /// validation against the loaded drumset.
    pub fn referenced_notes(&self) -> Vec<u8> {
        let mut notes: Vec<u8> = self
            .sections()
            .flat_map(|s| s.events.iter())
            .filter_map(|e| match e.kind {
                EventKind::NoteOn { note, .. } => Some(note),
                _ => None,
            })
            .collect();
        notes.sort_unstable();
        notes.dedup();
        notes
    }

    fn sections(&self) -> impl Iterator<Item = &Section> {
        self.intro
            .iter()
            .chain(self.outro.iter())
            .chain(self.parts.iter().flat_map(|p| {
                std::iter::once(&p.main)
                    .chain(p.drum_fills.iter())
                    .chain(p.transition.iter())
            }))
    }
}

fn parse_part(r: &mut ByteReader) -> Result<Part> {
    let mut loop_count = 0u16;
    let mut effect_name = String::new();
    let mut main = None;
    let mut drum_fills = Vec::new();
    let mut transition = None;

    while !r.is_empty() {
        let (tag, mut payload) = r.chunk()?;
        match &tag {
            b"LOOP" => loop_count = payload.u16("loop count")?,
            b"EFFN" => {
                let len = payload.u8("effect name length")? as usize;
                let raw = payload.bytes(len, "effect name")?;
                effect_name = String::from_utf8(raw.to_vec())
                    .map_err(|_| PlayerError::BadFormat("effect name is not UTF-8".into()))?;
            }
            b"MAIN" => main = Some(Section::read(&mut payload)?),
            b"FILL" => drum_fills.push(Section::read(&mut payload)?),
            b"TRAN" => transition = Some(Section::read(&mut payload)?),
            _ => {
                // Unknown sub-chunk: skipped
            }
        }
    }

    let main = main.ok_or_else(|| PlayerError::BadFormat("part has no main section".into()))?;

    Ok(Part {
        main,
        drum_fills,
        transition,
        loop_count,
        effect_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn section_bytes(length: u32, bar: u32, tempo: u16, events: &[(u32, u8, u8, u8, u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&bar.to_le_bytes());
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

    fn chunk(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(tag);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn head(tempo: u16) -> Vec<u8> {
        let mut payload = tempo.to_le_bytes().to_vec();
        payload.push(4);
        payload.push(4);
        chunk(b"HEAD", &payload)
    }

    fn part(main: &[u8], fills: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = chunk(b"MAIN", main);
        for f in fills {
            payload.extend_from_slice(&chunk(b"FILL", f));
        }
        chunk(b"PART", &payload)
    }

    fn song_bytes(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SONG_MAGIC);
        out.extend_from_slice(&1u16.to_le_bytes());
        for c in chunks {
            out.extend_from_slice(c);
        }
        out
    }

    #[test]
    fn parses_sections_and_parts() {
        let main = section_bytes(
            1920,
            1920,
            120,
            &[(0, 0, 36, 100, 0), (480, 0, 38, 90, 0), (960, 3, 0, 0, 0)],
        );
        let fill = section_bytes(1920, 1920, 0, &[(0, 0, 42, 80, 0)]);
        let intro = section_bytes(240, 1920, 0, &[]);
        let data = song_bytes(&[
            head(120),
            chunk(b"INTR", &intro),
            part(&main, &[fill]),
        ]);

        let song = Song::parse(&data).unwrap();
        assert_eq!(song.tempo, 120);
        assert!(song.intro.is_some());
        assert!(song.outro.is_none());
        assert_eq!(song.parts.len(), 1);
        assert_eq!(song.parts[0].main.events.len(), 3);
        assert_eq!(song.parts[0].drum_fills.len(), 1);
        assert_eq!(
            song.parts[0].main.events[0].kind,
            EventKind::NoteOn { note: 36, velocity: 100 }
        );
        assert_eq!(song.referenced_notes(), vec![36, 38, 42]);
    }

    #[test]
    fn missing_header_is_refused() {
        let main = section_bytes(1920, 1920, 0, &[]);
        let data = song_bytes(&[part(&main, &[])]);
        assert!(matches!(Song::parse(&data), Err(PlayerError::BadFormat(_))));
    }

    #[test]
    fn song_without_parts_is_refused() {
        let data = song_bytes(&[head(120)]);
        assert!(matches!(Song::parse(&data), Err(PlayerError::BadFormat(_))));
    }

    #[test]
    fn unknown_chunks_and_events_are_skipped() {
        let main = section_bytes(
            1920,
            1920,
            0,
            &[(0, 0, 36, 100, 0), (10, 99, 0, 0, 0), (20, 0, 38, 80, 0)],
        );
        let data = song_bytes(&[
            head(100),
            chunk(b"NOTE", b"a future annotation chunk"),
            part(&main, &[]),
        ]);
        let song = Song::parse(&data).unwrap();
        // the unknown event kind 99 is dropped, the rest survive
        assert_eq!(song.parts[0].main.events.len(), 2);
    }

    #[test]
    fn event_beyond_section_end_is_refused() {
        let main = section_bytes(100, 1920, 0, &[(101, 0, 36, 100, 0)]);
        let data = song_bytes(&[head(100), part(&main, &[])]);
        assert!(matches!(Song::parse(&data), Err(PlayerError::BadFormat(_))));
    }

    #[test]
    fn truncated_event_records_are_refused() {
        let mut main = section_bytes(1920, 1920, 0, &[(0, 0, 36, 100, 0)]);
        main.truncate(main.len() - 3);
        let data = song_bytes(&[head(100), part(&main, &[])]);
        assert!(matches!(Song::parse(&data), Err(PlayerError::BadFormat(_))));
    }

    #[test]
    fn single_track_fragment_round_trips_through_parse() {
        let raw = section_bytes(960, 480, 0, &[(0, 0, 36, 100, 0)]);
        let section = Section::parse(&raw).unwrap();
        assert_eq!(section.length_ticks, 960);
        assert_eq!(section.bar_length, 480);
        assert_eq!(section.events.len(), 1);
    }
}
