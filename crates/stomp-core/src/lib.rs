//! stomp-core: Domain types for the stomp playback engine

mod bytes;
mod drumset;
mod error;
mod pedal;
mod song;
mod status;
mod time;

pub use bytes::ByteReader;
pub use drumset::{Drumset, Instrument, SampleData, VelocityLayer};
pub use error::{PlayerError, Result};
pub use pedal::PedalEvent;
pub use song::{EventKind, Part, Section, Song, TrackEvent, MAX_SONG_PARTS};
pub use status::{PartKind, PlayerStatus, SectionKind};
pub use time::{tick_to_time_ratio, TimeSignature, TICKS_PER_BEAT, TICKS_PER_REFRESH};
