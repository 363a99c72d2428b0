//! stomp-engine: real-time playback engine for pedal-driven drum machines
//!
//! The [`Player`] owns the whole pipeline: it loads a drumset bundle and a
//! song bundle, spins up the audio loop, and translates pedal events into
//! transport transitions. Audio flows pedal event → queue → [`SongPlayer`]
//! → [`SoundManager`] voices → [`Mixer`] → [`AudioSink`].

mod mixer;
mod player;
mod queue;
mod sink;
mod sound;
mod song_player;
mod status;

pub use mixer::Mixer;
pub use player::{Player, SinkFactory, MAX_BUFFER_MS, MIN_BUFFER_MS};
pub use queue::PedalQueue;
pub use sink::{AudioFormat, AudioSink, BufferSink, CpalSink, SinkState, BYTES_PER_FRAME};
pub use sound::{SoundManager, MAX_VOICES};
pub use song_player::SongPlayer;
pub use status::StatusEvent;
