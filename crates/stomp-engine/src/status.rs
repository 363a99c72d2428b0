//! Status event stream emitted by the player

use stomp_core::PartKind;

/// Tagged status events delivered from the audio loop to the control
/// thread over a queued channel, replacing per-signal callbacks. Events
/// for one player are observed in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The audio loop is up and playback begins
    Started,
    /// The audio loop exited and all buffers were released
    Stopped,
    /// Load or playback failure; always followed by `Stopped`
    Error(String),
    StartedChanged(bool),
    PartChanged(PartKind),
    SigNumChanged(u8),
    BeatInBarChanged(u32),
    /// Master tick position
    Position(u64),
    PlayingIntro,
    PlayingMainTrack(usize),
    PlayingOutro,
    PlayingTranfill(usize),
    PlayingDrumfill(usize, usize),
    TempoChangedBySong(u16),
}
