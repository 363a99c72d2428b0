//! Transport status vocabulary

use serde::{Deserialize, Serialize};

/// Song player transport status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayerStatus {
    #[default]
    NoSongLoaded,
    Stopped,
    Paused,
    Intro,
    MainTrack,
    MainTrackToEnd,
    TranfillActive,
    TranfillQuiting,
    DrumfillActive,
    Outro,
    SingleTrack,
}

impl PlayerStatus {
    /// Whether the transport is in a state that produces audio
    pub fn is_playing(self) -> bool {
        !matches!(
            self,
            Self::NoSongLoaded | Self::Stopped | Self::Paused
        )
    }
}

/// Coarse section kind shown to the host (one value per screen color on the
/// original device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartKind {
    #[default]
    Stopped,
    Pause,
    Intro,
    MainLoop,
    DrumFill,
    TransFill,
    Outro,
}

impl From<PlayerStatus> for PartKind {
    fn from(status: PlayerStatus) -> Self {
        match status {
            PlayerStatus::NoSongLoaded | PlayerStatus::Stopped => Self::Stopped,
            PlayerStatus::Paused => Self::Pause,
            PlayerStatus::Intro => Self::Intro,
            PlayerStatus::MainTrack
            | PlayerStatus::MainTrackToEnd
            | PlayerStatus::SingleTrack => Self::MainLoop,
            PlayerStatus::Outro => Self::Outro,
            PlayerStatus::TranfillActive | PlayerStatus::TranfillQuiting => Self::TransFill,
            PlayerStatus::DrumfillActive => Self::DrumFill,
        }
    }
}

/// Section type of a single-track fragment, used to map single-track
/// playback onto a PartKind for the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    MainPart,
    DrumFill,
    TranFill,
    Intro,
    Outro,
}

impl SectionKind {
    pub fn part_kind(self) -> PartKind {
        match self {
            Self::MainPart => PartKind::MainLoop,
            Self::DrumFill => PartKind::DrumFill,
            Self::TranFill => PartKind::TransFill,
            Self::Intro => PartKind::Intro,
            Self::Outro => PartKind::Outro,
        }
    }
}
