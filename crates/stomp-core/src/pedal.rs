//! Pedal event protocol

use serde::{Deserialize, Serialize};

/// Events produced by the foot pedal, consumed by the song player at tick
/// boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PedalEvent {
    /// Short press: play a drum fill over the current part
    Press,
    /// Release: ends a held transition early
    Release,
    /// Long press: transition to the next part
    LongPress,
    /// Double tap: finish the bar, play the outro, stop
    MultiTap,
    /// Secondary switch: accent hit
    SecondaryPress,
}
