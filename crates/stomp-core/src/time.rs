//! Musical time units and conversions

use serde::{Deserialize, Serialize};

/// Ticks per quarter note
pub const TICKS_PER_BEAT: u32 = 480;

/// Ticks processed per scheduling quantum
pub const TICKS_PER_REFRESH: u32 = 5;

/// Seconds per tick at the given tempo
pub fn tick_to_time_ratio(bpm: u16) -> f64 {
    (60.0 / bpm as f64) / TICKS_PER_BEAT as f64
}

/// Time signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub num: u8,
    pub den: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self { num: 4, den: 4 }
    }
}

impl TimeSignature {
    pub fn new(num: u8, den: u8) -> Self {
        Self { num, den }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_ratio_matches_tempo() {
        // At 120 BPM a quarter note is 0.5 s, so one tick is 0.5/480 s
        let ratio = tick_to_time_ratio(120);
        assert!((ratio - 0.5 / 480.0).abs() < 1e-12);

        // Doubling the tempo halves the ratio
        assert!((tick_to_time_ratio(60) - 2.0 * ratio).abs() < 1e-12);
    }
}
