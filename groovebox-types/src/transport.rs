use serde::{Deserialize, Serialize};

/// Bounds applied to transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportLimits {
    pub min_bpm: u32,
    pub max_bpm: u32,
    pub min_lpb: u32,
    pub max_lpb: u32,
    pub max_shuffle: u32,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            min_bpm: 20,
            max_bpm: 200,
            min_lpb: 1,
            max_lpb: 24,
            max_shuffle: 100,
        }
    }
}

impl TransportLimits {
    pub fn clamp_bpm(&self, bpm: u32) -> u32 {
        bpm.clamp(self.min_bpm, self.max_bpm)
    }

    pub fn clamp_lpb(&self, lpb: u32) -> u32 {
        lpb.clamp(self.min_lpb, self.max_lpb)
    }

    pub fn clamp_shuffle(&self, shuffle: u32) -> u32 {
        shuffle.min(self.max_shuffle)
    }
}

/// Global transport state, replicated by the global control object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportState {
    pub playing: bool,
    pub recording: bool,
    pub loop_enabled: bool,
    /// First line of the loop.
    pub loop_start: u32,
    /// Loop length in lines.
    pub loop_length: u32,
    pub bpm: u32,
    pub lpb: u32,
    /// Shuffle amount, 0..=100.
    pub shuffle: u32,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            playing: false,
            recording: false,
            loop_enabled: false,
            loop_start: 0,
            loop_length: 16,
            bpm: 120,
            lpb: 4,
            shuffle: 0,
        }
    }
}

impl TransportState {
    /// Line at which the loop wraps back to `loop_start`.
    pub fn loop_stop(&self) -> u32 {
        self.loop_start.saturating_add(self.loop_length)
    }
}

/// The authoritative transport the global control object drives.
///
/// Each setter applies the request and returns the value now in effect,
/// which may differ from the request (clamping).
pub trait Transport: Send + Sync {
    fn state(&self) -> TransportState;
    fn current_line(&self) -> u32;
    fn set_bpm(&self, bpm: u32) -> Result<u32, String>;
    fn set_lpb(&self, lpb: u32) -> Result<u32, String>;
    fn set_shuffle(&self, shuffle: u32) -> Result<u32, String>;
    fn set_loop_enabled(&self, enabled: bool) -> Result<bool, String>;
    fn set_loop_start(&self, line: u32) -> Result<u32, String>;
    fn set_loop_length(&self, lines: u32) -> Result<u32, String>;
    fn set_playing(&self, playing: bool) -> Result<bool, String>;
    fn set_recording(&self, recording: bool) -> Result<bool, String>;
    /// Move the playhead to a line.
    fn jump(&self, line: u32) -> Result<u32, String>;
}
