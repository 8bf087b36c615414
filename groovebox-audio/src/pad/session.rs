use serde::{Deserialize, Serialize};

use groovebox_types::{MAX_PAD_FINGERS, TICKS_PER_LINE};

use super::motion::PadMotion;

/// Snap an absolute tick to the nearest line boundary.
pub fn quantize_tick(tick: u32) -> u32 {
    tick.saturating_add(TICKS_PER_LINE / 2) / TICKS_PER_LINE * TICKS_PER_LINE
}

/// Motions recorded together, replayed from one song tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadSession {
    /// Absolute song tick the session starts at.
    pub start: u32,
    pub motions: Vec<PadMotion>,
    #[serde(skip)]
    to_be_deleted: bool,
    #[serde(skip)]
    playing: bool,
}

impl PadSession {
    pub fn new(start: u32) -> Self {
        Self {
            start,
            motions: Vec::new(),
            to_be_deleted: false,
            playing: false,
        }
    }

    /// Start a motion for `finger` at absolute tick `now`. Returns its index,
    /// or None when the session already holds the maximum number of fingers.
    pub fn start_motion(&mut self, finger: u8, now: u32) -> Option<usize> {
        let live = self.motions.iter().filter(|m| !m.is_terminated()).count();
        if live >= MAX_PAD_FINGERS {
            return None;
        }
        self.motions
            .push(PadMotion::new(finger, now.saturating_sub(self.start)));
        Some(self.motions.len() - 1)
    }

    pub fn motion_mut(&mut self, index: usize) -> Option<&mut PadMotion> {
        self.motions.get_mut(index)
    }

    /// Tick after the session start at which the last motion releases.
    pub fn length(&self) -> u32 {
        self.motions.iter().map(PadMotion::end).max().unwrap_or(0)
    }

    pub fn is_recording(&self) -> bool {
        self.motions.iter().any(|m| !m.is_terminated())
    }

    pub fn contains(&self, now: u32) -> bool {
        now >= self.start && now - self.start <= self.length()
    }

    pub fn quantize(&mut self) {
        self.start = quantize_tick(self.start);
    }

    pub fn mark_for_deletion(&mut self) {
        self.to_be_deleted = true;
    }

    pub fn is_marked(&self) -> bool {
        self.to_be_deleted
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub(crate) fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }
}
