use serde::{Deserialize, Serialize};

use groovebox_types::MAX_PAD_CHORD;

/// One recorded pad position. `t` is relative to the start of its motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: u16,
    pub y: u16,
    pub z: u16,
    pub t: u32,
}

/// What a motion does at one playback tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionStep {
    Press(MotionSample),
    Slide(MotionSample),
    Release,
}

/// Notes a motion is sounding during playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Voicing {
    pub notes: [u8; MAX_PAD_CHORD],
    pub count: usize,
}

impl Voicing {
    pub fn as_slice(&self) -> &[u8] {
        &self.notes[..self.count]
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// A single finger gesture: press, any number of slides, release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadMotion {
    pub finger: u8,
    /// Start offset from the owning session's start, in ticks.
    pub start: u32,
    pub samples: Vec<MotionSample>,
    #[serde(skip)]
    terminated: bool,
    #[serde(skip)]
    pub(crate) voicing: Voicing,
}

impl PadMotion {
    pub fn new(finger: u8, start: u32) -> Self {
        Self {
            finger,
            start,
            samples: Vec::new(),
            terminated: false,
            voicing: Voicing::default(),
        }
    }

    /// Rebuild a finished motion from stored samples.
    pub fn from_samples(finger: u8, start: u32, samples: Vec<MotionSample>) -> Self {
        let mut motion = Self::new(finger, start);
        motion.samples = samples;
        motion.terminate();
        motion
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Append a sample. Samples never go back in time; a sample at the same
    /// tick as the previous one replaces it.
    pub fn record(&mut self, x: u16, y: u16, z: u16, t: u32) {
        if self.terminated {
            return;
        }
        let t = self.samples.last().map_or(t, |last| t.max(last.t));
        let sample = MotionSample { x, y, z, t };
        match self.samples.last_mut() {
            Some(last) if last.t == t => *last = sample,
            _ => self.samples.push(sample),
        }
    }

    /// Finish the motion. A zero-length motion gets its final sample repeated
    /// one tick later so playback still sees a press and a release.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.samples.sort_by_key(|s| s.t);
        if let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) {
            if first.t == last.t {
                let mut padded = *last;
                padded.t = padded.t.saturating_add(1);
                self.samples.push(padded);
            }
        }
    }

    /// Ticks from the first to the last sample.
    pub fn length(&self) -> u32 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.t - first.t,
            _ => 0,
        }
    }

    /// Ticks from the owning session's start to this motion's release.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.samples.last().map_or(0, |s| s.t))
    }

    /// The step to play `offset` ticks after the session start.
    pub fn step_at(&self, offset: u32) -> Option<MotionStep> {
        let rel = offset.checked_sub(self.start)?;
        let last = self.samples.len().checked_sub(1)?;
        let index = self.samples.binary_search_by_key(&rel, |s| s.t).ok()?;
        Some(if index == 0 {
            MotionStep::Press(self.samples[0])
        } else if index == last {
            MotionStep::Release
        } else {
            MotionStep::Slide(self.samples[index])
        })
    }
}
