//! Stored pad sessions and the upgrades applied to files from older levels.
//!
//! Conversions only run at import time; the engine always works with
//! relative ticks and plain 14-bit axes.
//!
//! | level | stored as |
//! |-------|-----------|
//! | < 4   | motion starts and sample ticks are absolute song ticks |
//! | < 6   | 7-bit axes, no z |
//! | 6, 7  | 14-bit axes in the old bit layout |
//! | 8     | current |

use serde::{Deserialize, Serialize};

use groovebox_types::PAD_AXIS_MAX;

use super::motion::{MotionSample, PadMotion};
use super::session::PadSession;

/// Pad format written by this version.
pub const PAD_LEVEL: u32 = 8;

/// z used when a stored sample has none.
pub const DEFAULT_Z: u16 = PAD_AXIS_MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSample {
    pub x: u16,
    pub y: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<u16>,
    pub t: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMotion {
    pub finger: u8,
    pub start: u32,
    pub samples: Vec<StoredSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub start: u32,
    pub motions: Vec<StoredMotion>,
}

/// Undo the bit layout used for 14-bit axes before level 8.
pub fn unscramble_axis(v: u16) -> u16 {
    ((v & 0xfe0) << 2 | v & 0x1f) & PAD_AXIS_MAX
}

fn upgrade_axis(level: u32, v: u16) -> u16 {
    if level < 6 {
        (v & 0x7f) << 7
    } else if level < 8 {
        unscramble_axis(v)
    } else {
        v.min(PAD_AXIS_MAX)
    }
}

fn upgrade_motion(level: u32, session_start: u32, stored: &StoredMotion) -> PadMotion {
    let (start, origin) = if level < 4 {
        (stored.start.saturating_sub(session_start), stored.start)
    } else {
        (stored.start, 0)
    };
    let samples = stored
        .samples
        .iter()
        .map(|s| MotionSample {
            x: upgrade_axis(level, s.x),
            y: upgrade_axis(level, s.y),
            z: s.z.map_or(DEFAULT_Z, |z| upgrade_axis(level, z)),
            t: s.t.saturating_sub(origin),
        })
        .collect();
    PadMotion::from_samples(stored.finger, start, samples)
}

/// Build a playable session from one stored at `level`.
pub fn upgrade_session(level: u32, stored: &StoredSession) -> PadSession {
    let mut session = PadSession::new(stored.start);
    session.motions = stored
        .motions
        .iter()
        .map(|m| upgrade_motion(level, stored.start, m))
        .collect();
    session
}

/// Stored form of a session at the current level.
pub fn store_session(session: &PadSession) -> StoredSession {
    StoredSession {
        start: session.start,
        motions: session
            .motions
            .iter()
            .map(|m| StoredMotion {
                finger: m.finger,
                start: m.start,
                samples: m
                    .samples
                    .iter()
                    .map(|s| StoredSample { x: s.x, y: s.y, z: Some(s.z), t: s.t })
                    .collect(),
            })
            .collect(),
    }
}
