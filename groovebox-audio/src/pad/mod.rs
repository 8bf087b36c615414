//! Pad engine: live finger gestures, session recording and playback.
//!
//! Gestures are drained from the pad ring once per tick. Every press, slide
//! and release is turned into notes through the current configuration; with
//! recording on, the gesture is also captured into a session that replays
//! whenever the song reaches the session's start tick again.

pub mod legacy;
pub mod mapping;
pub mod motion;
pub mod session;

use groovebox_types::{
    ArpDirection, PadConfiguration, PadEvent, PadEventKind, MAX_PAD_FINGERS,
};

use crate::arpeggiator::Arpeggiator;
use crate::midi::MidiEventBuilder;

pub use motion::{MotionSample, MotionStep, PadMotion, Voicing};
pub use session::{quantize_tick, PadSession};

fn sound(arp: &mut Arpeggiator, voicing: &Voicing, velocity: u8, channel: u8, out: &mut MidiEventBuilder) {
    if arp.direction() == ArpDirection::Off {
        for note in voicing.as_slice() {
            out.note_on(channel, *note, velocity);
        }
    } else {
        arp.set_velocity(velocity);
        for note in voicing.as_slice() {
            arp.enable_key(*note);
        }
    }
}

fn silence(arp: &mut Arpeggiator, voicing: &Voicing, channel: u8, out: &mut MidiEventBuilder) {
    if arp.direction() == ArpDirection::Off {
        for note in voicing.as_slice() {
            out.note_off(channel, *note);
        }
    } else {
        for note in voicing.as_slice() {
            arp.disable_key(*note);
        }
    }
}

/// Move from `from` to `to`, only touching notes when the voicing changes.
fn revoice(
    arp: &mut Arpeggiator,
    from: &Voicing,
    to: &Voicing,
    velocity: u8,
    channel: u8,
    out: &mut MidiEventBuilder,
) {
    if from != to {
        silence(arp, from, channel, out);
        sound(arp, to, velocity, channel, out);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RecordingMotion {
    session: usize,
    motion: usize,
    /// Absolute tick of the press.
    origin: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Finger {
    down: bool,
    voicing: Voicing,
    recording: Option<RecordingMotion>,
}

#[derive(Debug, Default)]
pub struct Pad {
    config: PadConfiguration,
    recording: bool,
    fingers: [Finger; MAX_PAD_FINGERS],
    sessions: Vec<PadSession>,
    /// Session new presses join while any recorded finger is down.
    active_session: Option<usize>,
    arpeggiator: Arpeggiator,
    arp_reset: bool,
}

impl Pad {
    pub fn config(&self) -> &PadConfiguration {
        &self.config
    }

    pub fn set_config(&mut self, config: PadConfiguration) {
        if config.arpeggio_direction != self.config.arpeggio_direction {
            self.arp_reset = true;
        }
        self.arpeggiator.set_pattern(config.arpeggio_pattern);
        self.config = config;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn sessions(&self) -> &[PadSession] {
        &self.sessions
    }

    /// Replace every recorded session, e.g. after loading a project.
    pub fn load_sessions(&mut self, sessions: Vec<PadSession>) {
        self.fingers.iter_mut().for_each(|f| f.recording = None);
        self.active_session = None;
        self.sessions = sessions;
    }

    /// Snap every finished session to the nearest line.
    pub fn quantize(&mut self) {
        for (i, session) in self.sessions.iter_mut().enumerate() {
            if Some(i) != self.active_session {
                session.quantize();
            }
        }
    }

    /// Drop all sessions. Ones still playing are removed once their notes are released.
    pub fn clear(&mut self) {
        for finger in self.fingers.iter_mut() {
            if let Some(rec) = finger.recording.take() {
                if let Some(m) = self.sessions.get_mut(rec.session).and_then(|s| s.motion_mut(rec.motion)) {
                    m.terminate();
                }
            }
        }
        self.active_session = None;
        self.sessions.iter_mut().for_each(PadSession::mark_for_deletion);
    }

    pub fn handle_event(&mut self, event: PadEvent, now: u32, channel: u8, out: &mut MidiEventBuilder) {
        let f = event.finger as usize;
        if f >= MAX_PAD_FINGERS {
            return;
        }
        match event.kind {
            PadEventKind::Press => {
                if self.fingers[f].down {
                    self.release_finger(f, channel, out);
                }
                let voicing = mapping::voicing(&self.config, event.x);
                sound(&mut self.arpeggiator, &voicing, mapping::velocity(event.z), channel, out);
                mapping::send_axes(&self.config, channel, event.y, event.z, out);
                let recording = if self.recording {
                    self.record_press(&event, now)
                } else {
                    None
                };
                self.fingers[f] = Finger { down: true, voicing, recording };
            }
            PadEventKind::Slide => {
                if !self.fingers[f].down {
                    return;
                }
                let voicing = mapping::voicing(&self.config, event.x);
                let from = self.fingers[f].voicing;
                revoice(&mut self.arpeggiator, &from, &voicing, mapping::velocity(event.z), channel, out);
                mapping::send_axes(&self.config, channel, event.y, event.z, out);
                self.fingers[f].voicing = voicing;
                if let Some(rec) = self.fingers[f].recording {
                    if let Some(m) = self.sessions.get_mut(rec.session).and_then(|s| s.motion_mut(rec.motion)) {
                        m.record(event.x, event.y, event.z, now.saturating_sub(rec.origin));
                    }
                }
            }
            PadEventKind::Release => {
                if self.fingers[f].down {
                    self.release_finger(f, channel, out);
                }
            }
        }
    }

    fn record_press(&mut self, event: &PadEvent, now: u32) -> Option<RecordingMotion> {
        let session = match self.active_session {
            Some(i) => i,
            None => {
                let start = if self.config.quantize { quantize_tick(now) } else { now };
                self.sessions.push(PadSession::new(start));
                self.sessions.len() - 1
            }
        };
        self.active_session = Some(session);
        let s = &mut self.sessions[session];
        let motion = s.start_motion(event.finger, now)?;
        s.motions[motion].record(event.x, event.y, event.z, 0);
        Some(RecordingMotion { session, motion, origin: now })
    }

    fn release_finger(&mut self, f: usize, channel: u8, out: &mut MidiEventBuilder) {
        let finger = std::mem::take(&mut self.fingers[f]);
        silence(&mut self.arpeggiator, &finger.voicing, channel, out);
        if let Some(rec) = finger.recording {
            if let Some(m) = self.sessions.get_mut(rec.session).and_then(|s| s.motion_mut(rec.motion)) {
                m.terminate();
            }
        }
        if self.fingers.iter().all(|f| f.recording.is_none()) {
            self.active_session = None;
        }
    }

    /// Replay recorded sessions at absolute tick `now` and advance the arpeggiator.
    pub fn process(&mut self, now: u32, channel: u8, out: &mut MidiEventBuilder) {
        if self.arp_reset {
            self.arp_reset = false;
            self.arpeggiator.reset(out, channel);
            self.arpeggiator.clear_keys();
            self.arpeggiator.set_direction(self.config.arpeggio_direction);
        }
        let config = &self.config;
        let arp = &mut self.arpeggiator;
        for (i, session) in self.sessions.iter_mut().enumerate() {
            if Some(i) == self.active_session {
                continue;
            }
            if session.is_marked() || !session.contains(now) {
                if session.is_playing() {
                    for m in session.motions.iter_mut() {
                        silence(arp, &std::mem::take(&mut m.voicing), channel, out);
                    }
                    session.set_playing(false);
                }
                continue;
            }
            session.set_playing(true);
            let offset = now - session.start;
            for m in session.motions.iter_mut() {
                match m.step_at(offset) {
                    Some(MotionStep::Press(s)) | Some(MotionStep::Slide(s)) => {
                        let voicing = mapping::voicing(config, s.x);
                        revoice(arp, &m.voicing, &voicing, mapping::velocity(s.z), channel, out);
                        mapping::send_axes(config, channel, s.y, s.z, out);
                        m.voicing = voicing;
                    }
                    Some(MotionStep::Release) => {
                        silence(arp, &std::mem::take(&mut m.voicing), channel, out);
                    }
                    None => {}
                }
            }
        }
        if self.active_session.is_none() {
            self.sessions.retain(|s| !(s.is_marked() && !s.is_playing()));
        }
        if self.arpeggiator.direction() != ArpDirection::Off || self.arpeggiator.current_pitch().is_some() {
            self.arpeggiator.tick(out, channel);
        }
    }

    /// Silence everything: live fingers, playback and the arpeggiator.
    pub fn release_all(&mut self, channel: u8, out: &mut MidiEventBuilder) {
        for f in 0..MAX_PAD_FINGERS {
            if self.fingers[f].down {
                self.release_finger(f, channel, out);
            }
        }
        for session in self.sessions.iter_mut() {
            for m in session.motions.iter_mut() {
                silence(&mut self.arpeggiator, &std::mem::take(&mut m.voicing), channel, out);
            }
            session.set_playing(false);
        }
        self.arpeggiator.reset(out, channel);
        self.arpeggiator.clear_keys();
    }
}
