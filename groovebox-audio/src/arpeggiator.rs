//! Arpeggiator: cycles held pad keys through a rhythmic note pattern.

use groovebox_types::{ArpDirection, MAX_ARP_FINGERS};

use crate::midi::MidiEventBuilder;

/// One step of a pattern, lengths in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternNote {
    pub on: u32,
    pub off: u32,
    pub octave: u8,
    /// Hold the note into the next step instead of releasing it.
    pub slide: bool,
}

const fn step(on: u32, off: u32, octave: u8, slide: bool) -> PatternNote {
    PatternNote { on, off, octave, slide }
}

#[derive(Debug, Clone, Copy)]
pub struct Pattern {
    pub name: &'static str,
    pub notes: &'static [PatternNote],
}

pub const PATTERNS: [Pattern; 5] = [
    Pattern { name: "Straight", notes: &[step(8, 8, 0, false)] },
    Pattern { name: "Staccato", notes: &[step(2, 6, 0, false)] },
    Pattern { name: "Octaves", notes: &[step(6, 2, 0, false), step(6, 2, 1, false)] },
    Pattern { name: "Legato", notes: &[step(8, 0, 0, true)] },
    Pattern {
        name: "Gallop",
        notes: &[step(4, 0, 0, true), step(4, 0, 1, true), step(6, 2, 0, false)],
    },
];

impl Pattern {
    pub fn get(index: usize) -> &'static Pattern {
        PATTERNS.get(index).unwrap_or(&PATTERNS[0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    /// Pick the next key and sound it.
    #[default]
    Trigger,
    HoldOn,
    /// Step the pattern and release, unless the step slides.
    Release,
    HoldOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldKey {
    note: u8,
    count: u8,
}

#[derive(Debug, Clone)]
pub struct Arpeggiator {
    keys: [HeldKey; MAX_ARP_FINGERS],
    len: usize,
    direction: ArpDirection,
    pattern: usize,
    phase: Phase,
    countdown: u32,
    step_index: usize,
    key_index: Option<usize>,
    ascending: bool,
    current_pitch: Option<u8>,
    velocity: u8,
}

impl Default for Arpeggiator {
    fn default() -> Self {
        Self {
            keys: [HeldKey { note: 0, count: 0 }; MAX_ARP_FINGERS],
            len: 0,
            direction: ArpDirection::Off,
            pattern: 0,
            phase: Phase::Trigger,
            countdown: 0,
            step_index: 0,
            key_index: None,
            ascending: true,
            current_pitch: None,
            velocity: 100,
        }
    }
}

impl Arpeggiator {
    pub fn set_direction(&mut self, direction: ArpDirection) {
        self.direction = direction;
    }

    pub fn direction(&self) -> ArpDirection {
        self.direction
    }

    pub fn set_pattern(&mut self, pattern: usize) {
        if pattern != self.pattern {
            self.pattern = pattern;
            self.step_index = 0;
        }
    }

    pub fn set_velocity(&mut self, velocity: u8) {
        self.velocity = velocity.clamp(1, 127);
    }

    /// Held keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys[..self.len].iter().map(|k| k.note)
    }

    pub fn key_count(&self) -> usize {
        self.len
    }

    pub fn current_pitch(&self) -> Option<u8> {
        self.current_pitch
    }

    /// Hold `note`. Already-held keys are reference counted; a full set ignores new keys.
    pub fn enable_key(&mut self, note: u8) -> bool {
        let held = &mut self.keys[..self.len];
        match held.binary_search_by_key(&note, |k| k.note) {
            Ok(i) => {
                held[i].count = held[i].count.saturating_add(1);
                true
            }
            Err(_) if self.len == MAX_ARP_FINGERS => false,
            Err(i) => {
                self.keys.copy_within(i..self.len, i + 1);
                self.keys[i] = HeldKey { note, count: 1 };
                self.len += 1;
                true
            }
        }
    }

    pub fn disable_key(&mut self, note: u8) {
        let Ok(i) = self.keys[..self.len].binary_search_by_key(&note, |k| k.note) else {
            return;
        };
        self.keys[i].count -= 1;
        if self.keys[i].count == 0 {
            self.keys.copy_within(i + 1..self.len, i);
            self.len -= 1;
        }
    }

    pub fn clear_keys(&mut self) {
        self.len = 0;
    }

    fn next_key_index(&mut self) -> usize {
        let len = self.len;
        let next = match (self.direction, self.key_index) {
            (ArpDirection::Reverse, None) => len - 1,
            (_, None) => 0,
            (ArpDirection::Reverse, Some(i)) => {
                if i == 0 || i >= len {
                    len - 1
                } else {
                    i - 1
                }
            }
            (ArpDirection::PingPong, Some(i)) => {
                if len <= 1 {
                    0
                } else if self.ascending {
                    if i + 1 >= len {
                        self.ascending = false;
                        len - 2
                    } else {
                        i + 1
                    }
                } else if i == 0 {
                    self.ascending = true;
                    1
                } else {
                    (i - 1).min(len - 1)
                }
            }
            (_, Some(i)) => (i + 1) % len,
        };
        self.key_index = Some(next);
        next
    }

    fn release(&mut self, out: &mut MidiEventBuilder, channel: u8) {
        if let Some(pitch) = self.current_pitch.take() {
            out.note_off(channel, pitch);
        }
    }

    /// Release the sounding note and restart the pattern.
    pub fn reset(&mut self, out: &mut MidiEventBuilder, channel: u8) {
        self.release(out, channel);
        self.phase = Phase::Trigger;
        self.countdown = 0;
        self.step_index = 0;
        self.key_index = None;
        self.ascending = true;
    }

    /// Advance one tick.
    pub fn tick(&mut self, out: &mut MidiEventBuilder, channel: u8) {
        if self.len == 0 {
            if self.current_pitch.is_some() || self.phase != Phase::Trigger {
                self.reset(out, channel);
            }
            return;
        }
        let pattern = Pattern::get(self.pattern);
        loop {
            let note = pattern.notes[self.step_index % pattern.notes.len()];
            match self.phase {
                Phase::Trigger => {
                    let index = self.next_key_index();
                    let pitch = self.keys[index].note.saturating_add(12 * note.octave).min(127);
                    let previous = self.current_pitch.replace(pitch);
                    out.note_on(channel, pitch, self.velocity);
                    if let Some(previous) = previous.filter(|p| *p != pitch) {
                        out.note_off(channel, previous);
                    }
                    self.countdown = note.on.max(1);
                    self.phase = Phase::HoldOn;
                    return;
                }
                Phase::HoldOn => {
                    self.countdown = self.countdown.saturating_sub(1);
                    if self.countdown > 0 {
                        return;
                    }
                    self.phase = Phase::Release;
                }
                Phase::Release => {
                    if !note.slide {
                        self.release(out, channel);
                    }
                    self.step_index = (self.step_index + 1) % pattern.notes.len();
                    if note.off == 0 {
                        self.phase = Phase::Trigger;
                    } else {
                        self.countdown = note.off;
                        self.phase = Phase::HoldOff;
                        return;
                    }
                }
                Phase::HoldOff => {
                    self.countdown = self.countdown.saturating_sub(1);
                    if self.countdown > 0 {
                        return;
                    }
                    self.phase = Phase::Trigger;
                }
            }
        }
    }
}
