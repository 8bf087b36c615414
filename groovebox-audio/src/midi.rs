//! MIDI events produced by the sequencers, one buffer per engine cycle.

use serde::{Deserialize, Serialize};

/// Default number of events one builder holds per cycle.
pub const DEFAULT_EVENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
}

/// A message stamped with the tick index (within the cycle) it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub tick: u32,
    pub message: MidiMessage,
}

/// Fixed-capacity output buffer. Once full, further events are counted
/// and dropped; the audio thread never allocates while filling it.
#[derive(Debug)]
pub struct MidiEventBuilder {
    events: Vec<MidiEvent>,
    capacity: usize,
    tick: u32,
    dropped: usize,
}

impl Default for MidiEventBuilder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl MidiEventBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            tick: 0,
            dropped: 0,
        }
    }

    /// Start a new cycle, discarding the previous one's events.
    pub fn begin(&mut self) {
        self.events.clear();
        self.tick = 0;
        self.dropped = 0;
    }

    /// Tick index subsequent events are stamped with.
    pub fn set_tick(&mut self, tick: u32) {
        self.tick = tick;
    }

    pub fn push(&mut self, message: MidiMessage) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.events.push(MidiEvent {
            tick: self.tick,
            message,
        });
        true
    }

    pub fn note_on(&mut self, channel: u8, note: u8, velocity: u8) -> bool {
        self.push(MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        })
    }

    pub fn note_off(&mut self, channel: u8, note: u8) -> bool {
        self.push(MidiMessage::NoteOff { channel, note })
    }

    pub fn controller(&mut self, channel: u8, controller: u8, value: u8) -> bool {
        self.push(MidiMessage::Controller {
            channel,
            controller,
            value,
        })
    }

    /// Send a 14-bit value as a coarse/fine controller pair.
    pub fn controller_14bit(&mut self, channel: u8, coarse: u8, fine: Option<u8>, value: u16) {
        let (hi, lo) = split_14bit(value);
        self.controller(channel, coarse, hi);
        if let Some(fine) = fine {
            self.controller(channel, fine, lo);
        }
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<MidiEvent> {
        std::mem::replace(&mut self.events, Vec::with_capacity(self.capacity))
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// High and low seven bits of a 14-bit value.
pub fn split_14bit(value: u16) -> (u8, u8) {
    let value = value.min(0x3fff);
    ((value >> 7) as u8, (value & 0x7f) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_builder_drops_and_counts() {
        let mut b = MidiEventBuilder::with_capacity(2);
        assert!(b.note_on(0, 60, 100));
        b.set_tick(3);
        assert!(b.note_off(0, 60));
        assert!(!b.note_on(0, 61, 100));
        assert_eq!(b.dropped(), 1);
        assert_eq!(b.events()[1].tick, 3);

        b.begin();
        assert!(b.is_empty());
        assert_eq!(b.dropped(), 0);
    }

    #[test]
    fn fourteen_bit_split() {
        assert_eq!(split_14bit(0x3fff), (127, 127));
        assert_eq!(split_14bit(0x2000), (64, 0));
        assert_eq!(split_14bit(0xffff), (127, 127));

        let mut b = MidiEventBuilder::default();
        b.controller_14bit(1, 7, Some(39), 0x0081);
        assert_eq!(
            b.events().iter().map(|e| e.message).collect::<Vec<_>>(),
            vec![
                MidiMessage::Controller { channel: 1, controller: 7, value: 1 },
                MidiMessage::Controller { channel: 1, controller: 39, value: 1 },
            ]
        );
    }
}
