//! Loops: time-ordered note storage and the notes currently sounding.
//!
//! Notes live in an arena of slots addressed by generation-checked handles;
//! a separate ordered index keyed by `on_at` gives playback order.

use std::collections::BTreeMap;

use groovebox_types::{EngineError, NoteEntry, LOOP_LENGTH, MAX_ACTIVE_NOTES, TICKS_PER_LINE};

use crate::midi::MidiEventBuilder;

/// Ticks in one loop.
pub const LOOP_TICKS: u32 = LOOP_LENGTH * TICKS_PER_LINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    note: Option<NoteEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct Loop {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// (on_at, insertion sequence) -> slot index.
    order: BTreeMap<(u32, u64), u32>,
    sequence: u64,
    cursor: u32,
}

impl Loop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_notes(notes: &[NoteEntry]) -> Result<Self, EngineError> {
        let mut l = Loop::new();
        for note in notes {
            l.note_insert(*note)?;
        }
        Ok(l)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn note_insert(&mut self, note: NoteEntry) -> Result<NoteHandle, EngineError> {
        note.validate()?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.note = Some(note);
        self.order.insert((note.on_at, self.sequence), index);
        self.sequence += 1;
        Ok(NoteHandle {
            index,
            generation: slot.generation,
        })
    }

    fn find(&self, on_at: u32, note: u8) -> Option<(u64, u32)> {
        self.order
            .range((on_at, 0)..=(on_at, u64::MAX))
            .find(|(_, &index)| {
                self.slots[index as usize]
                    .note
                    .is_some_and(|n| n.note == note)
            })
            .map(|(&(_, seq), &index)| (seq, index))
    }

    fn release_slot(&mut self, index: u32) -> Option<NoteEntry> {
        let slot = &mut self.slots[index as usize];
        let note = slot.note.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        note
    }

    pub fn note_delete(&mut self, on_at: u32, note: u8) -> Result<NoteEntry, EngineError> {
        let (seq, index) = self.find(on_at, note).ok_or(EngineError::NoSuchNote)?;
        self.order.remove(&(on_at, seq));
        self.release_slot(index).ok_or(EngineError::NoSuchNote)
    }

    /// Replace the note at (`on_at`, `note`) with `entry`, reordering if needed.
    pub fn note_update(&mut self, on_at: u32, note: u8, entry: NoteEntry) -> Result<NoteHandle, EngineError> {
        entry.validate()?;
        self.note_delete(on_at, note)?;
        self.note_insert(entry)
    }

    pub fn get(&self, handle: NoteHandle) -> Option<&NoteEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.note.as_ref())
    }

    /// Notes in non-decreasing `on_at` order.
    pub fn notes(&self) -> impl Iterator<Item = &NoteEntry> + '_ {
        self.order
            .values()
            .filter_map(|&index| self.slots[index as usize].note.as_ref())
    }

    pub fn notes_get(&self) -> Vec<NoteEntry> {
        self.notes().copied().collect()
    }

    /// Rewind the playback cursor.
    pub fn start(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// Trigger the notes starting at the cursor, then advance it.
    pub fn play_tick(&mut self, active: &mut ActiveNotes, out: &mut MidiEventBuilder) {
        let cursor = self.cursor;
        for &index in self.order.range((cursor, 0)..=(cursor, u64::MAX)).map(|(_, i)| i) {
            if let Some(note) = &self.slots[index as usize].note {
                active.trigger(note, out);
            }
        }
        self.cursor = (self.cursor + 1) % LOOP_TICKS;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sounding {
    channel: u8,
    note: u8,
    ticks2off: u32,
}

/// Playback slots for sounding notes. Note-ons beyond the capacity are dropped.
#[derive(Debug, Clone, Default)]
pub struct ActiveNotes {
    slots: [Option<Sounding>; MAX_ACTIVE_NOTES],
}

impl ActiveNotes {
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn trigger(&mut self, note: &NoteEntry, out: &mut MidiEventBuilder) -> bool {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.is_some_and(|s| s.channel == note.channel && s.note == note.note))
        {
            out.note_off(note.channel, note.note);
            *slot = None;
        }
        let Some(free) = self.slots.iter_mut().find(|s| s.is_none()) else {
            return false;
        };
        *free = Some(Sounding {
            channel: note.channel,
            note: note.note,
            ticks2off: note.length,
        });
        out.note_on(note.channel, note.note, note.velocity);
        true
    }

    /// Count every sounding note down one tick, releasing the expired ones.
    pub fn tick(&mut self, out: &mut MidiEventBuilder) {
        for slot in self.slots.iter_mut() {
            if let Some(s) = slot {
                s.ticks2off = s.ticks2off.saturating_sub(1);
                if s.ticks2off == 0 {
                    out.note_off(s.channel, s.note);
                    *slot = None;
                }
            }
        }
    }

    pub fn release_all(&mut self, out: &mut MidiEventBuilder) {
        for slot in self.slots.iter_mut() {
            if let Some(s) = slot.take() {
                out.note_off(s.channel, s.note);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use proptest::prelude::*;

    #[test]
    fn handles_go_stale_after_delete() {
        let mut l = Loop::new();
        let h = l.note_insert(NoteEntry::new(60, 100, 0, 4)).unwrap();
        assert_eq!(l.get(h).map(|n| n.note), Some(60));
        l.note_delete(0, 60).unwrap();
        assert!(l.get(h).is_none());
        let h2 = l.note_insert(NoteEntry::new(62, 100, 8, 4)).unwrap();
        assert!(l.get(h).is_none());
        assert_eq!(l.get(h2).map(|n| n.note), Some(62));
        assert_eq!(l.note_delete(0, 60), Err(EngineError::NoSuchNote));
    }

    #[test]
    fn update_moves_note() {
        let mut l = Loop::new();
        l.note_insert(NoteEntry::new(60, 100, 0, 4)).unwrap();
        l.note_insert(NoteEntry::new(64, 100, 16, 4)).unwrap();
        l.note_update(0, 60, NoteEntry::new(67, 90, 32, 4)).unwrap();
        let order: Vec<u8> = l.notes().map(|n| n.note).collect();
        assert_eq!(order, vec![64, 67]);
        assert!(l.note_update(0, 60, NoteEntry::new(1, 1, 1, 1)).is_err());
    }

    #[test]
    fn playback_triggers_and_releases() {
        let mut l = Loop::new();
        l.note_insert(NoteEntry::new(60, 100, 1, 2)).unwrap();
        let mut active = ActiveNotes::default();
        let mut out = MidiEventBuilder::default();
        let mut messages = Vec::new();
        for _ in 0..4 {
            out.begin();
            active.tick(&mut out);
            l.play_tick(&mut active, &mut out);
            messages.push(out.events().iter().map(|e| e.message).collect::<Vec<_>>());
        }
        assert!(messages[0].is_empty());
        assert_eq!(messages[1], vec![MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 }]);
        assert!(messages[2].is_empty());
        assert_eq!(messages[3], vec![MidiMessage::NoteOff { channel: 0, note: 60 }]);
    }

    #[test]
    fn excess_note_ons_are_dropped() {
        let mut l = Loop::new();
        for n in 0..(MAX_ACTIVE_NOTES as u8 + 4) {
            l.note_insert(NoteEntry::new(40 + n, 100, 0, 8)).unwrap();
        }
        let mut active = ActiveNotes::default();
        let mut out = MidiEventBuilder::default();
        l.play_tick(&mut active, &mut out);
        assert_eq!(active.count(), MAX_ACTIVE_NOTES);
        assert_eq!(out.events().len(), MAX_ACTIVE_NOTES);
        out.begin();
        active.release_all(&mut out);
        assert_eq!(out.events().len(), MAX_ACTIVE_NOTES);
        assert_eq!(active.count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u32),
        Delete(usize),
        Update(usize, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..128, 0u32..LOOP_TICKS).prop_map(|(n, t)| Op::Insert(n, t)),
            (0usize..64).prop_map(Op::Delete),
            (0usize..64, 0u32..LOOP_TICKS).prop_map(|(i, t)| Op::Update(i, t)),
        ]
    }

    proptest! {
        #[test]
        fn notes_stay_ordered(ops in proptest::collection::vec(op(), 0..80)) {
            let mut l = Loop::new();
            for op in ops {
                let current = l.notes_get();
                match op {
                    Op::Insert(n, t) => {
                        l.note_insert(NoteEntry::new(n, 100, t, 1)).unwrap();
                    }
                    Op::Delete(i) if !current.is_empty() => {
                        let victim = current[i % current.len()];
                        l.note_delete(victim.on_at, victim.note).unwrap();
                    }
                    Op::Update(i, t) if !current.is_empty() => {
                        let victim = current[i % current.len()];
                        let mut moved = victim;
                        moved.on_at = t;
                        l.note_update(victim.on_at, victim.note, moved).unwrap();
                    }
                    _ => {}
                }
                let notes = l.notes_get();
                prop_assert!(notes.windows(2).all(|w| w[0].on_at <= w[1].on_at));
            }
        }
    }
}
