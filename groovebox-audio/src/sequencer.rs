//! One sequencer machine: loops, loop sequence, envelopes and the pad.

use std::collections::BTreeMap;

use groovebox_types::{
    pad_time, EngineError, LoopId, SequencerCommand, SequencerSnapshot, MAX_LOOPS, MAX_SEQUENCE_LENGTH,
};

use crate::clock::TickPosition;
use crate::envelope::ControllerEnvelope;
use crate::loops::{ActiveNotes, Loop};
use crate::midi::MidiEventBuilder;
use crate::pad::Pad;
use crate::pad_ring::PadEventRing;

fn check_controller(controller: u8) -> Result<(), EngineError> {
    if controller > 127 {
        Err(EngineError::ParameterOutOfSpec("controller"))
    } else {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MachineSequencer {
    name: String,
    channel: u8,
    loops: Vec<Loop>,
    /// Song position (line) to loop.
    sequence: Vec<Option<LoopId>>,
    current_loop: Option<LoopId>,
    active: ActiveNotes,
    envelopes: BTreeMap<u8, ControllerEnvelope>,
    pad: Pad,
    pad_events: PadEventRing,
}

impl MachineSequencer {
    pub fn new(name: &str, channel: u8) -> Self {
        Self {
            name: name.to_string(),
            channel: channel.min(15),
            loops: Vec::new(),
            sequence: Vec::new(),
            current_loop: None,
            active: ActiveNotes::default(),
            envelopes: BTreeMap::new(),
            pad: Pad::default(),
            pad_events: PadEventRing::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Producer side of this sequencer's pad ring.
    pub fn pad_ring(&self) -> PadEventRing {
        self.pad_events.clone()
    }

    pub fn pad(&self) -> &Pad {
        &self.pad
    }

    pub fn pad_mut(&mut self) -> &mut Pad {
        &mut self.pad
    }

    pub fn current_loop(&self) -> Option<LoopId> {
        self.current_loop
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    fn loop_mut(&mut self, loop_id: LoopId) -> Result<&mut Loop, EngineError> {
        self.loops
            .get_mut(loop_id.index())
            .ok_or(EngineError::NoSuchLoop(loop_id.get()))
    }

    fn trim_sequence(&mut self) {
        while matches!(self.sequence.last(), Some(None)) {
            self.sequence.pop();
        }
    }

    fn envelope(&mut self, controller: u8) -> Result<&mut ControllerEnvelope, EngineError> {
        check_controller(controller)?;
        Ok(self
            .envelopes
            .entry(controller)
            .or_insert_with(|| ControllerEnvelope::new(controller)))
    }

    /// Apply `command` and return its confirmed form. On error nothing changes.
    pub fn execute(&mut self, command: SequencerCommand) -> Result<SequencerCommand, EngineError> {
        match &command {
            SequencerCommand::CreateLoop { loop_id } => {
                if self.loops.len() >= MAX_LOOPS {
                    return Err(EngineError::NoFreeLoopsAvailable);
                }
                let id = LoopId::new(self.loops.len() as u32);
                if loop_id.is_some_and(|requested| requested != id) {
                    return Err(EngineError::ParameterOutOfSpec("loop_id"));
                }
                self.loops.push(Loop::new());
                return Ok(SequencerCommand::CreateLoop { loop_id: Some(id) });
            }
            SequencerCommand::DeleteLoop { loop_id } => {
                let loop_id = *loop_id;
                self.loop_mut(loop_id)?;
                self.loops.remove(loop_id.index());
                let shift = |entry: Option<LoopId>| match entry {
                    Some(id) if id == loop_id => None,
                    Some(id) if id > loop_id => Some(LoopId::new(id.get() - 1)),
                    other => other,
                };
                for entry in self.sequence.iter_mut() {
                    *entry = shift(*entry);
                }
                self.current_loop = shift(self.current_loop);
                self.trim_sequence();
            }
            SequencerCommand::SetLoopAt { position, loop_id } => {
                if let Some(id) = loop_id {
                    self.loop_mut(*id)?;
                }
                let position = *position as usize;
                if position >= MAX_SEQUENCE_LENGTH {
                    return Err(EngineError::ParameterOutOfSpec("position"));
                }
                if self.sequence.len() <= position {
                    self.sequence.resize(position + 1, None);
                }
                self.sequence[position] = *loop_id;
                self.trim_sequence();
            }
            SequencerCommand::InsertNote { loop_id, note } => {
                self.loop_mut(*loop_id)?.note_insert(*note)?;
            }
            SequencerCommand::DeleteNote { loop_id, on_at, note } => {
                self.loop_mut(*loop_id)?.note_delete(*on_at, *note)?;
            }
            SequencerCommand::UpdateNote { loop_id, on_at, note, entry } => {
                self.loop_mut(*loop_id)?.note_update(*on_at, *note, *entry)?;
            }
            SequencerCommand::SetPadConfig(config) => {
                config.validate()?;
                self.pad.set_config(config.clone());
            }
            SequencerCommand::SetPadRecord(on) => self.pad.set_recording(*on),
            SequencerCommand::QuantizePad => self.pad.quantize(),
            SequencerCommand::ClearPad => self.pad.clear(),
            SequencerCommand::SetEnvelopePoint { controller, time, value } => {
                self.envelope(*controller)?.edit(|e| e.set_point(*time, *value));
            }
            SequencerCommand::DeleteEnvelopePoint { controller, time } => {
                if let Some(env) = self.envelopes.get_mut(controller) {
                    env.edit(|e| e.delete_point(*time));
                }
            }
            SequencerCommand::EnvelopeLine { controller, start, start_value, stop, stop_value } => {
                self.envelope(*controller)?
                    .edit(|e| e.line(*start, *start_value, *stop, *stop_value));
            }
            SequencerCommand::DeleteEnvelopeRange { controller, start, stop } => {
                if let Some(env) = self.envelopes.get_mut(controller) {
                    env.edit(|e| e.delete_range(*start, *stop));
                }
            }
            SequencerCommand::EnableEnvelope { controller, enabled } => {
                self.envelope(*controller)?.set_enabled(*enabled);
            }
        }
        Ok(command)
    }

    /// Replicated view of the current state.
    pub fn snapshot(&self) -> SequencerSnapshot {
        SequencerSnapshot {
            loops: self.loops.iter().map(Loop::notes_get).collect(),
            sequence: self.sequence.clone(),
            pad: self.pad.config().clone(),
            pad_recording: self.pad.is_recording(),
            envelopes: self
                .envelopes
                .iter()
                .map(|(c, env)| (*c, env.snapshot().clone()))
                .collect(),
        }
    }

    /// Replace loops, sequence, envelopes and pad settings with `snapshot`.
    pub fn restore(&mut self, snapshot: &SequencerSnapshot) -> Result<(), EngineError> {
        if snapshot.loops.len() > MAX_LOOPS {
            return Err(EngineError::NoFreeLoopsAvailable);
        }
        if snapshot.sequence.len() > MAX_SEQUENCE_LENGTH {
            return Err(EngineError::ParameterOutOfSpec("position"));
        }
        snapshot.pad.validate()?;
        let loops = snapshot
            .loops
            .iter()
            .map(|notes| Loop::from_notes(notes))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(bad) = snapshot.sequence.iter().flatten().find(|id| id.index() >= loops.len()) {
            return Err(EngineError::NoSuchLoop(bad.get()));
        }
        for controller in snapshot.envelopes.keys() {
            check_controller(*controller)?;
        }
        self.loops = loops;
        self.sequence = snapshot.sequence.clone();
        self.trim_sequence();
        self.current_loop = None;
        self.envelopes = snapshot
            .envelopes
            .iter()
            .map(|(c, data)| (*c, ControllerEnvelope::from_snapshot(*c, data.clone())))
            .collect();
        self.pad.set_config(snapshot.pad.clone());
        self.pad.set_recording(snapshot.pad_recording);
        Ok(())
    }

    /// Run one sequencer tick at `position`.
    pub fn tick(&mut self, position: TickPosition, out: &mut MidiEventBuilder) {
        let now = pad_time(position.line, position.tick);
        while let Some(event) = self.pad_events.pop() {
            self.pad.handle_event(event, now, self.channel, out);
        }
        self.pad.process(now, self.channel, out);

        if position.is_line_start() {
            if let Some(id) = self.sequence.get(position.line as usize).copied().flatten() {
                if let Some(l) = self.loops.get_mut(id.index()) {
                    self.current_loop = Some(id);
                    l.start();
                }
            }
        }

        self.active.tick(out);
        if let Some(l) = self.current_loop.and_then(|id| self.loops.get_mut(id.index())) {
            l.play_tick(&mut self.active, out);
        }

        for env in self.envelopes.values_mut() {
            env.process(now, self.channel, out);
        }
    }

    /// Handle live pad gestures while the transport is stopped.
    pub fn idle(&mut self, position: TickPosition, out: &mut MidiEventBuilder) {
        let now = pad_time(position.line, position.tick);
        while let Some(event) = self.pad_events.pop() {
            self.pad.handle_event(event, now, self.channel, out);
        }
    }

    /// Release every sounding note.
    pub fn stop(&mut self, out: &mut MidiEventBuilder) {
        self.active.release_all(out);
        self.pad.release_all(self.channel, out);
        self.current_loop = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use groovebox_types::{NoteEntry, PadEvent, PadEventKind, TICKS_PER_LINE};

    fn with_loops(n: u32) -> MachineSequencer {
        let mut s = MachineSequencer::new("Seq", 0);
        for _ in 0..n {
            s.execute(SequencerCommand::CreateLoop { loop_id: None }).unwrap();
        }
        s
    }

    fn run_lines(s: &mut MachineSequencer, lines: std::ops::Range<u32>) -> Vec<(TickPosition, MidiMessage)> {
        let mut out = MidiEventBuilder::default();
        let mut seen = Vec::new();
        for line in lines {
            for tick in 0..TICKS_PER_LINE {
                let pos = TickPosition { line, tick };
                out.begin();
                s.tick(pos, &mut out);
                seen.extend(out.events().iter().map(|e| (pos, e.message)));
            }
        }
        seen
    }

    #[test]
    fn create_loop_confirms_its_id() {
        let mut s = with_loops(1);
        assert_eq!(
            s.execute(SequencerCommand::CreateLoop { loop_id: None }),
            Ok(SequencerCommand::CreateLoop { loop_id: Some(LoopId::new(1)) })
        );
        assert_eq!(
            s.execute(SequencerCommand::CreateLoop { loop_id: Some(LoopId::new(7)) }),
            Err(EngineError::ParameterOutOfSpec("loop_id"))
        );
    }

    #[test]
    fn executing_matches_the_replicated_snapshot() {
        let commands = vec![
            SequencerCommand::CreateLoop { loop_id: None },
            SequencerCommand::CreateLoop { loop_id: None },
            SequencerCommand::CreateLoop { loop_id: None },
            SequencerCommand::SetLoopAt { position: 0, loop_id: Some(LoopId::new(0)) },
            SequencerCommand::SetLoopAt { position: 2, loop_id: Some(LoopId::new(2)) },
            SequencerCommand::InsertNote { loop_id: LoopId::new(2), note: NoteEntry::new(60, 100, 32, 4) },
            SequencerCommand::InsertNote { loop_id: LoopId::new(2), note: NoteEntry::new(62, 100, 0, 4) },
            SequencerCommand::UpdateNote {
                loop_id: LoopId::new(2),
                on_at: 32,
                note: 60,
                entry: NoteEntry::new(64, 90, 8, 2),
            },
            SequencerCommand::DeleteLoop { loop_id: LoopId::new(1) },
            SequencerCommand::EnvelopeLine { controller: 7, start: 0, start_value: 0, stop: 64, stop_value: 0x3fff },
            SequencerCommand::SetEnvelopePoint { controller: 7, time: 32, value: 5 },
            SequencerCommand::DeleteEnvelopeRange { controller: 7, start: 60, stop: 70 },
            SequencerCommand::EnableEnvelope { controller: 10, enabled: false },
            SequencerCommand::SetPadRecord(true),
        ];
        let mut s = MachineSequencer::new("Seq", 0);
        let mut mirror = SequencerSnapshot::default();
        for command in commands {
            let confirmed = s.execute(command).unwrap();
            mirror.apply(&confirmed).unwrap();
            assert_eq!(s.snapshot(), mirror);
        }
        assert_eq!(mirror.loop_at(2), Some(LoopId::new(1)));
    }

    #[test]
    fn errors_leave_state_alone() {
        let mut s = with_loops(1);
        let before = s.snapshot();
        assert_eq!(
            s.execute(SequencerCommand::SetLoopAt { position: 0, loop_id: Some(LoopId::new(3)) }),
            Err(EngineError::NoSuchLoop(3))
        );
        assert_eq!(
            s.execute(SequencerCommand::DeleteNote { loop_id: LoopId::new(0), on_at: 0, note: 1 }),
            Err(EngineError::NoSuchNote)
        );
        assert_eq!(
            s.execute(SequencerCommand::SetEnvelopePoint { controller: 200, time: 0, value: 0 }),
            Err(EngineError::ParameterOutOfSpec("controller"))
        );
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn far_sequence_positions_are_rejected() {
        let mut s = with_loops(1);
        let last = MAX_SEQUENCE_LENGTH as u32 - 1;
        s.execute(SequencerCommand::SetLoopAt { position: last, loop_id: Some(LoopId::new(0)) }).unwrap();
        assert_eq!(s.snapshot().sequence.len(), MAX_SEQUENCE_LENGTH);
        for position in [last + 1, 50_000_000, u32::MAX] {
            assert_eq!(
                s.execute(SequencerCommand::SetLoopAt { position, loop_id: Some(LoopId::new(0)) }),
                Err(EngineError::ParameterOutOfSpec("position"))
            );
        }
        assert_eq!(s.snapshot().sequence.len(), MAX_SEQUENCE_LENGTH);

        let mut oversized = s.snapshot();
        oversized.sequence.push(None);
        assert_eq!(
            MachineSequencer::new("Copy", 0).restore(&oversized),
            Err(EngineError::ParameterOutOfSpec("position"))
        );
    }

    #[test]
    fn ticks_far_into_the_song_do_not_overflow() {
        let mut s = with_loops(1);
        s.execute(SequencerCommand::SetEnvelopePoint { controller: 7, time: 0, value: 100 }).unwrap();
        let mut out = MidiEventBuilder::default();
        s.tick(TickPosition { line: u32::MAX, tick: TICKS_PER_LINE - 1 }, &mut out);
        assert!(!out.is_empty());
    }

    #[test]
    fn loop_sequence_drives_playback() {
        let mut s = with_loops(2);
        s.execute(SequencerCommand::InsertNote { loop_id: LoopId::new(0), note: NoteEntry::new(60, 100, 0, 4) })
            .unwrap();
        s.execute(SequencerCommand::InsertNote { loop_id: LoopId::new(1), note: NoteEntry::new(72, 100, 0, 4) })
            .unwrap();
        s.execute(SequencerCommand::SetLoopAt { position: 0, loop_id: Some(LoopId::new(0)) }).unwrap();
        s.execute(SequencerCommand::SetLoopAt { position: 1, loop_id: Some(LoopId::new(1)) }).unwrap();

        let seen = run_lines(&mut s, 0..3);
        let ons: Vec<(u32, u8)> = seen
            .iter()
            .filter_map(|(pos, m)| match m {
                MidiMessage::NoteOn { note, .. } => Some((pos.line, *note)),
                _ => None,
            })
            .collect();
        // Position 2 is unset, so loop 1 keeps playing from where it is.
        assert_eq!(ons, vec![(0, 60), (1, 72)]);
        assert_eq!(s.current_loop(), Some(LoopId::new(1)));
        let offs = seen.iter().filter(|(_, m)| matches!(m, MidiMessage::NoteOff { .. })).count();
        assert_eq!(offs, 2);
    }

    #[test]
    fn envelopes_follow_song_time() {
        let mut s = MachineSequencer::new("Seq", 3);
        s.execute(SequencerCommand::EnvelopeLine { controller: 7, start: 0, start_value: 0, stop: 32, stop_value: 0x3fff })
            .unwrap();
        let seen = run_lines(&mut s, 0..3);
        let values: Vec<u8> = seen
            .iter()
            .filter_map(|(_, m)| match m {
                MidiMessage::Controller { channel: 3, controller: 7, value } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(values.first(), Some(&0));
        assert_eq!(values.last(), Some(&127));
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn pad_events_reach_the_tick() {
        let mut s = MachineSequencer::new("Seq", 0);
        let ring = s.pad_ring();
        ring.push(PadEvent { finger: 0, kind: PadEventKind::Press, x: 0, y: 0, z: 0x3fff }).unwrap();
        let mut out = MidiEventBuilder::default();
        s.tick(TickPosition::default(), &mut out);
        assert!(out.events().iter().any(|e| matches!(e.message, MidiMessage::NoteOn { .. })));
        out.begin();
        s.stop(&mut out);
        assert!(out.events().iter().any(|e| matches!(e.message, MidiMessage::NoteOff { .. })));
    }

    #[test]
    fn restore_round_trips_the_snapshot() {
        let mut s = with_loops(2);
        s.execute(SequencerCommand::InsertNote { loop_id: LoopId::new(1), note: NoteEntry::new(50, 80, 16, 8) })
            .unwrap();
        s.execute(SequencerCommand::SetLoopAt { position: 3, loop_id: Some(LoopId::new(1)) }).unwrap();
        let snapshot = s.snapshot();
        let mut copy = MachineSequencer::new("Copy", 0);
        copy.restore(&snapshot).unwrap();
        assert_eq!(copy.snapshot(), snapshot);

        let mut broken = snapshot.clone();
        broken.sequence.push(Some(LoopId::new(9)));
        assert_eq!(copy.restore(&broken), Err(EngineError::NoSuchLoop(9)));
    }
}
