//! Sequencer data shared between the engine, the server mirror and client replicas.
//!
//! `SequencerSnapshot` is the replicated view of one sequencer machine. The
//! server keeps an authoritative copy and every client keeps a replica; both
//! sides change it only by applying the same confirmed `SequencerCommand`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::knob::MidiController;
use crate::music::{ArpDirection, ChordMode, SCALES};
use crate::{LoopId, LOOP_LENGTH, MAX_LOOPS, MAX_SEQUENCE_LENGTH, PAD_AXIS_MAX, TICKS_PER_LINE};

/// Absolute sequencer time of `tick` within `line`. Saturates far past the
/// end of any song.
pub const fn pad_time(line: u32, tick: u32) -> u32 {
    line.saturating_mul(TICKS_PER_LINE).saturating_add(tick)
}

/// Errors raised by sequencer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no free loops available")]
    NoFreeLoopsAvailable,
    #[error("no such loop: {0}")]
    NoSuchLoop(u32),
    #[error("no such note")]
    NoSuchNote,
    #[error("parameter out of range: {0}")]
    ParameterOutOfSpec(&'static str),
    #[error("pad event queue is full")]
    QueueFull,
    #[error("engine is not running")]
    EngineStopped,
}

/// One note of a loop. `on_at` and `length` are in ticks relative to the loop start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEntry {
    pub channel: u8,
    pub program: u8,
    pub velocity: u8,
    pub note: u8,
    pub on_at: u32,
    pub length: u32,
}

impl NoteEntry {
    pub fn new(note: u8, velocity: u8, on_at: u32, length: u32) -> Self {
        Self {
            channel: 0,
            program: 0,
            velocity,
            note,
            on_at,
            length,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.channel > 15 {
            return Err(EngineError::ParameterOutOfSpec("channel"));
        }
        if self.program > 127 {
            return Err(EngineError::ParameterOutOfSpec("program"));
        }
        if self.velocity > 127 {
            return Err(EngineError::ParameterOutOfSpec("velocity"));
        }
        if self.note > 127 {
            return Err(EngineError::ParameterOutOfSpec("note"));
        }
        if self.on_at >= LOOP_LENGTH * TICKS_PER_LINE {
            return Err(EngineError::ParameterOutOfSpec("on_at"));
        }
        if self.length == 0 {
            return Err(EngineError::ParameterOutOfSpec("length"));
        }
        Ok(())
    }
}

/// Finger action on the pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PadEventKind {
    Press,
    Slide,
    Release,
}

impl PadEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PadEventKind::Press => "press",
            PadEventKind::Slide => "slide",
            PadEventKind::Release => "release",
        }
    }

    pub fn from_name(name: &str) -> Option<PadEventKind> {
        match name {
            "press" => Some(PadEventKind::Press),
            "slide" => Some(PadEventKind::Slide),
            "release" => Some(PadEventKind::Release),
            _ => None,
        }
    }
}

/// A pad gesture sample. Axes are 14-bit (0..=0x3fff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadEvent {
    pub finger: u8,
    pub kind: PadEventKind,
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

/// Pad performance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadConfiguration {
    /// Index into `SCALES`.
    pub scale: usize,
    /// Octave of the lowest pad key.
    pub octave: u8,
    /// Octaves spanned by the x axis, 1..=3.
    pub range: u8,
    pub chord_mode: ChordMode,
    /// Index into the arpeggiator's built-in patterns.
    pub arpeggio_pattern: usize,
    pub arpeggio_direction: ArpDirection,
    /// Controller driven by the y axis.
    pub y_axis: Option<MidiController>,
    /// Controller driven by the z axis.
    pub z_axis: Option<MidiController>,
    /// Snap recorded sessions to the nearest line.
    pub quantize: bool,
}

impl Default for PadConfiguration {
    fn default() -> Self {
        Self {
            scale: 0,
            octave: 4,
            range: 2,
            chord_mode: ChordMode::Off,
            arpeggio_pattern: 0,
            arpeggio_direction: ArpDirection::Off,
            y_axis: None,
            z_axis: None,
            quantize: false,
        }
    }
}

impl PadConfiguration {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.scale >= SCALES.len() {
            return Err(EngineError::ParameterOutOfSpec("scale"));
        }
        if self.octave > 8 {
            return Err(EngineError::ParameterOutOfSpec("octave"));
        }
        if !(1..=3).contains(&self.range) {
            return Err(EngineError::ParameterOutOfSpec("range"));
        }
        for axis in [self.y_axis, self.z_axis].into_iter().flatten() {
            if axis.coarse > 127 || axis.fine.is_some_and(|f| f > 127) {
                return Err(EngineError::ParameterOutOfSpec("controller"));
            }
        }
        Ok(())
    }
}

/// Controller automation: a sparse map from absolute time to a 14-bit value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSnapshot {
    pub enabled: bool,
    pub fine: Option<u8>,
    pub points: BTreeMap<u32, u16>,
}

impl Default for EnvelopeSnapshot {
    fn default() -> Self {
        Self {
            enabled: true,
            fine: None,
            points: BTreeMap::new(),
        }
    }
}

impl EnvelopeSnapshot {
    pub fn set_point(&mut self, time: u32, value: u16) {
        self.points.insert(time, value.min(PAD_AXIS_MAX));
    }

    pub fn delete_point(&mut self, time: u32) -> bool {
        self.points.remove(&time).is_some()
    }

    /// Straight line from `start` to `stop`, erasing the points in between.
    pub fn line(&mut self, start: u32, start_value: u16, stop: u32, stop_value: u16) {
        let (start, start_value, stop, stop_value) = if start <= stop {
            (start, start_value, stop, stop_value)
        } else {
            (stop, stop_value, start, start_value)
        };
        self.delete_range(start, stop);
        self.set_point(start, start_value);
        self.set_point(stop, stop_value);
    }

    /// Remove all points with `start <= time <= stop`.
    pub fn delete_range(&mut self, start: u32, stop: u32) {
        let (start, stop) = if start <= stop { (start, stop) } else { (stop, start) };
        let doomed: Vec<u32> = self.points.range(start..=stop).map(|(t, _)| *t).collect();
        for t in doomed {
            self.points.remove(&t);
        }
    }
}

/// A change to a sequencer, in the form clients request and the server confirms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SequencerCommand {
    /// Append a loop. Requests carry `None`; confirmations carry the allocated id.
    CreateLoop { loop_id: Option<LoopId> },
    DeleteLoop { loop_id: LoopId },
    /// Assign (or clear) the loop played at a song position.
    SetLoopAt { position: u32, loop_id: Option<LoopId> },
    InsertNote { loop_id: LoopId, note: NoteEntry },
    DeleteNote { loop_id: LoopId, on_at: u32, note: u8 },
    UpdateNote { loop_id: LoopId, on_at: u32, note: u8, entry: NoteEntry },
    SetPadConfig(PadConfiguration),
    SetPadRecord(bool),
    QuantizePad,
    ClearPad,
    SetEnvelopePoint { controller: u8, time: u32, value: u16 },
    DeleteEnvelopePoint { controller: u8, time: u32 },
    EnvelopeLine { controller: u8, start: u32, start_value: u16, stop: u32, stop_value: u16 },
    DeleteEnvelopeRange { controller: u8, start: u32, stop: u32 },
    EnableEnvelope { controller: u8, enabled: bool },
}

/// Replicated state of one sequencer machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequencerSnapshot {
    /// Loop store; each loop's notes ordered by `on_at`.
    pub loops: Vec<Vec<NoteEntry>>,
    /// Song position to loop. Trailing unset entries are trimmed.
    pub sequence: Vec<Option<LoopId>>,
    pub pad: PadConfiguration,
    pub pad_recording: bool,
    /// Envelopes keyed by coarse controller number.
    pub envelopes: BTreeMap<u8, EnvelopeSnapshot>,
}

impl SequencerSnapshot {
    pub fn loop_at(&self, position: u32) -> Option<LoopId> {
        self.sequence.get(position as usize).copied().flatten()
    }

    pub fn notes(&self, loop_id: LoopId) -> Result<&[NoteEntry], EngineError> {
        self.loops
            .get(loop_id.index())
            .map(|l| l.as_slice())
            .ok_or(EngineError::NoSuchLoop(loop_id.get()))
    }

    /// Apply a command. On error the snapshot is left unchanged.
    pub fn apply(&mut self, command: &SequencerCommand) -> Result<(), EngineError> {
        match command {
            SequencerCommand::CreateLoop { loop_id } => {
                if self.loops.len() >= MAX_LOOPS {
                    return Err(EngineError::NoFreeLoopsAvailable);
                }
                if let Some(id) = loop_id {
                    if id.index() != self.loops.len() {
                        return Err(EngineError::ParameterOutOfSpec("loop_id"));
                    }
                }
                self.loops.push(Vec::new());
            }
            SequencerCommand::DeleteLoop { loop_id } => {
                self.check_loop(*loop_id)?;
                self.loops.remove(loop_id.index());
                for entry in self.sequence.iter_mut() {
                    *entry = match *entry {
                        Some(id) if id == *loop_id => None,
                        Some(id) if id > *loop_id => Some(LoopId::new(id.get() - 1)),
                        other => other,
                    };
                }
                self.trim_sequence();
            }
            SequencerCommand::SetLoopAt { position, loop_id } => {
                if let Some(id) = loop_id {
                    self.check_loop(*id)?;
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
                self.check_loop(*loop_id)?;
                note.validate()?;
                insert_sorted(&mut self.loops[loop_id.index()], *note);
            }
            SequencerCommand::DeleteNote { loop_id, on_at, note } => {
                self.check_loop(*loop_id)?;
                let notes = &mut self.loops[loop_id.index()];
                let idx = notes
                    .iter()
                    .position(|n| n.on_at == *on_at && n.note == *note)
                    .ok_or(EngineError::NoSuchNote)?;
                notes.remove(idx);
            }
            SequencerCommand::UpdateNote { loop_id, on_at, note, entry } => {
                self.check_loop(*loop_id)?;
                entry.validate()?;
                let notes = &mut self.loops[loop_id.index()];
                let idx = notes
                    .iter()
                    .position(|n| n.on_at == *on_at && n.note == *note)
                    .ok_or(EngineError::NoSuchNote)?;
                notes.remove(idx);
                insert_sorted(notes, *entry);
            }
            SequencerCommand::SetPadConfig(config) => {
                config.validate()?;
                self.pad = config.clone();
            }
            SequencerCommand::SetPadRecord(on) => self.pad_recording = *on,
            SequencerCommand::QuantizePad | SequencerCommand::ClearPad => {}
            SequencerCommand::SetEnvelopePoint { controller, time, value } => {
                check_controller(*controller)?;
                self.envelopes.entry(*controller).or_default().set_point(*time, *value);
            }
            SequencerCommand::DeleteEnvelopePoint { controller, time } => {
                if let Some(env) = self.envelopes.get_mut(controller) {
                    env.delete_point(*time);
                }
            }
            SequencerCommand::EnvelopeLine { controller, start, start_value, stop, stop_value } => {
                check_controller(*controller)?;
                self.envelopes
                    .entry(*controller)
                    .or_default()
                    .line(*start, *start_value, *stop, *stop_value);
            }
            SequencerCommand::DeleteEnvelopeRange { controller, start, stop } => {
                if let Some(env) = self.envelopes.get_mut(controller) {
                    env.delete_range(*start, *stop);
                }
            }
            SequencerCommand::EnableEnvelope { controller, enabled } => {
                check_controller(*controller)?;
                self.envelopes.entry(*controller).or_default().enabled = *enabled;
            }
        }
        Ok(())
    }

    fn check_loop(&self, loop_id: LoopId) -> Result<(), EngineError> {
        if loop_id.index() < self.loops.len() {
            Ok(())
        } else {
            Err(EngineError::NoSuchLoop(loop_id.get()))
        }
    }

    fn trim_sequence(&mut self) {
        while matches!(self.sequence.last(), Some(None)) {
            self.sequence.pop();
        }
    }
}

fn check_controller(controller: u8) -> Result<(), EngineError> {
    if controller > 127 {
        Err(EngineError::ParameterOutOfSpec("controller"))
    } else {
        Ok(())
    }
}

fn insert_sorted(notes: &mut Vec<NoteEntry>, note: NoteEntry) {
    let idx = notes.partition_point(|n| n.on_at <= note.on_at);
    notes.insert(idx, note);
}

/// Engine-side control of one sequencer machine, used by the server.
pub trait SequencerControl: Send + Sync {
    /// Queue a live pad gesture for the next tick.
    fn pad_event(&self, event: PadEvent) -> Result<(), EngineError>;
    /// Apply a change between ticks and return its confirmed form.
    fn execute(&self, command: SequencerCommand) -> Result<SequencerCommand, EngineError>;
    /// Current engine state, used to seed the server's authoritative copy.
    fn snapshot(&self) -> Result<SequencerSnapshot, EngineError> {
        Ok(SequencerSnapshot::default())
    }
}
