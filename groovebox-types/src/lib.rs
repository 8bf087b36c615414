//! # groovebox-types
//!
//! Shared type definitions for the groovebox workspace.
//! This crate contains the data model used by the replication layer
//! (groovebox-net), the real-time engine (groovebox-audio) and the host
//! binary, plus the traits through which the server reaches the engine.

mod graph;
mod knob;
mod machine;
pub mod music;
pub mod sequencer;
mod transport;

pub use graph::MachineGraph;
pub use knob::{KnobDescriptor, KnobType, KnobValue, MidiController};
pub use machine::{Connection, MachineDescriptor, MachineKind};
pub use music::{ArpDirection, ChordMode, Scale, SCALES};
pub use sequencer::{
    pad_time, EngineError, EnvelopeSnapshot, NoteEntry, PadConfiguration, PadEvent, PadEventKind,
    SequencerCommand, SequencerControl, SequencerSnapshot,
};
pub use transport::{Transport, TransportLimits, TransportState};

/// Identifier of a replicated object. Assigned by the server only, always positive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ObjId(i32);

impl ObjId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }
    pub fn get(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a loop inside a sequencer's loop store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct LoopId(u32);

impl LoopId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn get(self) -> u32 {
        self.0
    }
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequencer tick resolution: ticks per line.
pub const TICKS_PER_LINE: u32 = 16;
/// Length of a loop, in lines.
pub const LOOP_LENGTH: u32 = 16;
/// Maximum number of loops a sequencer's loop store can hold.
pub const MAX_LOOPS: usize = 512;
/// Number of song positions the loop sequence can address.
pub const MAX_SEQUENCE_LENGTH: usize = 4096;
/// Maximum notes sounding at once inside one loop.
pub const MAX_ACTIVE_NOTES: usize = 16;
/// Maximum fingers tracked on the pad at once.
pub const MAX_PAD_FINGERS: usize = 5;
/// Maximum notes in a pad chord.
pub const MAX_PAD_CHORD: usize = 4;
/// Maximum keys held by the arpeggiator.
pub const MAX_ARP_FINGERS: usize = 5;
/// Largest value of a 14-bit pad axis.
pub const PAD_AXIS_MAX: u16 = 0x3fff;
