pub mod arpeggiator;
pub mod clock;
pub mod engine;
pub mod envelope;
pub mod graph;
pub mod loops;
pub mod midi;
pub mod ops;
pub mod pad;
pub mod pad_ring;
pub mod project;
pub mod sequencer;

pub use clock::{SharedTransport, TickPosition, TransportClock};
pub use engine::{EngineThread, MidiSink, SequencerEngine, SequencerHandle};
pub use graph::PatchBay;
pub use midi::{MidiEvent, MidiEventBuilder, MidiMessage};
pub use ops::{OperationQueue, OperationSender};
pub use pad_ring::PadEventRing;
pub use project::{Project, ProjectError};
pub use sequencer::MachineSequencer;
