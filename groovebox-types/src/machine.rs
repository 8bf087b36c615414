use serde::{Deserialize, Serialize};

use crate::knob::KnobDescriptor;

/// Closed set of machine kinds. Set at creation and switched on where
/// type-specific behavior is needed (pad and sequencer commands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineKind {
    /// Generic audio node (synth, effect, mixer).
    #[default]
    Dynamic,
    /// Pattern sequencer with pad input, drives a connected machine.
    Sequencer,
    /// Final output stage of the graph.
    Sink,
}

impl MachineKind {
    pub fn name(&self) -> &'static str {
        match self {
            MachineKind::Dynamic => "dynamic",
            MachineKind::Sequencer => "sequencer",
            MachineKind::Sink => "sink",
        }
    }

    pub fn from_name(name: &str) -> Option<MachineKind> {
        match name {
            "dynamic" => Some(MachineKind::Dynamic),
            "sequencer" => Some(MachineKind::Sequencer),
            "sink" => Some(MachineKind::Sink),
            _ => None,
        }
    }
}

/// A directed connection between an output socket and an input socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub output: String,
    pub destination: String,
    pub input: String,
}

impl Connection {
    pub fn new(source: &str, output: &str, destination: &str, input: &str) -> Self {
        Self {
            source: source.to_string(),
            output: output.to_string(),
            destination: destination.to_string(),
            input: input.to_string(),
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source, self.output, self.destination, self.input
        )
    }
}

/// Everything the server needs to publish a machine when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDescriptor {
    pub name: String,
    pub kind: MachineKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub knobs: Vec<KnobDescriptor>,
    pub x: f32,
    pub y: f32,
}

impl MachineDescriptor {
    pub fn new(name: &str, kind: MachineKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            knobs: Vec::new(),
            x: 0.0,
            y: 0.0,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_knob(mut self, knob: KnobDescriptor) -> Self {
        self.knobs.push(knob);
        self
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.x = x;
        self.y = y;
        self
    }
}
