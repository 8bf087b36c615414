//! Machines: replicated audio-graph nodes with sockets, connections and knobs.
//!
//! A connection is stored twice, in the destination's input socket set and
//! in the source's output socket set. Both copies are added and removed
//! together on the server and on every client.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use groovebox_types::{
    Connection, KnobDescriptor, KnobValue, LoopId, MachineDescriptor, MachineGraph, MachineKind,
    ObjId, PadEvent, SequencerCommand, SequencerControl, SequencerSnapshot,
};

use crate::client::{ClientCore, ServerLink};
use crate::command::{unknown_verb, Command, CommandPayload};
use crate::error::{HandlerError, MessageError, ObjectError, ReplyError};
use crate::message::Message;
use crate::object::{ClientObject, ObjectBase, ServerObject};
use crate::protocol::ClientId;
use crate::server::ServerCore;

use super::knob::{KnobHandle, KnobState};
use super::sequencer::{read_pad_event, write_pad_event};
use super::RI_MACHINE;

const KEY_NAME: &str = "name";
const KEY_KIND: &str = "kind";
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_INPUTS: &str = "inputs";
const KEY_OUTPUTS: &str = "outputs";
const KEY_CONNECTIONS: &str = "connections";
const KEY_KNOBS: &str = "knobs";
const KEY_SEQUENCER: &str = "sequencer";
const KEY_SOURCE: &str = "src";
const KEY_OUTPUT: &str = "out";
const KEY_INPUT: &str = "inp";
const KEY_KNOB: &str = "knb_id";
const KEY_VALUE: &str = "value";
const KEY_LOOP: &str = "loop_id";

#[derive(Debug, Clone, PartialEq)]
pub enum MachineCommand {
    Attach { source: String, output: String, input: String },
    Detach { source: String, output: String, input: String },
    Move { x: f32, y: f32 },
    ChangeKnob { knob: u32, value: String },
    PadEvent(PadEvent),
    Sequencer(SequencerCommand),
}

impl CommandPayload for MachineCommand {
    fn verb(&self) -> &'static str {
        match self {
            MachineCommand::Attach { .. } => "attach_input",
            MachineCommand::Detach { .. } => "detach_input",
            MachineCommand::Move { .. } => "set_position",
            MachineCommand::ChangeKnob { .. } => "change_knob_value",
            MachineCommand::PadEvent(_) => "pad_event",
            MachineCommand::Sequencer(command) => command.verb(),
        }
    }

    fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError> {
        match self {
            MachineCommand::Attach { source, output, input }
            | MachineCommand::Detach { source, output, input } => {
                msg.set_text(KEY_SOURCE, source)?;
                msg.set_text(KEY_OUTPUT, output)?;
                msg.set_text(KEY_INPUT, input)
            }
            MachineCommand::Move { x, y } => {
                msg.set(KEY_X, x)?;
                msg.set(KEY_Y, y)
            }
            MachineCommand::ChangeKnob { knob, value } => {
                msg.set(KEY_KNOB, knob)?;
                msg.set_text(KEY_VALUE, value)
            }
            MachineCommand::PadEvent(event) => write_pad_event(event, msg),
            MachineCommand::Sequencer(command) => command.write_fields(msg),
        }
    }

    fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError> {
        let connection = |msg: &Message| -> Result<(String, String, String), MessageError> {
            Ok((
                msg.get_text(KEY_SOURCE)?,
                msg.get_text(KEY_OUTPUT)?,
                msg.get_text(KEY_INPUT)?,
            ))
        };
        Ok(match verb {
            "attach_input" => {
                let (source, output, input) = connection(msg)?;
                MachineCommand::Attach { source, output, input }
            }
            "detach_input" => {
                let (source, output, input) = connection(msg)?;
                MachineCommand::Detach { source, output, input }
            }
            "set_position" => MachineCommand::Move {
                x: msg.get(KEY_X)?,
                y: msg.get(KEY_Y)?,
            },
            "change_knob_value" => MachineCommand::ChangeKnob {
                knob: msg.get(KEY_KNOB)?,
                value: msg.get_text(KEY_VALUE)?,
            },
            "pad_event" => MachineCommand::PadEvent(read_pad_event(msg)?),
            other => MachineCommand::Sequencer(SequencerCommand::read_fields(other, msg)?),
        })
    }
}

/// Per-socket connection sets of one machine.
#[derive(Debug, Clone, Default)]
struct Sockets {
    inputs: BTreeMap<String, BTreeSet<Connection>>,
    outputs: BTreeMap<String, BTreeSet<Connection>>,
}

impl Sockets {
    fn new(inputs: &[String], outputs: &[String]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| (s.clone(), BTreeSet::new())).collect(),
            outputs: outputs.iter().map(|s| (s.clone(), BTreeSet::new())).collect(),
        }
    }

    fn has_input(&self, c: &Connection) -> bool {
        self.inputs.get(&c.input).is_some_and(|set| set.contains(c))
    }

    fn add_input(&mut self, c: &Connection) {
        self.inputs.entry(c.input.clone()).or_default().insert(c.clone());
    }

    fn add_output(&mut self, c: &Connection) {
        self.outputs.entry(c.output.clone()).or_default().insert(c.clone());
    }

    fn remove_input(&mut self, c: &Connection) -> bool {
        self.inputs.get_mut(&c.input).is_some_and(|set| set.remove(c))
    }

    fn remove_output(&mut self, c: &Connection) -> bool {
        self.outputs.get_mut(&c.output).is_some_and(|set| set.remove(c))
    }

    fn input_connections(&self) -> Vec<Connection> {
        self.inputs.values().flatten().cloned().collect()
    }

    fn output_connections(&self) -> Vec<Connection> {
        self.outputs.values().flatten().cloned().collect()
    }

    fn all(&self) -> Vec<Connection> {
        let set: BTreeSet<Connection> = self
            .inputs
            .values()
            .chain(self.outputs.values())
            .flatten()
            .cloned()
            .collect();
        set.into_iter().collect()
    }

    fn from_connections(name: &str, inputs: &[String], outputs: &[String], all: &[Connection]) -> Self {
        let mut sockets = Sockets::new(inputs, outputs);
        for c in all {
            if c.destination == name {
                sockets.add_input(c);
            }
            if c.source == name {
                sockets.add_output(c);
            }
        }
        sockets
    }
}

// ---- server ----

struct MachineState {
    x: f32,
    y: f32,
    sockets: Sockets,
    knobs: Vec<KnobState>,
    snapshot: SequencerSnapshot,
}

/// Server-authoritative machine. Changes are applied to the audio graph
/// first and broadcast only after the graph accepted them.
pub struct RIMachine {
    base: ObjectBase,
    name: String,
    kind: MachineKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
    graph: Arc<dyn MachineGraph>,
    sequencer: Option<Arc<dyn SequencerControl>>,
    state: Mutex<MachineState>,
}

impl RIMachine {
    /// Register a machine with the server and announce it to every client.
    pub fn register(
        server: &mut ServerCore,
        descriptor: MachineDescriptor,
        graph: Arc<dyn MachineGraph>,
        sequencer: Option<Arc<dyn SequencerControl>>,
    ) -> Result<Arc<RIMachine>, HandlerError> {
        if find_machine(server, &descriptor.name).is_some() {
            return Err(HandlerError::failure(format!(
                "machine {} already registered",
                descriptor.name
            )));
        }
        let knobs = descriptor
            .knobs
            .iter()
            .enumerate()
            .map(|(id, d)| KnobState {
                id: id as u32,
                descriptor: d.clone(),
            })
            .collect();
        let sockets = Sockets::new(&descriptor.inputs, &descriptor.outputs);
        let snapshot = match &sequencer {
            Some(control) => control.snapshot().map_err(|e| HandlerError::failure(e.to_string()))?,
            None => SequencerSnapshot::default(),
        };
        let machine = server.create_object(|base| RIMachine {
            base,
            name: descriptor.name,
            kind: descriptor.kind,
            inputs: descriptor.inputs,
            outputs: descriptor.outputs,
            graph,
            sequencer,
            state: Mutex::new(MachineState {
                x: descriptor.x,
                y: descriptor.y,
                sockets,
                knobs,
                snapshot,
            }),
        })?;
        info!(target: "net::machine", "registered {} ({})", machine.name, machine.kind.name());
        Ok(machine)
    }

    /// Detach every connection of `machine`, then delete it.
    pub fn unregister(server: &mut ServerCore, machine: &Arc<RIMachine>) -> Result<(), HandlerError> {
        let (inputs, outputs) = {
            let state = machine.state.lock();
            (state.sockets.input_connections(), state.sockets.output_connections())
        };
        for c in inputs {
            if let Err(e) = machine.detach(server, &c.source, &c.output, &c.input) {
                warn!(target: "net::machine", "detach {} failed: {}", c, e);
            }
        }
        for c in outputs {
            let Some(destination) = find_machine(server, &c.destination) else {
                continue;
            };
            if let Err(e) = destination.detach(server, &c.source, &c.output, &c.input) {
                warn!(target: "net::machine", "detach {} failed: {}", c, e);
            }
        }
        server.remove_object(machine.base.id())?;
        info!(target: "net::machine", "unregistered {}", machine.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn position(&self) -> (f32, f32) {
        let state = self.state.lock();
        (state.x, state.y)
    }

    pub fn input_connections(&self) -> Vec<Connection> {
        self.state.lock().sockets.input_connections()
    }

    pub fn output_connections(&self) -> Vec<Connection> {
        self.state.lock().sockets.output_connections()
    }

    pub fn knob_value(&self, knob: u32) -> Option<KnobValue> {
        self.state
            .lock()
            .knobs
            .iter()
            .find(|k| k.id == knob)
            .map(|k| k.descriptor.value.clone())
    }

    pub fn sequencer_snapshot(&self) -> SequencerSnapshot {
        self.state.lock().snapshot.clone()
    }

    /// Connect `source:output` to `self:input`.
    pub fn attach(
        &self,
        server: &mut ServerCore,
        source: &str,
        output: &str,
        input: &str,
    ) -> Result<Connection, HandlerError> {
        self.base.check_valid()?;
        let source_machine = find_machine(server, source)
            .ok_or_else(|| HandlerError::failure(format!("no machine named {}", source)))?;
        if !source_machine.outputs.iter().any(|o| o == output) {
            return Err(HandlerError::failure(format!("{} has no output {}", source, output)));
        }
        if !self.inputs.iter().any(|i| i == input) {
            return Err(HandlerError::failure(format!("{} has no input {}", self.name, input)));
        }
        let connection = Connection::new(source, output, &self.name, input);
        if self.state.lock().sockets.has_input(&connection) {
            return Err(HandlerError::failure(format!("{} already connected", connection)));
        }
        self.graph.connect(&connection).map_err(HandlerError::Failure)?;

        self.state.lock().sockets.add_input(&connection);
        source_machine.state.lock().sockets.add_output(&connection);
        server.distribute_command(
            self.base.id(),
            MachineCommand::Attach {
                source: source.to_string(),
                output: output.to_string(),
                input: input.to_string(),
            },
        )?;
        info!(target: "net::machine", "attached {}", connection);
        Ok(connection)
    }

    /// Remove `source:output -> self:input`. The source may already be gone.
    pub fn detach(
        &self,
        server: &mut ServerCore,
        source: &str,
        output: &str,
        input: &str,
    ) -> Result<(), HandlerError> {
        let connection = Connection::new(source, output, &self.name, input);
        if !self.state.lock().sockets.has_input(&connection) {
            return Err(HandlerError::failure(format!("{} not connected", connection)));
        }
        self.graph.disconnect(&connection).map_err(HandlerError::Failure)?;

        self.state.lock().sockets.remove_input(&connection);
        if let Some(source_machine) = find_machine(server, source) {
            source_machine.state.lock().sockets.remove_output(&connection);
        }
        server.distribute_command(
            self.base.id(),
            MachineCommand::Detach {
                source: source.to_string(),
                output: output.to_string(),
                input: input.to_string(),
            },
        )?;
        info!(target: "net::machine", "detached {}", connection);
        Ok(())
    }

    pub fn set_position(&self, server: &mut ServerCore, x: f32, y: f32) -> Result<(), HandlerError> {
        {
            let mut state = self.state.lock();
            state.x = x;
            state.y = y;
        }
        server.distribute_command(self.base.id(), MachineCommand::Move { x, y })?;
        Ok(())
    }

    /// Apply raw knob text to the real controller and broadcast the result.
    pub fn change_knob(
        &self,
        server: &mut ServerCore,
        knob: u32,
        raw: &str,
    ) -> Result<KnobValue, HandlerError> {
        let knob_state = self
            .state
            .lock()
            .knobs
            .iter()
            .find(|k| k.id == knob)
            .cloned()
            .ok_or_else(|| HandlerError::failure(format!("{} has no knob {}", self.name, knob)))?;
        let requested = knob_state.accept(raw).map_err(HandlerError::Failure)?;
        let applied = self
            .graph
            .set_controller(&self.name, &knob_state.descriptor.name, &requested)
            .map_err(HandlerError::Failure)?;
        let applied = knob_state
            .descriptor
            .constrain(applied)
            .ok_or_else(|| HandlerError::failure("controller changed type"))?;

        if let Some(k) = self.state.lock().knobs.iter_mut().find(|k| k.id == knob) {
            k.descriptor.value = applied.clone();
        }
        server.distribute_command(
            self.base.id(),
            MachineCommand::ChangeKnob {
                knob,
                value: applied.to_wire(),
            },
        )?;
        Ok(applied)
    }

    fn sequencer_control(&self) -> Result<&Arc<dyn SequencerControl>, HandlerError> {
        match (&self.kind, &self.sequencer) {
            (MachineKind::Sequencer, Some(control)) => Ok(control),
            _ => Err(HandlerError::failure(format!("{} is not a sequencer", self.name))),
        }
    }

    /// Run a sequencer change through the engine and broadcast the confirmed form.
    pub fn execute_sequencer(
        &self,
        server: &mut ServerCore,
        command: SequencerCommand,
    ) -> Result<SequencerCommand, HandlerError> {
        let control = self.sequencer_control()?;
        let confirmed = control
            .execute(command)
            .map_err(|e| HandlerError::failure(e.to_string()))?;
        if let Err(e) = self.state.lock().snapshot.apply(&confirmed) {
            warn!(target: "net::machine", "{} mirror rejected {:?}: {}", self.name, confirmed, e);
        }
        server.distribute_command(self.base.id(), MachineCommand::Sequencer(confirmed.clone()))?;
        Ok(confirmed)
    }

    pub fn pad_event(&self, event: PadEvent) -> Result<(), HandlerError> {
        self.sequencer_control()?
            .pad_event(event)
            .map_err(|e| HandlerError::failure(e.to_string()))
    }
}

fn find_machine(server: &ServerCore, name: &str) -> Option<Arc<RIMachine>> {
    server
        .objects_of::<RIMachine>()
        .into_iter()
        .find(|m| m.name == name)
}

impl ServerObject for RIMachine {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        RI_MACHINE
    }

    fn serialize(&self, msg: &mut Message) -> Result<(), MessageError> {
        let state = self.state.lock();
        msg.set_text(KEY_NAME, &self.name)?;
        msg.set_value(KEY_KIND, self.kind.name())?;
        msg.set(KEY_X, state.x)?;
        msg.set(KEY_Y, state.y)?;
        msg.set_json(KEY_INPUTS, &self.inputs)?;
        msg.set_json(KEY_OUTPUTS, &self.outputs)?;
        msg.set_json(KEY_CONNECTIONS, &state.sockets.all())?;
        msg.set_json(KEY_KNOBS, &state.knobs)?;
        if self.kind == MachineKind::Sequencer {
            msg.set_json(KEY_SEQUENCER, &state.snapshot)?;
        }
        Ok(())
    }

    fn process_message(
        &self,
        server: &mut ServerCore,
        client: ClientId,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        let command = match Command::<MachineCommand>::read(msg)? {
            Command::Request(command) => command,
            Command::Confirm(_) => return Err(unknown_verb().into()),
        };
        match command {
            MachineCommand::Attach { source, output, input } => {
                self.attach(server, &source, &output, &input)?;
            }
            MachineCommand::Detach { source, output, input } => {
                self.detach(server, &source, &output, &input)?;
            }
            MachineCommand::Move { x, y } => self.set_position(server, x, y)?,
            MachineCommand::ChangeKnob { knob, value } => {
                self.change_knob(server, knob, &value)?;
            }
            MachineCommand::PadEvent(event) => self.pad_event(event)?,
            MachineCommand::Sequencer(command) => {
                let confirmed = self.execute_sequencer(server, command)?;
                if let SequencerCommand::CreateLoop { loop_id: Some(id) } = confirmed {
                    server.acknowledge(client, msg, |reply| reply.set(KEY_LOOP, id.get()))?;
                    return Ok(());
                }
            }
        }
        server.acknowledge(client, msg, |_| Ok(()))?;
        Ok(())
    }

    fn on_delete(&self, _server: &mut ServerCore) {
        let mut state = self.state.lock();
        state.sockets = Sockets::new(&self.inputs, &self.outputs);
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---- client ----

/// Receives confirmed changes of one machine replica.
pub trait MachineStateListener: Send + Sync {
    fn on_move(&self, _x: f32, _y: f32) {}
    fn on_attach(&self, _source: &str, _output: &str, _input: &str) {}
    fn on_detach(&self, _source: &str, _output: &str, _input: &str) {}
    fn on_knob_changed(&self, _knob: u32, _value: &KnobValue) {}
    fn on_sequencer_changed(&self, _command: &SequencerCommand) {}
}

struct ReplicaState {
    x: f32,
    y: f32,
    sockets: Sockets,
    knobs: Vec<KnobState>,
    sequencer: Option<SequencerSnapshot>,
    listeners: Vec<Arc<dyn MachineStateListener>>,
}

pub struct MachineReplica {
    base: ObjectBase,
    link: ServerLink,
    name: String,
    kind: MachineKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
    state: Mutex<ReplicaState>,
}

impl MachineReplica {
    pub fn create(
        id: ObjId,
        msg: &Message,
        link: ServerLink,
    ) -> Result<Arc<dyn ClientObject>, HandlerError> {
        let name = msg.get_text(KEY_NAME)?;
        let kind = MachineKind::from_name(msg.get_value(KEY_KIND)?)
            .ok_or_else(|| MessageError::BadValue(KEY_KIND.to_string()))?;
        let inputs: Vec<String> = msg.get_json(KEY_INPUTS)?;
        let outputs: Vec<String> = msg.get_json(KEY_OUTPUTS)?;
        let connections: Vec<Connection> = msg.get_json(KEY_CONNECTIONS)?;
        let sockets = Sockets::from_connections(&name, &inputs, &outputs, &connections);
        let sequencer = if kind == MachineKind::Sequencer {
            Some(msg.get_json(KEY_SEQUENCER)?)
        } else {
            None
        };
        Ok(Arc::new(MachineReplica {
            base: ObjectBase::new(id),
            link,
            state: Mutex::new(ReplicaState {
                x: msg.get(KEY_X)?,
                y: msg.get(KEY_Y)?,
                sockets,
                knobs: msg.get_json(KEY_KNOBS)?,
                sequencer,
                listeners: Vec::new(),
            }),
            name,
            kind,
            inputs,
            outputs,
        }))
    }

    pub fn id(&self) -> ObjId {
        self.base.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn is_valid(&self) -> bool {
        self.base.is_valid()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn position(&self) -> (f32, f32) {
        let state = self.state.lock();
        (state.x, state.y)
    }

    pub fn input_connections(&self) -> Vec<Connection> {
        self.state.lock().sockets.input_connections()
    }

    pub fn output_connections(&self) -> Vec<Connection> {
        self.state.lock().sockets.output_connections()
    }

    /// Connections on one input socket.
    pub fn connections_on_input(&self, input: &str) -> Vec<Connection> {
        self.state
            .lock()
            .sockets
            .inputs
            .get(input)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Connections on one output socket.
    pub fn connections_on_output(&self, output: &str) -> Vec<Connection> {
        self.state
            .lock()
            .sockets
            .outputs
            .get(output)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn knobs(self: &Arc<Self>) -> Vec<KnobHandle> {
        let ids: Vec<u32> = self.state.lock().knobs.iter().map(|k| k.id).collect();
        ids.into_iter().map(|id| KnobHandle::new(Arc::clone(self), id)).collect()
    }

    pub fn knob(self: &Arc<Self>, id: u32) -> Option<KnobHandle> {
        let exists = self.state.lock().knobs.iter().any(|k| k.id == id);
        exists.then(|| KnobHandle::new(Arc::clone(self), id))
    }

    pub fn knob_by_name(self: &Arc<Self>, name: &str) -> Option<KnobHandle> {
        let id = self
            .state
            .lock()
            .knobs
            .iter()
            .find(|k| k.descriptor.name == name)
            .map(|k| k.id)?;
        Some(KnobHandle::new(Arc::clone(self), id))
    }

    pub(crate) fn knob_descriptor(&self, id: u32) -> Result<KnobDescriptor, ObjectError> {
        self.base.check_valid()?;
        self.state
            .lock()
            .knobs
            .iter()
            .find(|k| k.id == id)
            .map(|k| k.descriptor.clone())
            .ok_or(ObjectError::NoSuchObject(self.base.id()))
    }

    pub fn sequencer(&self) -> Option<SequencerSnapshot> {
        self.state.lock().sequencer.clone()
    }

    /// Subscribe to changes. The listener first receives the current
    /// position and every input connection, then incremental updates.
    pub fn set_state_change_listener(&self, listener: Arc<dyn MachineStateListener>) {
        let (x, y, inputs) = {
            let mut state = self.state.lock();
            state.listeners.push(Arc::clone(&listener));
            (state.x, state.y, state.sockets.input_connections())
        };
        listener.on_move(x, y);
        for c in inputs {
            listener.on_attach(&c.source, &c.output, &c.input);
        }
    }

    pub fn remove_state_change_listener(&self, listener: &Arc<dyn MachineStateListener>) {
        self.state
            .lock()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn request(&self, command: MachineCommand, via_udp: bool) -> Result<(), ReplyError> {
        self.base.check_valid()?;
        self.link.send_command(self.base.id(), command, via_udp)
    }

    pub fn attach_input(&self, source: &str, output: &str, input: &str) -> Result<(), ReplyError> {
        self.request(
            MachineCommand::Attach {
                source: source.to_string(),
                output: output.to_string(),
                input: input.to_string(),
            },
            false,
        )
    }

    pub fn detach_input(&self, source: &str, output: &str, input: &str) -> Result<(), ReplyError> {
        self.request(
            MachineCommand::Detach {
                source: source.to_string(),
                output: output.to_string(),
                input: input.to_string(),
            },
            false,
        )
    }

    pub fn set_position(&self, x: f32, y: f32) -> Result<(), ReplyError> {
        self.request(MachineCommand::Move { x, y }, false)
    }

    pub fn request_knob_change(&self, knob: u32, value: &str) -> Result<(), ReplyError> {
        self.request(
            MachineCommand::ChangeKnob {
                knob,
                value: value.to_string(),
            },
            false,
        )
    }

    /// Live pad gesture. Goes over the datagram channel when one is open.
    pub fn pad_event(&self, event: PadEvent) -> Result<(), ReplyError> {
        self.request(MachineCommand::PadEvent(event), true)
    }

    pub fn sequencer_command(&self, command: SequencerCommand) -> Result<(), ReplyError> {
        self.request(MachineCommand::Sequencer(command), false)
    }

    /// Blocking variant: waits for the server to accept or refuse.
    pub fn sequencer_command_confirmed(&self, command: SequencerCommand) -> Result<(), ReplyError> {
        self.base.check_valid()?;
        self.link
            .request_command(self.base.id(), MachineCommand::Sequencer(command))?;
        Ok(())
    }

    /// Ask for a new loop; `on_created` receives its id.
    pub fn create_loop<F>(&self, on_created: F) -> Result<(), ReplyError>
    where
        F: FnOnce(Result<LoopId, ReplyError>) + Send + 'static,
    {
        self.base.check_valid()?;
        let msg = Command::Request(MachineCommand::Sequencer(SequencerCommand::CreateLoop {
            loop_id: None,
        }))
        .to_message(self.base.id())?;
        self.link.send_with_reply(
            msg,
            Box::new(move |reply| {
                on_created(reply.and_then(|m| Ok(LoopId::new(m.get::<u32>(KEY_LOOP)?))))
            }),
        )?;
        Ok(())
    }

    /// Blocking `create_loop`.
    pub fn create_loop_blocking(&self) -> Result<LoopId, ReplyError> {
        self.base.check_valid()?;
        let reply = self.link.request_command(
            self.base.id(),
            MachineCommand::Sequencer(SequencerCommand::CreateLoop { loop_id: None }),
        )?;
        Ok(LoopId::new(reply.get::<u32>(KEY_LOOP)?))
    }

    fn apply_connection(&self, core: &ClientCore, connection: &Connection, attach: bool) {
        let source = core
            .objects_of::<MachineReplica>()
            .into_iter()
            .find(|m| m.name == connection.source);
        if let Some(source) = source {
            let mut state = source.state.lock();
            if attach {
                state.sockets.add_output(connection);
            } else {
                state.sockets.remove_output(connection);
            }
        }
    }
}

impl ClientObject for MachineReplica {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        RI_MACHINE
    }

    fn process_message(&self, core: &mut ClientCore, msg: &Message) -> Result<(), HandlerError> {
        let command = match Command::<MachineCommand>::read(msg)? {
            Command::Confirm(command) => command,
            Command::Request(_) => return Err(unknown_verb().into()),
        };
        match command {
            MachineCommand::Attach { source, output, input } => {
                let connection = Connection::new(&source, &output, &self.name, &input);
                let listeners = {
                    let mut state = self.state.lock();
                    state.sockets.add_input(&connection);
                    state.listeners.clone()
                };
                self.apply_connection(core, &connection, true);
                for l in &listeners {
                    l.on_attach(&source, &output, &input);
                }
            }
            MachineCommand::Detach { source, output, input } => {
                let connection = Connection::new(&source, &output, &self.name, &input);
                let listeners = {
                    let mut state = self.state.lock();
                    state.sockets.remove_input(&connection);
                    state.listeners.clone()
                };
                self.apply_connection(core, &connection, false);
                for l in &listeners {
                    l.on_detach(&source, &output, &input);
                }
            }
            MachineCommand::Move { x, y } => {
                let listeners = {
                    let mut state = self.state.lock();
                    state.x = x;
                    state.y = y;
                    state.listeners.clone()
                };
                for l in &listeners {
                    l.on_move(x, y);
                }
            }
            MachineCommand::ChangeKnob { knob, value } => {
                let (value, listeners) = {
                    let mut state = self.state.lock();
                    let k = state
                        .knobs
                        .iter_mut()
                        .find(|k| k.id == knob)
                        .ok_or_else(|| HandlerError::failure(format!("no knob {}", knob)))?;
                    let value = KnobValue::parse(k.descriptor.kind(), &value)
                        .ok_or_else(|| MessageError::BadValue(KEY_VALUE.to_string()))?;
                    k.descriptor.value = value.clone();
                    (value, state.listeners.clone())
                };
                for l in &listeners {
                    l.on_knob_changed(knob, &value);
                }
            }
            MachineCommand::Sequencer(command) => {
                let listeners = {
                    let mut state = self.state.lock();
                    let snapshot = state
                        .sequencer
                        .as_mut()
                        .ok_or_else(|| HandlerError::failure("not a sequencer"))?;
                    snapshot
                        .apply(&command)
                        .map_err(|e| HandlerError::failure(e.to_string()))?;
                    state.listeners.clone()
                };
                for l in &listeners {
                    l.on_sequencer_changed(&command);
                }
            }
            MachineCommand::PadEvent(_) => {}
        }
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
