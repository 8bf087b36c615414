//! In-memory patch bay: the audio graph the server mirrors.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use parking_lot::RwLock;

use groovebox_types::{Connection, KnobDescriptor, KnobValue, MachineDescriptor, MachineGraph};

#[derive(Debug, Default)]
pub struct PatchBay {
    machines: RwLock<BTreeMap<String, MachineDescriptor>>,
    connections: RwLock<BTreeSet<Connection>>,
}

impl PatchBay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_machine(&self, descriptor: MachineDescriptor) -> Result<(), String> {
        let mut machines = self.machines.write();
        if machines.contains_key(&descriptor.name) {
            return Err(format!("machine {} already exists", descriptor.name));
        }
        machines.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Remove a machine and every connection touching it.
    pub fn remove_machine(&self, name: &str) -> Option<MachineDescriptor> {
        let removed = self.machines.write().remove(name)?;
        self.connections
            .write()
            .retain(|c| c.source != name && c.destination != name);
        Some(removed)
    }

    pub fn machine(&self, name: &str) -> Option<MachineDescriptor> {
        self.machines.read().get(name).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.read().iter().cloned().collect()
    }

    pub fn is_connected(&self, connection: &Connection) -> bool {
        self.connections.read().contains(connection)
    }

    pub fn controller(&self, machine: &str, controller: &str) -> Option<KnobValue> {
        self.machines
            .read()
            .get(machine)?
            .knobs
            .iter()
            .find(|k| k.name == controller)
            .map(|k| k.value.clone())
    }

    fn check_sockets(&self, connection: &Connection) -> Result<(), String> {
        let machines = self.machines.read();
        let source = machines
            .get(&connection.source)
            .ok_or_else(|| format!("no machine named {}", connection.source))?;
        let destination = machines
            .get(&connection.destination)
            .ok_or_else(|| format!("no machine named {}", connection.destination))?;
        if !source.outputs.contains(&connection.output) {
            return Err(format!("{} has no output {}", source.name, connection.output));
        }
        if !destination.inputs.contains(&connection.input) {
            return Err(format!("{} has no input {}", destination.name, connection.input));
        }
        if connection.source == connection.destination {
            return Err(format!("{} cannot feed itself", source.name));
        }
        Ok(())
    }
}

impl MachineGraph for PatchBay {
    fn connect(&self, connection: &Connection) -> Result<(), String> {
        self.check_sockets(connection)?;
        if !self.connections.write().insert(connection.clone()) {
            return Err(format!("{} is already connected", connection));
        }
        debug!(target: "audio::graph", "connected {}", connection);
        Ok(())
    }

    fn disconnect(&self, connection: &Connection) -> Result<(), String> {
        if !self.connections.write().remove(connection) {
            return Err(format!("{} is not connected", connection));
        }
        debug!(target: "audio::graph", "disconnected {}", connection);
        Ok(())
    }

    fn set_controller(&self, machine: &str, controller: &str, value: &KnobValue) -> Result<KnobValue, String> {
        let mut machines = self.machines.write();
        let knob: &mut KnobDescriptor = machines
            .get_mut(machine)
            .ok_or_else(|| format!("no machine named {}", machine))?
            .knobs
            .iter_mut()
            .find(|k| k.name == controller)
            .ok_or_else(|| format!("{} has no controller {}", machine, controller))?;
        let applied = knob
            .constrain(value.clone())
            .ok_or_else(|| format!("{} does not accept that value", controller))?;
        knob.value = applied.clone();
        Ok(applied)
    }
}
