//! Knob replicas: typed parameter mirrors owned by a machine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use groovebox_types::{KnobDescriptor, KnobType, KnobValue};

use crate::error::{ObjectError, ReplyError};

use super::machine::MachineReplica;

/// One knob as it travels inside a machine's create message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobState {
    pub id: u32,
    pub descriptor: KnobDescriptor,
}

impl KnobState {
    /// Parse and constrain raw request text against this knob's type.
    /// The type tag is fixed; text of another type is rejected.
    pub fn accept(&self, raw: &str) -> Result<KnobValue, String> {
        let kind = self.descriptor.kind();
        let parsed = KnobValue::parse(kind, raw)
            .ok_or_else(|| format!("{:?} is not a valid {} value", raw, kind.name()))?;
        self.descriptor
            .constrain(parsed)
            .ok_or_else(|| format!("knob {} rejected {:?}", self.descriptor.name, raw))
    }
}

/// Client handle to one knob of a machine replica.
#[derive(Clone)]
pub struct KnobHandle {
    machine: Arc<MachineReplica>,
    id: u32,
}

impl KnobHandle {
    pub(crate) fn new(machine: Arc<MachineReplica>, id: u32) -> Self {
        Self { machine, id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn machine(&self) -> &Arc<MachineReplica> {
        &self.machine
    }

    pub fn descriptor(&self) -> Result<KnobDescriptor, ObjectError> {
        self.machine.knob_descriptor(self.id)
    }

    pub fn name(&self) -> String {
        self.descriptor().map(|d| d.name).unwrap_or_default()
    }

    pub fn title(&self) -> String {
        self.descriptor().map(|d| d.title).unwrap_or_default()
    }

    pub fn kind(&self) -> Result<KnobType, ObjectError> {
        self.descriptor().map(|d| d.kind())
    }

    pub fn get_value(&self) -> Result<KnobValue, ObjectError> {
        self.descriptor().map(|d| d.value)
    }

    pub fn get_value_as_double(&self) -> Result<f64, ObjectError> {
        self.get_value().map(|v| v.as_f64())
    }

    /// Display text, with enum knobs showing their entry name.
    pub fn get_value_as_text(&self) -> Result<String, ObjectError> {
        let d = self.descriptor()?;
        Ok(match d.enum_name() {
            Some(name) => name.to_string(),
            None => d.value.to_wire(),
        })
    }

    /// Ask the server to set the value; the server clamps to the knob's range.
    pub fn set_value_as_double(&self, value: f64) -> Result<(), ReplyError> {
        self.machine.request_knob_change(self.id, &value.to_string())
    }

    pub fn set_value_as_string(&self, value: &str) -> Result<(), ReplyError> {
        self.machine.request_knob_change(self.id, value)
    }
}

impl std::fmt::Debug for KnobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnobHandle")
            .field("machine", &self.machine.name())
            .field("id", &self.id)
            .finish()
    }
}
