//! Sample banks: a named set of sample slots.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use groovebox_types::ObjId;

use crate::client::{ClientCore, ServerLink};
use crate::command::{unknown_verb, Command, CommandPayload};
use crate::error::{HandlerError, MessageError, ReplyError};
use crate::message::Message;
use crate::object::{ClientObject, ObjectBase, ServerObject};
use crate::protocol::ClientId;
use crate::server::ServerCore;

use super::SAMPLE_BANK;

pub const SAMPLE_SLOTS: usize = 16;

const KEY_BANK: &str = "bank";
const KEY_NAME: &str = "name";
const KEY_SLOT: &str = "slot";
const KEY_OTHER: &str = "other";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBankState {
    pub name: String,
    pub samples: Vec<Option<String>>,
}

impl SampleBankState {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            samples: vec![None; SAMPLE_SLOTS],
        }
    }

    fn check_slot(&self, slot: usize) -> Result<(), String> {
        if slot < self.samples.len() {
            Ok(())
        } else {
            Err(format!("no sample slot {}", slot))
        }
    }

    /// Validate and apply a command.
    pub fn apply(&mut self, command: &SampleBankCommand) -> Result<(), String> {
        match command {
            SampleBankCommand::SetName(name) => {
                if name.is_empty() {
                    return Err("bank name may not be empty".to_string());
                }
                self.name = name.clone();
            }
            SampleBankCommand::SetSampleName { slot, name } => {
                self.check_slot(*slot)?;
                self.samples[*slot] = Some(name.clone());
            }
            SampleBankCommand::SwapSamples { slot, other } => {
                self.check_slot(*slot)?;
                self.check_slot(*other)?;
                self.samples.swap(*slot, *other);
            }
            SampleBankCommand::ClearSample { slot } => {
                self.check_slot(*slot)?;
                self.samples[*slot] = None;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleBankCommand {
    SetName(String),
    SetSampleName { slot: usize, name: String },
    SwapSamples { slot: usize, other: usize },
    ClearSample { slot: usize },
}

impl CommandPayload for SampleBankCommand {
    fn verb(&self) -> &'static str {
        match self {
            SampleBankCommand::SetName(_) => "set_name",
            SampleBankCommand::SetSampleName { .. } => "set_sample_name",
            SampleBankCommand::SwapSamples { .. } => "swap_samples",
            SampleBankCommand::ClearSample { .. } => "clear_sample",
        }
    }

    fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError> {
        match self {
            SampleBankCommand::SetName(name) => msg.set_text(KEY_NAME, name),
            SampleBankCommand::SetSampleName { slot, name } => {
                msg.set(KEY_SLOT, slot)?;
                msg.set_text(KEY_NAME, name)
            }
            SampleBankCommand::SwapSamples { slot, other } => {
                msg.set(KEY_SLOT, slot)?;
                msg.set(KEY_OTHER, other)
            }
            SampleBankCommand::ClearSample { slot } => msg.set(KEY_SLOT, slot),
        }
    }

    fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError> {
        Ok(match verb {
            "set_name" => SampleBankCommand::SetName(msg.get_text(KEY_NAME)?),
            "set_sample_name" => SampleBankCommand::SetSampleName {
                slot: msg.get(KEY_SLOT)?,
                name: msg.get_text(KEY_NAME)?,
            },
            "swap_samples" => SampleBankCommand::SwapSamples {
                slot: msg.get(KEY_SLOT)?,
                other: msg.get(KEY_OTHER)?,
            },
            "clear_sample" => SampleBankCommand::ClearSample {
                slot: msg.get(KEY_SLOT)?,
            },
            _ => return Err(unknown_verb()),
        })
    }
}

pub struct SampleBankObject {
    base: ObjectBase,
    state: Mutex<SampleBankState>,
}

impl SampleBankObject {
    pub fn create(server: &mut ServerCore, name: &str) -> Result<Arc<SampleBankObject>, HandlerError> {
        let state = SampleBankState::new(name);
        server.create_object(|base| SampleBankObject {
            base,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> SampleBankState {
        self.state.lock().clone()
    }

    pub fn execute(&self, server: &mut ServerCore, command: SampleBankCommand) -> Result<(), HandlerError> {
        self.state.lock().apply(&command).map_err(HandlerError::Failure)?;
        server.distribute_command(self.base.id(), command)?;
        Ok(())
    }
}

impl ServerObject for SampleBankObject {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        SAMPLE_BANK
    }

    fn serialize(&self, msg: &mut Message) -> Result<(), MessageError> {
        msg.set_json(KEY_BANK, &*self.state.lock())
    }

    fn process_message(
        &self,
        server: &mut ServerCore,
        client: ClientId,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        match Command::<SampleBankCommand>::read(msg)? {
            Command::Request(command) => {
                self.execute(server, command)?;
                server.acknowledge(client, msg, |_| Ok(()))?;
                Ok(())
            }
            Command::Confirm(_) => Err(unknown_verb().into()),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub trait SampleBankListener: Send + Sync {
    fn bank_changed(&self, state: &SampleBankState);
}

pub struct SampleBankReplica {
    base: ObjectBase,
    link: ServerLink,
    state: Mutex<SampleBankState>,
    listeners: Mutex<Vec<Arc<dyn SampleBankListener>>>,
}

impl SampleBankReplica {
    pub fn create(
        id: ObjId,
        msg: &Message,
        link: ServerLink,
    ) -> Result<Arc<dyn ClientObject>, HandlerError> {
        Ok(Arc::new(SampleBankReplica {
            base: ObjectBase::new(id),
            link,
            state: Mutex::new(msg.get_json(KEY_BANK)?),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn state(&self) -> SampleBankState {
        self.state.lock().clone()
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn sample(&self, slot: usize) -> Option<String> {
        self.state.lock().samples.get(slot).cloned().flatten()
    }

    pub fn add_listener(&self, listener: Arc<dyn SampleBankListener>) {
        self.listeners.lock().push(listener);
    }

    fn request(&self, command: SampleBankCommand) -> Result<(), ReplyError> {
        self.base.check_valid()?;
        self.link.send_command(self.base.id(), command, false)
    }

    pub fn set_name(&self, name: &str) -> Result<(), ReplyError> {
        self.request(SampleBankCommand::SetName(name.to_string()))
    }

    pub fn set_sample_name(&self, slot: usize, name: &str) -> Result<(), ReplyError> {
        self.request(SampleBankCommand::SetSampleName {
            slot,
            name: name.to_string(),
        })
    }

    pub fn swap_samples(&self, slot: usize, other: usize) -> Result<(), ReplyError> {
        self.request(SampleBankCommand::SwapSamples { slot, other })
    }

    pub fn clear_sample(&self, slot: usize) -> Result<(), ReplyError> {
        self.request(SampleBankCommand::ClearSample { slot })
    }
}

impl ClientObject for SampleBankReplica {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        SAMPLE_BANK
    }

    fn process_message(&self, _client: &mut ClientCore, msg: &Message) -> Result<(), HandlerError> {
        let command = match Command::<SampleBankCommand>::read(msg)? {
            Command::Confirm(command) => command,
            Command::Request(_) => return Err(unknown_verb().into()),
        };
        let state = {
            let mut state = self.state.lock();
            state.apply(&command).map_err(HandlerError::Failure)?;
            state.clone()
        };
        let listeners = self.listeners.lock().clone();
        for l in &listeners {
            l.bank_changed(&state);
        }
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounds_checked() {
        let mut bank = SampleBankState::new("Drums");
        bank.apply(&SampleBankCommand::SetSampleName {
            slot: 0,
            name: "kick.wav".into(),
        })
        .unwrap();
        bank.apply(&SampleBankCommand::SwapSamples { slot: 0, other: 15 })
            .unwrap();
        assert_eq!(bank.samples[15].as_deref(), Some("kick.wav"));
        assert!(bank.samples[0].is_none());
        assert!(bank
            .apply(&SampleBankCommand::ClearSample { slot: SAMPLE_SLOTS })
            .is_err());
        assert!(bank.apply(&SampleBankCommand::SetName(String::new())).is_err());
    }

    #[test]
    fn commands_roundtrip() {
        let command = SampleBankCommand::SetSampleName {
            slot: 3,
            name: "snare; tight".into(),
        };
        let msg = Command::Request(command.clone()).to_message(ObjId::new(5)).unwrap();
        assert_eq!(
            Command::<SampleBankCommand>::read(&msg).unwrap(),
            Command::Request(command)
        );
    }
}
