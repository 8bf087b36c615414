//! Protocol constants and control messages.
//!
//! Messages whose `id` is negative are protocol control messages; the
//! rest target a replicated object.

use serde::{Deserialize, Serialize};

use groovebox_types::ObjId;

use crate::error::MessageError;
use crate::message::Message;

/// Fixed introduction both sides send right after connecting.
pub const INTRODUCTION: &[u8; 5] = b"GRVBX";
/// Bumped whenever the message vocabulary changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 3;

pub const KEY_NEW_OBJID: &str = "new_objid";
pub const KEY_FACTORY: &str = "factory";
pub const KEY_OBJID: &str = "objid";
pub const KEY_REASON: &str = "reason";
pub const KEY_VERSION: &str = "version";
pub const KEY_CLIENT_ID: &str = "clientid";

/// Unique identifier for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Negative `id` values reserved for protocol control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    CreateObject,
    FlushAllObjects,
    DeleteObject,
    FailureResponse,
    ProtocolVersion,
    Reply,
    ClientId,
}

impl ControlCode {
    pub fn code(self) -> i32 {
        match self {
            ControlCode::CreateObject => -1,
            ControlCode::FlushAllObjects => -2,
            ControlCode::DeleteObject => -3,
            ControlCode::FailureResponse => -4,
            ControlCode::ProtocolVersion => -5,
            ControlCode::Reply => -6,
            ControlCode::ClientId => -7,
        }
    }

    pub fn from_code(code: i32) -> Option<ControlCode> {
        match code {
            -1 => Some(ControlCode::CreateObject),
            -2 => Some(ControlCode::FlushAllObjects),
            -3 => Some(ControlCode::DeleteObject),
            -4 => Some(ControlCode::FailureResponse),
            -5 => Some(ControlCode::ProtocolVersion),
            -6 => Some(ControlCode::Reply),
            -7 => Some(ControlCode::ClientId),
            _ => None,
        }
    }
}

/// Where a message is headed once its `id` is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Object(ObjId),
    Control(ControlCode),
}

/// Classify a message by its `id` key.
pub fn target_of(msg: &Message) -> Result<Target, MessageError> {
    let id = msg.identifier()?;
    if id >= 0 {
        Ok(Target::Object(ObjId::new(id)))
    } else {
        ControlCode::from_code(id)
            .map(Target::Control)
            .ok_or_else(|| MessageError::BadValue(crate::message::KEY_ID.to_string()))
    }
}

/// Fill `msg` as a control message.
pub fn control(msg: &mut Message, code: ControlCode) -> Result<(), MessageError> {
    msg.set_identifier(code.code())
}

/// Header of an object-creation message. The object's own fields follow.
pub fn create_object(msg: &mut Message, id: ObjId, factory: &str) -> Result<(), MessageError> {
    control(msg, ControlCode::CreateObject)?;
    msg.set(KEY_NEW_OBJID, id.get())?;
    msg.set_value(KEY_FACTORY, factory)
}

pub fn delete_object(msg: &mut Message, id: ObjId) -> Result<(), MessageError> {
    control(msg, ControlCode::DeleteObject)?;
    msg.set(KEY_OBJID, id.get())
}

pub fn failure_response(
    msg: &mut Message,
    reason: &str,
    repid: Option<u32>,
) -> Result<(), MessageError> {
    control(msg, ControlCode::FailureResponse)?;
    msg.set_text(KEY_REASON, reason)?;
    if let Some(repid) = repid {
        msg.set_reply_id(repid)?;
    }
    Ok(())
}

pub fn protocol_version(msg: &mut Message) -> Result<(), MessageError> {
    control(msg, ControlCode::ProtocolVersion)?;
    msg.set(KEY_VERSION, PROTOCOL_VERSION)
}

pub fn client_id(msg: &mut Message, id: ClientId) -> Result<(), MessageError> {
    control(msg, ControlCode::ClientId)?;
    msg.set(KEY_CLIENT_ID, id.0)
}

/// Header of a reply to the request that carried `repid`.
pub fn reply(msg: &mut Message, repid: u32) -> Result<(), MessageError> {
    control(msg, ControlCode::Reply)?;
    msg.set_reply_id(repid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_order_by_value() {
        let mut ids = vec![ClientId(3), ClientId(1), ClientId(2)];
        ids.sort();
        assert_eq!(ids, vec![ClientId(1), ClientId(2), ClientId(3)]);
        assert!(ClientId(1) < ClientId(2));
    }

    #[test]
    fn control_codes_roundtrip() {
        for code in [
            ControlCode::CreateObject,
            ControlCode::FlushAllObjects,
            ControlCode::DeleteObject,
            ControlCode::FailureResponse,
            ControlCode::ProtocolVersion,
            ControlCode::Reply,
            ControlCode::ClientId,
        ] {
            assert!(code.code() < 0);
            assert_eq!(ControlCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ControlCode::from_code(-99), None);
    }

    #[test]
    fn target_classification() {
        let mut msg = Message::new();
        msg.set_identifier(12).unwrap();
        assert_eq!(target_of(&msg), Ok(Target::Object(ObjId::new(12))));

        let mut msg = Message::new();
        failure_response(&mut msg, "no such loop", Some(4)).unwrap();
        assert_eq!(
            target_of(&msg),
            Ok(Target::Control(ControlCode::FailureResponse))
        );
        assert_eq!(msg.reply_id(), Some(4));
        assert_eq!(msg.get_text(KEY_REASON).unwrap(), "no such loop");

        let mut msg = Message::new();
        msg.set_identifier(-42).unwrap();
        assert!(target_of(&msg).is_err());
    }
}
