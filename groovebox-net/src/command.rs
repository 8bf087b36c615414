//! Typed per-object commands.
//!
//! Every object command is a payload enum whose variants map to a verb. A
//! client sends `req_<verb>` to ask for a change; the server answers every
//! client with `cmd_<verb>` carrying the value it actually applied.

use groovebox_types::ObjId;

use crate::error::MessageError;
use crate::message::{Message, KEY_COMMAND};

pub const REQUEST_PREFIX: &str = "req_";
pub const CONFIRM_PREFIX: &str = "cmd_";

/// A command vocabulary with one explicit wire mapping.
pub trait CommandPayload: Sized {
    fn verb(&self) -> &'static str;
    fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError>;
    fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError>;
}

/// Direction of a command: asked for by a client, or confirmed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<P> {
    Request(P),
    Confirm(P),
}

impl<P: CommandPayload> Command<P> {
    pub fn payload(&self) -> &P {
        match self {
            Command::Request(p) | Command::Confirm(p) => p,
        }
    }

    pub fn into_payload(self) -> P {
        match self {
            Command::Request(p) | Command::Confirm(p) => p,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Command::Request(_))
    }

    pub fn command_id(&self) -> String {
        match self {
            Command::Request(p) => format!("{}{}", REQUEST_PREFIX, p.verb()),
            Command::Confirm(p) => format!("{}{}", CONFIRM_PREFIX, p.verb()),
        }
    }

    /// Fill `msg` addressed to object `obj`.
    pub fn write(&self, obj: ObjId, msg: &mut Message) -> Result<(), MessageError> {
        msg.set_identifier(obj.get())?;
        msg.set_command_id(&self.command_id())?;
        self.payload().write_fields(msg)
    }

    pub fn to_message(&self, obj: ObjId) -> Result<Message, MessageError> {
        let mut msg = Message::new();
        self.write(obj, &mut msg)?;
        Ok(msg)
    }

    pub fn read(msg: &Message) -> Result<Self, MessageError> {
        let id = msg.command_id()?;
        if let Some(verb) = id.strip_prefix(REQUEST_PREFIX) {
            P::read_fields(verb, msg).map(Command::Request)
        } else if let Some(verb) = id.strip_prefix(CONFIRM_PREFIX) {
            P::read_fields(verb, msg).map(Command::Confirm)
        } else {
            Err(MessageError::BadValue(KEY_COMMAND.to_string()))
        }
    }
}

/// Error for a verb the payload type does not know.
pub fn unknown_verb() -> MessageError {
    MessageError::BadValue(KEY_COMMAND.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Toy {
        Set(u32),
        Name(String),
    }

    impl CommandPayload for Toy {
        fn verb(&self) -> &'static str {
            match self {
                Toy::Set(_) => "set",
                Toy::Name(_) => "name",
            }
        }

        fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError> {
            match self {
                Toy::Set(v) => msg.set("v", v),
                Toy::Name(n) => msg.set_text("n", n),
            }
        }

        fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError> {
            match verb {
                "set" => Ok(Toy::Set(msg.get("v")?)),
                "name" => Ok(Toy::Name(msg.get_text("n")?)),
                _ => Err(unknown_verb()),
            }
        }
    }

    #[test]
    fn request_and_confirm_prefixes() {
        let msg = Command::Request(Toy::Set(3)).to_message(ObjId::new(9)).unwrap();
        assert_eq!(msg.command_id().unwrap(), "req_set");
        assert_eq!(msg.identifier().unwrap(), 9);
        assert_eq!(Command::<Toy>::read(&msg).unwrap(), Command::Request(Toy::Set(3)));

        let msg = Command::Confirm(Toy::Name("a;b".into()))
            .to_message(ObjId::new(1))
            .unwrap();
        assert_eq!(msg.command_id().unwrap(), "cmd_name");
        assert_eq!(
            Command::<Toy>::read(&msg).unwrap(),
            Command::Confirm(Toy::Name("a;b".into()))
        );
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let mut msg = Message::new();
        msg.set_command_id("req_explode").unwrap();
        assert!(Command::<Toy>::read(&msg).is_err());

        let mut msg = Message::new();
        msg.set_command_id("set").unwrap();
        assert!(Command::<Toy>::read(&msg).is_err());

        let mut msg = Message::new();
        msg.set_command_id("req_set").unwrap();
        assert_eq!(
            Command::<Toy>::read(&msg),
            Err(MessageError::NoSuchKey("v".into()))
        );
    }
}
