//! Remote object replication for Groovebox.
//!
//! One server owns the authoritative objects (transport, machines, sample
//! banks); every client holds replicas. Clients only request changes, the
//! server applies them and broadcasts the confirmed result to all clients.

pub mod client;
pub mod command;
pub mod context;
pub mod error;
pub mod framing;
pub mod handler;
pub mod message;
pub mod object;
pub mod objects;
pub mod protocol;
pub mod server;

pub use client::{Client, ClientCore, ClientEvents, ReplyHandler, ServerLink};
pub use command::{Command, CommandPayload};
pub use context::{ContextHandle, ContextThread};
pub use error::{ContextError, HandlerError, MessageError, ObjectError, ReplyError};
pub use message::{Message, MessagePool};
pub use object::{ClientFactory, ClientObject, FactoryRegistry, ObjectBase, ServerObject};
pub use objects::default_registry;
pub use protocol::{ClientId, PROTOCOL_VERSION};
pub use server::{Server, ServerCore, ServerOptions};
