//! Error taxonomy of the replication layer.

use thiserror::Error;

use groovebox_types::ObjId;

/// Wire message construction and decoding errors.
///
/// On a live connection any of these is fatal: the connection is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("setting same key twice: {0}")]
    SettingSameKeyTwice(String),
    #[error("illegal character in {0:?}")]
    IllegalChar(String),
    #[error("malformed header")]
    BadHeader,
    #[error("malformed body")]
    BadBody,
    #[error("bad value for key {0}")]
    BadValue(String),
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Object registry and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("no such object: {0}")]
    NoSuchObject(ObjId),
    #[error("object id space exhausted")]
    ObjIdOverflow,
    #[error("duplicate object id: {0}")]
    DuplicateObjectId(ObjId),
    #[error("object was deleted")]
    ObjectWasDeleted,
    #[error("no such factory: {0}")]
    NoSuchFactory(String),
}

/// Errors from submitting work to a context thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context thread has stopped")]
    Stopped,
    #[error("blocking call issued from the context thread itself")]
    Reentrant,
}

/// Outcome of a request that awaited a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("request failed: {0}")]
    Failed(String),
    #[error("connection lost before reply")]
    ConnectionLost,
    #[error("reply id already pending")]
    IdCollision,
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// Error returned by a per-object message handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Application-level rejection, sent back to the requester only.
    #[error("{0}")]
    Failure(String),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl HandlerError {
    pub fn failure(reason: impl Into<String>) -> Self {
        HandlerError::Failure(reason.into())
    }
}
