//! Length-prefixed framing for stream and datagram transports.
//!
//! Stream format: `[8 hex ASCII digits: body length][body]`.
//! Datagram format: `[8 hex digits: client id][8 hex digits: body length][body]`,
//! since a datagram socket has no per-connection state to identify the sender.

use std::io::{self, Read, Write};

use crate::error::MessageError;
use crate::message::{Message, HEADER_LEN};
use crate::protocol::{ClientId, INTRODUCTION};

/// Hard cap on an encoded datagram.
pub const MAX_DATAGRAM: usize = 1024;

fn invalid(e: MessageError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Write an already encoded frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

/// Write a framed message to a stream.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> io::Result<()> {
    write_frame(writer, &msg.encode())
}

/// Read a framed message from a stream into `msg`.
pub fn read_message_into<R: Read>(reader: &mut R, msg: &mut Message) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = Message::decode_header(&header).map_err(invalid)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    msg.decode_body_into(&body).map_err(invalid)
}

/// Read a framed message from a stream.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Message> {
    let mut msg = Message::new();
    read_message_into(reader, &mut msg)?;
    Ok(msg)
}

/// Encode a datagram, or None when it would exceed `MAX_DATAGRAM`.
pub fn encode_datagram(client: ClientId, msg: &Message) -> Option<Vec<u8>> {
    let frame = msg.encode();
    if frame.len() + HEADER_LEN > MAX_DATAGRAM {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + frame.len());
    out.extend_from_slice(format!("{:08x}", client.0).as_bytes());
    out.extend_from_slice(&frame);
    Some(out)
}

/// Decode a datagram into the sending client id and its message.
pub fn decode_datagram(data: &[u8]) -> Result<(ClientId, Message), MessageError> {
    if data.len() < 2 * HEADER_LEN {
        return Err(MessageError::BadHeader);
    }
    let (client_hex, rest) = data.split_at(HEADER_LEN);
    if !client_hex.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(MessageError::BadHeader);
    }
    let client_text = std::str::from_utf8(client_hex).map_err(|_| MessageError::BadHeader)?;
    let client = u32::from_str_radix(client_text, 16).map_err(|_| MessageError::BadHeader)?;

    let len = Message::decode_header(&rest[..HEADER_LEN])?;
    let body = &rest[HEADER_LEN..];
    if body.len() != len {
        return Err(MessageError::BadBody);
    }
    Ok((ClientId::new(client), Message::decode_body(body)?))
}

/// Send our introduction and check the peer's.
pub fn exchange_introduction<S: Read + Write>(stream: &mut S) -> io::Result<()> {
    write_frame(stream, INTRODUCTION)?;
    let mut theirs = [0u8; INTRODUCTION.len()];
    stream.read_exact(&mut theirs)?;
    if &theirs != INTRODUCTION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "peer sent an unexpected introduction",
        ));
    }
    Ok(())
}
