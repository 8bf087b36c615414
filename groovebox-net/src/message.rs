//! Key/value wire message.
//!
//! Wire format: `[8 hex digits: body length][body]`, where the body is
//! `key=value;` repeated for every entry in key order. Keys and values may
//! not contain `=` or `;`; free-form text goes through `set_text`, which
//! percent-escapes them.

use std::fmt::Display;
use std::str::FromStr;

use parking_lot::Mutex;

use crate::error::MessageError;

/// Length of the hex body-length header.
pub const HEADER_LEN: usize = 8;
/// Largest body accepted from the wire.
pub const MAX_BODY_LEN: usize = 100_000_000;

/// Target object id, or a negative protocol control code.
pub const KEY_ID: &str = "id";
/// Per-object command selector.
pub const KEY_COMMAND: &str = "commandid";
/// Reply correlation id.
pub const KEY_REPLY: &str = "repid";

const KEY_VALUE_SEP: char = '=';
const ENTRY_SEP: char = ';';

fn check_chars(s: &str) -> Result<(), MessageError> {
    if s.contains(KEY_VALUE_SEP) || s.contains(ENTRY_SEP) {
        return Err(MessageError::IllegalChar(s.to_string()));
    }
    Ok(())
}

/// Escape `%`, `=` and `;` so arbitrary text can travel as a value.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            '=' => out.push_str("%3D"),
            ';' => out.push_str("%3B"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of `escape_text`.
pub fn unescape_text(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// An ordered set of unique keys mapped to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    // Sorted by key. A Vec keeps its capacity across `clear`, which is what
    // makes pooling worthwhile.
    entries: Vec<(String, String)>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.find(key).is_ok()
    }

    fn find(&self, key: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_str().cmp(key))
    }

    /// Set a key. Each key may be set only once.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), MessageError> {
        if key.is_empty() {
            return Err(MessageError::IllegalChar(String::new()));
        }
        check_chars(key)?;
        check_chars(value)?;
        match self.find(key) {
            Ok(_) => Err(MessageError::SettingSameKeyTwice(key.to_string())),
            Err(idx) => {
                self.entries.insert(idx, (key.to_string(), value.to_string()));
                Ok(())
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Result<&str, MessageError> {
        self.find(key)
            .map(|idx| self.entries[idx].1.as_str())
            .map_err(|_| MessageError::NoSuchKey(key.to_string()))
    }

    /// Set a key from any displayable value.
    pub fn set<T: Display>(&mut self, key: &str, value: T) -> Result<(), MessageError> {
        self.set_value(key, &value.to_string())
    }

    /// Read and parse a key.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, MessageError> {
        self.get_value(key)?
            .parse()
            .map_err(|_| MessageError::BadValue(key.to_string()))
    }

    /// Read and parse a key that may be absent.
    pub fn get_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>, MessageError> {
        if self.has_key(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Set a free-form text value (escaped).
    pub fn set_text(&mut self, key: &str, text: &str) -> Result<(), MessageError> {
        self.set_value(key, &escape_text(text))
    }

    pub fn get_text(&self, key: &str) -> Result<String, MessageError> {
        unescape_text(self.get_value(key)?).ok_or_else(|| MessageError::BadValue(key.to_string()))
    }

    /// Set a value serialized as JSON text.
    pub fn set_json<T: serde::Serialize>(&mut self, key: &str, value: &T) -> Result<(), MessageError> {
        let json =
            serde_json::to_string(value).map_err(|_| MessageError::BadValue(key.to_string()))?;
        self.set_text(key, &json)
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, MessageError> {
        serde_json::from_str(&self.get_text(key)?)
            .map_err(|_| MessageError::BadValue(key.to_string()))
    }

    pub fn identifier(&self) -> Result<i32, MessageError> {
        self.get(KEY_ID)
    }

    pub fn set_identifier(&mut self, id: i32) -> Result<(), MessageError> {
        self.set(KEY_ID, id)
    }

    pub fn command_id(&self) -> Result<&str, MessageError> {
        self.get_value(KEY_COMMAND)
    }

    pub fn set_command_id(&mut self, command: &str) -> Result<(), MessageError> {
        self.set_value(KEY_COMMAND, command)
    }

    pub fn reply_id(&self) -> Option<u32> {
        self.get(KEY_REPLY).ok()
    }

    pub fn set_reply_id(&mut self, repid: u32) -> Result<(), MessageError> {
        self.set(KEY_REPLY, repid)
    }

    /// Body text, `key=value;` per entry in key order.
    pub fn encode_body(&self) -> String {
        let mut body = String::new();
        for (k, v) in &self.entries {
            body.push_str(k);
            body.push(KEY_VALUE_SEP);
            body.push_str(v);
            body.push(ENTRY_SEP);
        }
        body
    }

    /// Header plus body, ready to write to a stream.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(format!("{:08x}", body.len()).as_bytes());
        out.extend_from_slice(body.as_bytes());
        out
    }

    /// Parse exactly eight hex digits into a body length.
    pub fn decode_header(header: &[u8]) -> Result<usize, MessageError> {
        if header.len() != HEADER_LEN || !header.iter().all(|b| b.is_ascii_hexdigit()) {
            return Err(MessageError::BadHeader);
        }
        let text = std::str::from_utf8(header).map_err(|_| MessageError::BadHeader)?;
        let len = usize::from_str_radix(text, 16).map_err(|_| MessageError::BadHeader)?;
        if len > MAX_BODY_LEN {
            return Err(MessageError::TooLarge(len));
        }
        Ok(len)
    }

    /// Parse a body into this (cleared) message.
    pub fn decode_body_into(&mut self, body: &[u8]) -> Result<(), MessageError> {
        self.clear();
        let text = std::str::from_utf8(body).map_err(|_| MessageError::BadBody)?;
        let mut rest = text;
        while !rest.is_empty() {
            let end = rest.find(ENTRY_SEP).ok_or(MessageError::BadBody)?;
            let entry = &rest[..end];
            let sep = entry.find(KEY_VALUE_SEP).ok_or(MessageError::BadBody)?;
            self.set_value(&entry[..sep], &entry[sep + 1..])?;
            rest = &rest[end + 1..];
        }
        Ok(())
    }

    pub fn decode_body(body: &[u8]) -> Result<Message, MessageError> {
        let mut msg = Message::new();
        msg.decode_body_into(body)?;
        Ok(msg)
    }
}

/// Free-list of messages owned by a context.
pub struct MessagePool {
    free: Mutex<Vec<Message>>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take a cleared message from the pool, or allocate one.
    pub fn acquire(&self) -> Message {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return a message to the pool.
    pub fn recycle(&self, mut msg: Message) {
        msg.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(msg);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(64)
    }
}
