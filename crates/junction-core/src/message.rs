//! Message envelope and frame codec.
//!
//! A `Message` is an immutable, reference-counted envelope: a header with
//! routing fields plus a JSON argument array. Clones share the same
//! allocation, so a message can sit in a transmit queue and in a log line
//! at the same time.
//!
//! On the wire each message is one frame:
//!   u32 big-endian length | JSON { header, body }

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;

/// Largest frame accepted by the default codec.
pub const MAX_FRAME_LEN: usize = 128 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// Header flag bits.
pub mod flags {
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    pub const AUTO_START: u8 = 0x02;
    pub const ALLOW_REMOTE_MSG: u8 = 0x04;
    pub const SESSIONLESS: u8 = 0x10;
    pub const GLOBAL_BROADCAST: u8 = 0x20;
}

/// Routing fields of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_type: MessageType,
    #[serde(default)]
    pub flags: u8,
    #[serde(default)]
    pub serial: u32,
    #[serde(default)]
    pub reply_serial: u32,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub member: String,
    #[serde(default)]
    pub error_name: String,
    #[serde(default)]
    pub session_id: u32,
    /// Milliseconds the message stays deliverable. 0 = forever.
    #[serde(default)]
    pub ttl_ms: u32,
    #[serde(default)]
    pub signature: String,
}

impl Header {
    fn blank(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: 0,
            serial: 0,
            reply_serial: 0,
            sender: String::new(),
            destination: String::new(),
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            error_name: String::new(),
            session_id: 0,
            ttl_ms: 0,
            signature: String::new(),
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            ..Self::blank(MessageType::MethodCall)
        }
    }

    /// A signal. An empty destination makes it a broadcast.
    pub fn signal(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            ..Self::blank(MessageType::Signal)
        }
    }

    pub fn reply_to(call: &Message) -> Self {
        Self {
            destination: call.sender().to_string(),
            reply_serial: call.serial(),
            session_id: call.session_id(),
            ..Self::blank(MessageType::MethodReturn)
        }
    }

    pub fn error_to(call: &Message, error_name: &str) -> Self {
        Self {
            destination: call.sender().to_string(),
            reply_serial: call.serial(),
            session_id: call.session_id(),
            error_name: error_name.to_string(),
            ..Self::blank(MessageType::Error)
        }
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = sender.to_string();
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn session(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn ttl(mut self, ttl_ms: u32) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }
}

#[derive(Debug)]
struct Inner {
    header: Header,
    body: Vec<Value>,
    received: Instant,
}

/// Shared, immutable message.
#[derive(Debug, Clone)]
pub struct Message(Arc<Inner>);

impl Message {
    /// Build a message. The signature is derived from the arguments.
    pub fn new(mut header: Header, body: Vec<Value>) -> Self {
        header.signature = signature_of(&body);
        Self(Arc::new(Inner {
            header,
            body,
            received: Instant::now(),
        }))
    }

    pub fn header(&self) -> &Header {
        &self.0.header
    }

    pub fn msg_type(&self) -> MessageType {
        self.0.header.msg_type
    }

    pub fn serial(&self) -> u32 {
        self.0.header.serial
    }

    pub fn reply_serial(&self) -> u32 {
        self.0.header.reply_serial
    }

    pub fn sender(&self) -> &str {
        &self.0.header.sender
    }

    pub fn destination(&self) -> &str {
        &self.0.header.destination
    }

    pub fn interface(&self) -> &str {
        &self.0.header.interface
    }

    pub fn member(&self) -> &str {
        &self.0.header.member
    }

    pub fn error_name(&self) -> &str {
        &self.0.header.error_name
    }

    pub fn session_id(&self) -> u32 {
        self.0.header.session_id
    }

    pub fn ttl_ms(&self) -> u32 {
        self.0.header.ttl_ms
    }

    pub fn flags(&self) -> u8 {
        self.0.header.flags
    }

    pub fn args(&self) -> &[Value] {
        &self.0.body
    }

    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.0.body.get(idx)
    }

    pub fn str_arg(&self, idx: usize) -> Result<&str, BusError> {
        self.arg(idx)
            .and_then(Value::as_str)
            .ok_or_else(|| BusError::Malformed(format!("{}: arg {idx} is not a string", self.member())))
    }

    pub fn u64_arg(&self, idx: usize) -> Result<u64, BusError> {
        self.arg(idx)
            .and_then(Value::as_u64)
            .ok_or_else(|| BusError::Malformed(format!("{}: arg {idx} is not an integer", self.member())))
    }

    /// Deserialize argument `idx` into a typed value.
    pub fn typed_arg<T: serde::de::DeserializeOwned>(&self, idx: usize) -> Result<T, BusError> {
        let v = self
            .arg(idx)
            .ok_or_else(|| BusError::Malformed(format!("{}: missing arg {idx}", self.member())))?;
        Ok(serde_json::from_value(v.clone())?)
    }

    /// Messages from a daemon's own controller endpoint (`:xxxx.1`).
    pub fn is_control(&self) -> bool {
        self.sender().ends_with(".1")
    }

    pub fn is_broadcast_signal(&self) -> bool {
        self.msg_type() == MessageType::Signal && self.destination().is_empty()
    }

    /// Messages with a TTL may be dropped, so they are not reliable.
    pub fn is_unreliable(&self) -> bool {
        self.ttl_ms() != 0
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in() == Some(Duration::ZERO)
    }

    /// Time left before the TTL elapses. `None` when there is no TTL.
    pub fn expires_in(&self) -> Option<Duration> {
        if self.ttl_ms() == 0 {
            return None;
        }
        let ttl = Duration::from_millis(u64::from(self.ttl_ms()));
        Some(ttl.saturating_sub(self.0.received.elapsed()))
    }

    /// Copy of this message with a new serial and sender, used when a
    /// daemon re-originates a message on another link.
    pub fn restamp(&self, sender: &str, serial: u32) -> Message {
        let header = self.0.header.clone().sender(sender).serial(serial);
        Message::new(header, self.0.body.clone())
    }
}

/// One character per top-level argument.
pub fn signature_of(body: &[Value]) -> String {
    body.iter()
        .map(|v| match v {
            Value::Null => 'n',
            Value::Bool(_) => 'b',
            Value::Number(n) if n.is_u64() => 'u',
            Value::Number(n) if n.is_i64() => 'x',
            Value::Number(_) => 'd',
            Value::String(_) => 's',
            Value::Array(_) => 'a',
            Value::Object(_) => 'e',
        })
        .collect()
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Turns messages into bytes and back. Implementations must be stateless
/// with respect to any single stream: all partial-read state lives in the
/// caller's buffer.
pub trait WireCodec: Send + Sync {
    fn encode(&self, msg: &Message, dst: &mut BytesMut) -> Result<(), BusError>;

    /// Decode one message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A complete frame is
    /// always consumed, even when it fails validation, so the caller can
    /// decide whether to continue.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, BusError>;
}

#[derive(Serialize)]
struct WireFrameRef<'a> {
    header: &'a Header,
    body: &'a [Value],
}

#[derive(Deserialize)]
struct WireFrame {
    header: Header,
    body: Vec<Value>,
}

/// Length-prefixed JSON frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME_LEN,
        }
    }
}

impl FrameCodec {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl WireCodec for FrameCodec {
    fn encode(&self, msg: &Message, dst: &mut BytesMut) -> Result<(), BusError> {
        let json = serde_json::to_vec(&WireFrameRef {
            header: msg.header(),
            body: msg.args(),
        })?;
        if json.len() > self.max_frame {
            return Err(BusError::Malformed(format!(
                "frame of {} bytes exceeds {}",
                json.len(),
                self.max_frame
            )));
        }
        dst.reserve(LEN_PREFIX + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, BusError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(BusError::Malformed(format!("frame length {len} exceeds {}", self.max_frame)));
        }
        if src.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let frame = src.split_to(len);

        let wire: WireFrame = serde_json::from_slice(&frame)?;
        if wire.header.signature != signature_of(&wire.body) {
            return Err(BusError::SignatureMismatch);
        }
        Ok(Some(Message(Arc::new(Inner {
            header: wire.header,
            body: wire.body,
            received: Instant::now(),
        }))))
    }
}
