#![deny(unsafe_code)]

//! Wire-level types for the patchbay RPC substrate.
//!
//! Everything that crosses a connection is a [`Packet`]; everything a packet
//! carries as a payload is a [`Value`]. Both are postcard-encoded, with the
//! enum variant index serving as the packet tag byte.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

mod framing;
mod transport;

pub use framing::{LengthPrefixedFramed, DEFAULT_MAX_FRAME_LEN};
pub use transport::PacketTransport;

/// Call ID identifying one in-flight call.
///
/// Call IDs are monotonically increasing and unique within the connection
/// that allocated them. The same integer is meaningful only together with
/// "which connection issued it" - a router translates ids when it forwards a
/// call between two links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CallId(pub u64);

impl CallId {
    /// Create a new call ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<CallId> for u64 {
    fn from(id: CallId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call:{}", self.0)
    }
}

/// Generates unique call IDs for one side of a connection.
///
/// Monotonically increasing counter starting at 1. An id is never reused
/// while a call using it is outstanding; never reusing them at all is the
/// simplest way to guarantee that.
pub struct CallIdGenerator {
    next: AtomicU64,
}

impl CallIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next unique call ID.
    pub fn next(&self) -> CallId {
        CallId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal JSON-like primitive carried in call arguments, results, and
/// out-of-band messages.
///
/// The core routes these opaquely; it never coerces or casts them. Anything
/// richer (shared references, typed records) belongs behind
/// [`encode_value`]/[`decode_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Borrow the string payload, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the integer payload, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the boolean payload, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Encode a single value to bytes.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_stdvec(value)
}

/// Decode a single value from bytes.
pub fn decode_value(bytes: &[u8]) -> Result<Value, postcard::Error> {
    postcard::from_bytes(bytes)
}

/// Classifies a wire error.
///
/// Variant order is wire-significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The target type is not registered anywhere.
    RemoteNotFound = 0,
    /// The type exists but has no such method (or the argument count does
    /// not match any overload).
    MethodNotFound = 1,
    /// The connection hosting the call went away before a terminal packet.
    ConnectionClosed = 2,
    /// More than one method matched the invocation.
    CallAmbiguous = 3,
    /// Any other handler failure, captured at its origin.
    Wrapped = 4,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RemoteNotFound => "remote not found",
            ErrorKind::MethodNotFound => "method not found",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::CallAmbiguous => "call ambiguous",
            ErrorKind::Wrapped => "wrapped",
        };
        f.write_str(s)
    }
}

/// Structured error payload of an `Error` packet.
///
/// Constructed exactly once at the error's origin and carried by value from
/// then on - the stack trace is frozen text, never re-captured when the
/// record crosses a hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    /// Human-readable description of where the error originated
    /// (a connection name, or `"local"`).
    pub origin: String,
    pub message: String,
    /// Frozen stack trace text, possibly empty.
    pub stack: String,
}

impl ErrorRecord {
    /// Build a record with an empty stack trace.
    pub fn new(kind: ErrorKind, origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            message: message.into(),
            stack: String::new(),
        }
    }

    /// A `ConnectionClosed` record originating at the local endpoint.
    pub fn connection_closed(origin: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ConnectionClosed,
            origin,
            "connection closed before the call completed",
        )
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (from {}): {}", self.kind, self.origin, self.message)
    }
}

impl std::error::Error for ErrorRecord {}

/// Protocol packet.
///
/// Variant order is wire-significant (postcard enum discriminants are the
/// packet tags). Every variant carries the [`CallId`] it concerns; only
/// `Call` opens a new id, everything else refers back to one.
#[repr(u8)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Invoke `ty.method(args)`. A `None` type addresses the router itself
    /// (registration, handshake, existence checks).
    Call {
        id: CallId,
        ty: Option<String>,
        method: String,
        args: Vec<Value>,
    } = 0,

    /// Terminal: the call completed with a result.
    Success { id: CallId, result: Value } = 1,

    /// Terminal: the call failed.
    Error { id: CallId, error: ErrorRecord } = 2,

    /// Advisory request that the callee stop processing. Not itself a
    /// terminal packet - the callee still owes a `Success` or `Error`.
    Cancel { id: CallId } = 3,

    /// Out-of-band message from the caller to whoever is executing the call.
    MessageToCallee { id: CallId, args: Vec<Value> } = 4,

    /// Out-of-band message from the executor back to the caller.
    MessageToCaller { id: CallId, args: Vec<Value> } = 5,
}

impl Packet {
    /// The call id this packet concerns.
    pub fn call_id(&self) -> CallId {
        match self {
            Packet::Call { id, .. }
            | Packet::Success { id, .. }
            | Packet::Error { id, .. }
            | Packet::Cancel { id }
            | Packet::MessageToCallee { id, .. }
            | Packet::MessageToCaller { id, .. } => *id,
        }
    }

    /// Whether this packet settles the call it refers to.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Packet::Success { .. } | Packet::Error { .. })
    }

    /// Encode to bytes (without any framing prefix).
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Decode from the bytes of exactly one packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
