//! Protobuf wire messages.
//!
//! Every message that crosses the wire, in every phase, travels inside an
//! [`Envelope`]. The envelope's `data` field holds one of the phase-specific
//! messages below, encoded on its own so that the signature covers exactly the
//! bytes the receiver decodes.

use std::fmt;

use prost::Message;

use crate::WireError;

/// Purpose tag carried by every envelope.
///
/// The numeric values are part of the wire format and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Route {
    /// Legacy peers left the route unset; only accepted where an introduction is expected.
    Invalid = 0,
    /// Introduction, key agreement and handshake challenges.
    Identity = 1,
    /// Session resumption sub-protocol.
    Reconnect = 2,
    /// Application payloads on an established session.
    ExchangeMessages = 3,
}

impl Route {
    /// Routes that applications may send on an established transport.
    pub fn is_sendable(self) -> bool {
        !matches!(self, Route::Invalid)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Route::Invalid => "Invalid",
            Route::Identity => "Identity",
            Route::Reconnect => "Reconnect",
            Route::ExchangeMessages => "ExchangeMessages",
        };
        f.write_str(name)
    }
}

/// Lifecycle phase of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SessionPhase {
    Invalid = 0,
    Init = 1,
    Handshaking = 2,
    Established = 3,
    Closed = 4,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Invalid => "Invalid",
            SessionPhase::Init => "Init",
            SessionPhase::Handshaking => "Handshaking",
            SessionPhase::Established => "Established",
            SessionPhase::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Per-message bookkeeping attached to an envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub id: String,
    /// Microseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

/// Signed wire unit.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub padding: Vec<u8>,
    #[prost(enumeration = "Route", tag = "4")]
    pub route: i32,
    #[prost(message, optional, tag = "5")]
    pub metadata: Option<Metadata>,
}

/// Self-declared identity sent at the start of a fresh handshake.
#[derive(Clone, PartialEq, Message)]
pub struct Introduction {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub algorithm: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub padding: Vec<u8>,
}

/// Ephemeral key agreement contribution.
#[derive(Clone, PartialEq, Message)]
pub struct KeyExchange {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub padding: Vec<u8>,
}

/// Opaque application bytes (also used for handshake challenges).
#[derive(Clone, PartialEq, Message)]
pub struct Payload {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}

/// Ratchet-encrypted envelope as it appears on an established connection.
#[derive(Clone, PartialEq, Message)]
pub struct RatchetFrame {
    /// Sender's current ratchet public key.
    #[prost(bytes = "vec", tag = "1")]
    pub dh: Vec<u8>,
    /// Length of the sender's previous chain.
    #[prost(uint64, tag = "2")]
    pub pn: u64,
    /// Index of this message in the current chain.
    #[prost(uint64, tag = "3")]
    pub n: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconnectRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(enumeration = "SessionPhase", tag = "2")]
    pub last_phase: i32,
    #[prost(uint64, tag = "3")]
    pub last_send_sequence: u64,
    #[prost(uint64, tag = "4")]
    pub last_recv_sequence: u64,
    /// Public key of the requesting side.
    #[prost(bytes = "vec", tag = "5")]
    pub remote_public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub resume_challenge: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconnectResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(enumeration = "SessionPhase", tag = "3")]
    pub resume_from_phase: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub challenge_response: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub server_challenge: Vec<u8>,
    #[prost(uint64, tag = "6")]
    pub server_send_sequence: u64,
    #[prost(uint64, tag = "7")]
    pub server_recv_sequence: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconnectVerify {
    #[prost(bytes = "vec", tag = "1")]
    pub challenge_response: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub verified: bool,
}

/// Final resumption message. Sequences are from the server's point of view.
#[derive(Clone, PartialEq, Message)]
pub struct ReconnectComplete {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(uint64, tag = "3")]
    pub resume_send_sequence: u64,
    #[prost(uint64, tag = "4")]
    pub resume_recv_sequence: u64,
}

/// Decode any wire message from a byte slice.
pub fn decode_msg<M: Message + Default>(bytes: &[u8]) -> Result<M, WireError> {
    Ok(M::decode(bytes)?)
}
