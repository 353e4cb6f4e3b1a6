//!
//! Package contains the wire contract of the waypoint realtime messages.
//!
//! Every packet exchanged with the realtime host starts with a fixed
//! five byte header followed by an opaque payload produced by the
//! application serializer:
//!
//! ```text
//! [route handle: u16 BE][request id: u16 BE][flag: u8][payload bytes...]
//! ```
//!
//! Along with the header codec this package contains:
//! * The packet flag byte and its request/reply semantics.
//! * Helper functionalities used to frame and classify packets, shared
//!   by the client-sdk and by host emulations in tests.
//! * The reliability and priority send hints that are attached per
//!   packet and passed through to the transport uninterpreted.
//!
//! WARNING: The current version of this repository is 0.0.1-dev0 and is
//! undergoing development for the first release client 0.1.0-rc0, which
//! means that both the public interfaces and internal module structures
//! may change significantly.
//!

#![deny(unreachable_pub)]
#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 5;

/// Route handles below this value are reserved for the session
/// management routes; host assigned scene route handles start here.
pub const SYSTEM_ROUTE_HANDLE_CEILING: u16 = 16;

/// Reserved route handle for the scene connection handshake request.
pub const ROUTE_HANDLE_SCENE_CONNECT: u16 = 1;

/// Reserved route handle for the scene disconnection request.
pub const ROUTE_HANDLE_SCENE_DISCONNECT: u16 = 2;

/// Reserved route handle for the host initiated scene-closed notice.
pub const ROUTE_HANDLE_SCENE_CLOSED: u16 = 3;

/// Request id 0 is never allocated; it is the placeholder carried by
/// packets outside the request/reply protocol.
pub const REQUEST_ID_NONE: u16 = 0;

/// The packet flag byte. Determines how the receiver demultiplexes the
/// packet: plain route message, request, one of the reply kinds, or a
/// cancellation notice.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketFlag {
    /// One-way route message, no reply expected.
    None = 0,
    /// Request expecting a correlated reply.
    Request = 1,
    /// Intermediate reply value for a request.
    Next = 2,
    /// Terminal error reply, payload is a UTF-8 fault message.
    Error = 3,
    /// Terminal success reply, optionally carrying a final value.
    Complete = 4,
    /// Best-effort cancellation notice for a request.
    Cancel = 5,
}

impl PacketFlag {
    /// Decode the flag byte.
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(PacketFlag::None),
            1 => Ok(PacketFlag::Request),
            2 => Ok(PacketFlag::Next),
            3 => Ok(PacketFlag::Error),
            4 => Ok(PacketFlag::Complete),
            5 => Ok(PacketFlag::Cancel),
            other => Err(WireError::UnknownFlag(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Reliability hint attached per send. The sdk never interprets it,
/// the transport may.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Reliability {
    Unreliable,
    UnreliableSequenced,
    Reliable,
    ReliableSequenced,
    ReliableOrdered,
}

impl Default for Reliability {
    fn default() -> Self {
        Reliability::ReliableOrdered
    }
}

/// Priority hint attached per send. The sdk never interprets it,
/// the transport may.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Immediate,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// The fixed header framed in front of every payload.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PacketHeader {
    pub route_handle: u16,
    pub request_id: u16,
    pub flag: PacketFlag,
}

impl PacketHeader {
    /// Encode the header into the first [`HEADER_LEN`] bytes of a new
    /// buffer sized for the payload that follows.
    pub fn encode_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&self.route_handle.to_be_bytes());
        bytes.extend_from_slice(&self.request_id.to_be_bytes());
        bytes.push(self.flag.as_byte());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Decode the header, returning it together with the payload slice.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let route_handle = u16::from_be_bytes([bytes[0], bytes[1]]);
        let request_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        let flag = PacketFlag::from_byte(bytes[4])?;

        Ok((
            PacketHeader {
                route_handle,
                request_id,
                flag,
            },
            &bytes[HEADER_LEN..],
        ))
    }
}

/// Wire level decode failures. The offending packet is dropped by the
/// receiver, these never abort a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown packet flag byte: {0}")]
    UnknownFlag(u8),
}

/// Packet framing and classification helpers used by the client-sdk and
/// by host emulations.
pub mod helpers;
