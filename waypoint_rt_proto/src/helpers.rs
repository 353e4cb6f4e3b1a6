//!
//! Packet framing helpers used by both the client-sdk and host emulations.
//!

use log::{error, trace};

use crate::{PacketFlag, PacketHeader, WireError, REQUEST_ID_NONE};

pub type PacketBytes = Vec<u8>;

/// Packet kinds based on the header flag byte.
/// The payload is the opaque application bytes after striping the header.
pub enum PacketView {
    /// undefined packet, either truncated or carrying an unknown flag.
    Undefined,
    /// a one-way route message.
    Message(PacketPayloadMessage),
    /// a request initiated by the remote peer through an ask.
    Request(PacketPayloadRequest),
    /// a reply to a previously issued request.
    Reply(PacketPayloadReply),
    /// a best-effort cancellation notice for a previous request.
    Cancel(PacketPayloadCancel),
}

/// Extracted payload of a one-way route message.
pub struct PacketPayloadMessage {
    pub route_handle: u16,
    pub bytes: PacketBytes,
}

/// Extracted payload of a request packet.
pub struct PacketPayloadRequest {
    pub route_handle: u16,
    pub request_id: u16,
    pub bytes: PacketBytes,
}

/// The three reply kinds of the request/reply protocol. `Error` and
/// `Complete` are terminal, `Next` is an intermediate value.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ReplyKind {
    Next,
    Error,
    Complete,
}

/// Extracted payload of a reply packet.
pub struct PacketPayloadReply {
    pub route_handle: u16,
    pub request_id: u16,
    pub kind: ReplyKind,
    pub bytes: PacketBytes,
}

/// Extracted payload of a cancellation notice.
pub struct PacketPayloadCancel {
    pub route_handle: u16,
    pub request_id: u16,
}

///
/// Process a packet received over the connection.
/// 1. Decode the fixed header.
/// 2. Check the flag and request id fields.
/// 3. Determine whether the packet is MESSAGE, REQUEST, REPLY, or CANCEL.
/// 4. Return a PacketView with the appropriate payload.
///
pub fn process_packet(msg: PacketBytes) -> PacketView {
    trace!("process_packet_len: {}", msg.len());

    match PacketHeader::decode(&msg) {
        Ok((header, payload)) => classify_packet(header, payload.to_vec()),
        Err(e) => {
            error!("process_packet_ERROR: {}", e);
            PacketView::Undefined
        }
    }
}

/// Create a one-way route message packet.
pub fn create_message_packet(route_handle: u16, payload: &[u8]) -> PacketBytes {
    trace!("create_message_packet_route: {}", route_handle);

    PacketHeader {
        route_handle,
        request_id: REQUEST_ID_NONE,
        flag: PacketFlag::None,
    }
    .encode_with_payload(payload)
}

/// Create a request packet carrying the REQUEST_ID allocated by the caller.
pub fn create_request_packet(route_handle: u16, request_id: u16, payload: &[u8]) -> PacketBytes {
    trace!("create_request_packet_req_id: {}", request_id);

    PacketHeader {
        route_handle,
        request_id,
        flag: PacketFlag::Request,
    }
    .encode_with_payload(payload)
}

/// Create a reply packet of the given kind for the REQUEST_ID.
pub fn create_reply_packet(
    kind: ReplyKind,
    route_handle: u16,
    request_id: u16,
    payload: &[u8],
) -> PacketBytes {
    trace!("create_reply_packet_req_id: {}", request_id);

    let flag = match kind {
        ReplyKind::Next => PacketFlag::Next,
        ReplyKind::Error => PacketFlag::Error,
        ReplyKind::Complete => PacketFlag::Complete,
    };

    PacketHeader {
        route_handle,
        request_id,
        flag,
    }
    .encode_with_payload(payload)
}

/// Create a cancellation notice for the REQUEST_ID.
pub fn create_cancel_packet(route_handle: u16, request_id: u16) -> PacketBytes {
    trace!("create_cancel_packet_req_id: {}", request_id);

    PacketHeader {
        route_handle,
        request_id,
        flag: PacketFlag::Cancel,
    }
    .encode_with_payload(&[])
}

///
/// Process the header and payload of a decoded packet.
/// 1. Check the flag and request id combination.
/// 2. Determine if the packet is MESSAGE, REQUEST, REPLY, or CANCEL.
/// 3. Return the PacketView with the appropriate payload.
///
fn classify_packet(header: PacketHeader, bytes: PacketBytes) -> PacketView {
    if header.flag != PacketFlag::None && header.request_id == REQUEST_ID_NONE {
        error!("classify_packet_ERROR_request_flag_without_request_id");
        return PacketView::Undefined;
    }

    match header.flag {
        PacketFlag::None => PacketView::Message(PacketPayloadMessage {
            route_handle: header.route_handle,
            bytes,
        }),
        PacketFlag::Request => PacketView::Request(PacketPayloadRequest {
            route_handle: header.route_handle,
            request_id: header.request_id,
            bytes,
        }),
        PacketFlag::Next | PacketFlag::Error | PacketFlag::Complete => {
            let kind = match header.flag {
                PacketFlag::Next => ReplyKind::Next,
                PacketFlag::Error => ReplyKind::Error,
                _ => ReplyKind::Complete,
            };

            PacketView::Reply(PacketPayloadReply {
                route_handle: header.route_handle,
                request_id: header.request_id,
                kind,
                bytes,
            })
        }
        PacketFlag::Cancel => PacketView::Cancel(PacketPayloadCancel {
            route_handle: header.route_handle,
            request_id: header.request_id,
        }),
    }
}
