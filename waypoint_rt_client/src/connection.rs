use waypoint_rt_proto::{Priority, Reliability};

use crate::error::TransportError;

/// Why the connection went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this client.
    Local,
    /// Closed by the remote host.
    Remote,
    /// Torn down after a transport failure.
    Error(String),
}

/// Event stream surfaced by a connection: framed packets in arrival
/// order, terminated by exactly one `Closed` event.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Packet(Vec<u8>),
    Closed(CloseReason),
}

/// A physical connection to the realtime host, consumed as an opaque
/// collaborator: it moves framed packets in both directions and reports
/// closure. Connection establishment, framing and encryption live in the
/// transport implementation, not here.
///
/// Reliability and priority are pass-through hints attached per send;
/// the sdk never interprets them.
pub trait Connection: Send + Sync + 'static {
    /// Queue one framed packet. Returns an error if the connection is
    /// no longer able to accept packets.
    fn send_packet(
        &self,
        bytes: Vec<u8>,
        reliability: Reliability,
        priority: Priority,
    ) -> Result<(), TransportError>;

    /// The inbound event stream. Packets for different routes are
    /// interleaved but each route's packets arrive in send order.
    fn events(&self) -> flume::Receiver<TransportEvent>;

    /// Ask the transport to close. The `Closed` event is still expected
    /// to be delivered on the event stream.
    fn close(&self, reason: CloseReason);

    fn is_open(&self) -> bool;
}
