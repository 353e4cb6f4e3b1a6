use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use dashmap::DashMap;
use serde::de::DeserializeOwned;

use waypoint_rt_proto::{
    helpers::{self as packet_helpers, PacketPayloadReply, ReplyKind},
    Priority, Reliability, REQUEST_ID_NONE,
};

use crate::connection::Connection;
use crate::error::{CodecError, RpcError, TransportError};
use crate::serializer::Serializer;

// ====================================================================
// NOTE: REQUEST-RESPONSE PATTERN SUPPORT
// ====================================================================
// When we issue a request we allocate a connection-scoped request id,
// register the pending entry, and only then hand the packet to the
// connection. A reply could in principle race the send call, so the
// pending entry must exist before transmission completes. Ids wrap at
// u16 and are recycled only after the prior holder is removed by a
// terminal reply, a cancellation, or connection loss.
// ====================================================================

/// Reply events delivered to the caller side of a pending request.
enum ReplyEvent {
    /// intermediate value.
    Next(Vec<u8>),
    /// terminal success, optionally carrying a final value.
    Complete(Option<Vec<u8>>),
    /// terminal failure: remote fault, cancellation, or connection loss.
    Fault(RpcError),
}

struct PendingEntry {
    route: Arc<str>,
    route_handle: u16,
    scene_handle: Option<u16>,
    tx: flume::Sender<ReplyEvent>,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Correlates outgoing requests with inbound reply packets and manages
/// per-request cancellation and completion. One manager per physical
/// connection; the pending table is shared by every scene on it.
pub(crate) struct RequestManager {
    connection: Arc<dyn Connection>,
    pending: DashMap<u16, PendingEntry>,
    next_request_id: Mutex<u16>,
}

impl RequestManager {
    pub(crate) fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            pending: DashMap::new(),
            next_request_id: Mutex::new(1),
        }
    }

    /// Issue a request on a route handle. The pending entry is
    /// registered before the packet is handed to the connection.
    pub(crate) fn send_request(
        self: &Arc<Self>,
        route: Arc<str>,
        route_handle: u16,
        scene_handle: Option<u16>,
        payload: &[u8],
        reliability: Reliability,
        priority: Priority,
    ) -> Result<PendingRpc, RpcError> {
        let request_id = self.allocate_request_id()?;
        let (tx, rx) = flume::unbounded();

        self.pending.insert(
            request_id,
            PendingEntry {
                route: route.clone(),
                route_handle,
                scene_handle,
                tx,
                created_at: Instant::now(),
            },
        );

        let packet = packet_helpers::create_request_packet(route_handle, request_id, payload);
        if let Err(e) = self.connection.send_packet(packet, reliability, priority) {
            self.pending.remove(&request_id);
            return Err(RpcError::Transport(e));
        }

        tracing::trace!(target: "client-event", "request_sent_req_id: {}", request_id);

        Ok(PendingRpc {
            request_id,
            route,
            rx,
            manager: Arc::downgrade(self),
            terminated: false,
        })
    }

    // Next free id, skipping ids currently in flight. Id 0 stays
    // reserved as the non-request placeholder.
    fn allocate_request_id(&self) -> Result<u16, RpcError> {
        let mut next = self
            .next_request_id
            .lock()
            .expect("request_id_lock_poisoned");

        let start = *next;
        loop {
            let candidate = *next;
            *next = next.wrapping_add(1);

            if candidate != REQUEST_ID_NONE && !self.pending.contains_key(&candidate) {
                return Ok(candidate);
            }
            if *next == start {
                return Err(RpcError::TooManyPendingRequests);
            }
        }
    }

    /// Surface an inbound reply packet to its pending entry. Replies
    /// for unknown ids and duplicate terminals are logged and dropped,
    /// never fatal to the dispatcher.
    pub(crate) fn handle_reply(&self, reply: PacketPayloadReply) {
        match reply.kind {
            ReplyKind::Next => {
                if let Some(entry) = self.pending.get(&reply.request_id) {
                    let _ = entry.tx.send(ReplyEvent::Next(reply.bytes));
                } else {
                    tracing::warn!(target: "client-event",
                        "reply_for_unknown_req_id_dropped: {}", reply.request_id);
                }
            }
            ReplyKind::Error => {
                if let Some((_, entry)) = self.pending.remove(&reply.request_id) {
                    let message = String::from_utf8_lossy(&reply.bytes).into_owned();
                    let _ = entry.tx.send(ReplyEvent::Fault(RpcError::RemoteFault(message)));
                } else {
                    tracing::warn!(target: "client-event",
                        "terminal_reply_for_unknown_req_id_dropped: {}", reply.request_id);
                }
            }
            ReplyKind::Complete => {
                if let Some((_, entry)) = self.pending.remove(&reply.request_id) {
                    let value = if reply.bytes.is_empty() {
                        None
                    } else {
                        Some(reply.bytes)
                    };
                    let _ = entry.tx.send(ReplyEvent::Complete(value));
                } else {
                    tracing::warn!(target: "client-event",
                        "terminal_reply_for_unknown_req_id_dropped: {}", reply.request_id);
                }
            }
        }
    }

    /// Remove the pending entry and best-effort notify the host. Never
    /// blocks waiting for an acknowledgment.
    pub(crate) fn cancel(&self, request_id: u16) {
        if let Some((_, entry)) = self.pending.remove(&request_id) {
            if self.connection.is_open() {
                let packet = packet_helpers::create_cancel_packet(entry.route_handle, request_id);
                if let Err(e) =
                    self.connection
                        .send_packet(packet, Reliability::Reliable, Priority::Medium)
                {
                    tracing::debug!(target: "client-event",
                        "cancel_notice_send_failed_req_id {}: {}", request_id, e);
                }
            }
            let _ = entry.tx.send(ReplyEvent::Fault(RpcError::Cancelled));

            tracing::trace!(target: "client-event",
                "request_cancelled_route {} req_id: {}", entry.route, request_id);
        }
    }

    /// Fail every outstanding request, e.g. on connection loss.
    pub(crate) fn fail_all(&self, error: RpcError) {
        let ids: Vec<u16> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(ReplyEvent::Fault(error.clone()));
            }
        }
    }

    /// Fail the outstanding requests issued through one scene.
    pub(crate) fn fail_scene(&self, scene_handle: u16, error: RpcError) {
        let ids: Vec<u16> = self
            .pending
            .iter()
            .filter(|entry| entry.value().scene_handle == Some(scene_handle))
            .map(|entry| *entry.key())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(ReplyEvent::Fault(error.clone()));
            }
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn contains(&self, request_id: u16) -> bool {
        self.pending.contains_key(&request_id)
    }
}

/// Caller side of an issued request. Await the reply stream with
/// [`PendingRpc::next_value`], or [`PendingRpc::await_single`] when the
/// route replies with exactly one value. Dropping the handle cancels
/// the request if no terminal reply arrived yet.
pub struct PendingRpc {
    request_id: u16,
    route: Arc<str>,
    rx: flume::Receiver<ReplyEvent>,
    manager: Weak<RequestManager>,
    terminated: bool,
}

impl PendingRpc {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Next reply value. `Ok(Some(bytes))` per intermediate value (and
    /// for a final value carried by the terminal success), `Ok(None)`
    /// once the request completed, `Err` on the terminal failure.
    pub async fn next_value(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        if self.terminated {
            return Ok(None);
        }

        match self.rx.recv_async().await {
            Ok(ReplyEvent::Next(bytes)) => Ok(Some(bytes)),
            Ok(ReplyEvent::Complete(value)) => {
                self.terminated = true;
                Ok(value)
            }
            Ok(ReplyEvent::Fault(error)) => {
                self.terminated = true;
                Err(error)
            }
            Err(_) => {
                self.terminated = true;
                Err(RpcError::Protocol("reply channel dropped".to_owned()))
            }
        }
    }

    /// Await exactly one value; errors with [`RpcError::NoValue`] if
    /// the request completes without one.
    pub async fn await_single(mut self) -> Result<Vec<u8>, RpcError> {
        match self.next_value().await? {
            Some(bytes) => Ok(bytes),
            None => Err(RpcError::NoValue),
        }
    }

    /// Cancel the request: removed locally, best-effort notice to the
    /// host, caller observes [`RpcError::Cancelled`].
    pub fn cancel(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.cancel(self.request_id);
        }
    }
}

impl Drop for PendingRpc {
    fn drop(&mut self) {
        if !self.terminated {
            if let Some(manager) = self.manager.upgrade() {
                manager.cancel(self.request_id);
            }
        }
    }
}

/// Context handed to procedure handlers for one inbound request:
/// payload access, intermediate replies, and the cancellation flag.
/// The terminal reply is produced from the handler's return value.
pub struct RequestContext {
    scene_id: Arc<str>,
    route: Arc<str>,
    route_handle: u16,
    request_id: u16,
    payload: Vec<u8>,
    connection: Arc<dyn Connection>,
    cancelled: Arc<AtomicBool>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scene_id: Arc<str>,
        route: Arc<str>,
        route_handle: u16,
        request_id: u16,
        payload: Vec<u8>,
        connection: Arc<dyn Connection>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            scene_id,
            route,
            route_handle,
            request_id,
            payload,
            connection,
            cancelled,
        }
    }

    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the request payload through the application serializer.
    pub fn read_as<T: DeserializeOwned, S: Serializer>(
        &self,
        serializer: &S,
    ) -> Result<T, CodecError> {
        serializer.decode(&self.payload)
    }

    /// Send an intermediate reply value. The terminal reply still comes
    /// from the handler's return value.
    pub fn send_value(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let packet = packet_helpers::create_reply_packet(
            ReplyKind::Next,
            self.route_handle,
            self.request_id,
            bytes,
        );
        self.connection
            .send_packet(packet, Reliability::ReliableOrdered, Priority::Medium)
    }

    /// Whether the host sent a cancellation notice for this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
