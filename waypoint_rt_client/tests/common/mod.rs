//! In-memory transport and a scripted host for driving the sdk without
//! a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use waypoint_rt_client::system::{
    RemoteRouteDescriptor, RouteAssignment, SceneConnectRequest, SceneConnectResult,
    SceneDisconnectRequest,
};
use waypoint_rt_client::{
    CloseReason, Connection, Priority, Reliability, TransportError, TransportEvent,
};
use waypoint_rt_proto::{
    helpers::{self as packet_helpers, PacketView, ReplyKind},
    ROUTE_HANDLE_SCENE_CONNECT, SYSTEM_ROUTE_HANDLE_CEILING,
};

/// Connection double backed by two in-memory channels.
pub struct MockConnection {
    open: AtomicBool,
    to_client_tx: flume::Sender<TransportEvent>,
    to_client_rx: flume::Receiver<TransportEvent>,
    from_client_tx: flume::Sender<Vec<u8>>,
    from_client_rx: flume::Receiver<Vec<u8>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (to_client_tx, to_client_rx) = flume::unbounded();
        let (from_client_tx, from_client_rx) = flume::unbounded();
        Arc::new(Self {
            open: AtomicBool::new(true),
            to_client_tx,
            to_client_rx,
            from_client_tx,
            from_client_rx,
        })
    }

    /// Host side: inject a packet into the client's event stream.
    pub fn push_packet(&self, bytes: Vec<u8>) {
        let _ = self.to_client_tx.send(TransportEvent::Packet(bytes));
    }

    /// Host side: drop the connection.
    pub fn close_remote(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.to_client_tx.send(TransportEvent::Closed(CloseReason::Remote));
    }

    /// Host side: the packets the client sent.
    pub fn outbox(&self) -> flume::Receiver<Vec<u8>> {
        self.from_client_rx.clone()
    }
}

impl Connection for MockConnection {
    fn send_packet(
        &self,
        bytes: Vec<u8>,
        _reliability: Reliability,
        _priority: Priority,
    ) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError("connection closed".to_owned()));
        }
        self.from_client_tx
            .send(bytes)
            .map_err(|_| TransportError("host gone".to_owned()))
    }

    fn events(&self) -> flume::Receiver<TransportEvent> {
        self.to_client_rx.clone()
    }

    fn close(&self, reason: CloseReason) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.to_client_tx.send(TransportEvent::Closed(reason));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// One request observed on the host side.
pub struct HostRequest {
    pub route_handle: u16,
    pub request_id: u16,
    pub bytes: Vec<u8>,
}

/// One reply observed on the host side.
pub struct HostReply {
    pub route_handle: u16,
    pub request_id: u16,
    pub bytes: Vec<u8>,
}

/// The host side of a [`MockConnection`], with just enough protocol to
/// drive scenes through their life cycle.
pub struct FakeHost {
    pub connection: Arc<MockConnection>,
    outbox: flume::Receiver<Vec<u8>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let connection = MockConnection::new();
        let outbox = connection.outbox();
        Self { connection, outbox }
    }

    /// Next packet the client sent, classified.
    pub async fn recv(&self) -> PacketView {
        let bytes = self.outbox.recv_async().await.expect("client gone");
        packet_helpers::process_packet(bytes)
    }

    /// Next packet, expected to be a request.
    pub async fn expect_request(&self) -> HostRequest {
        match self.recv().await {
            PacketView::Request(request) => HostRequest {
                route_handle: request.route_handle,
                request_id: request.request_id,
                bytes: request.bytes,
            },
            _ => panic!("expected a request packet"),
        }
    }

    /// Next packet, expected to be a reply of the given kind.
    pub async fn expect_reply(&self, kind: ReplyKind) -> HostReply {
        match self.recv().await {
            PacketView::Reply(reply) => {
                assert_eq!(reply.kind, kind, "unexpected reply kind");
                HostReply {
                    route_handle: reply.route_handle,
                    request_id: reply.request_id,
                    bytes: reply.bytes,
                }
            }
            _ => panic!("expected a reply packet"),
        }
    }

    /// Non-blocking look at the next packet, if any.
    pub fn try_recv(&self) -> Option<PacketView> {
        self.outbox
            .try_recv()
            .ok()
            .map(packet_helpers::process_packet)
    }

    /// Next packet, expected to be a cancellation notice; returns the
    /// request id.
    pub async fn expect_cancel(&self) -> u16 {
        match self.recv().await {
            PacketView::Cancel(cancel) => cancel.request_id,
            _ => panic!("expected a cancel packet"),
        }
    }

    pub fn reply_next(&self, route_handle: u16, request_id: u16, payload: &[u8]) {
        self.connection.push_packet(packet_helpers::create_reply_packet(
            ReplyKind::Next,
            route_handle,
            request_id,
            payload,
        ));
    }

    pub fn reply_complete(&self, route_handle: u16, request_id: u16, payload: &[u8]) {
        self.connection.push_packet(packet_helpers::create_reply_packet(
            ReplyKind::Complete,
            route_handle,
            request_id,
            payload,
        ));
    }

    pub fn reply_error(&self, route_handle: u16, request_id: u16, message: &str) {
        self.connection.push_packet(packet_helpers::create_reply_packet(
            ReplyKind::Error,
            route_handle,
            request_id,
            message.as_bytes(),
        ));
    }

    pub fn push_message(&self, route_handle: u16, payload: &[u8]) {
        self.connection
            .push_packet(packet_helpers::create_message_packet(route_handle, payload));
    }

    pub fn push_request(&self, route_handle: u16, request_id: u16, payload: &[u8]) {
        self.connection.push_packet(packet_helpers::create_request_packet(
            route_handle,
            request_id,
            payload,
        ));
    }

    /// Serve one scene connection handshake: assign the scene handle
    /// and sequential local route handles, advertise the given remote
    /// routes, and reply. Returns the assignments for the test to look
    /// up handles by name.
    pub async fn accept_scene_connect(
        &self,
        scene_handle: u16,
        remote_routes: &[(&str, u16)],
    ) -> SceneConnectResult {
        let request = self.expect_request().await;
        assert_eq!(request.route_handle, ROUTE_HANDLE_SCENE_CONNECT);

        let connect: SceneConnectRequest =
            serde_json::from_slice(&request.bytes).expect("malformed connect request");

        let local_routes: Vec<RouteAssignment> = connect
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| RouteAssignment {
                name: route.name.clone(),
                handle: SYSTEM_ROUTE_HANDLE_CEILING + index as u16,
            })
            .collect();

        let result = SceneConnectResult {
            scene_handle,
            local_routes,
            remote_routes: remote_routes
                .iter()
                .map(|(name, handle)| RemoteRouteDescriptor {
                    name: (*name).to_string(),
                    handle: *handle,
                    metadata: HashMap::new(),
                })
                .collect(),
        };

        self.reply_complete(
            request.route_handle,
            request.request_id,
            &serde_json::to_vec(&result).expect("encode connect result"),
        );
        result
    }

    /// Next packet, expected to be the one-way scene disconnection
    /// notice; returns the scene handle it names.
    pub async fn expect_scene_disconnect(&self) -> u16 {
        match self.recv().await {
            PacketView::Message(message) => {
                assert_eq!(
                    message.route_handle,
                    waypoint_rt_proto::ROUTE_HANDLE_SCENE_DISCONNECT
                );
                let notice: SceneDisconnectRequest =
                    serde_json::from_slice(&message.bytes).expect("malformed disconnect notice");
                notice.scene_handle
            }
            _ => panic!("expected the scene disconnect notice"),
        }
    }
}

/// Handle assigned to a local route by [`FakeHost::accept_scene_connect`].
pub fn local_handle(result: &SceneConnectResult, name: &str) -> u16 {
    result
        .local_routes
        .iter()
        .find(|assignment| assignment.name == name)
        .unwrap_or_else(|| panic!("no handle assigned for route {name}"))
        .handle
}
