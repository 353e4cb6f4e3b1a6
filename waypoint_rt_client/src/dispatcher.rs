use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::AbortHandle;

use waypoint_rt_proto::{
    helpers::{
        self as packet_helpers, PacketPayloadMessage, PacketPayloadRequest, PacketView, ReplyKind,
    },
    Priority, Reliability, ROUTE_HANDLE_SCENE_CLOSED, SYSTEM_ROUTE_HANDLE_CEILING,
};

use crate::connection::{CloseReason, Connection};
use crate::error::RpcError;
use crate::request::{RequestContext, RequestManager};
use crate::routes::{BindTarget, Packet, ProcedureHandlerFn};
use crate::scene::SceneCore;
use crate::system::{self, SceneClosedNotice};

/// A host assigned route handle bound to a scene's local route.
struct RouteBinding {
    scene_handle: u16,
    scene: Arc<SceneCore>,
    target: BindTarget,
}

/// State of one inbound request while its procedure handler runs.
struct InboundEntry {
    cancelled: Arc<AtomicBool>,
    // unordered procedures only; ordered jobs drain through the route
    // worker and observe the cancellation flag instead.
    abort: Mutex<Option<AbortHandle>>,
}

/// One queued unit of work for a procedure route.
pub(crate) struct InboundJob {
    dispatcher: Arc<PacketDispatcher>,
    handler: ProcedureHandlerFn,
    context: RequestContext,
    responder: Responder,
    request_id: u16,
    cancelled: Arc<AtomicBool>,
    route_name: Arc<str>,
    scene_id: Arc<str>,
}

impl InboundJob {
    async fn run(self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.dispatcher.inbound.remove(&self.request_id);
            return;
        }

        let handler = self.handler;
        let result = AssertUnwindSafe(handler(self.context)).catch_unwind().await;

        self.dispatcher.inbound.remove(&self.request_id);
        if self.cancelled.load(Ordering::Acquire) {
            // the host gave up on this request, no reply expected.
            return;
        }

        match result {
            Ok(Ok(value)) => self.responder.complete(value),
            Ok(Err(fault)) => self.responder.error(&fault),
            Err(_) => {
                tracing::error!(target: "client-event",
                    "procedure_handler_panicked_route {} scene {}",
                    self.route_name, self.scene_id);
                self.responder.error("internal handler failure");
            }
        }
    }
}

/// One packet queued for a route's delivery worker, with the handler
/// chain snapshotted at dispatch time.
pub(crate) struct RouteDeliveryJob {
    handlers: Vec<crate::routes::RouteHandlerFn>,
    packet: Packet,
}

impl RouteDeliveryJob {
    async fn run(self) {
        for handler in &self.handlers {
            if AssertUnwindSafe(handler(self.packet.clone()))
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!(target: "client-event",
                    "route_handler_panicked_route {} scene {}",
                    self.packet.route, self.packet.scene_id);
            }
        }
    }
}

/// Sends the reply packets for one inbound request.
struct Responder {
    connection: Arc<dyn Connection>,
    route_handle: u16,
    request_id: u16,
}

impl Responder {
    fn complete(&self, value: Option<Vec<u8>>) {
        let payload = value.unwrap_or_default();
        let packet = packet_helpers::create_reply_packet(
            ReplyKind::Complete,
            self.route_handle,
            self.request_id,
            &payload,
        );
        if let Err(e) =
            self.connection
                .send_packet(packet, Reliability::ReliableOrdered, Priority::Medium)
        {
            tracing::error!(target: "client-event", "reply_send_failed_req_id {}: {}", self.request_id, e);
        }
    }

    fn error(&self, message: &str) {
        let packet = packet_helpers::create_reply_packet(
            ReplyKind::Error,
            self.route_handle,
            self.request_id,
            message.as_bytes(),
        );
        if let Err(e) =
            self.connection
                .send_packet(packet, Reliability::ReliableOrdered, Priority::Medium)
        {
            tracing::error!(target: "client-event", "reply_send_failed_req_id {}: {}", self.request_id, e);
        }
    }
}

/// Demultiplexes the inbound packet stream of one physical connection:
/// replies to the request manager, requests to the owning procedure,
/// route messages to the owning handler chain, reserved handles to the
/// session management protocol. Unroutable packets are dropped and
/// logged, never fatal.
pub(crate) struct PacketDispatcher {
    connection: Arc<dyn Connection>,
    requests: Arc<RequestManager>,
    bindings: DashMap<u16, RouteBinding>,
    scenes_by_handle: DashMap<u16, Arc<SceneCore>>,
    inbound: DashMap<u16, InboundEntry>,
    closed: AtomicBool,
}

impl PacketDispatcher {
    pub(crate) fn new(connection: Arc<dyn Connection>, requests: Arc<RequestManager>) -> Self {
        Self {
            connection,
            requests,
            bindings: DashMap::new(),
            scenes_by_handle: DashMap::new(),
            inbound: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind the handles assigned by a scene connection handshake.
    pub(crate) fn bind_scene(
        &self,
        scene: Arc<SceneCore>,
        scene_handle: u16,
        assignments: Vec<(u16, BindTarget)>,
    ) {
        for (handle, target) in assignments {
            self.bindings.insert(
                handle,
                RouteBinding {
                    scene_handle,
                    scene: scene.clone(),
                    target,
                },
            );
        }
        self.scenes_by_handle.insert(scene_handle, scene);
    }

    /// Drop every binding of a scene, e.g. on disconnect.
    pub(crate) fn unbind_scene(&self, scene_handle: u16) {
        self.bindings
            .retain(|_, binding| binding.scene_handle != scene_handle);
        self.scenes_by_handle.remove(&scene_handle);
    }

    /// Process one inbound packet. Never blocks: handler work is spawned
    /// or queued so the pump stays free for unrelated packets.
    pub(crate) fn dispatch(self: &Arc<Self>, bytes: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(target: "client-event", "packet_after_close_dropped");
            return;
        }

        match packet_helpers::process_packet(bytes) {
            PacketView::Undefined => {
                tracing::warn!(target: "client-event", "undefined_packet_dropped");
            }
            PacketView::Reply(reply) => self.requests.handle_reply(reply),
            PacketView::Cancel(cancel) => self.cancel_inbound_request(cancel.request_id),
            PacketView::Request(request) => self.dispatch_request(request),
            PacketView::Message(message) => {
                if message.route_handle < SYSTEM_ROUTE_HANDLE_CEILING {
                    self.dispatch_system_message(message);
                } else {
                    self.dispatch_route_message(message);
                }
            }
        }
    }

    /// Fail everything tied to the connection. Packets arriving after
    /// this are dropped.
    pub(crate) fn handle_connection_closed(&self, reason: &CloseReason) {
        tracing::debug!(target: "client-event", "connection_closed: {:?}", reason);

        self.closed.store(true, Ordering::Release);
        self.requests.fail_all(RpcError::ConnectionLost);

        let scene_handles: Vec<u16> = self.scenes_by_handle.iter().map(|s| *s.key()).collect();
        for handle in scene_handles {
            if let Some((_, scene)) = self.scenes_by_handle.remove(&handle) {
                scene.force_disconnect();
            }
        }
        self.bindings.clear();
        self.inbound.clear();
    }

    #[inline(always)]
    fn dispatch_route_message(self: &Arc<Self>, message: PacketPayloadMessage) {
        let Some(binding) = self.bindings.get(&message.route_handle) else {
            tracing::warn!(target: "client-event",
                "unroutable_packet_dropped_handle: {}", message.route_handle);
            return;
        };

        let route = match &binding.target {
            BindTarget::Message(route) => route.clone(),
            BindTarget::Procedure(route) => {
                tracing::warn!(target: "client-event",
                    "plain_message_on_procedure_route_dropped: {}", route.name);
                return;
            }
        };
        let scene_id = binding.scene.id();
        drop(binding);

        let job = RouteDeliveryJob {
            // chain snapshot at dispatch time: handlers removed later
            // still run for this packet, handlers removed before do not.
            handlers: route.handler_snapshot(),
            packet: Packet {
                scene_id,
                route: route.name.clone(),
                payload: message.bytes,
            },
        };

        // single delivery worker per route: invocation order equals
        // packet arrival order, without blocking the pump.
        let queue = route.queue.get_or_init(|| {
            let (tx, rx) = flume::unbounded::<RouteDeliveryJob>();
            tokio::spawn(async move {
                while let Ok(job) = rx.recv_async().await {
                    job.run().await;
                }
            });
            tx
        });
        if queue.send(job).is_err() {
            tracing::error!(target: "client-event",
                "route_delivery_worker_gone: {}", route.name);
        }
    }

    #[inline(always)]
    fn dispatch_request(self: &Arc<Self>, request: PacketPayloadRequest) {
        let Some(binding) = self.bindings.get(&request.route_handle) else {
            tracing::warn!(target: "client-event",
                "request_for_unknown_route_dropped_handle: {}", request.route_handle);
            return;
        };

        let route = match &binding.target {
            BindTarget::Procedure(route) => route.clone(),
            BindTarget::Message(route) => {
                tracing::warn!(target: "client-event",
                    "request_on_plain_route_dropped: {}", route.name);
                return;
            }
        };
        let scene_id = binding.scene.id();
        drop(binding);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inbound.insert(
            request.request_id,
            InboundEntry {
                cancelled: cancelled.clone(),
                abort: Mutex::new(None),
            },
        );

        let context = RequestContext::new(
            scene_id.clone(),
            route.name.clone(),
            request.route_handle,
            request.request_id,
            request.bytes,
            self.connection.clone(),
            cancelled.clone(),
        );
        let job = InboundJob {
            dispatcher: self.clone(),
            handler: route.handler.clone(),
            context,
            responder: Responder {
                connection: self.connection.clone(),
                route_handle: request.route_handle,
                request_id: request.request_id,
            },
            request_id: request.request_id,
            cancelled,
            route_name: route.name.clone(),
            scene_id,
        };

        if route.ordered {
            // single worker per ordered route: replies flush in packet
            // arrival order.
            let queue = route.queue.get_or_init(|| {
                let (tx, rx) = flume::unbounded::<InboundJob>();
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv_async().await {
                        job.run().await;
                    }
                });
                tx
            });
            if queue.send(job).is_err() {
                tracing::error!(target: "client-event",
                    "ordered_procedure_worker_gone: {}", route.name);
            }
        } else {
            let request_id = request.request_id;
            let handle = tokio::spawn(job.run()).abort_handle();
            if let Some(entry) = self.inbound.get(&request_id) {
                *entry.abort.lock().expect("inbound_abort_lock_poisoned") = Some(handle);
            }
        }
    }

    #[inline(always)]
    fn cancel_inbound_request(&self, request_id: u16) {
        if let Some((_, entry)) = self.inbound.remove(&request_id) {
            entry.cancelled.store(true, Ordering::Release);
            if let Some(abort) = entry
                .abort
                .lock()
                .expect("inbound_abort_lock_poisoned")
                .take()
            {
                abort.abort();
            }
            tracing::trace!(target: "client-event", "inbound_request_cancelled: {}", request_id);
        } else {
            tracing::debug!(target: "client-event",
                "cancel_for_unknown_inbound_request: {}", request_id);
        }
    }

    #[inline(always)]
    fn dispatch_system_message(&self, message: PacketPayloadMessage) {
        match message.route_handle {
            ROUTE_HANDLE_SCENE_CLOSED => match system::decode::<SceneClosedNotice>(&message.bytes)
            {
                Ok(notice) => self.handle_scene_closed(notice),
                Err(e) => {
                    tracing::warn!(target: "client-event", "scene_closed_notice_decode_failed: {}", e);
                }
            },
            other => {
                tracing::warn!(target: "client-event",
                    "unroutable_system_packet_dropped_handle: {}", other);
            }
        }
    }

    fn handle_scene_closed(&self, notice: SceneClosedNotice) {
        tracing::debug!(target: "client-event",
            "scene_closed_by_host_handle {}: {}", notice.scene_handle, notice.reason);

        if let Some((_, scene)) = self.scenes_by_handle.remove(&notice.scene_handle) {
            self.bindings
                .retain(|_, binding| binding.scene_handle != notice.scene_handle);
            self.requests
                .fail_scene(notice.scene_handle, RpcError::ConnectionLost);
            scene.force_disconnect();
        }
    }
}
