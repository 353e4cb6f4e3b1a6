use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;

use waypoint_rt_proto::{
    helpers as packet_helpers, Priority, Reliability, ROUTE_HANDLE_SCENE_CONNECT,
    ROUTE_HANDLE_SCENE_DISCONNECT, SYSTEM_ROUTE_HANDLE_CEILING,
};

use crate::connection::Connection;
use crate::dispatcher::PacketDispatcher;
use crate::error::{RpcError, SceneError};
use crate::events::{EventDispatcher, Subscription};
use crate::request::{PendingRpc, RequestContext, RequestManager};
use crate::resolver::DependencyResolver;
use crate::routes::{
    Packet, RemoteRoute, RouteHandlerFn, RouteRegistration, RouteTable,
};
use crate::serializer::{JsonSerializer, Serializer};
use crate::system::{
    self, SceneConnectRequest, SceneConnectResult, SceneDisconnectRequest,
};

/// Scene handle value before the host assigned one.
const SCENE_HANDLE_UNASSIGNED: u16 = 0;

/// Observable scene connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SceneConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SceneConnectionState::Disconnected => "disconnected",
            SceneConnectionState::Connecting => "connecting",
            SceneConnectionState::Connected => "connected",
            SceneConnectionState::Disconnecting => "disconnecting",
        }
    }
}

type ConnectOutcome = Option<Result<(), SceneError>>;

enum LifecycleState {
    Disconnected,
    // the receiver lets concurrent connect calls observe the one
    // in-flight handshake instead of issuing duplicates.
    Connecting(watch::Receiver<ConnectOutcome>),
    Connected,
    Disconnecting,
}

impl LifecycleState {
    fn snapshot(&self) -> SceneConnectionState {
        match self {
            LifecycleState::Disconnected => SceneConnectionState::Disconnected,
            LifecycleState::Connecting(_) => SceneConnectionState::Connecting,
            LifecycleState::Connected => SceneConnectionState::Connected,
            LifecycleState::Disconnecting => SceneConnectionState::Disconnecting,
        }
    }
}

enum ConnectGate {
    AlreadyConnected,
    Wait(watch::Receiver<ConnectOutcome>),
    Run(watch::Sender<ConnectOutcome>),
}

// Resets an abandoned handshake (the connect future was dropped
// mid-flight) back to disconnected so the scene stays usable.
struct ConnectAbortGuard<'a> {
    core: &'a SceneCore,
    armed: bool,
}

impl Drop for ConnectAbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self
                .core
                .state
                .lock()
                .expect("scene_state_lock_poisoned");
            if matches!(&*state, LifecycleState::Connecting(_)) {
                *state = LifecycleState::Disconnected;
            }
        }
    }
}

/// Shared scene state: life cycle, route table, resolver scope, and the
/// connection level collaborators. Wrapped by [`Scene`] which adds the
/// typed serializer surface.
pub(crate) struct SceneCore {
    id: Arc<str>,
    handle: AtomicU16,
    state: Mutex<LifecycleState>,
    state_events: EventDispatcher<SceneConnectionState>,
    pub(crate) routes: RouteTable,
    resolver: DependencyResolver,
    connection: Arc<dyn Connection>,
    requests: Arc<RequestManager>,
    dispatcher: Arc<PacketDispatcher>,
    handshake_timeout: Duration,
}

impl SceneCore {
    pub(crate) fn new(
        id: Arc<str>,
        resolver: DependencyResolver,
        connection: Arc<dyn Connection>,
        requests: Arc<RequestManager>,
        dispatcher: Arc<PacketDispatcher>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            id,
            handle: AtomicU16::new(SCENE_HANDLE_UNASSIGNED),
            state: Mutex::new(LifecycleState::Disconnected),
            state_events: EventDispatcher::new(),
            routes: RouteTable::new(),
            resolver,
            connection,
            requests,
            dispatcher,
            handshake_timeout,
        }
    }

    pub(crate) fn id(&self) -> Arc<str> {
        self.id.clone()
    }

    fn state_snapshot(&self) -> SceneConnectionState {
        self.state.lock().expect("scene_state_lock_poisoned").snapshot()
    }

    fn set_state(&self, state: LifecycleState) -> SceneConnectionState {
        let snapshot = state.snapshot();
        *self.state.lock().expect("scene_state_lock_poisoned") = state;
        self.state_events.emit(&snapshot);
        snapshot
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<(), SceneError> {
        let state = self.state_snapshot();
        if state != SceneConnectionState::Connected {
            return Err(SceneError::InvalidState {
                operation,
                state: state.as_str(),
            });
        }
        Ok(())
    }

    pub(crate) async fn connect(self: &Arc<Self>, ticket: Option<String>) -> Result<(), SceneError> {
        let gate = {
            let mut state = self.state.lock().expect("scene_state_lock_poisoned");
            match &*state {
                LifecycleState::Connected => ConnectGate::AlreadyConnected,
                LifecycleState::Disconnecting => {
                    return Err(SceneError::InvalidState {
                        operation: "connect",
                        state: "disconnecting",
                    })
                }
                LifecycleState::Connecting(rx) => ConnectGate::Wait(rx.clone()),
                LifecycleState::Disconnected => {
                    let (tx, rx) = watch::channel(None);
                    *state = LifecycleState::Connecting(rx);
                    ConnectGate::Run(tx)
                }
            }
        };

        match gate {
            ConnectGate::AlreadyConnected => Ok(()),
            ConnectGate::Wait(mut rx) => loop {
                let outcome = rx.borrow().clone();
                if let Some(result) = outcome {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(SceneError::ConnectionLost);
                }
            },
            ConnectGate::Run(tx) => {
                let mut guard = ConnectAbortGuard {
                    core: self,
                    armed: true,
                };
                self.state_events.emit(&SceneConnectionState::Connecting);
                tracing::debug!(target: "client-event", "scene_connecting: {}", self.id);

                let result = self.run_handshake(ticket).await;
                guard.armed = false;
                match &result {
                    Ok(()) => {
                        self.set_state(LifecycleState::Connected);
                        tracing::info!(target: "client-event", "scene_connected: {}", self.id);
                    }
                    Err(e) => {
                        self.set_state(LifecycleState::Disconnected);
                        tracing::warn!(target: "client-event",
                            "scene_connect_failed {}: {}", self.id, e);
                    }
                }
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    async fn run_handshake(self: &Arc<Self>, ticket: Option<String>) -> Result<(), SceneError> {
        let request = SceneConnectRequest {
            scene_id: self.id.to_string(),
            ticket,
            routes: self
                .routes
                .local_descriptors()
                .into_iter()
                .map(|d| system::RouteDescriptor {
                    name: d.name.to_string(),
                    metadata: d.metadata,
                })
                .collect(),
        };
        let payload = system::encode(&request)?;

        let pending = self
            .requests
            .send_request(
                Arc::from("scene.connect"),
                ROUTE_HANDLE_SCENE_CONNECT,
                None,
                &payload,
                Reliability::ReliableOrdered,
                Priority::High,
            )
            .map_err(SceneError::Rpc)?;

        let reply = tokio::time::timeout(self.handshake_timeout, pending.await_single()).await;
        match reply {
            // the dropped pending handle cancels the request.
            Err(_) => Err(SceneError::Timeout),
            Ok(Err(RpcError::RemoteFault(message))) => Err(SceneError::ConnectionRefused(message)),
            Ok(Err(RpcError::ConnectionLost)) => Err(SceneError::ConnectionLost),
            Ok(Err(e)) => Err(SceneError::Rpc(e)),
            Ok(Ok(bytes)) => {
                let result: SceneConnectResult = system::decode(&bytes)?;
                self.apply_connect_result(result)
            }
        }
    }

    fn apply_connect_result(self: &Arc<Self>, result: SceneConnectResult) -> Result<(), SceneError> {
        if result.scene_handle == SCENE_HANDLE_UNASSIGNED {
            return Err(SceneError::Rpc(RpcError::Protocol(
                "host assigned the reserved scene handle".to_owned(),
            )));
        }

        self.handle.store(result.scene_handle, Ordering::Release);

        let mut assignments = Vec::new();
        for assignment in result.local_routes {
            if assignment.handle < SYSTEM_ROUTE_HANDLE_CEILING {
                return Err(SceneError::Rpc(RpcError::Protocol(format!(
                    "host assigned a reserved route handle: {}",
                    assignment.handle
                ))));
            }
            match self.routes.assign_local_handle(&assignment.name, assignment.handle) {
                Some(target) => assignments.push((assignment.handle, target)),
                None => {
                    tracing::warn!(target: "client-event",
                        "handle_assignment_for_undeclared_route: {}", assignment.name);
                }
            }
        }

        self.routes.set_remote_routes(
            result
                .remote_routes
                .into_iter()
                .map(|r| RemoteRoute {
                    name: Arc::from(r.name.as_str()),
                    handle: r.handle,
                    metadata: r.metadata,
                })
                .collect(),
        );

        self.dispatcher
            .bind_scene(self.clone(), result.scene_handle, assignments);
        Ok(())
    }

    pub(crate) async fn disconnect(self: &Arc<Self>) -> Result<(), SceneError> {
        {
            let mut state = self.state.lock().expect("scene_state_lock_poisoned");
            match &*state {
                LifecycleState::Connected => *state = LifecycleState::Disconnecting,
                other => {
                    return Err(SceneError::InvalidState {
                        operation: "disconnect",
                        state: other.snapshot().as_str(),
                    })
                }
            }
        }
        self.state_events.emit(&SceneConnectionState::Disconnecting);

        let scene_handle = self.handle.load(Ordering::Acquire);

        // notify the host, best effort and without waiting for an
        // acknowledgment; local teardown happens regardless.
        if self.connection.is_open() {
            let payload = system::encode(&SceneDisconnectRequest { scene_handle })
                .unwrap_or_default();
            let packet =
                packet_helpers::create_message_packet(ROUTE_HANDLE_SCENE_DISCONNECT, &payload);
            if let Err(e) =
                self.connection
                    .send_packet(packet, Reliability::ReliableOrdered, Priority::High)
            {
                tracing::debug!(target: "client-event",
                    "scene_disconnect_notice_send_failed {}: {}", self.id, e);
            }
        }

        self.dispatcher.unbind_scene(scene_handle);
        self.requests.fail_scene(scene_handle, RpcError::ConnectionLost);
        self.handle.store(SCENE_HANDLE_UNASSIGNED, Ordering::Release);
        self.routes.clear_remote_routes();
        self.set_state(LifecycleState::Disconnected);

        tracing::info!(target: "client-event", "scene_disconnected: {}", self.id);
        Ok(())
    }

    /// Teardown driven by the host or by connection loss. Route
    /// handlers stay registered; only the wire side is reset.
    pub(crate) fn force_disconnect(&self) {
        let transitioned = {
            let mut state = self.state.lock().expect("scene_state_lock_poisoned");
            match &*state {
                LifecycleState::Connected | LifecycleState::Disconnecting => {
                    *state = LifecycleState::Disconnected;
                    true
                }
                // a handshake in flight observes the failure through
                // its pending request and finishes the transition.
                _ => false,
            }
        };

        if transitioned {
            self.handle.store(SCENE_HANDLE_UNASSIGNED, Ordering::Release);
            self.routes.clear_remote_routes();
            self.state_events.emit(&SceneConnectionState::Disconnected);
            tracing::debug!(target: "client-event", "scene_forced_disconnected: {}", self.id);
        }
    }
}

/// A server-side session context this client attaches to: the unit of
/// route and request scoping. Obtained from the client, connected
/// explicitly, and the only object feature modules need.
pub struct Scene<S: Serializer = JsonSerializer> {
    core: Arc<SceneCore>,
    serializer: Arc<S>,
}

impl<S: Serializer> Clone for Scene<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            serializer: self.serializer.clone(),
        }
    }
}

impl<S: Serializer> Scene<S> {
    pub(crate) fn new(core: Arc<SceneCore>, serializer: Arc<S>) -> Self {
        Self { core, serializer }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn state(&self) -> SceneConnectionState {
        self.core.state_snapshot()
    }

    /// The scene scoped dependency resolver. Torn down when the scene
    /// object is disposed, not on disconnect.
    pub fn resolver(&self) -> &DependencyResolver {
        &self.core.resolver
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Subscribe to connection state transitions.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SceneConnectionState) + Send + Sync + 'static,
    {
        self.core.state_events.subscribe(callback)
    }

    /// Append a handler to a route's chain. New routes can only be
    /// declared while the scene is disconnected; their handles are
    /// assigned during the connection handshake.
    pub fn add_route<F, Fut>(&self, name: &str, handler: F) -> Result<RouteRegistration, SceneError>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_route_with_metadata(name, HashMap::new(), handler)
    }

    pub fn add_route_with_metadata<F, Fut>(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
        handler: F,
    ) -> Result<RouteRegistration, SceneError>
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let allow_declare =
            matches!(self.state(), SceneConnectionState::Disconnected);
        let wrapped: RouteHandlerFn = Arc::new(move |packet| Box::pin(handler(packet)));
        self.core.routes.add_route(name, metadata, wrapped, allow_declare)
    }

    /// Declare a procedure: a route answering every request with
    /// exactly one terminal reply. `ordered` serializes the route's
    /// requests through one worker so replies flush in arrival order.
    pub fn add_procedure<F, Fut>(
        &self,
        name: &str,
        ordered: bool,
        handler: F,
    ) -> Result<(), SceneError>
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Vec<u8>>, String>> + Send + 'static,
    {
        let state = self.state();
        if state != SceneConnectionState::Disconnected {
            return Err(SceneError::InvalidState {
                operation: "declare procedure",
                state: state.as_str(),
            });
        }

        self.core.routes.add_procedure(
            name,
            HashMap::new(),
            ordered,
            Arc::new(move |ctx| Box::pin(handler(ctx))),
        )
    }

    /// Connect to the scene on the host. Concurrent calls share the
    /// one in-flight handshake.
    pub async fn connect(&self) -> Result<(), SceneError> {
        self.core.connect(None).await
    }

    /// Connect, presenting an authorization ticket to the host.
    pub async fn connect_with_ticket(&self, ticket: &str) -> Result<(), SceneError> {
        self.core.connect(Some(ticket.to_owned())).await
    }

    pub async fn disconnect(&self) -> Result<(), SceneError> {
        self.core.disconnect().await
    }

    /// Send a one-way message on a remote route. Accepted only while
    /// connected; never queued.
    pub fn send(&self, route: &str, payload: &[u8]) -> Result<(), SceneError> {
        self.send_with(route, payload, Reliability::default(), Priority::default())
    }

    pub fn send_with(
        &self,
        route: &str,
        payload: &[u8],
        reliability: Reliability,
        priority: Priority,
    ) -> Result<(), SceneError> {
        self.core.ensure_connected("send")?;
        let remote = self
            .core
            .routes
            .remote_route(route)
            .ok_or_else(|| SceneError::UnknownRoute(route.to_owned()))?;

        let packet = packet_helpers::create_message_packet(remote.handle, payload);
        self.core
            .connection
            .send_packet(packet, reliability, priority)
            .map_err(SceneError::Transport)
    }

    /// Encode a value through the scene serializer and send it.
    pub fn send_as<T: Serialize>(&self, route: &str, value: &T) -> Result<(), SceneError> {
        let payload = self.serializer.encode(value)?;
        self.send(route, &payload)
    }

    /// Issue a request on a remote route. The returned handle resolves
    /// with the terminal reply; dropping it cancels the request.
    pub fn rpc(&self, route: &str, payload: &[u8]) -> Result<PendingRpc, SceneError> {
        self.rpc_with(route, payload, Reliability::default(), Priority::default())
    }

    pub fn rpc_with(
        &self,
        route: &str,
        payload: &[u8],
        reliability: Reliability,
        priority: Priority,
    ) -> Result<PendingRpc, SceneError> {
        self.core.ensure_connected("rpc")?;
        let remote = self
            .core
            .routes
            .remote_route(route)
            .ok_or_else(|| SceneError::UnknownRoute(route.to_owned()))?;
        let scene_handle = self.core.handle.load(Ordering::Acquire);

        self.core
            .requests
            .send_request(
                remote.name.clone(),
                remote.handle,
                Some(scene_handle),
                payload,
                reliability,
                priority,
            )
            .map_err(SceneError::Rpc)
    }

    /// Typed single-value request through the scene serializer.
    pub async fn rpc_as<Req, Res>(&self, route: &str, request: &Req) -> Result<Res, SceneError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let payload = self.serializer.encode(request)?;
        let bytes = self
            .rpc(route, &payload)?
            .await_single()
            .await
            .map_err(SceneError::Rpc)?;
        Ok(self.serializer.decode(&bytes)?)
    }
}
