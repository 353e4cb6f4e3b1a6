use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{CloseReason, Connection, TransportEvent};
use crate::dispatcher::PacketDispatcher;
use crate::request::RequestManager;
use crate::resolver::DependencyResolver;
use crate::scene::{Scene, SceneCore};
use crate::serializer::{JsonSerializer, Serializer};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration settings for the realtime client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Application identifier presented to the host.
    pub application: String,
    /// Upper bound on a scene connection handshake. Requests issued by
    /// application code carry no default timeout; callers race their
    /// own timer against the pending request.
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn new(application: &str) -> Self {
        Self {
            application: application.to_owned(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

struct ClientShared {
    config: ClientConfig,
    session_id: Uuid,
    connection: Arc<dyn Connection>,
    requests: Arc<RequestManager>,
    dispatcher: Arc<PacketDispatcher>,
    resolver: DependencyResolver,
    scenes: Mutex<HashMap<Arc<str>, Arc<SceneCore>>>,
    _pump: JoinHandle<()>,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        if self.connection.is_open() {
            self.connection.close(CloseReason::Local);
        }
    }
}

/// The realtime client: owns one physical connection and the scenes
/// multiplexed over it. Must be created inside a tokio runtime; the
/// inbound packet pump runs as a task until the connection closes.
pub struct Client<S: Serializer = JsonSerializer> {
    shared: Arc<ClientShared>,
    serializer: Arc<S>,
}

impl<S: Serializer> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            serializer: self.serializer.clone(),
        }
    }
}

impl Client<JsonSerializer> {
    /// Client over an established connection, with the default JSON
    /// payload codec.
    pub fn new(config: ClientConfig, connection: Arc<dyn Connection>) -> Self {
        Self::with_serializer(config, connection, JsonSerializer)
    }
}

impl<S: Serializer> Client<S> {
    /// Client over an established connection with an application
    /// supplied payload codec.
    pub fn with_serializer(
        config: ClientConfig,
        connection: Arc<dyn Connection>,
        serializer: S,
    ) -> Self {
        let requests = Arc::new(RequestManager::new(connection.clone()));
        let dispatcher = Arc::new(PacketDispatcher::new(connection.clone(), requests.clone()));

        // the pump: single ordered packet stream in, demultiplexed and
        // handed off without ever blocking on handler work.
        let events = connection.events();
        let pump_dispatcher = dispatcher.clone();
        let pump = tokio::spawn(async move {
            loop {
                match events.recv_async().await {
                    Ok(TransportEvent::Packet(bytes)) => pump_dispatcher.dispatch(bytes),
                    Ok(TransportEvent::Closed(reason)) => {
                        pump_dispatcher.handle_connection_closed(&reason);
                        break;
                    }
                    Err(_) => {
                        pump_dispatcher.handle_connection_closed(&CloseReason::Error(
                            "transport event stream dropped".to_owned(),
                        ));
                        break;
                    }
                }
            }
        });

        let session_id = Uuid::new_v4();
        tracing::info!(target: "client-event",
            "client_created_session {} application {}", session_id, config.application);

        Self {
            shared: Arc::new(ClientShared {
                config,
                session_id,
                connection,
                requests,
                dispatcher,
                resolver: DependencyResolver::new(),
                scenes: Mutex::new(HashMap::new()),
                _pump: pump,
            }),
            serializer: Arc::new(serializer),
        }
    }

    /// Identifier of this client session, unique per client instance.
    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// The root dependency resolver; each scene resolves through its
    /// own child scope delegating here.
    pub fn resolver(&self) -> &DependencyResolver {
        &self.shared.resolver
    }

    /// Whether the underlying connection still accepts packets.
    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_open()
    }

    /// Number of requests currently awaiting a terminal reply, for
    /// diagnostics.
    pub fn pending_request_count(&self) -> usize {
        self.shared.requests.outstanding()
    }

    /// The scene object for `id`, created disconnected on first use.
    /// Subsequent calls return the same scene.
    pub fn scene(&self, id: &str) -> Scene<S> {
        let mut scenes = self
            .shared
            .scenes
            .lock()
            .expect("client_scenes_lock_poisoned");

        if let Some(core) = scenes.get(id) {
            return Scene::new(core.clone(), self.serializer.clone());
        }

        let scene_id: Arc<str> = Arc::from(id);
        let core = Arc::new(SceneCore::new(
            scene_id.clone(),
            self.shared.resolver.create_child_scope(Some("scene")),
            self.shared.connection.clone(),
            self.shared.requests.clone(),
            self.shared.dispatcher.clone(),
            self.shared.config.handshake_timeout,
        ));
        scenes.insert(scene_id, core.clone());

        tracing::debug!(target: "client-event", "scene_created: {}", id);
        Scene::new(core, self.serializer.clone())
    }

    /// Close the connection. Every scene observes the closure through
    /// the transport event stream; outstanding requests fail.
    pub fn close(&self) {
        if self.shared.connection.is_open() {
            self.shared.connection.close(CloseReason::Local);
        }
        self.shared
            .scenes
            .lock()
            .expect("client_scenes_lock_poisoned")
            .clear();
    }
}
