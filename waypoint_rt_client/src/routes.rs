use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

use crate::dispatcher::{InboundJob, RouteDeliveryJob};
use crate::error::{CodecError, SceneError};
use crate::request::RequestContext;
use crate::serializer::Serializer;

/// Route handle value meaning "not assigned yet"; real handles are
/// assigned by the host during the scene connection handshake.
pub(crate) const ROUTE_HANDLE_UNASSIGNED: u16 = 0;

/// An inbound one-way message delivered to route handlers.
#[derive(Clone, Debug)]
pub struct Packet {
    pub scene_id: Arc<str>,
    pub route: Arc<str>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Decode the payload through the application serializer.
    pub fn read_as<T: DeserializeOwned, S: Serializer>(
        &self,
        serializer: &S,
    ) -> Result<T, CodecError> {
        serializer.decode(&self.payload)
    }
}

pub(crate) type RouteHandlerFn = Arc<dyn Fn(Packet) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ProcedureHandlerFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<Option<Vec<u8>>, String>> + Send + Sync>;

/// A locally declared one-way route: an ordered handler chain plus the
/// host assigned handle once the scene is connected.
pub(crate) struct LocalRoute {
    pub(crate) name: Arc<str>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) handle: AtomicU16,
    handlers: RwLock<Vec<(u64, RouteHandlerFn)>>,
    next_handler_id: AtomicU64,
    // lazily started delivery worker: one route's packets run their
    // chains in arrival order without blocking the packet pump.
    pub(crate) queue: OnceCell<flume::Sender<RouteDeliveryJob>>,
}

impl LocalRoute {
    fn new(name: Arc<str>, metadata: HashMap<String, String>) -> Self {
        Self {
            name,
            metadata,
            handle: AtomicU16::new(ROUTE_HANDLE_UNASSIGNED),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            queue: OnceCell::new(),
        }
    }

    fn add_handler(self: &Arc<Self>, handler: RouteHandlerFn) -> RouteRegistration {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .expect("route_handlers_lock_poisoned")
            .push((id, handler));

        RouteRegistration {
            id,
            route: Arc::downgrade(self),
        }
    }

    /// Snapshot of the chain in registration order. Dispatch iterates
    /// the snapshot, so concurrent add/remove cannot corrupt an
    /// in-flight packet.
    pub(crate) fn handler_snapshot(&self) -> Vec<RouteHandlerFn> {
        self.handlers
            .read()
            .expect("route_handlers_lock_poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }

    fn remove_handler(&self, id: u64) {
        self.handlers
            .write()
            .expect("route_handlers_lock_poisoned")
            .retain(|(handler_id, _)| *handler_id != id);
    }
}

/// A locally declared procedure: a route expecting exactly one reply
/// per request. Ordered procedures flush replies in packet arrival
/// order through a single per-route worker queue.
pub(crate) struct ProcedureRoute {
    pub(crate) name: Arc<str>,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) ordered: bool,
    pub(crate) handle: AtomicU16,
    pub(crate) handler: ProcedureHandlerFn,
    // lazily started worker feed, ordered procedures only.
    pub(crate) queue: OnceCell<flume::Sender<InboundJob>>,
}

/// A route that exists on the host side of the scene; sends target its
/// handle.
#[derive(Clone, Debug)]
pub(crate) struct RemoteRoute {
    pub(crate) name: Arc<str>,
    pub(crate) handle: u16,
    pub(crate) metadata: HashMap<String, String>,
}

/// Handle to one handler registration. Dropping it (or calling
/// [`RouteRegistration::cancel`]) removes exactly that handler, never
/// the route.
pub struct RouteRegistration {
    id: u64,
    route: Weak<LocalRoute>,
}

impl RouteRegistration {
    pub fn cancel(self) {
        // Drop does the removal.
    }
}

impl Drop for RouteRegistration {
    fn drop(&mut self) {
        if let Some(route) = self.route.upgrade() {
            route.remove_handler(self.id);
        }
    }
}

/// Name/metadata pair advertised during the scene connection handshake.
pub(crate) struct LocalRouteDescriptor {
    pub(crate) name: Arc<str>,
    pub(crate) metadata: HashMap<String, String>,
}

/// The target a host assigned handle binds to.
pub(crate) enum BindTarget {
    Message(Arc<LocalRoute>),
    Procedure(Arc<ProcedureRoute>),
}

/// Per-scene mapping from route name to handler chain (local side) and
/// from route name to wire handle (remote side). A name identifies
/// either a message route or a procedure, never both.
pub(crate) struct RouteTable {
    locals: RwLock<HashMap<Arc<str>, Arc<LocalRoute>>>,
    procedures: RwLock<HashMap<Arc<str>, Arc<ProcedureRoute>>>,
    remotes: RwLock<HashMap<Arc<str>, RemoteRoute>>,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self {
            locals: RwLock::new(HashMap::new()),
            procedures: RwLock::new(HashMap::new()),
            remotes: RwLock::new(HashMap::new()),
        }
    }

    /// Append a handler to the chain for `name`, declaring the route on
    /// first use. All handlers of a route run, in registration order,
    /// for every inbound packet on that route.
    pub(crate) fn add_route(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
        handler: RouteHandlerFn,
        allow_declare: bool,
    ) -> Result<RouteRegistration, SceneError> {
        if self
            .procedures
            .read()
            .expect("route_table_lock_poisoned")
            .contains_key(name)
        {
            return Err(SceneError::DuplicateRoute(name.to_owned()));
        }

        let mut locals = self.locals.write().expect("route_table_lock_poisoned");
        if let Some(route) = locals.get(name) {
            return Ok(route.add_handler(handler));
        }

        if !allow_declare {
            return Err(SceneError::InvalidState {
                operation: "declare route",
                state: "connected",
            });
        }

        let name: Arc<str> = Arc::from(name);
        let route = Arc::new(LocalRoute::new(name.clone(), metadata));
        let registration = route.add_handler(handler);
        locals.insert(name, route);
        Ok(registration)
    }

    /// Declare a procedure for `name`. A procedure owns its name
    /// exclusively; re-declaring is a configuration error.
    pub(crate) fn add_procedure(
        &self,
        name: &str,
        metadata: HashMap<String, String>,
        ordered: bool,
        handler: ProcedureHandlerFn,
    ) -> Result<(), SceneError> {
        if self
            .locals
            .read()
            .expect("route_table_lock_poisoned")
            .contains_key(name)
        {
            return Err(SceneError::DuplicateRoute(name.to_owned()));
        }

        let mut procedures = self.procedures.write().expect("route_table_lock_poisoned");
        if procedures.contains_key(name) {
            return Err(SceneError::DuplicateRoute(name.to_owned()));
        }

        let name: Arc<str> = Arc::from(name);
        procedures.insert(
            name.clone(),
            Arc::new(ProcedureRoute {
                name,
                metadata,
                ordered,
                handle: AtomicU16::new(ROUTE_HANDLE_UNASSIGNED),
                handler,
                queue: OnceCell::new(),
            }),
        );
        Ok(())
    }

    /// Every locally declared route and procedure, for the handshake.
    pub(crate) fn local_descriptors(&self) -> Vec<LocalRouteDescriptor> {
        let locals = self.locals.read().expect("route_table_lock_poisoned");
        let procedures = self.procedures.read().expect("route_table_lock_poisoned");

        locals
            .values()
            .map(|r| LocalRouteDescriptor {
                name: r.name.clone(),
                metadata: r.metadata.clone(),
            })
            .chain(procedures.values().map(|p| LocalRouteDescriptor {
                name: p.name.clone(),
                metadata: p.metadata.clone(),
            }))
            .collect()
    }

    /// Record a host assigned handle for a local route, returning the
    /// bind target for the dispatcher.
    pub(crate) fn assign_local_handle(&self, name: &str, handle: u16) -> Option<BindTarget> {
        if let Some(route) = self
            .locals
            .read()
            .expect("route_table_lock_poisoned")
            .get(name)
        {
            route.handle.store(handle, Ordering::Release);
            return Some(BindTarget::Message(route.clone()));
        }

        if let Some(procedure) = self
            .procedures
            .read()
            .expect("route_table_lock_poisoned")
            .get(name)
        {
            procedure.handle.store(handle, Ordering::Release);
            return Some(BindTarget::Procedure(procedure.clone()));
        }

        None
    }

    pub(crate) fn set_remote_routes(&self, routes: Vec<RemoteRoute>) {
        let mut remotes = self.remotes.write().expect("route_table_lock_poisoned");
        remotes.clear();
        for route in routes {
            remotes.insert(route.name.clone(), route);
        }
    }

    pub(crate) fn remote_route(&self, name: &str) -> Option<RemoteRoute> {
        self.remotes
            .read()
            .expect("route_table_lock_poisoned")
            .get(name)
            .cloned()
    }

    pub(crate) fn clear_remote_routes(&self) {
        self.remotes
            .write()
            .expect("route_table_lock_poisoned")
            .clear();
    }
}
