#![deny(unreachable_pub)]
#![forbid(unsafe_code)]

//! Client sdk core for the waypoint realtime backend.
//!
//! A client owns one physical connection to the realtime host and
//! multiplexes any number of scenes over it. A scene is a server-side
//! session context: named routes carry one-way binary messages, and
//! procedures carry request/reply exchanges correlated by a
//! connection-scoped request id. Feature modules (chat, presence,
//! matchmaking, ...) are thin consumers of this substrate: they
//! register routes, send packets, and issue requests against a
//! [`Scene`] obtained from the [`Client`].
//!
//! The sdk consumes its collaborators as opaque boundaries:
//! * [`Connection`]: an established transport able to move framed
//!   packets and report closure. Connection establishment, framing and
//!   encryption live in the transport implementation.
//! * [`Serializer`]: the application payload codec. The sdk frames a
//!   five byte packet header itself and treats payloads as opaque
//!   bytes beyond that; [`JsonSerializer`] is the out-of-the-box codec.
//!
//! Each scene (and through child scopes, any unit of work inside one)
//! gets isolated, lifetime bound component instances from the
//! [`DependencyResolver`].

mod client;
mod connection;
mod dispatcher;
mod error;
mod events;
mod p2p;
mod request;
mod resolver;
mod routes;
mod scene;
mod serializer;

/// Session management messages spoken on the reserved route handles.
pub mod system;

pub use client::{Client, ClientConfig};
pub use connection::{CloseReason, Connection, TransportEvent};
pub use error::{CodecError, ResolverError, RpcError, SceneError, TransportError};
pub use events::Subscription;
pub use p2p::{
    ConnectionId, LocalP2pServers, P2pMediator, P2pServer, P2pServers, PeerProtocol,
};
pub use request::{PendingRpc, RequestContext};
pub use resolver::{DependencyResolver, DependencyScope};
pub use routes::{Packet, RouteRegistration};
pub use scene::{Scene, SceneConnectionState};
pub use serializer::{JsonSerializer, Serializer};

pub use waypoint_rt_proto::{Priority, Reliability};
