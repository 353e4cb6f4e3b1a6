//! The [waypoint_rt] package provides the client sdk for the waypoint
//! realtime backend.
//!
//! WARNING: This is a living document and will get updated as we keep
//! implementing more features towards the 0.1.0-alpha.0 release. Some
//! concepts here are not implemented yet, but are mentioned to guide the
//! development.
//!
//! The waypoint_rt package consists of the below sub-packages:
//!     * [waypoint_rt_proto]:
//!         - provides the wire contract: the packet header codec, the
//!           packet flags, and the send hints attached per packet.
//!     * [waypoint_rt_client]:
//!         - provides the client, the scenes multiplexed over one
//!           physical connection, the route/request dispatch, and the
//!           scoped dependency resolution.
//!
//! NOTE: [waypoint_rt] provides only the realtime client components. An
//! application will depend on additional services like authentication
//! and an authorization-provider. We recommend using managed services
//! from cloud-providers for additional services, though it is upto you
//! how you run these additional services.
//!
//! DEFINITIONS AND TERMINOLOGIES:
//!
//! * SCENE: A server-side session context a client attaches to; the
//!     unit of route and request scoping. A client multiplexes multiple
//!     scenes over a single physical connection.
//! * ROUTE: A named channel for one-way messages within a scene,
//!     identified on the wire by a numeric handle assigned by the host
//!     during the scene connection handshake.
//! * PROCEDURE: A route variant expecting a correlated reply,
//!     identified by a connection-scoped, reusable request id.
//! * RESOLVER SCOPE: A node of the hierarchical dependency registry
//!     giving each scene (and optionally each unit of work) isolated or
//!     shared component instances per a declared scope policy.

pub use waypoint_rt_client::*;
pub use waypoint_rt_proto as proto;
