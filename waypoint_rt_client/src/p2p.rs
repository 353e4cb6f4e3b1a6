//! Peer-to-peer capability surface: local listen target bookkeeping and
//! the mediation contract for opening a direct connection to a peer's
//! server. The candidate negotiation algorithm itself is a pluggable
//! transport behavior; the sdk only orchestrates which scene a
//! resulting connection attaches to.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::TransportError;

/// Transport protocol of a peer listen target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerProtocol {
    Tcp,
    Udp,
}

/// Identifier of one physical peer connection bound to a local server.
pub type ConnectionId = Uuid;

/// A locally registered listen target peers can be mediated towards.
#[derive(Clone, Debug)]
pub struct P2pServer {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: PeerProtocol,
    pub bound_connections: HashSet<ConnectionId>,
}

/// Registry of local peer listen targets: registered when a listener
/// starts, removed when it stops.
pub trait P2pServers: Send + Sync {
    fn register_local_server(
        &self,
        server_id: &str,
        host: &str,
        port: u16,
        protocol: PeerProtocol,
    ) -> Result<(), TransportError>;

    fn remove_local_server(&self, server_id: &str) -> Result<(), TransportError>;

    /// Record a peer connection attached to a local server.
    fn bind_connection(&self, server_id: &str, connection: ConnectionId)
        -> Result<(), TransportError>;

    fn unbind_connection(&self, server_id: &str, connection: ConnectionId);

    fn servers(&self) -> Vec<P2pServer>;
}

/// Negotiates a direct connection to a peer's registered server, using
/// a mediation token minted by the host. Implemented by the transport
/// layer.
pub trait P2pMediator: Send + Sync {
    fn open_p2p_connection(
        &self,
        token: &str,
        server_id: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn Connection>, TransportError>>;
}

/// In-process [`P2pServers`] registry.
pub struct LocalP2pServers {
    servers: DashMap<String, P2pServer>,
}

impl Default for LocalP2pServers {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalP2pServers {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
        }
    }
}

impl P2pServers for LocalP2pServers {
    fn register_local_server(
        &self,
        server_id: &str,
        host: &str,
        port: u16,
        protocol: PeerProtocol,
    ) -> Result<(), TransportError> {
        if self.servers.contains_key(server_id) {
            return Err(TransportError(format!(
                "p2p server already registered: {server_id}"
            )));
        }

        self.servers.insert(
            server_id.to_owned(),
            P2pServer {
                server_id: server_id.to_owned(),
                host: host.to_owned(),
                port,
                protocol,
                bound_connections: HashSet::new(),
            },
        );

        tracing::debug!(target: "client-event", "p2p_server_registered: {}", server_id);
        Ok(())
    }

    fn remove_local_server(&self, server_id: &str) -> Result<(), TransportError> {
        match self.servers.remove(server_id) {
            Some(_) => {
                tracing::debug!(target: "client-event", "p2p_server_removed: {}", server_id);
                Ok(())
            }
            None => Err(TransportError(format!(
                "p2p server not registered: {server_id}"
            ))),
        }
    }

    fn bind_connection(
        &self,
        server_id: &str,
        connection: ConnectionId,
    ) -> Result<(), TransportError> {
        match self.servers.get_mut(server_id) {
            Some(mut server) => {
                server.bound_connections.insert(connection);
                Ok(())
            }
            None => Err(TransportError(format!(
                "p2p server not registered: {server_id}"
            ))),
        }
    }

    fn unbind_connection(&self, server_id: &str, connection: ConnectionId) {
        if let Some(mut server) = self.servers.get_mut(server_id) {
            server.bound_connections.remove(&connection);
        }
    }

    fn servers(&self) -> Vec<P2pServer> {
        self.servers.iter().map(|s| s.value().clone()).collect()
    }
}
