//! Session management protocol spoken on the reserved route handles:
//! scene connection handshake, scene disconnection, and the host
//! initiated scene-closed notice. These messages are framed by the sdk
//! itself and always encoded as JSON, independent of the application
//! serializer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A route declared by the client, advertised during the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Scene connection handshake request. Carries the scene id, an
/// optional authorization ticket, and the locally declared routes so
/// the host can assign their handles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneConnectRequest {
    pub scene_id: String,
    #[serde(default)]
    pub ticket: Option<String>,
    pub routes: Vec<RouteDescriptor>,
}

/// One host assigned route handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteAssignment {
    pub name: String,
    pub handle: u16,
}

/// A route living on the host side of the scene.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteRouteDescriptor {
    pub name: String,
    pub handle: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Successful scene connection handshake reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneConnectResult {
    pub scene_handle: u16,
    pub local_routes: Vec<RouteAssignment>,
    pub remote_routes: Vec<RemoteRouteDescriptor>,
}

/// Scene disconnection request, answered with an empty completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneDisconnectRequest {
    pub scene_handle: u16,
}

/// Host initiated notice that a scene was closed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneClosedNotice {
    pub scene_handle: u16,
    pub reason: String,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError(e.to_string()))
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
}
