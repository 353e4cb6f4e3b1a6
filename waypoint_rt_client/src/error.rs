use thiserror::Error;

use waypoint_rt_proto::WireError;

/// Failure of the application serializer while encoding or decoding a
/// payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

/// Failure reported by the transport while queueing a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Configuration errors of the dependency resolver. Fatal to the
/// operation that triggered them, never to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("dependency already registered in this scope: {type_name}")]
    DuplicateRegistration { type_name: &'static str },
    #[error("no registration found for dependency: {type_name}")]
    UnresolvedDependency { type_name: &'static str },
    #[error("no ancestor scope tagged \"{name}\" for dependency: {type_name}")]
    UnknownScope {
        name: String,
        type_name: &'static str,
    },
}

/// Terminal outcomes of a pending request, surfaced to the caller that
/// issued it. Exactly one terminal outcome is observed per request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The host replied with a terminal error packet. The carried
    /// message is surfaced verbatim.
    #[error("remote fault: {0}")]
    RemoteFault(String),
    /// The connection dropped while the request was outstanding.
    /// Retry policy belongs to the caller.
    #[error("connection lost while request was outstanding")]
    ConnectionLost,
    /// The request was cancelled locally.
    #[error("request cancelled")]
    Cancelled,
    /// Out-of-protocol reply observed for this request.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Every request id is currently in flight.
    #[error("request id space exhausted")]
    TooManyPendingRequests,
    /// The request completed without carrying a value where the caller
    /// expected exactly one.
    #[error("request completed without a value")]
    NoValue,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Scene level failures surfaced synchronously to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// Operation attempted outside the required scene state.
    #[error("invalid scene state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// The host refused the scene connection handshake.
    #[error("scene connection refused: {0}")]
    ConnectionRefused(String),
    /// The scene connection handshake timed out.
    #[error("scene connection timed out")]
    Timeout,
    /// The connection dropped.
    #[error("connection lost")]
    ConnectionLost,
    /// No route with this name is known on the host side of the scene.
    #[error("unknown remote route: {0}")]
    UnknownRoute(String),
    /// A route with this name is already declared on the scene.
    #[error("route already declared: {0}")]
    DuplicateRoute(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<WireError> for SceneError {
    fn from(e: WireError) -> Self {
        SceneError::Transport(TransportError(e.to_string()))
    }
}
