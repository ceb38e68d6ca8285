//! Effect seam between the reactor and its environment.

use std::time::Duration;

use uuid::Uuid;

use crate::proto::{Endpoint, NodeEndpoints};

/// Opaque handle for one TCP session. Minted by the environment on each
/// connection attempt; a fresh id per attempt is what lets the reactor
/// discard packages from stale sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn get(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Capabilities the reactor may invoke. Synchronous and infallible from the
/// reactor's point of view; transport failures surface later as messages or
/// connection-loss notifications.
pub trait DriverEnv {
    /// Starts a TCP connection attempt; completion arrives later as
    /// `Msg::ConnectionEstablished` with the returned id.
    fn connect(&mut self, endpoint: &Endpoint) -> ConnectionId;

    /// Releases the session bound to `cid`. Called exactly once per id.
    fn close_connection(&mut self, cid: ConnectionId);

    /// Starts endpoint discovery; completion arrives later as
    /// `Msg::EstablishConnection`.
    fn discover(&mut self);

    fn generate_id(&mut self) -> Uuid;

    /// Monotonic time since driver start.
    fn elapsed(&self) -> Duration;

    /// Closes the current session and opens one to the redirection target.
    fn force_reconnect(&mut self, correlation: Uuid, node: &NodeEndpoints) -> ConnectionId;
}
