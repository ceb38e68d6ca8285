//! Driver state machine data.

use std::time::Duration;

use uuid::Uuid;

use crate::proto::Package;

use super::env::ConnectionId;
use super::registry::ExchangeRegistry;

/// Which handshake package is currently outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeKind {
    Authentication,
    Identification,
}

#[derive(Debug)]
pub enum ConnectingStage {
    /// Discovery not yet started.
    Reconnecting,
    /// Discovery in flight.
    EndpointDiscovery,
    /// TCP socket opening; the id the environment minted for the attempt.
    ConnectionEstablishing(ConnectionId),
}

#[derive(Debug)]
pub enum ConnectedStage {
    /// Handshake in progress; user submissions keep buffering.
    Confirming {
        pending: Vec<Package>,
        started: Duration,
        correlation: Uuid,
        which: HandshakeKind,
    },
    /// Steady state; every outstanding wire request is registered.
    Active(ExchangeRegistry),
}

#[derive(Debug)]
pub enum DriverState {
    Init,
    Awaiting {
        pending: Vec<Package>,
        connecting: ConnectingStage,
    },
    Connected {
        cid: ConnectionId,
        stage: ConnectedStage,
    },
    Closed,
}

/// Externally observable coarse phase, for logging and the runtime's
/// handshake-timeout bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverPhase {
    Init,
    Awaiting,
    Confirming,
    Active,
    Closed,
}

impl DriverState {
    pub fn phase(&self) -> DriverPhase {
        match self {
            DriverState::Init => DriverPhase::Init,
            DriverState::Awaiting { .. } => DriverPhase::Awaiting,
            DriverState::Connected { stage, .. } => match stage {
                ConnectedStage::Confirming { .. } => DriverPhase::Confirming,
                ConnectedStage::Active(_) => DriverPhase::Active,
            },
            DriverState::Closed => DriverPhase::Closed,
        }
    }

    /// Id of the live TCP session, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            DriverState::Connected { cid, .. } => Some(*cid),
            DriverState::Init | DriverState::Awaiting { .. } | DriverState::Closed => None,
        }
    }

    /// Instant the outstanding handshake package was sent, if one is.
    pub fn handshake_started(&self) -> Option<Duration> {
        match self {
            DriverState::Connected {
                stage: ConnectedStage::Confirming { started, .. },
                ..
            } => Some(*started),
            _ => None,
        }
    }
}
