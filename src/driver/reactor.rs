//! Connection driver reactor.
//!
//! The reactor consumes one [`Msg`] at a time, mutates [`DriverState`] and
//! returns the [`Transmission`]s the caller must deliver, invoking effects
//! through [`DriverEnv`]. It never suspends and performs no I/O of its own,
//! which is what keeps every transition testable over a scripted input
//! trace.

use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::proto::{
    Command, Credentials, Endpoint, NotHandledPayload, NotHandledReason, Package,
    PayloadEncodeError, command, decode_not_handled, decode_reason_text, payloads,
};
use crate::settings::{Retry, Settings};

use super::env::{ConnectionId, DriverEnv};
use super::registry::{Exchange, ExchangeRegistry};
use super::state::{ConnectedStage, ConnectingStage, DriverPhase, DriverState, HandshakeKind};

/// Input message set.
#[derive(Clone, Debug)]
pub enum Msg {
    SystemInit,
    EstablishConnection(Endpoint),
    ConnectionEstablished(ConnectionId),
    PackageArrived(ConnectionId, Package),
    SendPackage(Package),
}

/// Output alphabet. `Send` is socket-bound; `Recv` completes an exchange
/// for the awaiting caller; `Ignored` is informational.
#[derive(Clone, Debug, PartialEq)]
pub enum Transmission {
    Send(Package),
    Ignored(Package),
    Recv(Result<Package, BadNews>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationError {
    ServerError(String),
    NotAuthenticated,
    Aborted,
}

/// A failed exchange, addressed by its correlation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BadNews {
    pub correlation: Uuid,
    pub error: OperationError,
}

impl BadNews {
    pub fn new(correlation: Uuid, error: OperationError) -> Self {
        Self { correlation, error }
    }

    fn aborted(correlation: Uuid) -> Self {
        Self::new(correlation, OperationError::Aborted)
    }
}

fn abort(correlation: Uuid) -> Transmission {
    Transmission::Recv(Err(BadNews::aborted(correlation)))
}

pub struct Driver {
    credentials: Option<Credentials>,
    connection_name: String,
    identify_payload: Bytes,
    retry: Retry,
    state: DriverState,
}

impl Driver {
    pub fn new(settings: &Settings) -> Result<Self, PayloadEncodeError> {
        let connection_name = settings
            .connection
            .default_connection_name
            .clone()
            .unwrap_or_else(|| format!("ES-{}", Uuid::new_v4()));
        let identify_payload = Bytes::from(payloads::encode_identify_client(
            command::CLIENT_VERSION,
            &connection_name,
        )?);
        Ok(Self {
            credentials: settings
                .connection
                .default_user_credentials
                .as_ref()
                .map(|creds| creds.to_credentials()),
            connection_name,
            identify_payload,
            retry: settings.operation.retry,
            state: DriverState::Init,
        })
    }

    pub fn phase(&self) -> DriverPhase {
        self.state.phase()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.state.connection_id()
    }

    pub fn handshake_started(&self) -> Option<Duration> {
        self.state.handshake_started()
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn react(&mut self, msg: Msg, env: &mut impl DriverEnv) -> Vec<Transmission> {
        match msg {
            Msg::SystemInit => self.handle_system_init(env),
            Msg::EstablishConnection(endpoint) => self.handle_establish_connection(endpoint, env),
            Msg::ConnectionEstablished(cid) => self.handle_connection_established(cid, env),
            Msg::PackageArrived(cid, package) => self.handle_package_arrived(cid, package, env),
            Msg::SendPackage(package) => self.handle_send_package(package, env),
        }
    }

    /// Transport failure for `cid`. Surviving requests are re-queued and a
    /// fresh discovery round starts; exchanges out of retry budget abort.
    /// Stale ids are a no-op.
    pub fn connection_lost(
        &mut self,
        cid: ConnectionId,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        match std::mem::replace(&mut self.state, DriverState::Closed) {
            DriverState::Connected { cid: known, stage } if known == cid => {
                env.close_connection(cid);
                let mut out = Vec::new();
                let pending = match stage {
                    ConnectedStage::Confirming { pending, .. } => pending,
                    ConnectedStage::Active(mut registry) => {
                        let mut pending = Vec::with_capacity(registry.len());
                        for exchange in registry.drain() {
                            if self.retry.max_reached(exchange.retry_count) {
                                out.push(abort(exchange.correlation()));
                            } else {
                                pending.push(exchange.request);
                            }
                        }
                        pending
                    }
                };
                env.discover();
                self.state = DriverState::Awaiting {
                    pending,
                    connecting: ConnectingStage::EndpointDiscovery,
                };
                out
            }
            DriverState::Awaiting {
                pending,
                connecting: ConnectingStage::ConnectionEstablishing(known),
            } if known == cid => {
                env.close_connection(cid);
                env.discover();
                self.state = DriverState::Awaiting {
                    pending,
                    connecting: ConnectingStage::EndpointDiscovery,
                };
                Vec::new()
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    /// Aborts every buffered submission and in-flight exchange, releases a
    /// live connection and enters the terminal state. Idempotent; later
    /// submissions still receive `Aborted` results.
    pub fn shutdown(&mut self, env: &mut impl DriverEnv) -> Vec<Transmission> {
        let mut out = Vec::new();
        match std::mem::replace(&mut self.state, DriverState::Closed) {
            DriverState::Connected { cid, stage } => {
                env.close_connection(cid);
                match stage {
                    ConnectedStage::Confirming { pending, .. } => {
                        for package in pending {
                            out.push(abort(package.correlation));
                        }
                    }
                    ConnectedStage::Active(mut registry) => {
                        for exchange in registry.drain() {
                            out.push(abort(exchange.correlation()));
                        }
                    }
                }
            }
            DriverState::Awaiting {
                pending,
                connecting,
            } => {
                if let ConnectingStage::ConnectionEstablishing(cid) = connecting {
                    env.close_connection(cid);
                }
                for package in pending {
                    out.push(abort(package.correlation));
                }
            }
            DriverState::Init | DriverState::Closed => {}
        }
        out
    }

    fn handle_system_init(&mut self, env: &mut impl DriverEnv) -> Vec<Transmission> {
        if matches!(self.state, DriverState::Init) {
            env.discover();
            self.state = DriverState::Awaiting {
                pending: Vec::new(),
                connecting: ConnectingStage::EndpointDiscovery,
            };
        }
        Vec::new()
    }

    fn handle_send_package(
        &mut self,
        package: Package,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        match &mut self.state {
            DriverState::Init => {
                env.discover();
                self.state = DriverState::Awaiting {
                    pending: vec![package],
                    connecting: ConnectingStage::Reconnecting,
                };
                Vec::new()
            }
            DriverState::Awaiting { pending, .. } => {
                pending.push(package);
                Vec::new()
            }
            DriverState::Connected {
                stage: ConnectedStage::Confirming { pending, .. },
                ..
            } => {
                pending.push(package);
                Vec::new()
            }
            DriverState::Connected {
                stage: ConnectedStage::Active(registry),
                ..
            } => {
                registry.insert(Exchange::new(package.clone(), env.elapsed()));
                vec![Transmission::Send(package)]
            }
            DriverState::Closed => vec![abort(package.correlation)],
        }
    }

    fn handle_establish_connection(
        &mut self,
        endpoint: Endpoint,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        if let DriverState::Awaiting { connecting, .. } = &mut self.state
            && matches!(connecting, ConnectingStage::EndpointDiscovery)
        {
            *connecting = ConnectingStage::ConnectionEstablishing(env.connect(&endpoint));
        }
        Vec::new()
    }

    fn handle_connection_established(
        &mut self,
        cid: ConnectionId,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        match std::mem::replace(&mut self.state, DriverState::Closed) {
            DriverState::Awaiting {
                pending,
                connecting: ConnectingStage::ConnectionEstablishing(known),
            } if known == cid => {
                let (package, which) = match &self.credentials {
                    Some(creds) => (
                        Package::authenticate(env.generate_id(), creds.clone()),
                        HandshakeKind::Authentication,
                    ),
                    None => (
                        Package::new(
                            command::IDENTIFY_CLIENT,
                            env.generate_id(),
                            self.identify_payload.clone(),
                        ),
                        HandshakeKind::Identification,
                    ),
                };
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Confirming {
                        pending,
                        started: env.elapsed(),
                        correlation: package.correlation,
                        which,
                    },
                };
                vec![Transmission::Send(package)]
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    fn handle_package_arrived(
        &mut self,
        cid: ConnectionId,
        package: Package,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        let state = std::mem::replace(&mut self.state, DriverState::Closed);
        let DriverState::Connected { cid: known, stage } = state else {
            // No live session: nothing to attribute the package to.
            self.state = state;
            return Vec::new();
        };

        if known != cid {
            self.state = DriverState::Connected { cid: known, stage };
            return vec![Transmission::Ignored(package)];
        }

        // Heartbeat servicing preempts stage-specific handling.
        match Command::from_u8(package.cmd) {
            Some(Command::HeartbeatRequest) => {
                self.state = DriverState::Connected { cid: known, stage };
                return vec![Transmission::Send(Package::heartbeat_response(
                    package.correlation,
                ))];
            }
            Some(Command::HeartbeatResponse) => {
                self.state = DriverState::Connected { cid: known, stage };
                return Vec::new();
            }
            _ => {}
        }

        match stage {
            ConnectedStage::Confirming {
                pending,
                started,
                correlation,
                which,
            } => self.handle_confirming(known, pending, started, correlation, which, package, env),
            ConnectedStage::Active(registry) => {
                self.handle_active(known, registry, package, env)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_confirming(
        &mut self,
        cid: ConnectionId,
        pending: Vec<Package>,
        started: Duration,
        correlation: Uuid,
        which: HandshakeKind,
        package: Package,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        let keep = |driver: &mut Self, pending| {
            driver.state = DriverState::Connected {
                cid,
                stage: ConnectedStage::Confirming {
                    pending,
                    started,
                    correlation,
                    which,
                },
            };
            Vec::new()
        };

        if package.correlation != correlation {
            return keep(self, pending);
        }

        match (which, Command::from_u8(package.cmd)) {
            (
                HandshakeKind::Authentication,
                Some(Command::Authenticated | Command::NotAuthenticated),
            ) => {
                // A rejected handshake credential is not fatal; the
                // operation layer reacts to per-request auth failures.
                let identify = Package::new(
                    command::IDENTIFY_CLIENT,
                    env.generate_id(),
                    self.identify_payload.clone(),
                );
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Confirming {
                        pending,
                        started: env.elapsed(),
                        correlation: identify.correlation,
                        which: HandshakeKind::Identification,
                    },
                };
                vec![Transmission::Send(identify)]
            }
            (HandshakeKind::Identification, Some(Command::ClientIdentified)) => {
                let mut registry = ExchangeRegistry::new();
                let mut out = Vec::with_capacity(pending.len());
                for buffered in pending {
                    registry.insert(Exchange::new(buffered.clone(), env.elapsed()));
                    out.push(Transmission::Send(buffered));
                }
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Active(registry),
                };
                out
            }
            _ => keep(self, pending),
        }
    }

    fn handle_active(
        &mut self,
        cid: ConnectionId,
        mut registry: ExchangeRegistry,
        package: Package,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        let Some(exchange) = registry.remove_and_get(&package.correlation) else {
            self.state = DriverState::Connected {
                cid,
                stage: ConnectedStage::Active(registry),
            };
            return vec![Transmission::Ignored(package)];
        };

        match Command::from_u8(package.cmd) {
            Some(Command::BadRequest) => {
                let reason = decode_reason_text(&package.payload);
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Active(registry),
                };
                vec![Transmission::Recv(Err(BadNews::new(
                    package.correlation,
                    OperationError::ServerError(reason),
                )))]
            }
            Some(Command::NotAuthenticated) => {
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Active(registry),
                };
                vec![Transmission::Recv(Err(BadNews::new(
                    package.correlation,
                    OperationError::NotAuthenticated,
                )))]
            }
            Some(Command::NotHandled) => {
                self.handle_not_handled(cid, registry, exchange, package, env)
            }
            _ => {
                // One-shot exchange completion; data commands pass through.
                self.state = DriverState::Connected {
                    cid,
                    stage: ConnectedStage::Active(registry),
                };
                vec![Transmission::Recv(Ok(package))]
            }
        }
    }

    fn handle_not_handled(
        &mut self,
        cid: ConnectionId,
        mut registry: ExchangeRegistry,
        mut exchange: Exchange,
        package: Package,
        env: &mut impl DriverEnv,
    ) -> Vec<Transmission> {
        if let Ok(NotHandledPayload {
            reason: NotHandledReason::NotMaster,
            master: Some(node),
        }) = decode_not_handled(&package.payload)
        {
            let new_cid = env.force_reconnect(package.correlation, &node);
            let mut pending = vec![exchange.request];
            let mut out = Vec::new();
            for survivor in registry.drain() {
                if self.retry.max_reached(survivor.retry_count) {
                    out.push(abort(survivor.correlation()));
                } else {
                    pending.push(survivor.request);
                }
            }
            self.state = DriverState::Awaiting {
                pending,
                connecting: ConnectingStage::ConnectionEstablishing(new_cid),
            };
            return out;
        }

        // Non-master reasons and malformed payloads: bounded retry.
        if self.retry.max_reached(exchange.retry_count) {
            self.state = DriverState::Connected {
                cid,
                stage: ConnectedStage::Active(registry),
            };
            return vec![abort(package.correlation)];
        }

        exchange.retry_count += 1;
        let request = exchange.request.clone();
        registry.insert(exchange);
        self.state = DriverState::Connected {
            cid,
            stage: ConnectedStage::Active(registry),
        };
        vec![Transmission::Send(request)]
    }
}
