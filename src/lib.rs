#![forbid(unsafe_code)]

//! Connection driver core of an EventStore TCP client.
//!
//! The crate is split along the reactor boundary:
//!
//! - [`proto`]: the package wire vocabulary, with command codes, the body
//!   codec, length-prefixed framing and the handshake/redirection payloads.
//! - [`driver`]: the pure reactor. A state machine consuming [`driver::Msg`]
//!   and emitting [`driver::Transmission`], covering connection
//!   establishment, handshakes, exchange correlation and retry policy.
//! - [`runtime`]: the blocking socket loop that feeds the reactor from real
//!   TCP connections and realizes its effects.
//! - [`settings`]: client configuration with a TOML layer.

pub mod driver;
pub mod proto;
pub mod runtime;
pub mod settings;

pub use driver::{
    BadNews, ConnectionId, Driver, DriverEnv, DriverPhase, Msg, OperationError, Transmission,
};
pub use proto::{Credentials, Endpoint, NodeEndpoints, Package};
pub use runtime::{
    Discovery, DriverHandle, DriverRuntime, RuntimeError, StaticDiscovery, TransmissionSink,
};
pub use settings::{Retry, Settings, SettingsError};
