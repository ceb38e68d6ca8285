//! Blocking socket runtime around the driver reactor.
//!
//! One thread owns the [`Driver`] and loops over a bounded input channel;
//! connector and reader threads feed it. Everything the reactor treats as a
//! synchronous effect is realized here: sockets, clock, id minting, and the
//! discovery hand-off (with reconnect backoff).

mod heartbeat;

use std::collections::VecDeque;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use uuid::Uuid;

use crate::driver::{BadNews, ConnectionId, Driver, DriverEnv, Msg, Transmission};
use crate::proto::{Endpoint, FrameReader, FrameWriter, NodeEndpoints, Package, PayloadEncodeError};
use crate::settings::Settings;

use heartbeat::{HeartbeatDecision, HeartbeatTracker};

const TICK: Duration = Duration::from_millis(50);

/// Supplies one candidate cluster endpoint per discovery round.
pub trait Discovery: Send {
    fn next_endpoint(&mut self) -> Option<Endpoint>;
}

/// Fixed seed list, cycled round-robin across reconnects.
pub struct StaticDiscovery {
    endpoints: Vec<Endpoint>,
    cursor: usize,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            cursor: 0,
        }
    }
}

impl Discovery for StaticDiscovery {
    fn next_endpoint(&mut self) -> Option<Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.endpoints[self.cursor % self.endpoints.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Some(endpoint)
    }
}

/// Receives the observable half of the transmission stream.
pub trait TransmissionSink: Send {
    fn on_recv(&mut self, result: Result<Package, BadNews>);
    fn on_ignored(&mut self, package: Package);
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("identification payload encoding failed: {0}")]
    Payload(#[from] PayloadEncodeError),
    #[error("driver loop is not running")]
    Stopped,
}

enum Input {
    Msg(Msg),
    SocketReady { cid: ConnectionId, stream: TcpStream },
    ConnectFailed(ConnectionId),
    ConnectionLost(ConnectionId),
    Shutdown,
}

/// Owns a started driver loop. Dropping the handle without calling
/// [`DriverHandle::shutdown`] leaves the loop running detached.
pub struct DriverHandle {
    input_tx: Sender<Input>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DriverHandle {
    /// Submits a user package. Blocks when the input queue is full.
    pub fn send_package(&self, package: Package) -> Result<(), RuntimeError> {
        self.input_tx
            .send(Input::Msg(Msg::SendPackage(package)))
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Aborts outstanding work and stops the loop.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.input_tx.send(Input::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub struct DriverRuntime<D, S> {
    settings: Settings,
    discovery: D,
    sink: S,
}

impl<D, S> DriverRuntime<D, S>
where
    D: Discovery + 'static,
    S: TransmissionSink + 'static,
{
    pub fn new(settings: Settings, discovery: D, sink: S) -> Self {
        Self {
            settings,
            discovery,
            sink,
        }
    }

    pub fn start(self) -> Result<DriverHandle, RuntimeError> {
        let driver = Driver::new(&self.settings)?;
        let (input_tx, input_rx) = channel::bounded(self.settings.transport.msg_queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let env = TcpEnv {
            discovery: Box::new(self.discovery),
            input_tx: input_tx.clone(),
            origin: Instant::now(),
            backoff: Backoff::new(BackoffPolicy {
                base: self.settings.transport.backoff_base(),
                max: self.settings.transport.backoff_max(),
            }),
            scheduled: None,
            closed: Vec::new(),
            attempt: None,
            live: None,
        };

        let mut driver_loop = DriverLoop {
            driver,
            env,
            input_rx,
            input_tx: input_tx.clone(),
            sink: self.sink,
            live: None,
            heartbeat: None,
            heartbeat_interval: self.settings.transport.heartbeat_interval(),
            heartbeat_timeout: self.settings.transport.heartbeat_timeout(),
            max_frame_bytes: self.settings.transport.max_frame_bytes,
            deferred_lost: VecDeque::new(),
            shutdown: Arc::clone(&shutdown),
        };
        tracing::info!(
            "starting connection driver as {}",
            driver_loop.driver.connection_name()
        );
        let join = thread::spawn(move || driver_loop.run());

        Ok(DriverHandle {
            input_tx,
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

/// Exponential reconnect pacing. The first attempt after a reset is
/// immediate; each subsequent one doubles up to the cap.
struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            Duration::ZERO
        } else {
            let shift = (self.attempts - 1).min(16);
            self.policy
                .base
                .saturating_mul(1u32 << shift)
                .min(self.policy.max)
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

struct TcpEnv {
    discovery: Box<dyn Discovery>,
    input_tx: Sender<Input>,
    origin: Instant,
    backoff: Backoff,
    /// Discovery completion waiting for its backoff delay to elapse.
    scheduled: Option<(Instant, Endpoint)>,
    /// Connection ids released by the reactor, pending socket teardown.
    closed: Vec<ConnectionId>,
    attempt: Option<ConnectionId>,
    live: Option<ConnectionId>,
}

impl TcpEnv {
    fn expects(&self, cid: ConnectionId) -> bool {
        self.attempt == Some(cid)
    }

    fn take_ready(&mut self, now: Instant) -> Option<Msg> {
        match &self.scheduled {
            Some((due, _)) if *due <= now => self
                .scheduled
                .take()
                .map(|(_, endpoint)| Msg::EstablishConnection(endpoint)),
            _ => None,
        }
    }

    fn take_closed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closed)
    }
}

impl DriverEnv for TcpEnv {
    fn connect(&mut self, endpoint: &Endpoint) -> ConnectionId {
        let cid = ConnectionId::new(Uuid::new_v4());
        self.attempt = Some(cid);
        let endpoint = endpoint.clone();
        let input_tx = self.input_tx.clone();
        thread::spawn(move || run_connector(endpoint, cid, input_tx));
        cid
    }

    fn close_connection(&mut self, cid: ConnectionId) {
        if self.live == Some(cid) {
            self.live = None;
        }
        if self.attempt == Some(cid) {
            self.attempt = None;
        }
        self.closed.push(cid);
    }

    fn discover(&mut self) {
        let delay = self.backoff.next_delay();
        match self.discovery.next_endpoint() {
            Some(endpoint) => {
                tracing::debug!("discovery selected {endpoint}, due in {delay:?}");
                self.scheduled = Some((Instant::now() + delay, endpoint));
            }
            None => {
                tracing::warn!("discovery produced no endpoint; driver stays idle");
            }
        }
    }

    fn generate_id(&mut self) -> Uuid {
        Uuid::new_v4()
    }

    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn force_reconnect(&mut self, correlation: Uuid, node: &NodeEndpoints) -> ConnectionId {
        tracing::info!(
            "master redirection for {correlation}: reconnecting to {}",
            node.tcp
        );
        if let Some(live) = self.live.take() {
            self.closed.push(live);
        }
        self.connect(&node.tcp)
    }
}

struct LiveConnection {
    cid: ConnectionId,
    writer: FrameWriter<TcpStream>,
    stream: TcpStream,
}

struct DriverLoop<S> {
    driver: Driver,
    env: TcpEnv,
    input_rx: Receiver<Input>,
    input_tx: Sender<Input>,
    sink: S,
    live: Option<LiveConnection>,
    heartbeat: Option<HeartbeatTracker>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    max_frame_bytes: usize,
    /// Write failures observed mid-dispatch, handled after the batch.
    deferred_lost: VecDeque<ConnectionId>,
    shutdown: Arc<AtomicBool>,
}

impl<S: TransmissionSink> DriverLoop<S> {
    fn run(&mut self) {
        let transmissions = self.driver.react(Msg::SystemInit, &mut self.env);
        self.dispatch(transmissions);
        self.pump();

        let input_rx = self.input_rx.clone();
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.finish();
                break;
            }

            let tick = channel::after(TICK);
            crossbeam::select! {
                recv(input_rx) -> input => {
                    let Ok(input) = input else {
                        self.finish();
                        break;
                    };
                    if !self.handle_input(input) {
                        break;
                    }
                }
                recv(tick) -> _ => {
                    self.poll_heartbeat();
                }
            }
            self.pump();
        }
    }

    /// Runs deferred work: due discovery completions, socket teardown and
    /// write failures noticed during dispatch.
    fn pump(&mut self) {
        loop {
            for cid in self.env.take_closed() {
                if self.live.as_ref().is_some_and(|live| live.cid == cid) {
                    self.close_live();
                }
            }

            if let Some(cid) = self.deferred_lost.pop_front() {
                self.handle_connection_lost(cid);
                continue;
            }

            match self.env.take_ready(Instant::now()) {
                Some(msg) => {
                    self.feed(msg);
                    continue;
                }
                None => break,
            }
        }
    }

    fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Msg(msg) => {
                if let Msg::PackageArrived(cid, _) = &msg
                    && self.live.as_ref().is_some_and(|live| live.cid == *cid)
                    && let Some(tracker) = &mut self.heartbeat
                {
                    tracker.note_recv(self.env.elapsed());
                }
                self.feed(msg);
                true
            }
            Input::SocketReady { cid, stream } => {
                self.install_connection(cid, stream);
                true
            }
            Input::ConnectFailed(cid) => {
                if self.env.expects(cid) {
                    self.handle_connection_lost(cid);
                }
                true
            }
            Input::ConnectionLost(cid) => {
                self.handle_connection_lost(cid);
                true
            }
            Input::Shutdown => {
                self.finish();
                false
            }
        }
    }

    fn feed(&mut self, msg: Msg) {
        let transmissions = self.driver.react(msg, &mut self.env);
        self.dispatch(transmissions);
    }

    fn dispatch(&mut self, transmissions: Vec<Transmission>) {
        for transmission in transmissions {
            match transmission {
                Transmission::Send(package) => self.write_package(package),
                Transmission::Ignored(package) => {
                    tracing::debug!(
                        "ignored package cmd {:#04x} correlation {}",
                        package.cmd,
                        package.correlation
                    );
                    self.sink.on_ignored(package);
                }
                Transmission::Recv(result) => self.sink.on_recv(result),
            }
        }
    }

    fn write_package(&mut self, package: Package) {
        let Some(live) = &mut self.live else {
            tracing::warn!(
                "dropping outbound package {}: no live connection",
                package.correlation
            );
            return;
        };

        let body = match package.encode() {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("package {} not encodable: {err}", package.correlation);
                return;
            }
        };
        match live.writer.write_frame(&body) {
            Ok(_) => {
                if let Some(tracker) = &mut self.heartbeat {
                    tracker.note_send(self.env.elapsed());
                }
            }
            Err(err) => {
                tracing::warn!("write on {} failed: {err}", live.cid);
                self.deferred_lost.push_back(live.cid);
            }
        }
    }

    fn install_connection(&mut self, cid: ConnectionId, stream: TcpStream) {
        if !self.env.expects(cid) {
            // A newer attempt superseded this one.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let _ = stream.set_nodelay(true);
        let reader_stream = match stream.try_clone() {
            Ok(reader_stream) => reader_stream,
            Err(err) => {
                tracing::warn!("socket clone for {cid} failed: {err}");
                self.handle_connection_lost(cid);
                return;
            }
        };
        let writer_stream = match stream.try_clone() {
            Ok(writer_stream) => writer_stream,
            Err(err) => {
                tracing::warn!("socket clone for {cid} failed: {err}");
                self.handle_connection_lost(cid);
                return;
            }
        };

        self.close_live();
        self.env.attempt = None;
        self.env.live = Some(cid);
        self.env.backoff.reset();
        self.live = Some(LiveConnection {
            cid,
            writer: FrameWriter::new(writer_stream, self.max_frame_bytes),
            stream,
        });
        self.heartbeat = Some(HeartbeatTracker::new(
            self.heartbeat_interval,
            self.heartbeat_timeout,
            self.env.elapsed(),
        ));

        let input_tx = self.input_tx.clone();
        let max_frame_bytes = self.max_frame_bytes;
        thread::spawn(move || run_reader(reader_stream, cid, input_tx, max_frame_bytes));

        tracing::info!("connection {cid} established");
        self.feed(Msg::ConnectionEstablished(cid));
    }

    fn handle_connection_lost(&mut self, cid: ConnectionId) {
        if self.live.as_ref().is_some_and(|live| live.cid == cid) {
            self.close_live();
        }
        let transmissions = self.driver.connection_lost(cid, &mut self.env);
        self.dispatch(transmissions);
    }

    fn poll_heartbeat(&mut self) {
        let Some(live_cid) = self.live.as_ref().map(|live| live.cid) else {
            return;
        };
        let now = self.env.elapsed();
        let Some(decision) = self.heartbeat.as_mut().and_then(|tracker| tracker.poll(now))
        else {
            return;
        };
        match decision {
            HeartbeatDecision::SendRequest => {
                let correlation = Uuid::new_v4();
                self.write_package(Package::heartbeat_request(correlation));
            }
            HeartbeatDecision::ConnectionDead => {
                tracing::warn!("connection {live_cid} missed its heartbeat deadline");
                self.handle_connection_lost(live_cid);
            }
        }
    }

    fn close_live(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.stream.shutdown(Shutdown::Both);
            if self.env.live == Some(live.cid) {
                self.env.live = None;
            }
            self.heartbeat = None;
        }
    }

    fn finish(&mut self) {
        let transmissions = self.driver.shutdown(&mut self.env);
        self.dispatch(transmissions);
        self.close_live();
        tracing::info!("connection driver stopped");
    }
}

fn run_connector(endpoint: Endpoint, cid: ConnectionId, input_tx: Sender<Input>) {
    match TcpStream::connect((endpoint.host.as_str(), endpoint.port)) {
        Ok(stream) => {
            let _ = input_tx.send(Input::SocketReady { cid, stream });
        }
        Err(err) => {
            tracing::warn!("connect to {endpoint} failed: {err}");
            let _ = input_tx.send(Input::ConnectFailed(cid));
        }
    }
}

fn run_reader(
    stream: TcpStream,
    cid: ConnectionId,
    input_tx: Sender<Input>,
    max_frame_bytes: usize,
) {
    let mut reader = FrameReader::new(stream, max_frame_bytes);
    loop {
        match reader.read_next() {
            Ok(Some(body)) => match Package::decode(&body) {
                Ok(package) => {
                    if input_tx
                        .send(Input::Msg(Msg::PackageArrived(cid, package)))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    // Stream framing is intact but the body is garbage;
                    // safer to abandon the session than resynchronize.
                    tracing::warn!("undecodable package on {cid}: {err}");
                    let _ = input_tx.send(Input::ConnectionLost(cid));
                    break;
                }
            },
            Ok(None) => {
                let _ = input_tx.send(Input::ConnectionLost(cid));
                break;
            }
            Err(err) => {
                tracing::debug!("read on {cid} ended: {err}");
                let _ = input_tx.send(Input::ConnectionLost(cid));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        });

        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn static_discovery_cycles() {
        let mut discovery = StaticDiscovery::new(vec![
            Endpoint::new("a", 1),
            Endpoint::new("b", 2),
        ]);
        assert_eq!(discovery.next_endpoint(), Some(Endpoint::new("a", 1)));
        assert_eq!(discovery.next_endpoint(), Some(Endpoint::new("b", 2)));
        assert_eq!(discovery.next_endpoint(), Some(Endpoint::new("a", 1)));
    }

    #[test]
    fn empty_discovery_yields_nothing() {
        let mut discovery = StaticDiscovery::new(Vec::new());
        assert_eq!(discovery.next_endpoint(), None);
    }
}
