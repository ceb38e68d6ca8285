//! End-to-end driver loop tests against a scripted TCP server.

use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use uuid::Uuid;

use eventstore_tcp::proto::command;
use eventstore_tcp::proto::payloads::decode_identify_client;
use eventstore_tcp::proto::{FrameReader, FrameWriter};
use eventstore_tcp::{
    BadNews, DriverRuntime, Endpoint, OperationError, Package, Settings, StaticDiscovery,
    TransmissionSink,
};

const MAX_FRAME_BYTES: usize = 1024 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum SinkEvent {
    Recv(Result<Package, BadNews>),
    Ignored(Package),
}

struct ChannelSink(Sender<SinkEvent>);

impl TransmissionSink for ChannelSink {
    fn on_recv(&mut self, result: Result<Package, BadNews>) {
        let _ = self.0.send(SinkEvent::Recv(result));
    }

    fn on_ignored(&mut self, package: Package) {
        let _ = self.0.send(SinkEvent::Ignored(package));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn test_settings(name: &str) -> Settings {
    let mut settings = Settings::default();
    settings.connection.default_connection_name = Some(name.to_string());
    // Quiet keep-alives so the server script only sees scripted traffic.
    settings.transport.heartbeat_interval_ms = 60_000;
    settings.transport.heartbeat_timeout_ms = 120_000;
    settings.transport.backoff_base_ms = 10;
    settings.transport.backoff_max_ms = 50;
    settings
}

fn sink() -> (ChannelSink, Receiver<SinkEvent>) {
    let (tx, rx) = unbounded();
    (ChannelSink(tx), rx)
}

struct Peer {
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl Peer {
    fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = listener.accept().expect("accept");
        let reader_stream = stream.try_clone().expect("clone stream");
        Peer {
            reader: FrameReader::new(reader_stream, MAX_FRAME_BYTES),
            writer: FrameWriter::new(stream, MAX_FRAME_BYTES),
        }
    }

    fn read_package(&mut self) -> Option<Package> {
        let body = self.reader.read_next().expect("read frame")?;
        Some(Package::decode(&body).expect("decode package"))
    }

    fn write_package(&mut self, package: &Package) {
        let body = package.encode().expect("encode package");
        self.writer.write_frame(&body).expect("write frame");
    }

    /// Services the identification handshake and checks the reported name.
    fn expect_handshake(&mut self, expected_name: &str) {
        let identify = self.read_package().expect("identify package");
        assert_eq!(identify.cmd, command::IDENTIFY_CLIENT);
        let (version, name) = decode_identify_client(&identify.payload).expect("identify payload");
        assert_eq!(version, command::CLIENT_VERSION);
        assert_eq!(name, expected_name);
        self.write_package(&Package::new(
            command::CLIENT_IDENTIFIED,
            identify.correlation,
            Bytes::new(),
        ));
    }
}

fn expect_recv_ok(events: &Receiver<SinkEvent>) -> Package {
    loop {
        match events.recv_timeout(RECV_TIMEOUT).expect("sink event") {
            SinkEvent::Recv(Ok(package)) => return package,
            SinkEvent::Ignored(_) => continue,
            other => panic!("unexpected sink event: {other:?}"),
        }
    }
}

#[test]
fn handshake_buffered_submit_and_echo() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    let server: JoinHandle<()> = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        peer.expect_handshake("itest");

        // The submission buffered during connect arrives right after.
        let request = peer.read_package().expect("user package");
        assert_eq!(request.cmd, 0xB0);
        assert_eq!(&request.payload[..], b"ping");
        peer.write_package(&Package::new(
            0xB1,
            request.correlation,
            Bytes::from_static(b"pong"),
        ));

        // Server-initiated heartbeat must be answered with the same
        // correlation.
        let heartbeat_corr = Uuid::new_v4();
        peer.write_package(&Package::new(
            command::HEARTBEAT_REQUEST,
            heartbeat_corr,
            Bytes::new(),
        ));
        let response = peer.read_package().expect("heartbeat response");
        assert_eq!(response.cmd, command::HEARTBEAT_RESPONSE);
        assert_eq!(response.correlation, heartbeat_corr);

        // Unsolicited package: the client reports it as ignored, which the
        // test uses as the script-complete marker.
        peer.write_package(&Package::new(0xB2, Uuid::new_v4(), Bytes::new()));

        // Hold the socket open until the client shuts down.
        assert!(peer.read_package().is_none());
    });

    let (sink, events) = sink();
    let discovery = StaticDiscovery::new(vec![Endpoint::new("127.0.0.1", port)]);
    let handle = DriverRuntime::new(test_settings("itest"), discovery, sink)
        .start()
        .expect("start runtime");

    let correlation = Uuid::new_v4();
    handle
        .send_package(Package::new(0xB0, correlation, Bytes::from_static(b"ping")))
        .expect("send package");

    let echo = expect_recv_ok(&events);
    assert_eq!(echo.cmd, 0xB1);
    assert_eq!(echo.correlation, correlation);
    assert_eq!(&echo.payload[..], b"pong");

    // The heartbeat exchange has completed once the marker shows up.
    loop {
        match events.recv_timeout(RECV_TIMEOUT).expect("sink event") {
            SinkEvent::Ignored(package) if package.cmd == 0xB2 => break,
            SinkEvent::Ignored(_) => continue,
            other => panic!("unexpected sink event: {other:?}"),
        }
    }

    handle.shutdown();
    server.join().expect("server thread");
}

#[test]
fn survivors_ride_the_next_connection_after_a_drop() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    let server: JoinHandle<()> = thread::spawn(move || {
        // First session: identify, then drop the socket without answering
        // anything else.
        {
            let mut peer = Peer::accept(&listener);
            peer.expect_handshake("retest");
        }

        // Second session: the driver re-identifies and re-sends the
        // surviving request with its original correlation.
        let mut peer = Peer::accept(&listener);
        peer.expect_handshake("retest");
        let request = peer.read_package().expect("replayed package");
        assert_eq!(request.cmd, 0xB0);
        peer.write_package(&Package::new(
            0xB1,
            request.correlation,
            Bytes::from_static(b"late"),
        ));

        assert!(peer.read_package().is_none());
    });

    let (sink, events) = sink();
    let discovery = StaticDiscovery::new(vec![Endpoint::new("127.0.0.1", port)]);
    let handle = DriverRuntime::new(test_settings("retest"), discovery, sink)
        .start()
        .expect("start runtime");

    let correlation = Uuid::new_v4();
    handle
        .send_package(Package::new(0xB0, correlation, Bytes::from_static(b"once")))
        .expect("send package");

    let echo = expect_recv_ok(&events);
    assert_eq!(echo.correlation, correlation);
    assert_eq!(&echo.payload[..], b"late");

    handle.shutdown();
    server.join().expect("server thread");
}

#[test]
fn shutdown_aborts_unconnected_submissions() {
    init_tracing();
    // A freshly released port: connects are refused, so the driver keeps
    // cycling discovery while the submission stays buffered.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local addr").port()
    };

    let (sink, events) = sink();
    let discovery = StaticDiscovery::new(vec![Endpoint::new("127.0.0.1", port)]);
    let handle = DriverRuntime::new(test_settings("downtest"), discovery, sink)
        .start()
        .expect("start runtime");

    let correlation = Uuid::new_v4();
    handle
        .send_package(Package::new(0xB0, correlation, Bytes::from_static(b"nope")))
        .expect("send package");

    // Let at least one refused connect cycle through.
    thread::sleep(Duration::from_millis(200));
    handle.shutdown();

    match events.recv_timeout(RECV_TIMEOUT).expect("sink event") {
        SinkEvent::Recv(Err(bad)) => {
            assert_eq!(bad.correlation, correlation);
            assert_eq!(bad.error, OperationError::Aborted);
        }
        other => panic!("unexpected sink event: {other:?}"),
    }
}
