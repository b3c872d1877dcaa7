//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use upstream_relay::config::loader::parse_config;
use upstream_relay::http::connection::ClientConnection;
use upstream_relay::http::request::{parse_request_head, ClientRequest};
use upstream_relay::http::{HttpServer, Runtime};
use upstream_relay::lifecycle::Shutdown;
use upstream_relay::load_balancer::{
    PeerOutcome, PeerPick, PeerSelector, PeerSet, UpstreamRegistry,
};
use upstream_relay::net::connector::{BackendConnection, Connector, TcpConnector};
use upstream_relay::net::listener::Listener;
use upstream_relay::routing::{RouteMatch, Router};
use upstream_relay::upstream::UpstreamContext;

/// A request as the mock backend saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub head: String,
    pub body: Vec<u8>,
}

/// Read one request (head plus Content-Length body) from `socket`.
pub async fn read_request(socket: &mut TcpStream) -> Option<Received> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some(Received { head, body })
}

/// Backend answering every request with whatever `respond` returns, then
/// closing the connection.
pub async fn spawn_backend<F, Fut>(respond: F) -> SocketAddr
where
    F: Fn(Received) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut socket).await {
                    let response = respond(request).await;
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });
    addr
}

/// Backend with a fixed response.
pub async fn fixed_backend(response: &'static str) -> SocketAddr {
    spawn_backend(move |_| async move { response.as_bytes().to_vec() }).await
}

/// `200 OK` with `body` and a Content-Length.
pub fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Config text with one upstream group `app` over `servers` and a catch-all
/// route. `proxy` is appended as the `[proxy]` table body.
pub fn config_text(servers: &[SocketAddr], proxy: &str) -> String {
    let servers = servers
        .iter()
        .map(|a| format!("{{ address = \"{a}\" }}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[listener]\nbind_address = \"127.0.0.1:0\"\n\n\
         [[upstreams]]\nname = \"app\"\nservers = [{servers}]\n\n\
         [[routes]]\nname = \"all\"\nupstream = \"app\"\n\n\
         [proxy]\n{proxy}\n"
    )
}

/// A running relay; dropping it leaves the server task to the runtime.
pub struct Relay {
    pub addr: SocketAddr,
    pub server: HttpServer,
    pub shutdown: Shutdown,
}

pub async fn spawn_relay(config: &str) -> Relay {
    let config = parse_config(config).unwrap();
    let server = HttpServer::new(Runtime::build(&config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let listener = Listener::from_std_parts(listener, 64);
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let task = server.clone();
    tokio::spawn(async move {
        let _ = task.run(listener, rx).await;
    });
    Relay {
        addr,
        server,
        shutdown,
    }
}

/// Send raw bytes, read until the relay closes.
pub async fn exchange_bytes(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out)).await;
    out
}

pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    String::from_utf8_lossy(&exchange_bytes(addr, request).await).to_string()
}

pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map_or("", |(_, b)| b)
}

/// TCP connector that counts releases.
#[derive(Debug, Default)]
pub struct CountingConnector {
    inner: TcpConnector,
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,
    /// Hand out one pooled connection whose backend already hung up.
    stale: AtomicBool,
}

impl CountingConnector {
    pub fn with_stale_connection() -> Self {
        let connector = Self::default();
        connector.stale.store(true, Ordering::SeqCst);
        connector
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, peer: &PeerPick) -> io::Result<BackendConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.stale.swap(false, Ordering::SeqCst) {
            let (ours, theirs) = tokio::io::duplex(64);
            drop(theirs);
            return Ok(BackendConnection {
                stream: Box::new(ours),
                addr: peer.addr,
                reused: true,
            });
        }
        self.inner.connect(peer).await
    }

    fn release(&self, conn: BackendConnection, reusable: bool) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(conn, reusable);
    }
}

/// Context of the catch-all route of `config`, with its connector replaced.
pub fn route_context(config: &str, connector: Arc<CountingConnector>) -> UpstreamContext {
    let config = parse_config(config).unwrap();
    let registry = UpstreamRegistry::from_config(&config.upstreams).unwrap();
    let router = Router::build(&config, &registry).unwrap();
    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let RouteMatch::Matched(route) = router.match_request(&request) else {
        panic!("catch-all route missing");
    };
    let mut context = route.context.clone();
    context.upstream.connector = connector;
    context
}

/// Every `report_outcome` of a group, in order.
pub type Outcomes = Arc<Mutex<Vec<(SocketAddr, PeerOutcome)>>>;

#[derive(Debug)]
struct RecordingSelector {
    inner: Arc<dyn PeerSelector>,
    outcomes: Outcomes,
}

impl PeerSelector for RecordingSelector {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn init(&self) -> Box<dyn PeerSet> {
        Box::new(RecordingPeers {
            inner: self.inner.init(),
            outcomes: self.outcomes.clone(),
        })
    }
}

struct RecordingPeers {
    inner: Box<dyn PeerSet>,
    outcomes: Outcomes,
}

impl PeerSet for RecordingPeers {
    fn tries(&self) -> usize {
        self.inner.tries()
    }

    fn get_next(&mut self) -> Option<PeerPick> {
        self.inner.get_next()
    }

    fn report_outcome(&mut self, peer: &PeerPick, outcome: PeerOutcome) {
        self.outcomes.lock().unwrap().push((peer.addr, outcome));
        self.inner.report_outcome(peer, outcome);
    }
}

/// Record the peer outcomes reported through `context`.
pub fn record_outcomes(context: &mut UpstreamContext) -> Outcomes {
    let outcomes = Outcomes::default();
    context.upstream.selector = Arc::new(RecordingSelector {
        inner: context.upstream.selector.clone(),
        outcomes: outcomes.clone(),
    });
    outcomes
}

pub fn parse(raw: &str) -> ClientRequest {
    parse_request_head(raw.as_bytes(), 8192).unwrap().unwrap().0
}

/// A client connection whose other end is returned to the test.
pub fn client_pair() -> (ClientConnection, DuplexStream) {
    client_pair_with(1 << 20)
}

/// Like `client_pair`, with at most `capacity` bytes in flight to the client.
pub fn client_pair_with(capacity: usize) -> (ClientConnection, DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(capacity);
    (
        ClientConnection::new(Box::new(ours), Duration::from_secs(5)),
        theirs,
    )
}

/// Everything the client side received until the relay side was dropped.
pub async fn drain(mut client: DuplexStream) -> String {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).to_string()
}
