//! End-to-end tests through the listening server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use upstream_relay::config::loader::parse_config;

mod common;

use common::*;

const GET: &[u8] = b"GET /hello HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n";

#[tokio::test]
async fn reqwest_sees_backend_response() {
    let backend = spawn_backend(|req| async move {
        assert!(req.head.starts_with("GET /hello HTTP/1.1\r\n"));
        ok_response("hello")
    })
    .await;
    let relay = spawn_relay(&config_text(&[backend], "")).await;

    let response = reqwest::get(format!("http://{}/hello", relay.addr)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn chunked_backend_body_is_reframed() {
    let backend = fixed_backend(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n",
    )
    .await;
    for buffering in ["true", "false"] {
        let relay = spawn_relay(&config_text(&[backend], &format!("buffering = {buffering}"))).await;
        let response = reqwest::get(format!("http://{}/", relay.addr)).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "abcdefg", "buffering = {buffering}");
    }
}

#[tokio::test]
async fn no_live_upstream_is_bad_gateway() {
    let relay = spawn_relay(&config_text(&[closed_port().await], "")).await;
    let response = raw_exchange(relay.addr, GET).await;
    assert_eq!(status_of(&response), 502);
}

#[tokio::test]
async fn unmatched_request_is_not_found() {
    let backend = fixed_backend("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let config = format!(
        "[[upstreams]]\nname = \"app\"\nservers = [{{ address = \"{backend}\" }}]\n\n\
         [[routes]]\nname = \"only\"\nhost = \"known.example\"\nupstream = \"app\"\n"
    );
    let relay = spawn_relay(&config).await;
    let response = raw_exchange(relay.addr, GET).await;
    assert_eq!(status_of(&response), 404);
}

#[tokio::test]
async fn response_headers_go_through_the_dispatch_table() {
    let backend = fixed_backend(
        "HTTP/1.1 302 Found\r\n\
         Location: http://backend.internal/next\r\n\
         X-Powered-By: php\r\n\
         X-Custom: kept\r\n\
         X-Accel-Expires: 30\r\n\
         Content-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = "hide_headers = [\"X-Powered-By\"]\n\
                 redirect = [{ from = \"http://backend.internal/\", to = \"/\" }]";
    let relay = spawn_relay(&config_text(&[backend], proxy)).await;

    let response = raw_exchange(relay.addr, GET).await;
    assert_eq!(status_of(&response), 302);
    let lower = response.to_ascii_lowercase();
    assert!(lower.contains("location: /next\r\n"));
    assert!(lower.contains("x-custom: kept\r\n"));
    assert!(!lower.contains("x-powered-by"));
    assert!(!lower.contains("x-accel-expires"));
    assert!(lower.contains("server: upstream-relay\r\n"));
}

#[tokio::test]
async fn intercepted_status_gets_relay_error_page() {
    let backend = fixed_backend("HTTP/1.1 404 Not Found\r\nContent-Length: 10\r\n\r\nbackend404").await;
    let relay = spawn_relay(&config_text(&[backend], "intercept_errors = [404]")).await;

    let response = raw_exchange(relay.addr, GET).await;
    assert_eq!(status_of(&response), 404);
    assert!(!body_of(&response).contains("backend404"));
}

#[tokio::test]
async fn accel_redirect_to_named_route() {
    let front = fixed_backend(
        "HTTP/1.1 200 OK\r\nX-Accel-Redirect: @files\r\nContent-Length: 7\r\n\r\nignored",
    )
    .await;
    let files = spawn_backend(|_| async { ok_response("from files") }).await;
    let config = format!(
        "[[upstreams]]\nname = \"front\"\nservers = [{{ address = \"{front}\" }}]\n\n\
         [[upstreams]]\nname = \"files\"\nservers = [{{ address = \"{files}\" }}]\n\n\
         [[routes]]\nname = \"files\"\nhost = \"internal.invalid\"\nupstream = \"files\"\npriority = 10\n\n\
         [[routes]]\nname = \"front\"\nupstream = \"front\"\n"
    );
    let relay = spawn_relay(&config).await;

    let response = raw_exchange(relay.addr, GET).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "from files");
}

#[tokio::test]
async fn cached_response_skips_backend() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let backend = spawn_backend(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        async { ok_response("cached body") }
    })
    .await;
    let proxy = "[proxy.cache]\nenabled = true\nvalid = [{ secs = 60 }]";
    let relay = spawn_relay(&config_text(&[backend], proxy)).await;

    let first = raw_exchange(relay.addr, GET).await;
    let second = raw_exchange(relay.addr, GET).await;
    assert_eq!(body_of(&first), "cached body");
    assert_eq!(status_of(&second), 200);
    assert_eq!(body_of(&second), "cached body");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upgraded_connection_relays_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await.unwrap();
        assert!(request.head.to_ascii_lowercase().contains("upgrade: echo"));
        socket
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        let (mut rd, mut wr) = socket.split();
        let _ = tokio::io::copy(&mut rd, &mut wr).await;
    });
    let relay = spawn_relay(&config_text(&[backend], "")).await;

    let mut client = TcpStream::connect(relay.addr).await.unwrap();
    client
        .write_all(b"GET /ws HTTP/1.1\r\nHost: test\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert_eq!(status_of(&String::from_utf8_lossy(&head)), 101);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn reload_switches_upstreams() {
    let old = spawn_backend(|_| async { ok_response("old") }).await;
    let new = spawn_backend(|_| async { ok_response("new") }).await;
    let relay = spawn_relay(&config_text(&[old], "")).await;
    assert_eq!(body_of(&raw_exchange(relay.addr, GET).await), "old");

    relay
        .server
        .reload(&parse_config(&config_text(&[new], "")).unwrap())
        .unwrap();
    assert_eq!(body_of(&raw_exchange(relay.addr, GET).await), "new");
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let backend = spawn_backend(|_| async { ok_response("x") }).await;
    let relay = spawn_relay(&config_text(&[backend], "")).await;
    assert_eq!(status_of(&raw_exchange(relay.addr, GET).await), 200);

    relay.shutdown.trigger();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(relay.server.active_connections(), 0);
    let refused = TcpStream::connect(relay.addr).await;
    assert!(refused.is_err());
}

/// Echo the request body back with a Content-Length.
async fn echo_backend() -> std::net::SocketAddr {
    spawn_backend(|req| async move {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            req.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&req.body);
        out
    })
    .await
}

fn body_bytes(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map_or(&[][..], |pos| &response[pos + 4..])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn buffered_and_direct_relays_deliver_identical_bytes(
        body in proptest::collection::vec(any::<u8>(), 0..48 * 1024)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (buffered, direct) = rt.block_on(async {
            let backend = echo_backend().await;
            // Small buffers force the spill file into play.
            let small = "buffering = true\nbusy_buffers_size = 2048\n\
                         [proxy.buffers]\ncount = 4\nsize = 1024";
            let buffered = spawn_relay(&config_text(&[backend], small)).await;
            let direct = spawn_relay(&config_text(&[backend], "buffering = false\nbuffer_size = 1024")).await;

            let mut request = format!(
                "PUT /echo HTTP/1.1\r\nHost: test\r\nConnection: close\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .into_bytes();
            request.extend_from_slice(&body);
            (
                exchange_bytes(buffered.addr, &request).await,
                exchange_bytes(direct.addr, &request).await,
            )
        });
        prop_assert_eq!(body_bytes(&buffered), &body[..]);
        prop_assert_eq!(body_bytes(&direct), &body[..]);
    }
}
