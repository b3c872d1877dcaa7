//! Upstream request state machine against real backend sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use upstream_relay::cache::{CachedResponse, Lookup};
use upstream_relay::http::request::RequestBody;
use upstream_relay::load_balancer::PeerOutcome;
use upstream_relay::resilience::FailureKind;
use upstream_relay::upstream::headers::OutboundHeaders;
use upstream_relay::upstream::{Completion, FinalizeError, Outcome, Phase, UpstreamRequest};

mod common;

use common::*;

#[tokio::test]
async fn successful_request_releases_once() {
    let backend = spawn_backend(|_| async { ok_response("hello") }).await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[backend], ""), connector.clone());

    let request = parse("GET /hello HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let completion = upstream.run().await;
    assert_eq!(completion, Completion::Responded { status: 200 });
    assert_eq!(upstream.phase(), Phase::Finalized);
    assert_eq!(upstream.attempts().len(), 1);
    assert_eq!(upstream.attempts()[0].status, 200);
    assert_eq!(upstream.attempts()[0].bytes, 5);

    assert_eq!(
        upstream.finalize(Outcome::Done).await,
        Err(FinalizeError::AlreadyFinalized)
    );
    drop(upstream);
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.releases(), 1);

    drop(conn);
    let response = drain(client).await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "hello");
}

#[tokio::test]
async fn refused_connection_fails_over_to_next_server() {
    let dead = closed_port().await;
    let backend = spawn_backend(|_| async { ok_response("second") }).await;
    let connector = Arc::new(CountingConnector::default());
    let mut ctx = route_context(&config_text(&[dead, backend], ""), connector.clone());
    let outcomes = record_outcomes(&mut ctx);

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![(dead, PeerOutcome::Failed), (backend, PeerOutcome::Success)]
    );

    let attempts = upstream.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].peer.addr, dead);
    assert_eq!(attempts[0].failure, Some(FailureKind::Error));
    assert_eq!(attempts[1].peer.addr, backend);
    assert_eq!(attempts[1].status, 200);
    drop(upstream);

    drop(conn);
    assert_eq!(body_of(&drain(client).await), "second");
}

#[tokio::test]
async fn tries_limit_bounds_attempts() {
    let servers = [closed_port().await, closed_port().await, closed_port().await];
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&servers, "next_upstream_tries = 2"), connector.clone());

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, _client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.remaining_tries(), 2);
    let completion = upstream.run().await;
    assert!(matches!(completion, Completion::ErrorPage { status: 502, .. }));
    assert_eq!(upstream.attempts().len(), 2);
    assert_eq!(upstream.remaining_tries(), 0);
}

#[tokio::test]
async fn oversized_header_is_bad_gateway() {
    let big = format!(
        "HTTP/1.1 200 OK\r\nX-Big: {}\r\nContent-Length: 0\r\n\r\n",
        "a".repeat(8192)
    );
    let backend = spawn_backend(move |_| {
        let big = big.clone();
        async move { big.into_bytes() }
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[backend], "buffer_size = 1024"), connector);

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, _client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let completion = upstream.run().await;
    assert!(matches!(completion, Completion::ErrorPage { status: 502, .. }));
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::InvalidHeader));
}

#[tokio::test]
async fn status_in_mask_moves_to_next_server() {
    let failing = fixed_backend("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy").await;
    let backend = spawn_backend(|_| async { ok_response("ok") }).await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(&[failing, backend], "next_upstream = [\"error\", \"http_503\"]"),
        connector,
    );

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, _client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts()[0].status, 503);
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::Http503));
}

#[tokio::test]
async fn status_on_last_server_is_relayed() {
    let failing = fixed_backend("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\n\r\nbusy").await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(&[failing], "next_upstream = [\"error\", \"http_503\"]"),
        connector,
    );

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 503 });
    drop(upstream);
    drop(conn);
    assert_eq!(body_of(&drain(client).await), "busy");
}

#[tokio::test]
async fn streamed_body_is_not_replayed() {
    // Reads the request, then hangs up without answering.
    let hangs_up = spawn_backend(|_| async { Vec::new() }).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let healthy = spawn_backend(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        async { ok_response("late") }
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(&[hangs_up, healthy], "request_buffering = false"),
        connector,
    );

    let request = parse("PUT /upload HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\n\r\n");
    let mut body = RequestBody::Streaming { length: 5 };
    let (mut conn, mut client) = client_pair();
    client.write_all(b"abcde").await.unwrap();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let completion = upstream.run().await;
    assert!(matches!(completion, Completion::ErrorPage { status: 502, .. }));
    assert_eq!(upstream.attempts().len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn buffered_body_is_replayed_after_failure() {
    let hangs_up = spawn_backend(|_| async { Vec::new() }).await;
    let healthy = spawn_backend(|req| async move {
        ok_response(&String::from_utf8_lossy(&req.body))
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[hangs_up, healthy], ""), connector);

    let request = parse("PUT /upload HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\n\r\n");
    let mut body = RequestBody::Buffered(bytes::Bytes::from_static(b"abcde"));
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts().len(), 2);
    drop(upstream);
    drop(conn);
    assert_eq!(body_of(&drain(client).await), "abcde");
}

#[tokio::test]
async fn buffered_post_fails_over_after_send() {
    let hangs_up = spawn_backend(|_| async { Vec::new() }).await;
    let healthy = spawn_backend(|req| async move {
        ok_response(&String::from_utf8_lossy(&req.body))
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[hangs_up, healthy], ""), connector);

    let request = parse("POST /orders HTTP/1.1\r\nHost: test\r\nContent-Length: 2\r\n\r\n");
    let mut body = RequestBody::Buffered(bytes::Bytes::from_static(b"{}"));
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts().len(), 2);
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::Error));
    drop(upstream);
    drop(conn);
    assert_eq!(body_of(&drain(client).await), "{}");
}

#[tokio::test]
async fn cancelled_request_releases_connection() {
    let silent = spawn_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Vec::new()
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[silent], ""), connector.clone());

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, _client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let waited = tokio::time::timeout(Duration::from_millis(200), upstream.run()).await;
    assert!(waited.is_err());
    assert_eq!(upstream.phase(), Phase::Active);
    assert_eq!(connector.connects(), 1);
    drop(upstream);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn read_timeout_ends_in_gateway_timeout() {
    let silent = spawn_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Vec::new()
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[silent], "read_timeout_ms = 200"), connector.clone());

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, _client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let completion = upstream.run().await;
    assert!(matches!(completion, Completion::ErrorPage { status: 504, .. }));
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::Timeout));
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn client_leaving_while_waiting_releases_backend() {
    let silent = spawn_backend(|_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Vec::new()
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[silent], ""), connector.clone());

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();
    drop(client);

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    let completion = tokio::time::timeout(Duration::from_secs(5), upstream.run())
        .await
        .expect("client close was not noticed");
    assert_eq!(completion, Completion::ClientClosed);
    assert_eq!(upstream.phase(), Phase::Finalized);
    assert_eq!(connector.releases(), 1);
}

#[tokio::test]
async fn cache_fill_survives_client_leaving() {
    let backend = spawn_backend(|_| async { ok_response("cached body") }).await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(&[backend], "[proxy.cache]\nenabled = true\nvalid = [{ secs = 60 }]"),
        connector,
    );

    let request = parse("GET /page HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();
    drop(client);

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::ClientClosed);
    drop(upstream);

    let cache = ctx.cache.as_ref().unwrap();
    match cache.lookup("test/page") {
        Lookup::Hit(entry) => {
            assert_eq!(entry.status, 200);
            assert_eq!(&entry.body[..], b"cached body");
        }
        other => panic!("expected a fresh entry, got {}", other.label()),
    }
}

#[tokio::test]
async fn stale_entry_answers_when_every_server_fails() {
    let dead = closed_port().await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(
            &[dead],
            "[proxy.cache]\nenabled = true\nvalid = [{ secs = 60 }]\nuse_stale = [\"error\"]",
        ),
        connector,
    );

    let cache = ctx.cache.clone().unwrap();
    let handle = cache.begin_write("test/old").unwrap();
    cache
        .commit(
            handle,
            CachedResponse {
                status: 200,
                reason: "OK".into(),
                headers: OutboundHeaders::new(),
                body: bytes::Bytes::from_static(b"old copy"),
                stored_at: SystemTime::now() - Duration::from_secs(120),
                valid_for: Duration::from_secs(60),
            },
        )
        .unwrap();
    assert_eq!(cache.lookup("test/old").label(), "stale");

    let request = parse("GET /old HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::Error));
    drop(upstream);
    drop(conn);
    assert_eq!(body_of(&drain(client).await), "old copy");
}

#[tokio::test]
async fn dead_pooled_connection_costs_no_try() {
    let backend = spawn_backend(|_| async { ok_response("fresh") }).await;
    let connector = Arc::new(CountingConnector::with_stale_connection());
    let mut ctx = route_context(&config_text(&[backend], ""), connector.clone());
    let outcomes = record_outcomes(&mut ctx);

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.remaining_tries(), 1);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts().len(), 2);
    assert_eq!(upstream.attempts()[0].failure, Some(FailureKind::Error));
    assert_eq!(upstream.remaining_tries(), 1);
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![(backend, PeerOutcome::Next), (backend, PeerOutcome::Success)]
    );
    drop(upstream);
    assert_eq!(connector.connects(), 2);

    drop(conn);
    assert_eq!(body_of(&drain(client).await), "fresh");
}

#[tokio::test]
async fn stored_response_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(|_| async { ok_response("stored body") }).await;
    let connector = Arc::new(CountingConnector::default());
    let proxy = format!(
        "store = true\nstore_path = \"{}/{{uri}}\"",
        dir.path().display()
    );
    let ctx = route_context(&config_text(&[backend], &proxy), connector);

    let request = parse("GET /pages/index.html HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair();

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    drop(upstream);

    let stored = std::fs::read(dir.path().join("pages/index.html")).unwrap();
    assert_eq!(stored, b"stored body");
    drop(conn);
    assert_eq!(body_of(&drain(client).await), "stored body");
}

#[tokio::test]
async fn slow_client_gets_whole_direct_body() {
    let payload = "x".repeat(20_000);
    let sent = payload.clone();
    let backend = spawn_backend(move |_| {
        let body = sent.clone();
        async move { ok_response(&body) }
    })
    .await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(
        &config_text(&[backend], "buffering = false\nbuffer_size = 1024"),
        connector,
    );

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, client) = client_pair_with(64);
    let reader = tokio::spawn(drain(client));

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::Responded { status: 200 });
    assert_eq!(upstream.attempts()[0].bytes, 20_000);
    drop(upstream);
    drop(conn);

    let response = reader.await.unwrap();
    assert_eq!(body_of(&response), payload);
}

#[rstest]
#[case("buffering = true")]
#[case("buffering = false")]
#[tokio::test]
async fn aborted_client_counts_only_delivered_bytes(#[case] proxy: &str) {
    let backend = spawn_backend(|_| async { ok_response(&"y".repeat(64 * 1024)) }).await;
    let connector = Arc::new(CountingConnector::default());
    let ctx = route_context(&config_text(&[backend], proxy), connector.clone());

    let request = parse("GET / HTTP/1.1\r\nHost: test\r\n\r\n");
    let mut body = RequestBody::Empty;
    let (mut conn, mut client) = client_pair_with(1024);
    tokio::spawn(async move {
        let mut head = [0u8; 512];
        let _ = client.read(&mut head).await;
    });

    let mut upstream = UpstreamRequest::new(&ctx, &request, &mut body, &mut conn);
    assert_eq!(upstream.run().await, Completion::ClientClosed);
    let delivered = upstream.attempts()[0].bytes;
    assert!(delivered < 4096, "counted {delivered} bytes");
    drop(upstream);
    assert_eq!(connector.releases(), 1);
}
