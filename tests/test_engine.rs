//! Tests for the forwarding engine

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use vanguard::config::ProxyRuleConfig;
use vanguard::http::request::{Method, Request, RequestBuilder};
use vanguard::proxy::relay::FailureKind;
use vanguard::proxy::{ForwardingEngine, Outcome, Relay, RuleSet};

fn engine_with(rules: Vec<ProxyRuleConfig>) -> ForwardingEngine {
    let rules = RuleSet::from_config(&rules).unwrap();
    ForwardingEngine::new(Arc::new(rules), Relay::default())
}

fn rule(prefix: &str, target: &str) -> ProxyRuleConfig {
    ProxyRuleConfig {
        prefix: prefix.to_string(),
        target: target.to_string(),
        rewrite_origin: true,
        verify_tls: true,
    }
}

fn get(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .version("HTTP/1.1")
        .header("Host", "localhost:8081")
        .build()
        .unwrap()
}

async fn spawn_upstream(response: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            if received.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        sock.write_all(&response).await.unwrap();
        sock.shutdown().await.unwrap();
        received
    });

    (addr, handle)
}

#[tokio::test]
async fn test_unmatched_request_is_delegated() {
    let engine = engine_with(vec![rule("/api", "http://localhost:8080")]);
    let (mut proxy_side, _client) = duplex(4096);

    let outcome = engine.handle(&get("/index.html"), &mut proxy_side).await;
    assert!(matches!(outcome, Outcome::Delegated));
}

#[tokio::test]
async fn test_empty_ruleset_always_delegates() {
    let engine = engine_with(vec![]);
    let (mut proxy_side, _client) = duplex(4096);

    for path in ["/", "/api/users", "/anything?q=1"] {
        let outcome = engine.handle(&get(path), &mut proxy_side).await;
        assert!(matches!(outcome, Outcome::Delegated), "path {path:?}");
    }
}

#[tokio::test]
async fn test_matched_request_is_relayed_with_rewritten_origin() {
    let (addr, upstream) = spawn_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
    )
    .await;

    let engine = engine_with(vec![rule("/api", &format!("http://{}", addr))]);
    let (mut proxy_side, mut client) = duplex(64 * 1024);

    let outcome = engine.handle(&get("/api/users"), &mut proxy_side).await;
    drop(proxy_side);

    let summary = match outcome {
        Outcome::Relayed(summary) => summary,
        other => panic!("expected a relayed outcome, got {other:?}"),
    };
    assert_eq!(summary.status, 200);

    let mut relayed = Vec::new();
    client.read_to_end(&mut relayed).await.unwrap();
    assert!(String::from_utf8_lossy(&relayed).starts_with("HTTP/1.1 200 OK\r\n"));

    // The upstream sees the same path and a first-party Host header.
    let seen = String::from_utf8_lossy(&upstream.await.unwrap()).to_string();
    assert!(seen.contains("GET /api/users HTTP/1.1"));
    assert!(seen.contains(&format!("Host: {}", addr)));
    assert!(!seen.contains("localhost:8081"));
}

#[tokio::test]
async fn test_host_preserved_when_rewrite_origin_is_off() {
    let (addr, upstream) = spawn_upstream(
        b"HTTP/1.1 204 No Content\r\n\r\n".to_vec(),
    )
    .await;

    let mut passthrough = rule("/api", &format!("http://{}", addr));
    passthrough.rewrite_origin = false;

    let engine = engine_with(vec![passthrough]);
    let (mut proxy_side, _client) = duplex(64 * 1024);

    let outcome = engine.handle(&get("/api/users"), &mut proxy_side).await;
    assert!(matches!(outcome, Outcome::Relayed(_)));

    let seen = String::from_utf8_lossy(&upstream.await.unwrap()).to_string();
    assert!(seen.contains("Host: localhost:8081"));
}

#[tokio::test]
async fn test_unreachable_upstream_answers_502() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let engine = engine_with(vec![rule("/api", &format!("http://{}", addr))]);
    let (mut proxy_side, mut client) = duplex(64 * 1024);

    let outcome = engine.handle(&get("/api/users"), &mut proxy_side).await;
    drop(proxy_side);

    let kind = match outcome {
        Outcome::Failed(kind) => kind,
        other => panic!("expected a failed outcome, got {other:?}"),
    };
    assert!(matches!(kind, FailureKind::UpstreamUnreachable(_)));

    let mut relayed = Vec::new();
    client.read_to_end(&mut relayed).await.unwrap();
    let relayed = String::from_utf8_lossy(&relayed);

    assert!(relayed.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(relayed.contains("502 Bad Gateway"));
}

#[tokio::test]
async fn test_first_matching_rule_decides_the_target() {
    let (addr, upstream) = spawn_upstream(
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
    )
    .await;

    // The second rule's upstream does not even exist; declaration order
    // sends the request to the first.
    let engine = engine_with(vec![
        rule("/api", &format!("http://{}", addr)),
        rule("/api/v2", "http://127.0.0.1:1"),
    ]);
    let (mut proxy_side, _client) = duplex(64 * 1024);

    let outcome = engine.handle(&get("/api/v2/users"), &mut proxy_side).await;
    assert!(matches!(outcome, Outcome::Relayed(_)));

    let seen = String::from_utf8_lossy(&upstream.await.unwrap()).to_string();
    assert!(seen.contains("GET /api/v2/users HTTP/1.1"));
}
