//! Tests for the scoped TLS verification downgrade
//!
//! Runs a local HTTPS upstream with a freshly minted self-signed
//! certificate: rules that skip verification get through, rules that
//! verify are refused with an untrusted-upstream failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::TcpListener;
use vanguard::http::request::Method;
use vanguard::proxy::relay::{FailureKind, Relay};
use vanguard::proxy::rewrite::OutboundRequest;
use vanguard::proxy::rules::{Origin, Scheme};

fn outbound(addr: SocketAddr) -> OutboundRequest {
    let target = Origin {
        scheme: Scheme::Https,
        host: "localhost".to_string(),
        port: Some(addr.port()),
    };

    let mut headers = HashMap::new();
    headers.insert("Host".to_string(), target.host_header());

    OutboundRequest {
        method: Method::GET,
        target,
        path: "/api/ping".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
        body: Vec::new(),
        upgrade: false,
    }
}

/// HTTPS upstream with a self-signed cert for "localhost". Answers one
/// request and closes.
async fn spawn_self_signed_upstream() -> SocketAddr {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();

    let cert_der = cert.der().clone();
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(rustls::pki_types::PrivatePkcs8KeyDer::from(
        key.serialize_der(),
    ));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert_der], key_der)
    .unwrap();

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();

        // A verifying client aborts the handshake; that's expected.
        let Ok(mut tls) = acceptor.accept(sock).await else {
            return;
        };

        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tls.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let _ = tls
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecure")
            .await;
        let _ = tls.shutdown().await;
    });

    addr
}

#[tokio::test]
async fn test_verify_tls_false_accepts_self_signed_upstream() {
    let addr = spawn_self_signed_upstream().await;
    let request = outbound(addr);
    let (mut proxy_side, mut client) = duplex(64 * 1024);

    let relay = Relay::default();
    let summary = relay.relay(&request, false, &mut proxy_side).await.unwrap();
    drop(proxy_side);

    assert_eq!(summary.status, 200);
    assert_eq!(summary.body_bytes, 6);

    let mut relayed = Vec::new();
    client.read_to_end(&mut relayed).await.unwrap();
    assert!(String::from_utf8_lossy(&relayed).ends_with("secure"));
}

#[tokio::test]
async fn test_verify_tls_true_rejects_self_signed_upstream() {
    let addr = spawn_self_signed_upstream().await;
    let request = outbound(addr);
    let (mut proxy_side, _client) = duplex(4096);

    let relay = Relay::default();
    let err = relay
        .relay(&request, true, &mut proxy_side)
        .await
        .unwrap_err();

    assert!(
        matches!(err.kind, FailureKind::UpstreamUntrusted(_)),
        "expected an untrusted-upstream failure, got {:?}",
        err.kind
    );
    assert!(!err.response_started);
}
