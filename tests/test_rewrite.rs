//! Tests for outbound request construction

use vanguard::config::ProxyRuleConfig;
use vanguard::http::request::{Method, Request, RequestBuilder};
use vanguard::proxy::rewrite::rewrite;
use vanguard::proxy::rules::{ForwardingRule, RuleSet};

fn api_rule(target: &str, rewrite_origin: bool) -> ForwardingRule {
    let rules = RuleSet::from_config(&[ProxyRuleConfig {
        prefix: "/api".to_string(),
        target: target.to_string(),
        rewrite_origin,
        verify_tls: true,
    }])
    .unwrap();

    rules.matching("/api").unwrap().clone()
}

fn api_request() -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path("/api/users")
        .version("HTTP/1.1")
        .header("Host", "localhost:8081")
        .header("Accept", "application/json")
        .build()
        .unwrap()
}

#[test]
fn test_rewrite_origin_replaces_host_header() {
    let rule = api_rule("http://localhost:8080", true);
    let request = api_request();

    let outbound = rewrite(&request, &rule);

    assert_eq!(outbound.headers.get("Host").unwrap(), "localhost:8080");
    assert_eq!(outbound.path, "/api/users");
    assert_eq!(outbound.target, rule.target);
}

#[test]
fn test_rewrite_origin_false_preserves_host_bit_for_bit() {
    let rule = api_rule("http://localhost:8080", false);
    let request = api_request();

    let outbound = rewrite(&request, &rule);

    assert_eq!(outbound.headers.get("Host").unwrap(), "localhost:8081");
}

#[test]
fn test_rewrite_replaces_host_regardless_of_spelling() {
    let rule = api_rule("http://backend.test", true);
    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/api")
        .header("host", "localhost:8081")
        .build()
        .unwrap();

    let outbound = rewrite(&request, &rule);

    // The lowercase spelling is gone, replaced by a single Host entry.
    assert_eq!(outbound.headers.get("Host").unwrap(), "backend.test");
    assert!(!outbound.headers.contains_key("host"));
}

#[test]
fn test_path_query_and_body_pass_through() {
    let rule = api_rule("http://localhost:8080", true);
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/api/search?q=rust&page=2")
        .header("Content-Type", "application/json")
        .body(b"{\"q\":\"rust\"}".to_vec())
        .build()
        .unwrap();

    let outbound = rewrite(&request, &rule);

    assert_eq!(outbound.method, Method::POST);
    assert_eq!(outbound.path, "/api/search?q=rust&page=2");
    assert_eq!(outbound.body, b"{\"q\":\"rust\"}");
    assert_eq!(
        outbound.headers.get("Content-Type").unwrap(),
        "application/json"
    );
}

#[test]
fn test_inbound_request_is_not_mutated() {
    let rule = api_rule("http://localhost:8080", true);
    let request = api_request();

    let _ = rewrite(&request, &rule);

    assert_eq!(request.header("Host"), Some("localhost:8081"));
    assert_eq!(request.path, "/api/users");
}

#[test]
fn test_upgrade_hint_carries_over() {
    let rule = api_rule("http://localhost:8080", true);

    let plain = api_request();
    assert!(!rewrite(&plain, &rule).upgrade);

    let handshake = RequestBuilder::new()
        .method(Method::GET)
        .path("/api/live")
        .header("Host", "localhost:8081")
        .header("Connection", "keep-alive, Upgrade")
        .header("Upgrade", "websocket")
        .build()
        .unwrap();

    assert!(rewrite(&handshake, &rule).upgrade);
}
