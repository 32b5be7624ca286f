//! Outbound request construction
//!
//! Turns an inbound request plus its matched rule into the request sent
//! upstream. The inbound request is never mutated; path, query string and
//! body pass through byte-for-byte.

use crate::http::request::{Method, Request};
use crate::proxy::rules::{ForwardingRule, Origin};
use std::collections::HashMap;

/// A request addressed to an upstream origin.
///
/// Owns its own header map and body; it does not alias the inbound
/// request or its connection.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub target: Origin,
    /// Request-target exactly as received, query included. No prefix
    /// stripping: the upstream is expected to understand the same prefix.
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Carried over from the inbound protocol hint; the relay switches to
    /// a byte pipe when the upstream accepts the upgrade.
    pub upgrade: bool,
}

/// Rewrites an inbound request for the rule's target origin.
///
/// The target scheme and authority always come from the rule. When the
/// rule asks for an origin rewrite, any existing Host header (whatever its
/// capitalization) is replaced with the target's `host[:port]`; otherwise
/// the client's Host value is preserved bit-for-bit.
pub fn rewrite(request: &Request, rule: &ForwardingRule) -> OutboundRequest {
    let mut headers = request.headers.clone();

    if rule.rewrite_origin {
        headers.retain(|k, _| !k.eq_ignore_ascii_case("host"));
        headers.insert("Host".to_string(), rule.target.host_header());
    }

    OutboundRequest {
        method: request.method.clone(),
        target: rule.target.clone(),
        path: request.path.clone(),
        version: request.version.clone(),
        headers,
        body: request.body.clone(),
        upgrade: request.is_upgrade(),
    }
}
