//! Forwarding rules and prefix matching
//!
//! A rule maps a literal path prefix to an upstream origin. Rules are
//! validated eagerly when the set is built and never change afterwards;
//! matching walks the declaration order and the first hit wins.

use crate::config::ProxyRuleConfig;
use std::fmt;
use thiserror::Error;

/// Schemes a rule target may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

/// An upstream origin: scheme + host + optional explicit port.
///
/// `port` is `None` when the configured URL relied on the scheme default,
/// so the Host header value can mirror the URL as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
}

impl Origin {
    /// Port to actually connect to.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Value for a rewritten Host header: `host` or `host:port`.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", scheme, self.host, port),
            None => write!(f, "{}://{}", scheme, self.host),
        }
    }
}

/// A validated forwarding rule.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub prefix: String,
    pub target: Origin,
    /// Overwrite the Host header with the target's host so the upstream
    /// perceives the request as first-party.
    pub rewrite_origin: bool,
    /// When false, upstream certificate-chain and hostname verification is
    /// skipped for this rule's connections. Development-only behavior.
    pub verify_tls: bool,
}

/// Rejected rule configurations. Any one of these aborts startup; a
/// partially-loaded rule set is never used.
#[derive(Debug, Error)]
pub enum MalformedRule {
    #[error("rule {index}: prefix must not be empty")]
    EmptyPrefix { index: usize },

    #[error("rule {index} ({prefix:?}): prefix must start with '/'")]
    RelativePrefix { index: usize, prefix: String },

    #[error("rule {index} ({prefix:?}): prefix must not contain '?' or '#'")]
    QueryInPrefix { index: usize, prefix: String },

    #[error("rule {index} ({prefix:?}): prefix already declared by an earlier rule")]
    DuplicatePrefix { index: usize, prefix: String },

    #[error("rule {index} ({prefix:?}): invalid target {target:?}: {reason}")]
    InvalidTarget {
        index: usize,
        prefix: String,
        target: String,
        reason: String,
    },
}

/// Ordered, immutable collection of forwarding rules.
///
/// Declaration order is significant: callers put more specific prefixes
/// first when overlap is intended.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ForwardingRule>,
}

impl RuleSet {
    /// Builds and validates the rule set from configuration.
    pub fn from_config(configs: &[ProxyRuleConfig]) -> Result<Self, MalformedRule> {
        let mut rules = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            let rule = validate_rule(index, config)?;

            if rules.iter().any(|r: &ForwardingRule| r.prefix == rule.prefix) {
                return Err(MalformedRule::DuplicatePrefix {
                    index,
                    prefix: rule.prefix,
                });
            }

            rules.push(rule);
        }

        Ok(Self { rules })
    }

    /// First rule whose prefix is a literal, byte-wise prefix of the
    /// request path. The query string never participates in matching.
    /// A miss is not an error; the caller delegates the request.
    pub fn matching(&self, path: &str) -> Option<&ForwardingRule> {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        self.rules.iter().find(|r| path.starts_with(r.prefix.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForwardingRule> {
        self.rules.iter()
    }
}

fn validate_rule(index: usize, config: &ProxyRuleConfig) -> Result<ForwardingRule, MalformedRule> {
    if config.prefix.is_empty() {
        return Err(MalformedRule::EmptyPrefix { index });
    }

    if !config.prefix.starts_with('/') {
        return Err(MalformedRule::RelativePrefix {
            index,
            prefix: config.prefix.clone(),
        });
    }

    if config.prefix.contains(['?', '#']) {
        return Err(MalformedRule::QueryInPrefix {
            index,
            prefix: config.prefix.clone(),
        });
    }

    let target = parse_origin(&config.target).map_err(|reason| MalformedRule::InvalidTarget {
        index,
        prefix: config.prefix.clone(),
        target: config.target.clone(),
        reason,
    })?;

    Ok(ForwardingRule {
        prefix: config.prefix.clone(),
        target,
        rewrite_origin: config.rewrite_origin,
        verify_tls: config.verify_tls,
    })
}

/// Parses a target as a bare origin. The target carries scheme, host and
/// port only; paths, queries and credentials are rejected because the
/// engine forwards the inbound path unmodified.
fn parse_origin(target: &str) -> Result<Origin, String> {
    let url = url::Url::parse(target).map_err(|e| e.to_string())?;

    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(format!("unsupported scheme {other:?}")),
    };

    let host = url
        .host_str()
        .ok_or_else(|| "missing host".to_string())?
        .to_string();

    if !matches!(url.path(), "" | "/") {
        return Err("target must not carry a path".to_string());
    }

    if url.query().is_some() || url.fragment().is_some() {
        return Err("target must not carry a query or fragment".to_string());
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err("target must not carry credentials".to_string());
    }

    Ok(Origin {
        scheme,
        host,
        port: url.port(),
    })
}
