//! Forwarding layer
//!
//! This module implements the core forwarding decision engine: rule
//! matching, request rewriting, and upstream relaying.

pub mod engine;
pub mod relay;
pub mod rewrite;
pub mod rules;

pub use engine::{ForwardingEngine, Outcome};
pub use relay::{FailureKind, Relay, RelaySummary};
pub use rewrite::{OutboundRequest, rewrite};
pub use rules::{ForwardingRule, MalformedRule, Origin, RuleSet, Scheme};
