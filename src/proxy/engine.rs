//! Forwarding engine
//!
//! Composes matching, rewriting, and relaying for one inbound request.
//! Two terminal outcomes per request: a matched request is rewritten and
//! relayed (or answered with a gateway error), an unmatched one is handed
//! back so the static-asset collaborator can serve it.

use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::relay::{FailureKind, Relay, RelaySummary};
use crate::proxy::rewrite::rewrite;
use crate::proxy::rules::RuleSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// What happened to a request the engine was asked to handle.
#[derive(Debug)]
pub enum Outcome {
    /// A rule matched and the upstream response was relayed.
    Relayed(RelaySummary),
    /// A rule matched but the relay failed; an error response was written
    /// to the client where still possible.
    Failed(FailureKind),
    /// No rule matched; the caller serves the request itself.
    Delegated,
}

pub struct ForwardingEngine {
    rules: Arc<RuleSet>,
    relay: Relay,
}

impl ForwardingEngine {
    pub fn new(rules: Arc<RuleSet>, relay: Relay) -> Self {
        Self { rules, relay }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Handles one inbound request against the client's stream.
    ///
    /// Relay failures never propagate as errors: they are mapped to a
    /// gateway response here, and the connection task just closes.
    pub async fn handle<C>(&self, request: &Request, client: &mut C) -> Outcome
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(rule) = self.rules.matching(&request.path) else {
            return Outcome::Delegated;
        };

        tracing::debug!(
            prefix = %rule.prefix,
            target = %rule.target,
            method = ?request.method,
            path = %request.path,
            "Matched forwarding rule"
        );

        let outbound = rewrite(request, rule);

        match self.relay.relay(&outbound, rule.verify_tls, client).await {
            Ok(summary) => {
                tracing::info!(
                    status = summary.status,
                    method = ?request.method,
                    path = %request.path,
                    target = %rule.target,
                    upgraded = summary.upgraded,
                    "Request forwarded"
                );
                Outcome::Relayed(summary)
            }

            Err(err) => {
                match &err.kind {
                    // The client hung up; nothing to answer and nothing
                    // wrong upstream.
                    FailureKind::ClientAborted => {
                        tracing::debug!(
                            method = ?request.method,
                            path = %request.path,
                            "Client aborted mid-relay"
                        );
                    }
                    kind => {
                        tracing::warn!(
                            error = %kind,
                            method = ?request.method,
                            path = %request.path,
                            target = %rule.target,
                            "Failed to forward request"
                        );

                        if !err.response_started {
                            self.write_error_response(kind, client).await;
                        }
                    }
                }

                Outcome::Failed(err.kind)
            }
        }
    }

    async fn write_error_response<C>(&self, kind: &FailureKind, client: &mut C)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let (status, message) = match kind {
            FailureKind::UpstreamTimeout(_) => (
                StatusCode::GatewayTimeout,
                "504 Gateway Timeout\r\n\r\nThe upstream did not respond in time.",
            ),
            _ => (
                StatusCode::BadGateway,
                "502 Bad Gateway\r\n\r\nFailed to reach the upstream origin.",
            ),
        };

        let response = Response::plain_text(status, message);
        let mut writer = ResponseWriter::new(&response);

        // If this write fails the client is gone too; nothing left to do.
        if let Err(e) = writer.write_to_stream(client).await {
            tracing::debug!(error = %e, "Could not deliver error response");
        }
    }
}
