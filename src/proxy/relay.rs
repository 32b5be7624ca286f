//! Upstream relay
//!
//! Performs the outbound call for a matched request: connects to the
//! target origin (TCP, with TLS on top for https targets), sends the
//! rewritten request, and streams the response back to the client without
//! buffering whole bodies. Upgrade handshakes accepted by the upstream
//! switch the exchange to a bidirectional byte pipe.

use crate::proxy::rewrite::OutboundRequest;
use crate::proxy::rules::Origin;
use crate::http::request::Method;
use bytes::BytesMut;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const BUFFER_SIZE: usize = 8192;
const MAX_HEAD_SIZE: usize = 64 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a relay operation failed.
#[derive(Debug, Error)]
pub enum FailureKind {
    /// Connection refused, DNS failure, reset, or a response the proxy
    /// could not make sense of. Reported to the client as 502.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Certificate verification failed while `verify_tls` was on.
    #[error("upstream certificate rejected: {0}")]
    UpstreamUntrusted(String),

    /// The upstream did not connect or answer in time. Reported as 504.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// The client went away mid-relay. Not an upstream fault.
    #[error("client closed the connection")]
    ClientAborted,
}

/// A relay failure plus whether response bytes already reached the client.
/// Once the head is on the wire no error response can be sent anymore.
#[derive(Debug)]
pub struct RelayError {
    pub kind: FailureKind,
    pub response_started: bool,
}

impl From<FailureKind> for RelayError {
    fn from(kind: FailureKind) -> Self {
        Self {
            kind,
            response_started: false,
        }
    }
}

/// What a completed relay looked like, for logging and connection
/// lifecycle decisions.
#[derive(Debug, Clone, Copy)]
pub struct RelaySummary {
    pub status: u16,
    pub body_bytes: u64,
    pub upgraded: bool,
}

/// Outbound byte stream, plain or TLS.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Performs upstream calls. One relay operation exclusively owns its
/// upstream connection; nothing is shared across requests.
pub struct Relay {
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT)
    }
}

impl Relay {
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            response_timeout,
        }
    }

    /// Sends `outbound` upstream and relays the response into `client`.
    ///
    /// Plain exchanges stream the body chunk-by-chunk (exact
    /// Content-Length when declared, until upstream EOF otherwise).
    /// Upgrade handshakes answered with 101 turn into a bidirectional
    /// tunnel that runs until either peer closes. No retries.
    pub async fn relay<C>(
        &self,
        outbound: &OutboundRequest,
        verify_tls: bool,
        client: &mut C,
    ) -> Result<RelaySummary, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream = self.connect(&outbound.target, verify_tls).await?;

        tracing::trace!(target = %outbound.target, "Connected to upstream");

        let request_bytes = serialize_outbound(outbound);
        upstream
            .write_all(&request_bytes)
            .await
            .map_err(|e| FailureKind::UpstreamUnreachable(e.to_string()))?;
        upstream
            .flush()
            .await
            .map_err(|e| FailureKind::UpstreamUnreachable(e.to_string()))?;

        let (mut head, leftover) = self.read_head(&mut upstream).await?;

        tracing::debug!(status = head.status, target = %outbound.target, "Upstream responded");

        if outbound.upgrade && head.status == 101 {
            return self.tunnel(head, leftover, &mut upstream, client).await;
        }

        // The upstream connection is close-delimited; its connection
        // management headers are not the client's business.
        head.remove_header("Connection");
        head.remove_header("Keep-Alive");
        head.remove_header("Proxy-Connection");
        head.push_header("Connection", "close");

        let content_length = head.content_length();
        let status = head.status;

        client.write_all(&head.to_bytes()).await.map_err(|_| RelayError {
            kind: FailureKind::ClientAborted,
            response_started: false,
        })?;

        let body_bytes = if response_has_body(&outbound.method, status) {
            self.stream_body(&mut upstream, client, leftover, content_length)
                .await?
        } else {
            client.flush().await.map_err(|_| RelayError {
                kind: FailureKind::ClientAborted,
                response_started: true,
            })?;
            0
        };

        Ok(RelaySummary {
            status,
            body_bytes,
            upgraded: false,
        })
    }

    async fn connect(
        &self,
        origin: &Origin,
        verify_tls: bool,
    ) -> Result<Box<dyn UpstreamIo>, FailureKind> {
        let addr = (origin.host.as_str(), origin.effective_port());

        let tcp = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FailureKind::UpstreamTimeout(self.connect_timeout))?
            .map_err(|e| FailureKind::UpstreamUnreachable(format!("{}: {}", origin, e)))?;

        if !origin.scheme.is_tls() {
            return Ok(Box::new(tcp));
        }

        let connector = tls_connector(verify_tls)?;
        let server_name = rustls::pki_types::ServerName::try_from(origin.host.clone())
            .map_err(|e| FailureKind::UpstreamUnreachable(format!("{}: {}", origin.host, e)))?;

        let tls = timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| FailureKind::UpstreamTimeout(self.connect_timeout))?
            .map_err(|e| classify_tls_error(e, &origin.host))?;

        Ok(Box::new(tls))
    }

    /// Reads the response head, returning it plus any body bytes that
    /// arrived in the same reads.
    async fn read_head(
        &self,
        upstream: &mut Box<dyn UpstreamIo>,
    ) -> Result<(ResponseHead, BytesMut), RelayError> {
        let deadline = self.response_timeout;

        let result = timeout(deadline, async {
            let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

            loop {
                if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head_bytes = buffer.split_to(end + 4);
                    let head = ResponseHead::parse(&head_bytes)?;
                    return Ok((head, buffer));
                }

                if buffer.len() > MAX_HEAD_SIZE {
                    return Err(FailureKind::UpstreamUnreachable(
                        "response head too large".to_string(),
                    ));
                }

                let n = upstream
                    .read_buf(&mut buffer)
                    .await
                    .map_err(|e| FailureKind::UpstreamUnreachable(e.to_string()))?;

                if n == 0 {
                    return Err(FailureKind::UpstreamUnreachable(
                        "connection closed before response head".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner.map_err(RelayError::from),
            Err(_) => Err(FailureKind::UpstreamTimeout(deadline).into()),
        }
    }

    /// Streams the response body to the client. `limit` is the declared
    /// Content-Length; without one, bytes flow until upstream EOF. Each
    /// chunk is flushed so event streams are observable immediately.
    async fn stream_body<C>(
        &self,
        upstream: &mut Box<dyn UpstreamIo>,
        client: &mut C,
        leftover: BytesMut,
        limit: Option<u64>,
    ) -> Result<u64, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut remaining = limit;
        let mut total: u64 = 0;

        let aborted = |_| RelayError {
            kind: FailureKind::ClientAborted,
            response_started: true,
        };

        if !leftover.is_empty() {
            let take = match remaining {
                Some(r) => (leftover.len() as u64).min(r) as usize,
                None => leftover.len(),
            };
            client.write_all(&leftover[..take]).await.map_err(aborted)?;
            client.flush().await.map_err(aborted)?;
            total += take as u64;
            if let Some(r) = &mut remaining {
                *r -= take as u64;
            }
        }

        let mut buf = [0u8; BUFFER_SIZE];
        let mut probe = [0u8; 512];

        enum Event {
            Upstream(std::io::Result<usize>),
            Client(std::io::Result<usize>),
        }

        loop {
            if remaining == Some(0) {
                break;
            }

            // Watch the client while waiting on the upstream: a client
            // that goes away mid-stream must close the upstream promptly,
            // not when the next write happens to fail.
            let event = tokio::select! {
                n = upstream.read(&mut buf) => Event::Upstream(n),
                r = client.read(&mut probe) => Event::Client(r),
            };

            let n = match event {
                Event::Upstream(result) => result.map_err(|e| RelayError {
                    kind: FailureKind::UpstreamUnreachable(e.to_string()),
                    response_started: true,
                })?,

                Event::Client(Ok(0)) | Event::Client(Err(_)) => {
                    return Err(RelayError {
                        kind: FailureKind::ClientAborted,
                        response_started: true,
                    });
                }

                // Stray bytes from the client are ignored; the exchange
                // is close-delimited, so nothing more is expected.
                Event::Client(Ok(_)) => continue,
            };

            if n == 0 {
                if remaining.is_some() {
                    return Err(RelayError {
                        kind: FailureKind::UpstreamUnreachable(
                            "connection closed mid-body".to_string(),
                        ),
                        response_started: true,
                    });
                }
                break;
            }

            let take = match remaining {
                Some(r) => (n as u64).min(r) as usize,
                None => n,
            };

            client.write_all(&buf[..take]).await.map_err(aborted)?;
            client.flush().await.map_err(aborted)?;
            total += take as u64;
            if let Some(r) = &mut remaining {
                *r -= take as u64;
            }
        }

        Ok(total)
    }

    /// Relays a negotiated 101 and shuttles bytes both ways until either
    /// peer closes. Request/response framing stops here.
    async fn tunnel<C>(
        &self,
        head: ResponseHead,
        leftover: BytesMut,
        upstream: &mut Box<dyn UpstreamIo>,
        client: &mut C,
    ) -> Result<RelaySummary, RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let aborted = |_| RelayError {
            kind: FailureKind::ClientAborted,
            response_started: false,
        };

        client.write_all(&head.to_bytes()).await.map_err(aborted)?;
        if !leftover.is_empty() {
            client.write_all(&leftover).await.map_err(|_| RelayError {
                kind: FailureKind::ClientAborted,
                response_started: true,
            })?;
        }
        client.flush().await.map_err(|_| RelayError {
            kind: FailureKind::ClientAborted,
            response_started: true,
        })?;

        let piped = copy_bidirectional(client, upstream).await;

        let body_bytes = match piped {
            Ok((_, from_upstream)) => from_upstream + leftover.len() as u64,
            // Either peer dropping the socket mid-tunnel is a normal way
            // for an upgraded exchange to end.
            Err(e) => {
                tracing::debug!(error = %e, "Tunnel closed with error");
                leftover.len() as u64
            }
        };

        Ok(RelaySummary {
            status: 101,
            body_bytes,
            upgraded: true,
        })
    }
}

/// Serializes an outbound request for the wire.
///
/// Plain exchanges get hop-by-hop headers stripped and `Connection: close`
/// injected so the response may be close-delimited. Upgrade handshakes
/// keep their `Connection`/`Upgrade` pair untouched.
pub fn serialize_outbound(outbound: &OutboundRequest) -> Vec<u8> {
    let mut buffer = Vec::new();

    let path = if outbound.path.is_empty() {
        "/"
    } else {
        &outbound.path
    };

    buffer.extend_from_slice(
        format!("{} {} {}\r\n", outbound.method.as_str(), path, outbound.version).as_bytes(),
    );

    let mut headers = outbound.headers.clone();

    if !outbound.upgrade {
        headers.retain(|k, _| !is_hop_by_hop(k));
        headers.insert("Connection".to_string(), "close".to_string());
    }

    for (key, value) in &headers {
        buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }

    buffer.extend_from_slice(b"\r\n");

    if !outbound.body.is_empty() {
        buffer.extend_from_slice(&outbound.body);
    }

    buffer
}

fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 6] = [
        "Connection",
        "Keep-Alive",
        "Proxy-Connection",
        "Transfer-Encoding",
        "Upgrade",
        "TE",
    ];
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn response_has_body(method: &Method, status: u16) -> bool {
    *method != Method::HEAD && status >= 200 && status != 204 && status != 304
}

/// An upstream response head, kept raw: exact status code and header
/// order are preserved for relaying.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn parse(bytes: &[u8]) -> Result<Self, FailureKind> {
        let malformed = |what: &str| FailureKind::UpstreamUnreachable(format!("malformed response: {what}"));

        let text = std::str::from_utf8(bytes).map_err(|_| malformed("head is not UTF-8"))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().ok_or_else(|| malformed("empty head"))?;
        let mut parts = status_line.splitn(3, ' ');

        let version = parts.next().ok_or_else(|| malformed("missing version"))?;
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| malformed("bad status code"))?;
        let reason = parts.next().unwrap_or("").to_string();

        if !version.starts_with("HTTP/") {
            return Err(malformed("bad version"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| malformed("bad header line"))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            version: version.to_string(),
            status,
            reason,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        for (key, value) in &self.headers {
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

fn tls_connector(verify: bool) -> Result<TlsConnector, FailureKind> {
    let config = if verify {
        verified_tls_config()
    } else {
        insecure_tls_config()
    }?;
    Ok(TlsConnector::from(config))
}

fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn verified_tls_config() -> Result<Arc<rustls::ClientConfig>, FailureKind> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let roots: rustls::RootCertStore = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();

    let config = rustls::ClientConfig::builder_with_provider(ring_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| FailureKind::UpstreamUnreachable(format!("TLS setup: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Client config that skips certificate verification entirely.
///
/// Development-only: scoped to connections whose rule sets
/// `verify_tls: false`, never applied process-wide.
fn insecure_tls_config() -> Result<Arc<rustls::ClientConfig>, FailureKind> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(config.clone());
    }

    let config = rustls::ClientConfig::builder_with_provider(ring_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| FailureKind::UpstreamUnreachable(format!("TLS setup: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    Ok(CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Accepts any certificate chain and server name. Signature checks still
/// run so the handshake itself stays honest.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn classify_tls_error(err: std::io::Error, host: &str) -> FailureKind {
    let untrusted = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false);

    if untrusted {
        FailureKind::UpstreamUntrusted(format!("{host}: {err}"))
    } else {
        FailureKind::UpstreamUnreachable(format!("{host}: {err}"))
    }
}
