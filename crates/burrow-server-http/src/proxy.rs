//! Reverse proxy pipeline
//!
//! Every proxied request opens a fresh TCP connection to the tunnel's target,
//! so one slow upstream can only ever stall the request that is using it.
//! Bodies stream through in both directions without being buffered.

use crate::{empty_body, ProxyBody};
use burrow_proto::Target;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Tunnel {0} is not connected")]
    TunnelNotProxyable(String),

    #[error("Failed to connect to {target}: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    #[error("Upstream {target} did not respond within {timeout:?}")]
    UpstreamTimeout { target: String, timeout: Duration },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Status code returned to the public caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Upstream timeouts
#[derive(Debug, Clone, Copy)]
pub struct ProxySettings {
    /// Bound on establishing the outbound TCP connection
    pub connect_timeout: Duration,
    /// Bound on waiting for the upstream's response headers; body streaming is uncapped
    pub response_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// Where a public request came from, for the `x-forwarded-*` headers
#[derive(Debug, Clone)]
pub struct ForwardedFor {
    pub client_addr: SocketAddr,
    pub public_host: Option<String>,
    pub secure: bool,
}

/// Forwards one public request to a tunnel target
pub struct ReverseProxy {
    settings: ProxySettings,
    /// Cancelled when the public listener stops; ends spliced WebSocket sessions
    sessions: CancellationToken,
}

impl ReverseProxy {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            sessions: CancellationToken::new(),
        }
    }

    /// Tear down every spliced WebSocket session
    pub fn close_sessions(&self) {
        self.sessions.cancel();
    }

    /// Forward `request` to `target`, rewriting its path to `forward_path`
    pub async fn forward(
        &self,
        request: Request<Incoming>,
        target: &Target,
        forward_path: &str,
        forwarded: &ForwardedFor,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if is_websocket_upgrade(&request) {
            return self
                .forward_upgrade(request, target, forward_path, forwarded)
                .await;
        }

        let mut sender = self.open(target, false).await?;

        let (mut parts, body) = request.into_parts();
        parts.uri = parse_path(forward_path)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        rewrite_host(&mut parts.headers, target)?;
        add_forwarded_headers(&mut parts.headers, forwarded);

        debug!(
            method = %parts.method,
            path = %forward_path,
            %target,
            "Forwarding request"
        );

        let response = self
            .await_response(sender.send_request(Request::from_parts(parts, body)), target)
            .await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        trace!(status = %parts.status, %target, "Streaming upstream response");

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Forward a WebSocket upgrade and, once the upstream switches protocols,
    /// splice the two upgraded connections together
    ///
    /// The upgrade headers go upstream untouched; any bytes either side sent
    /// right after its handshake are carried by the upgraded connection.
    async fn forward_upgrade(
        &self,
        mut request: Request<Incoming>,
        target: &Target,
        forward_path: &str,
        forwarded: &ForwardedFor,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let mut sender = self.open(target, true).await?;

        let client_upgrade = hyper::upgrade::on(&mut request);

        let (mut parts, body) = request.into_parts();
        parts.uri = parse_path(forward_path)?;
        parts.version = Version::HTTP_11;
        rewrite_host(&mut parts.headers, target)?;
        add_forwarded_headers(&mut parts.headers, forwarded);

        debug!(path = %forward_path, %target, "Forwarding WebSocket upgrade");

        let mut response = self
            .await_response(sender.send_request(Request::from_parts(parts, body)), target)
            .await?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(status = %response.status(), %target, "Upstream declined the upgrade");
            return Ok(response.map(|body| body.boxed()));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        let target_label = target.to_string();
        let closed = self.sessions.child_token();

        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(target = %target_label, "WebSocket upgrade failed: {}", e);
                    return;
                }
            };

            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);

            let spliced = tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client, &mut upstream) => result,
                _ = closed.cancelled() => {
                    debug!(target = %target_label, "Closing WebSocket session for shutdown");
                    return;
                }
            };

            match spliced {
                Ok((from_client, from_upstream)) => {
                    debug!(
                        target = %target_label,
                        from_client,
                        from_upstream,
                        "WebSocket session ended"
                    );
                }
                Err(e) => {
                    debug!(target = %target_label, "WebSocket splice error: {}", e);
                }
            }
        });

        let (parts, _body) = response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }

    async fn open(
        &self,
        target: &Target,
        with_upgrades: bool,
    ) -> Result<http1::SendRequest<Incoming>, ProxyError> {
        let stream = connect(target, self.settings.connect_timeout).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;

        let target_label = target.to_string();
        if with_upgrades {
            tokio::spawn(async move {
                if let Err(e) = conn.with_upgrades().await {
                    debug!(target = %target_label, "Upstream connection closed: {}", e);
                }
            });
        } else {
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(target = %target_label, "Upstream connection closed: {}", e);
                }
            });
        }

        Ok(sender)
    }

    async fn await_response<F>(
        &self,
        response: F,
        target: &Target,
    ) -> Result<Response<Incoming>, ProxyError>
    where
        F: std::future::Future<Output = Result<Response<Incoming>, hyper::Error>>,
    {
        let timeout = self.settings.response_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::UpstreamTimeout {
                target: target.to_string(),
                timeout,
            }),
        }
    }
}

async fn connect(target: &Target, timeout: Duration) -> Result<TcpStream, ProxyError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target.authority()))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout {
            target: target.to_string(),
            timeout,
        })?
        .map_err(|e| ProxyError::UpstreamUnreachable {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn parse_path(forward_path: &str) -> Result<Uri, ProxyError> {
    forward_path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("bad path '{}': {}", forward_path, e)))
}

/// True for `Connection: upgrade` + `Upgrade: websocket` requests
pub fn is_websocket_upgrade<B>(request: &Request<B>) -> bool {
    let headers = request.headers();

    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    upgrade && connection
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn rewrite_host(headers: &mut HeaderMap, target: &Target) -> Result<(), ProxyError> {
    let host = HeaderValue::from_str(&target.authority())
        .map_err(|e| ProxyError::InvalidRequest(format!("bad target host: {}", e)))?;
    headers.insert(header::HOST, host);
    Ok(())
}

fn add_forwarded_headers(headers: &mut HeaderMap, forwarded: &ForwardedFor) {
    let client_ip = forwarded.client_addr.ip().to_string();
    let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = forwarded
        .public_host
        .as_deref()
        .and_then(|h| HeaderValue::from_str(h).ok())
    {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if forwarded.secure { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}
