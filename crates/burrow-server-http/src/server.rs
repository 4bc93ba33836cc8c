//! Public HTTP server

use crate::api;
use crate::proxy::{ForwardedFor, ProxyError, ProxySettings, ReverseProxy};
use crate::ProxyBody;
use burrow_router::{
    AddressingScheme, IdentifierResolver, RegistryError, Resolution, TunnelRegistry,
};
use http::header;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    pub addressing_scheme: AddressingScheme,
    /// Advertise `https://` URLs (TLS is terminated in front of the broker)
    pub secure_public_scheme: bool,
    pub landing_page: bool,
    pub proxy: ProxySettings,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            addressing_scheme: AddressingScheme::default(),
            secure_public_scheme: false,
            landing_page: true,
            proxy: ProxySettings::default(),
        }
    }
}

/// State shared by every request on the public listener
pub(crate) struct HttpState {
    pub(crate) registry: Arc<TunnelRegistry>,
    pub(crate) resolver: IdentifierResolver,
    pub(crate) proxy: ReverseProxy,
    pub(crate) config: HttpServerConfig,
    /// Host used in public URLs when a request carries no `Host` header
    pub(crate) default_host: String,
}

/// Public HTTP listener: API plus reverse proxy
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<HttpState>,
}

impl HttpServer {
    /// Bind the public listener
    pub async fn bind(
        config: HttpServerConfig,
        registry: Arc<TunnelRegistry>,
    ) -> Result<Self, HttpServerError> {
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            HttpServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        let state = HttpState {
            registry,
            resolver: IdentifierResolver::new(config.addressing_scheme),
            proxy: ReverseProxy::new(config.proxy),
            default_host: local_addr.to_string(),
            config,
        };

        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, one task per
    /// connection
    ///
    /// Returns once every open connection and WebSocket session is closed.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        info!(
            "HTTP server listening on {} ({} addressing)",
            self.local_addr()?,
            self.state.config.addressing_scheme
        );

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        debug!("Accepted HTTP connection from {}", peer_addr);
                        let state = self.state.clone();
                        let closed = shutdown.child_token();
                        connections.spawn(serve_connection(socket, peer_addr, state, closed));
                    }
                    Err(e) => {
                        error!("Failed to accept HTTP connection: {}", e);
                    }
                },
            }
        }

        drop(self.listener);
        self.state.proxy.close_sessions();
        info!(connections = connections.len(), "HTTP server stopping");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<HttpState>,
    closed: CancellationToken,
) {
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(req, &state, peer_addr).await) }
    });

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(socket), service)
        .with_upgrades();

    tokio::select! {
        result = connection => {
            if let Err(e) = result {
                debug!("HTTP connection from {} ended: {}", peer_addr, e);
            }
        }
        _ = closed.cancelled() => {
            debug!("Closing HTTP connection from {} for shutdown", peer_addr);
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: &HttpState,
    peer_addr: SocketAddr,
) -> Response<ProxyBody> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()));
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let resolution = if api::is_api_path(req.uri().path()) {
        Resolution::NotFound
    } else {
        state.resolver.resolve(host.as_deref(), &path_and_query)
    };

    if let Resolution::Found {
        tunnel_id,
        forward_path,
    } = resolution
    {
        match state.registry.proxy_target(&tunnel_id) {
            Ok(target) => {
                let forwarded = ForwardedFor {
                    client_addr: peer_addr,
                    public_host: host.clone(),
                    secure: state.config.secure_public_scheme,
                };

                return match state
                    .proxy
                    .forward(req, &target, &forward_path, &forwarded)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(tunnel_id = %tunnel_id, %target, "Proxy error: {}", e);
                        api::error_response(e.status_code(), e.to_string())
                    }
                };
            }
            Err(RegistryError::TunnelNotProxyable(_))
                if !is_legacy_create(state, req.method(), req.uri().path()) =>
            {
                debug!(tunnel_id = %tunnel_id, "Tunnel has no live target");
                let e = ProxyError::TunnelNotProxyable(tunnel_id);
                return api::error_response(e.status_code(), e.to_string());
            }
            // Unknown identifiers (and legacy create requests) are API requests
            Err(_) => {}
        }
    }

    api::handle(
        state,
        req.method(),
        req.uri().path(),
        req.uri().query(),
        host.as_deref(),
    )
    .await
}

/// Under legacy addressing `GET /<id>` doubles as the create endpoint, so a
/// pending tunnel answers it with its info instead of a `502`
fn is_legacy_create(state: &HttpState, method: &Method, path: &str) -> bool {
    state.config.addressing_scheme == AddressingScheme::Legacy
        && *method == Method::GET
        && path.trim_end_matches('/').matches('/').count() == 1
}
