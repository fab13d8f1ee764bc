//! Server startup and accept loop
//!
//! Binds the listener, terminates optional TLS, performs the WebSocket
//! upgrade and routes each upgrade path to the VLESS or Trojan endpoint.

use crate::config::ServerConfig;
use crate::core::{ProtocolKind, Server};
use crate::handler::process_connection;
use crate::logger::log;
use crate::transport::{load_tls_acceptor, ConnectionMeta};

use anyhow::{anyhow, Result};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::{HeaderValue, StatusCode};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// TCP keepalive interval. Dead peers are detected in ~45s (3 probes × 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Upgrade paths and the codec each one serves
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub vless_path: String,
    pub trojan_path: String,
}

impl Endpoints {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            vless_path: config.vless_path.clone(),
            trojan_path: config.trojan_path.clone(),
        }
    }

    /// Exact path match; anything else is not a tunnel endpoint
    pub fn route(&self, path: &str) -> Option<ProtocolKind> {
        if path == self.vless_path {
            Some(ProtocolKind::Vless)
        } else if path == self.trojan_path {
            Some(ProtocolKind::Trojan)
        } else {
            None
        }
    }
}

/// Bounded tungstenite buffers derived from the relay buffer size.
/// The defaults (unbounded write buffer, 64MB messages) are far too generous
/// for many concurrent tunnels.
pub fn build_ws_config(buffer_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .write_buffer_size(buffer_size)
        .max_write_buffer_size(buffer_size * 2)
        .max_message_size(Some(buffer_size * 4))
        .max_frame_size(Some(buffer_size * 2))
}

fn not_found() -> ErrorResponse {
    let mut reject = ErrorResponse::new(None);
    *reject.status_mut() = StatusCode::NOT_FOUND;
    reject
}

/// Upgrade one accepted stream and hand it to the session orchestrator
pub async fn accept_connection<S>(
    server: Arc<Server>,
    stream: S,
    peer_addr: SocketAddr,
    endpoints: &Endpoints,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut protocol = None;
    let mut early_data: Option<String> = None;

    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, mut response: Response| {
            let path = req.uri().path();
            let Some(kind) = endpoints.route(path) else {
                log::debug!(peer = %peer_addr, path = %path, "Unknown upgrade path");
                return Err(not_found());
            };
            protocol = Some(kind);

            // Early data rides in the subprotocol header; echo it back so
            // the client accepts the handshake
            if let Some(value) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                early_data = value.to_str().ok().map(str::to_owned);
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::clone(value));
            }
            Ok(response)
        },
        Some(build_ws_config(server.conn_config.buffer_size)),
    );

    let ws_stream = match tokio::time::timeout(server.conn_config.handshake_timeout, upgrade).await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => return Err(anyhow!("WebSocket upgrade failed: {}", e)),
        Err(_) => return Err(anyhow!("WebSocket upgrade timeout")),
    };
    let protocol = protocol.ok_or_else(|| anyhow!("upgrade completed without an endpoint"))?;

    let meta = ConnectionMeta {
        peer_addr,
        protocol,
    };
    process_connection(&server, ws_stream, early_data, meta).await?;
    Ok(())
}

/// Bind the configured listener and serve until shutdown
pub async fn run_server(server: Arc<Server>, config: &ServerConfig) -> Result<()> {
    let tls_acceptor = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
        _ => None,
    };

    let listener = bind_listener(&config.host, config.port, server.conn_config.tcp_backlog)?;
    serve(server, listener, tls_acceptor, Endpoints::from_config(config)).await
}

/// Accept loop. Returns once the shutdown token is cancelled.
pub async fn serve(
    server: Arc<Server>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    endpoints: Endpoints,
) -> Result<()> {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if server.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(server.conn_config.max_connections)))
    } else {
        None
    };

    let local_addr = listener.local_addr()?;
    let endpoints = Arc::new(endpoints);

    log::info!(
        address = %local_addr,
        tls = tls_acceptor.is_some(),
        max_connections = server.conn_config.max_connections,
        vless_path = %endpoints.vless_path,
        trojan_path = %endpoints.trojan_path,
        "Server started"
    );

    let shutdown = server.conn_manager.shutdown_token().clone();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let peer_addr = addr.to_string();
                log::connection(&peer_addr, "new");

                // Acquire connection permit (backpressure when at limit)
                let permit = if let Some(ref limiter) = conn_limiter {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                } else {
                    None
                };

                let server = Arc::clone(&server);
                let tls_acceptor = tls_acceptor.clone();
                let endpoints = Arc::clone(&endpoints);

                tokio::spawn(async move {
                    let _permit = permit;
                    let result = async {
                        if server.conn_config.tcp_nodelay {
                            let _ = stream.set_nodelay(true);
                        }

                        let keepalive = TcpKeepalive::new()
                            .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
                            .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
                        let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

                        if let Some(tls_acceptor) = tls_acceptor {
                            match tokio::time::timeout(
                                server.conn_config.handshake_timeout,
                                tls_acceptor.accept(stream),
                            )
                            .await
                            {
                                Ok(Ok(tls_stream)) => {
                                    log::debug!(peer = %peer_addr, "TLS handshake successful");
                                    accept_connection(server, tls_stream, addr, &endpoints).await
                                }
                                Ok(Err(e)) => Err(anyhow!("TLS handshake failed: {}", e)),
                                Err(_) => Err(anyhow!("TLS handshake timeout")),
                            }
                        } else {
                            accept_connection(server, stream, addr, &endpoints).await
                        }
                    }
                    .await;

                    if let Err(e) = result {
                        log::debug!(peer = %peer_addr, error = %e, "Connection error");
                    }
                    log::connection(&peer_addr, "closed");
                });
            }
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                if e.kind() == std::io::ErrorKind::Other {
                    break;
                }
            }
        }
    }

    log::info!("Listener stopped");
    Ok(())
}

/// Bind with SO_REUSEADDR for fast restarts and the configured backlog
fn bind_listener(host: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let socket_addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .or_else(|_| format!("[{}]:{}", host, port).parse())?;
    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}
