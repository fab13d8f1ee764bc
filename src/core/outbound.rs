//! TCP outbound relay
//!
//! Connects to the decoded target, writes the payload that arrived with the
//! header, then pipes bytes both ways until either side is done.
//!
//! One retry is allowed per session: when the direct attempt fails to
//! connect, or the upstream goes away without sending a single byte, the
//! same port is tried once more through the fallback egress host.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use super::credentials::EgressPolicy;
use super::protocol::Address;
use crate::config::ConnConfig;
use crate::error::TunnelError;
use crate::logger::log;
use crate::transport::{ChunkReader, ChunkWriter};

/// Which egress an attempt used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Direct,
    Fallback,
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Direct => write!(f, "direct"),
            Attempt::Fallback => write!(f, "fallback"),
        }
    }
}

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream, including the initial payload
    pub uplink: u64,
    /// Upstream to client, excluding the response preamble
    pub downlink: u64,
    /// Attempt that carried the session
    pub attempt: Attempt,
}

/// `host:port`, with brackets for IPv6 literals
fn display_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Connect with an upper bound on the whole attempt, DNS included.
///
/// On timeout the pending connect is dropped, which releases the socket.
pub async fn connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, TunnelError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TunnelError::ConnectFailure {
            target: display_target(host, port),
            source,
        }),
        Err(_) => Err(TunnelError::ConnectTimeout {
            target: display_target(host, port),
            timeout,
        }),
    }
}

/// Which side ended a relay
enum Finished {
    Client(Result<(), TunnelError>),
    Upstream(Result<(), TunnelError>),
}

/// Outbound TCP path of one session
pub struct TcpRelay<'a> {
    peer: SocketAddr,
    config: &'a ConnConfig,
    egress: &'a EgressPolicy,
}

impl<'a> TcpRelay<'a> {
    pub fn new(peer: SocketAddr, config: &'a ConnConfig, egress: &'a EgressPolicy) -> Self {
        Self {
            peer,
            config,
            egress,
        }
    }

    /// Relay one session to `target`.
    ///
    /// `preamble` is prepended to the first upstream chunk only, whichever
    /// attempt produces it. Only `initial` is replayed on the fallback
    /// attempt; chunks already written to a failed upstream are lost.
    pub async fn run(
        &self,
        target: &Address,
        initial: Bytes,
        preamble: Bytes,
        reader: &mut ChunkReader,
        writer: &ChunkWriter,
    ) -> Result<RelayStats, TunnelError> {
        let host = target.host();
        let port = target.port();
        let mut preamble = Some(preamble).filter(|p| !p.is_empty());

        let err = match self
            .attempt(&host, port, Attempt::Direct, &initial, reader, writer, &mut preamble)
            .await
        {
            Ok(stats) => return Ok(stats),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        let Some(fallback) = self.egress.fallback_host() else {
            log::debug!(peer = %self.peer, target = %target, error = %err, "No fallback egress, giving up");
            return Err(err);
        };
        if reader.handle().is_closed() {
            return Err(err);
        }

        log::debug!(
            peer = %self.peer,
            target = %target,
            fallback = %fallback,
            error = %err,
            "Retrying through fallback egress"
        );

        match self
            .attempt(fallback, port, Attempt::Fallback, &initial, reader, writer, &mut preamble)
            .await
        {
            Ok(stats) => Ok(stats),
            Err(e) if e.is_retryable() => Err(TunnelError::RetryExhausted(Box::new(e))),
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        host: &str,
        port: u16,
        attempt: Attempt,
        initial: &Bytes,
        reader: &mut ChunkReader,
        writer: &ChunkWriter,
        preamble: &mut Option<Bytes>,
    ) -> Result<RelayStats, TunnelError> {
        let target = display_target(host, port);
        let mut stream = connect_with_timeout(host, port, self.config.connect_timeout)
            .await
            .inspect_err(|e| {
                log::debug!(peer = %self.peer, target = %target, attempt = %attempt, error = %e, "TCP connect failed")
            })?;
        if self.config.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }
        log::debug!(peer = %self.peer, target = %target, attempt = %attempt, "Connected to remote");

        if !initial.is_empty() {
            stream
                .write_all(initial)
                .await
                .map_err(|source| TunnelError::ConnectFailure {
                    target: target.clone(),
                    source,
                })?;
        }

        let mut stats = RelayStats {
            uplink: initial.len() as u64,
            downlink: 0,
            attempt,
        };

        // A stalled upstream blocks both pumps; the handle still ends the relay
        let handle = reader.handle().clone();
        let finished = {
            let (mut rd, mut wr) = stream.split();
            tokio::select! {
                biased;
                _ = handle.closed() => Finished::Client(Ok(())),
                r = pump_uplink(reader, &mut wr, &mut stats.uplink) => Finished::Client(r),
                r = pump_downlink(&mut rd, writer, preamble, self.config.buffer_size, &mut stats.downlink) => {
                    Finished::Upstream(r)
                }
            }
        };

        log::debug!(
            peer = %self.peer,
            target = %target,
            attempt = %attempt,
            uplink = stats.uplink,
            downlink = stats.downlink,
            "Relay finished"
        );

        match finished {
            Finished::Client(Err(e @ TunnelError::Transport(_)))
            | Finished::Upstream(Err(e @ TunnelError::Transport(_))) => Err(e),
            Finished::Client(Ok(())) => Ok(stats),
            Finished::Upstream(Ok(())) | Finished::Client(Err(_)) | Finished::Upstream(Err(_))
                if stats.downlink == 0 =>
            {
                Err(TunnelError::SilentUpstream(target))
            }
            Finished::Upstream(Ok(())) => Ok(stats),
            Finished::Client(Err(e)) | Finished::Upstream(Err(e)) => Err(e),
        }
    }
}

/// Client chunks to the upstream. Ends when the client is done.
async fn pump_uplink(
    reader: &mut ChunkReader,
    remote: &mut WriteHalf<'_>,
    sent: &mut u64,
) -> Result<(), TunnelError> {
    while let Some(chunk) = reader.next_chunk().await? {
        remote.write_all(&chunk).await?;
        *sent += chunk.len() as u64;
    }
    let _ = remote.shutdown().await;
    Ok(())
}

/// Upstream bytes to the client. Ends on upstream EOF.
async fn pump_downlink(
    remote: &mut ReadHalf<'_>,
    writer: &ChunkWriter,
    preamble: &mut Option<Bytes>,
    buffer_size: usize,
    received: &mut u64,
) -> Result<(), TunnelError> {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let n = remote.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        *received += n as u64;

        let data = buf.split().freeze();
        let chunk = match preamble.take() {
            Some(head) => {
                let mut out = BytesMut::with_capacity(head.len() + data.len());
                out.extend_from_slice(&head);
                out.extend_from_slice(&data);
                out.freeze()
            }
            None => data,
        };
        writer.send(chunk).await?;
    }
}
