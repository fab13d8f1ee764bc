//! Connection handling logic
//!
//! Drives one upgraded connection through its session: decode the first
//! chunk once, authenticate, dispatch to the TCP or DNS path, and tear
//! everything down exactly once whichever side ends first.

use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

use crate::core::{
    decode_header, select_route, DnsRelay, HeaderDescriptor, Route, Server, Session,
    SessionState, TcpRelay,
};
use crate::error::{Result, TunnelError};
use crate::logger::log;
use crate::transport::{
    ChunkReader, ChunkWriter, ConnectionMeta, TerminalEvent, TransportHandle, WebSocketTransport,
};

/// Chunks queued towards one client before relays wait
const WRITE_QUEUE: usize = 16;

/// Process a single upgraded connection
pub async fn process_connection<S>(
    server: &Server,
    ws_stream: WebSocketStream<S>,
    early_data: Option<String>,
    meta: ConnectionMeta,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_addr = meta.peer_addr.to_string();
    let handle = TransportHandle::with_parent(server.conn_manager.shutdown_token());
    let mut session = Session::new(meta.peer_addr, meta.protocol);

    let transport = match WebSocketTransport::new(
        ws_stream,
        early_data.as_deref(),
        handle.clone(),
        WRITE_QUEUE,
    ) {
        Ok(t) => t,
        Err(e) => {
            log::debug!(peer = %peer_addr, error = %e, "Invalid early data");
            session.transition(SessionState::Rejected);
            handle.close(TerminalEvent::Error);
            return Err(e);
        }
    };
    let WebSocketTransport {
        mut reader,
        writer,
    } = transport;

    let first = match read_first_chunk(&mut reader, server.conn_config.handshake_timeout).await {
        Ok(Some(chunk)) => chunk,
        Ok(None) => {
            log::debug!(peer = %peer_addr, "Closed before sending a header");
            session.close();
            return Ok(());
        }
        Err(e) => {
            log::debug!(peer = %peer_addr, error = %e, "No header received");
            session.close();
            handle.close(TerminalEvent::Cancelled);
            return Err(e);
        }
    };

    let (header, route) = match decode_and_route(server, &meta, &first) {
        Ok(decoded) => decoded,
        Err(e) => {
            if e.is_silent() {
                log::authentication(&peer_addr, false);
            } else {
                log::debug!(peer = %peer_addr, protocol = %meta.protocol, error = %e, "Rejected session");
            }
            session.transition(SessionState::Rejected);
            handle.close(TerminalEvent::Cancelled);
            return Err(e);
        }
    };

    session.transition(SessionState::Authenticated);
    log::authentication(&peer_addr, true);

    let (session_id, cancel_token) = server.conn_manager.register(meta.protocol);
    let _guard = scopeguard::guard((), |_| {
        server.conn_manager.unregister(session_id);
        log::debug!(session_id = session_id, "Session unregistered");
    });

    log::debug!(
        peer = %peer_addr,
        protocol = %meta.protocol,
        target = %header.address,
        route = ?route,
        session_id = session_id,
        "Session accepted"
    );

    let initial = first.slice(header.payload_offset..);
    session.transition(SessionState::Relaying);

    let result = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => {
            log::debug!(peer = %peer_addr, session_id = session_id, "Session cancelled");
            handle.close(TerminalEvent::Cancelled);
            Ok(())
        }
        result = dispatch(server, &meta, &header, route, initial, &mut reader, &writer) => result,
    };

    if let Err(ref e) = result {
        log::debug!(peer = %peer_addr, target = %header.address, error = %e, "Session failed");
        handle.close(TerminalEvent::Error);
    }
    session.close();

    // Dropping the writer flushes what is queued and closes the WebSocket
    drop(writer);
    log::debug!(
        peer = %peer_addr,
        session_id = session_id,
        terminal = ?handle.terminal_event(),
        "Session closed"
    );
    result
}

/// First inbound chunk, bounded by the handshake timeout
async fn read_first_chunk(reader: &mut ChunkReader, timeout: Duration) -> Result<Option<Bytes>> {
    match tokio::time::timeout(timeout, reader.next_chunk()).await {
        Ok(chunk) => chunk,
        Err(_) => Err(TunnelError::Transport(format!(
            "no header within {:?}",
            timeout
        ))),
    }
}

/// Decode with the endpoint's codec, then pick the outbound path
fn decode_and_route(
    server: &Server,
    meta: &ConnectionMeta,
    first: &[u8],
) -> Result<(HeaderDescriptor, Route)> {
    let header = decode_header(meta.protocol, first, &server.credentials)?;
    let route = select_route(&header)?;
    Ok((header, route))
}

async fn dispatch(
    server: &Server,
    meta: &ConnectionMeta,
    header: &HeaderDescriptor,
    route: Route,
    initial: Bytes,
    reader: &mut ChunkReader,
    writer: &ChunkWriter,
) -> Result<()> {
    let preamble = header.response_preamble();
    match route {
        Route::Tcp => {
            let stats = TcpRelay::new(meta.peer_addr, &server.conn_config, &server.egress)
                .run(&header.address, initial, preamble, reader, writer)
                .await?;
            log::debug!(
                peer = %meta.peer_addr,
                target = %header.address,
                attempt = %stats.attempt,
                up = stats.uplink,
                down = stats.downlink,
                "Relay completed"
            );
        }
        Route::Dns => {
            let stats = DnsRelay::new(meta.peer_addr, server.resolver.as_ref())
                .run(initial, preamble, reader, writer)
                .await?;
            log::debug!(
                peer = %meta.peer_addr,
                queries = stats.queries,
                answers = stats.answers,
                "DNS relay completed"
            );
        }
    }
    Ok(())
}
