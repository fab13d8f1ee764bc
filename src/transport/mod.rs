//! Transport adapter
//!
//! Turns an upgraded client connection into:
//! - [`ChunkReader`]: ordered inbound binary chunks, early data first
//! - [`ChunkWriter`]: outbound chunks, handed to a dedicated writer task
//! - [`TransportHandle`]: cloneable close handle shared by both halves
//!
//! Closing through the handle is idempotent and wakes any pending read or
//! write immediately.

mod tls;
mod ws;

pub use tls::load_tls_acceptor;
pub use ws::{decode_early_data, WebSocketTransport};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::ProtocolKind;
use crate::error::TunnelError;

/// Inbound chunk stream after framing has been stripped
pub type InboundStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// How a transport ended. Recorded once; later events are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Orderly close from either side
    Closed,
    /// Underlying connection failed
    Error,
    /// Closed locally (session teardown, shutdown)
    Cancelled,
}

/// Shared close handle for one transport
#[derive(Debug, Clone, Default)]
pub struct TransportHandle {
    cancel: CancellationToken,
    terminal: Arc<OnceLock<TerminalEvent>>,
}

impl TransportHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that also closes when `parent` is cancelled
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            terminal: Arc::new(OnceLock::new()),
        }
    }

    /// Close the transport. Returns true only for the call that recorded the
    /// terminal event.
    pub fn close(&self, event: TerminalEvent) -> bool {
        let first = self.terminal.set(event).is_ok();
        self.cancel.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the transport is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// The recorded terminal event. A parent cancellation that nobody
    /// recorded counts as `Cancelled`.
    pub fn terminal_event(&self) -> Option<TerminalEvent> {
        match self.terminal.get() {
            Some(event) => Some(*event),
            None if self.cancel.is_cancelled() => Some(TerminalEvent::Cancelled),
            None => None,
        }
    }
}

/// Client-to-server half
pub struct ChunkReader {
    early_data: Option<Bytes>,
    inbound: InboundStream,
    handle: TransportHandle,
}

impl ChunkReader {
    pub fn new(inbound: InboundStream, early_data: Option<Bytes>, handle: TransportHandle) -> Self {
        Self {
            early_data: early_data.filter(|d| !d.is_empty()),
            inbound,
            handle,
        }
    }

    /// Next inbound chunk; `Ok(None)` once the transport is closed
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if let Some(data) = self.early_data.take() {
            return Ok(Some(data));
        }
        if self.handle.is_closed() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = self.handle.closed() => Ok(None),
            item = self.inbound.next() => match item {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(e)) => {
                    self.handle.close(TerminalEvent::Error);
                    Err(TunnelError::Transport(e.to_string()))
                }
                None => {
                    self.handle.close(TerminalEvent::Closed);
                    Ok(None)
                }
            },
        }
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }
}

/// Server-to-client half.
///
/// Dropping the writer lets the writer task flush what is queued and then
/// close the connection; [`TransportHandle::close`] aborts without flushing.
pub struct ChunkWriter {
    tx: mpsc::Sender<Bytes>,
    handle: TransportHandle,
}

impl ChunkWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, handle: TransportHandle) -> Self {
        Self { tx, handle }
    }

    /// Queue one chunk for the client. Empty chunks are skipped.
    pub async fn send(&self, chunk: Bytes) -> Result<(), TunnelError> {
        if chunk.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.handle.closed() => Err(TunnelError::Transport("transport closed".into())),
            sent = self.tx.send(chunk) => {
                sent.map_err(|_| TunnelError::Transport("writer task gone".into()))
            }
        }
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }
}

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Endpoint the upgrade request was routed to
    pub protocol: ProtocolKind,
}
