//! WebSocket transport
//!
//! Splits a WebSocket stream into a [`ChunkReader`] and a [`ChunkWriter`].
//! Uses a generic stream parameter so plain TCP and TLS connections are
//! handled the same way.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use super::{ChunkReader, ChunkWriter, InboundStream, TerminalEvent, TransportHandle};
use crate::error::TunnelError;
use crate::logger::log;

/// Upper bound for sending the close frame once the session is over
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Standard alphabet, padding optional
const EARLY_DATA_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode early data carried in `Sec-WebSocket-Protocol`.
///
/// The value is URL-safe base64 (`-` and `_`), padding optional. An absent
/// or empty value means no early data.
pub fn decode_early_data(header: &str) -> Result<Option<Bytes>, base64::DecodeError> {
    let header = header.trim();
    if header.is_empty() {
        return Ok(None);
    }
    let normalized = header.replace('-', "+").replace('_', "/");
    let data = EARLY_DATA_ENGINE.decode(normalized)?;
    Ok(Some(Bytes::from(data)).filter(|d| !d.is_empty()))
}

/// Both halves of an upgraded WebSocket connection
pub struct WebSocketTransport {
    pub reader: ChunkReader,
    pub writer: ChunkWriter,
}

impl WebSocketTransport {
    /// Wrap an accepted WebSocket.
    ///
    /// Malformed early data fails the whole transport. `write_queue` bounds
    /// the number of chunks waiting for the writer task.
    pub fn new<S>(
        ws_stream: WebSocketStream<S>,
        early_data_header: Option<&str>,
        handle: TransportHandle,
        write_queue: usize,
    ) -> Result<Self, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let early_data = match early_data_header {
            Some(header) => decode_early_data(header)?,
            None => None,
        };

        let (sink, stream) = ws_stream.split();

        let inbound: InboundStream = Box::pin(futures_util::stream::unfold(
            stream,
            |mut stream| async move {
                loop {
                    match stream.next().await {
                        Some(Ok(Message::Binary(data))) => return Some((Ok(data), stream)),
                        Some(Ok(Message::Close(_))) | None => return None,
                        // Skip non-binary messages
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Some((Err(io::Error::other(e)), stream)),
                    }
                }
            },
        ));

        let (tx, rx) = mpsc::channel(write_queue.max(1));
        tokio::spawn(write_loop(sink, rx, handle.clone()));

        Ok(Self {
            reader: ChunkReader::new(inbound, early_data, handle.clone()),
            writer: ChunkWriter::new(tx, handle),
        })
    }
}

/// Owns the WebSocket sink for the lifetime of the session.
///
/// Drains queued chunks until the writer is dropped, then sends a close
/// frame. A closed handle stops it at once, even mid-send.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    handle: TransportHandle,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let chunk = tokio::select! {
            biased;
            _ = handle.closed() => break,
            chunk = rx.recv() => chunk,
        };
        let Some(data) = chunk else {
            handle.close(TerminalEvent::Closed);
            break;
        };

        let sent = tokio::select! {
            biased;
            _ = handle.closed() => break,
            sent = sink.send(Message::Binary(data)) => sent,
        };
        if let Err(e) = sent {
            log::debug!(error = %e, "WebSocket send failed");
            handle.close(TerminalEvent::Error);
            break;
        }
    }

    rx.close();
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn test_decode_early_data_absent() {
        assert_eq!(decode_early_data("").unwrap(), None);
        assert_eq!(decode_early_data("   ").unwrap(), None);
    }

    #[test]
    fn test_decode_early_data_url_safe() {
        // 0xfb 0xff 0xbf encodes to "-_-_" in the URL-safe alphabet
        let data = decode_early_data("-_-_").unwrap().unwrap();
        assert_eq!(data.as_ref(), &[0xfb, 0xff, 0xbf]);
    }

    #[test]
    fn test_decode_early_data_padding_optional() {
        assert_eq!(decode_early_data("aGVsbG8").unwrap().unwrap(), "hello");
        assert_eq!(decode_early_data("aGVsbG8=").unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_decode_early_data_malformed() {
        assert!(decode_early_data("!!!not base64!!!").is_err());
        assert!(decode_early_data("a").is_err());
    }

    #[tokio::test]
    async fn test_malformed_early_data_fails_transport() {
        let (server, _client) = ws_pair().await;
        let result =
            WebSocketTransport::new(server, Some("%%%"), TransportHandle::new(), 8);
        assert!(matches!(result, Err(TunnelError::EarlyData(_))));
    }

    #[tokio::test]
    async fn test_reader_yields_early_then_binary_skipping_text() {
        let (server, mut client) = ws_pair().await;
        let handle = TransportHandle::new();
        let WebSocketTransport { mut reader, writer: _writer } =
            WebSocketTransport::new(server, Some("aGVsbG8"), handle.clone(), 8).unwrap();

        client.send(Message::Binary(Bytes::from_static(b"abc"))).await.unwrap();
        client.send(Message::Text("ignored".into())).await.unwrap();
        client.send(Message::Binary(Bytes::from_static(b"def"))).await.unwrap();

        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "hello");
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "abc");
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "def");

        client.close(None).await.unwrap();
        assert!(reader.next_chunk().await.unwrap().is_none());
        assert_eq!(handle.terminal_event(), Some(TerminalEvent::Closed));
    }

    #[tokio::test]
    async fn test_writer_delivers_then_closes_on_drop() {
        let (server, mut client) = ws_pair().await;
        let WebSocketTransport { reader: _reader, writer } =
            WebSocketTransport::new(server, None, TransportHandle::new(), 8).unwrap();

        writer.send(Bytes::from_static(b"one")).await.unwrap();
        writer.send(Bytes::from_static(b"two")).await.unwrap();
        drop(writer);

        let first = client.next().await.unwrap().unwrap();
        assert_eq!(first, Message::Binary(Bytes::from_static(b"one")));
        let second = client.next().await.unwrap().unwrap();
        assert_eq!(second, Message::Binary(Bytes::from_static(b"two")));
        match client.next().await {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_close_closes_client() {
        let (server, mut client) = ws_pair().await;
        let handle = TransportHandle::new();
        let WebSocketTransport { reader: _reader, writer: _writer } =
            WebSocketTransport::new(server, None, handle.clone(), 8).unwrap();

        handle.close(TerminalEvent::Cancelled);
        let next = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("client did not observe close");
        assert!(matches!(next, Some(Ok(Message::Close(_))) | None));
    }
}
