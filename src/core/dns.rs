//! UDP-over-DNS relay
//!
//! UDP sessions may only target port 53. The client stream carries
//! datagrams as `[u16 length BE][payload]`; every datagram becomes one
//! DNS-over-HTTPS POST and every answer goes back with the same framing.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::TunnelError;
use crate::logger::log;
use crate::transport::{ChunkReader, ChunkWriter};

/// The only UDP port that is relayed
pub const DNS_PORT: u16 = 53;

const DNS_MESSAGE: &str = "application/dns-message";

/// Largest datagram the 2-byte length prefix can describe
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// Datagrams waiting for the resolver before the reader waits
const QUERY_QUEUE: usize = 32;

/// Malformed length-prefixed framing inside one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("length prefix claims {declared} bytes, only {remaining} left")]
    LengthExceedsBuffer { declared: usize, remaining: usize },

    #[error("incomplete length prefix")]
    IncompletePrefix,
}

/// Split one chunk into datagrams.
///
/// Datagrams framed before a malformed prefix are still returned; the
/// rest of the chunk is dropped.
pub fn split_datagrams(chunk: &Bytes) -> (Vec<Bytes>, Option<FramingError>) {
    let mut datagrams = Vec::new();
    let mut pos = 0;

    while pos < chunk.len() {
        if chunk.len() - pos < 2 {
            return (datagrams, Some(FramingError::IncompletePrefix));
        }
        let declared = u16::from_be_bytes([chunk[pos], chunk[pos + 1]]) as usize;
        let start = pos + 2;
        let remaining = chunk.len() - start;
        if declared > remaining {
            return (
                datagrams,
                Some(FramingError::LengthExceedsBuffer {
                    declared,
                    remaining,
                }),
            );
        }
        datagrams.push(chunk.slice(start..start + declared));
        pos = start + declared;
    }

    (datagrams, None)
}

/// Prefix a response with its length, and the preamble if given.
/// `None` when the response cannot be framed.
pub fn frame_response(response: &[u8], preamble: Option<&[u8]>) -> Option<Bytes> {
    let len = u16::try_from(response.len()).ok()?;
    let head = preamble.unwrap_or_default();
    let mut out = BytesMut::with_capacity(head.len() + 2 + response.len());
    out.extend_from_slice(head);
    out.put_u16(len);
    out.extend_from_slice(response);
    Some(out.freeze())
}

/// Resolves one raw DNS query message
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, query: Bytes) -> Result<Bytes, TunnelError>;
}

/// DNS-over-HTTPS resolver (RFC 8484, POST)
pub struct DohResolver {
    url: reqwest::Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for DohResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohResolver")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl DohResolver {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TunnelError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| TunnelError::Config(format!("invalid DoH URL '{}': {}", url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| TunnelError::Config(format!("DoH client: {}", e)))?;

        Ok(Self { url, client })
    }
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn resolve(&self, query: Bytes) -> Result<Bytes, TunnelError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(query)
            .send()
            .await
            .map_err(|e| TunnelError::Dns(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::Dns(format!("upstream returned {}", status)));
        }

        response
            .bytes()
            .await
            .map_err(|e| TunnelError::Dns(e.to_string()))
    }
}

/// Counters of a finished DNS session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsStats {
    /// Datagrams handed to the resolver
    pub queries: u64,
    /// Answers written back to the client
    pub answers: u64,
}

/// UDP path of one session
pub struct DnsRelay<'a> {
    peer: SocketAddr,
    resolver: &'a dyn DnsResolver,
}

impl<'a> DnsRelay<'a> {
    pub fn new(peer: SocketAddr, resolver: &'a dyn DnsResolver) -> Self {
        Self { peer, resolver }
    }

    /// Relay until the client is done.
    ///
    /// Answers keep query order. A failed query is logged and skipped; the
    /// session goes on.
    pub async fn run(
        &self,
        initial: Bytes,
        preamble: Bytes,
        reader: &mut ChunkReader,
        writer: &ChunkWriter,
    ) -> Result<DnsStats, TunnelError> {
        let (tx, rx) = mpsc::channel::<Bytes>(QUERY_QUEUE);

        let (uplink, downlink) = tokio::join!(
            self.read_queries(initial, reader, tx),
            self.answer_queries(rx, preamble, writer),
        );

        let queries = uplink?;
        let answers = downlink?;
        Ok(DnsStats { queries, answers })
    }

    async fn read_queries(
        &self,
        initial: Bytes,
        reader: &mut ChunkReader,
        tx: mpsc::Sender<Bytes>,
    ) -> Result<u64, TunnelError> {
        let mut queued = 0u64;
        let mut next = Some(initial).filter(|c| !c.is_empty());

        loop {
            let chunk = match next.take() {
                Some(chunk) => chunk,
                None => match reader.next_chunk().await? {
                    Some(chunk) => chunk,
                    None => return Ok(queued),
                },
            };

            let (datagrams, framing_error) = split_datagrams(&chunk);
            for datagram in datagrams {
                if tx.send(datagram).await.is_err() {
                    return Ok(queued);
                }
                queued += 1;
            }
            if let Some(e) = framing_error {
                log::debug!(peer = %self.peer, error = %e, "Dropping malformed UDP framing");
            }
        }
    }

    async fn answer_queries(
        &self,
        mut rx: mpsc::Receiver<Bytes>,
        preamble: Bytes,
        writer: &ChunkWriter,
    ) -> Result<u64, TunnelError> {
        let mut preamble = Some(preamble).filter(|p| !p.is_empty());
        let mut answered = 0u64;

        while let Some(query) = rx.recv().await {
            let len = query.len();
            let resolved = tokio::select! {
                biased;
                _ = writer.handle().closed() => break,
                r = self.resolver.resolve(query) => r,
            };
            let answer = match resolved {
                Ok(answer) => answer,
                Err(e) => {
                    log::debug!(peer = %self.peer, query_len = len, error = %e, "DNS query failed");
                    continue;
                }
            };

            let Some(framed) = frame_response(&answer, preamble.as_deref()) else {
                log::warn!(
                    peer = %self.peer,
                    answer_len = answer.len(),
                    "DNS answer exceeds {} bytes, dropped",
                    MAX_DATAGRAM_LEN
                );
                continue;
            };
            preamble = None;

            writer.send(framed).await?;
            answered += 1;
        }

        Ok(answered)
    }
}
