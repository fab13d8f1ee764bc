use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::core::DecodeError;

/// Session-level error taxonomy.
///
/// None of these cross the per-connection task boundary; the peer only ever
/// sees the connection close.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Header too short or a field is malformed
    #[error("malformed header: {0}")]
    MalformedHeader(DecodeError),

    /// Unknown user id or wrong password
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address kind {0:#04x}")]
    UnsupportedAddressKind(u8),

    /// UDP is only relayed to port 53
    #[error("UDP not allowed to port {0}, only DNS (53) is relayed")]
    UdpNotAllowed(u16),

    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("connect to {target} failed: {source}")]
    ConnectFailure {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Upstream closed without sending a single byte back
    #[error("upstream {0} closed without responding")]
    SilentUpstream(String),

    /// Fallback attempt failed as well
    #[error("retry exhausted: {0}")]
    RetryExhausted(Box<TunnelError>),

    /// Client-side connection failed or closed abnormally
    #[error("transport error: {0}")]
    Transport(String),

    /// Early data in the upgrade request is not valid base64
    #[error("invalid early data: {0}")]
    EarlyData(#[from] base64::DecodeError),

    #[error("DNS-over-HTTPS error: {0}")]
    Dns(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<DecodeError> for TunnelError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::AuthenticationFailed => TunnelError::AuthenticationFailed,
            DecodeError::UnsupportedCommand(c) => TunnelError::UnsupportedCommand(c),
            DecodeError::UnsupportedAddressKind(k) => TunnelError::UnsupportedAddressKind(k),
            other => TunnelError::MalformedHeader(other),
        }
    }
}

impl TunnelError {
    /// Rejections that must not be logged with any detail
    pub fn is_silent(&self) -> bool {
        matches!(self, TunnelError::AuthenticationFailed)
    }

    /// Failures that qualify for the single fallback-egress retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::ConnectTimeout { .. }
                | TunnelError::ConnectFailure { .. }
                | TunnelError::SilentUpstream(_)
        )
    }

    /// Rejected before any outbound connection was attempted
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedHeader(_)
                | TunnelError::AuthenticationFailed
                | TunnelError::UnsupportedCommand(_)
                | TunnelError::UnsupportedAddressKind(_)
                | TunnelError::UdpNotAllowed(_)
        )
    }
}
