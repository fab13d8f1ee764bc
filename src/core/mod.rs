//! Core relay module
//!
//! This module contains the protocol-independent relay logic:
//! - Header codecs (VLESS, Trojan) and constant-time credential checks
//! - Session lifecycle and route selection
//! - TCP outbound relay with a single fallback retry
//! - UDP-over-DNS relay
//! - Live session registry

pub mod connection;
pub mod credentials;
pub mod dns;
pub mod matcher;
pub mod outbound;
pub mod protocol;
pub mod server;
pub mod session;
pub mod trojan;
pub mod vless;

pub use connection::{ConnectionManager, SessionId};
pub use credentials::{is_valid_uuid, mask_uuid, password_to_hex, CredentialSet, EgressPolicy};
pub use dns::{DnsRelay, DnsResolver, DohResolver};
pub use outbound::TcpRelay;
pub use protocol::{Address, AddressKind, Command, DecodeError, HeaderDescriptor, ProtocolKind};
pub use server::Server;
pub use session::{select_route, Route, Session, SessionState};

/// Decode the first inbound chunk with the codec of `protocol`
pub fn decode_header(
    protocol: ProtocolKind,
    buf: &[u8],
    credentials: &CredentialSet,
) -> Result<HeaderDescriptor, DecodeError> {
    match protocol {
        ProtocolKind::Vless => vless::decode(buf, credentials),
        ProtocolKind::Trojan => trojan::decode(buf, credentials),
    }
}
