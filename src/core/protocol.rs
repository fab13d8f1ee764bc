//! Shared session-header types
//!
//! Both header codecs (VLESS and Trojan) decode into the same
//! [`HeaderDescriptor`]. They differ only in layout and tag values, so the
//! address handling lives here and each codec maps its own tags onto
//! [`AddressKind`].

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Which codec a session speaks. Chosen by the upgrade path, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Vless,
    Trojan,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Vless => write!(f, "vless"),
            ProtocolKind::Trojan => write!(f, "trojan"),
        }
    }
}

/// Relay direction requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

/// Address kinds, independent of each codec's tag values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Domain,
    Ipv6,
}

/// Decoded relay target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4], u16),
    /// IPv6 address
    IPv6([u8; 16], u16),
    /// Domain name
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(_, port) => write!(f, "[{}]:{}", self.host(), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Address {
    /// Decode the host part of an address of `kind` starting at `pos`.
    ///
    /// The port is filled in by the caller since VLESS and Trojan place it on
    /// different sides of the host. Returns the address and the offset just
    /// past the host bytes.
    pub fn decode_host(
        buf: &[u8],
        pos: usize,
        kind: AddressKind,
    ) -> Result<(Self, usize), DecodeError> {
        match kind {
            AddressKind::Ipv4 => {
                let end = pos + 4;
                let bytes = slice(buf, pos, end)?;
                let mut ip = [0u8; 4];
                ip.copy_from_slice(bytes);
                Ok((Address::IPv4(ip, 0), end))
            }
            AddressKind::Ipv6 => {
                let end = pos + 16;
                let bytes = slice(buf, pos, end)?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(bytes);
                Ok((Address::IPv6(ip, 0), end))
            }
            AddressKind::Domain => {
                let len = *buf.get(pos).ok_or(DecodeError::AddressLengthExceedsBuffer {
                    needed: pos + 1,
                    available: buf.len(),
                })? as usize;
                let start = pos + 1;
                let end = start + len;
                let bytes = slice(buf, start, end)?;
                if bytes.is_empty() {
                    return Err(DecodeError::InvalidAddress("empty domain"));
                }
                let domain = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::InvalidAddress("invalid domain encoding"))?;
                Ok((Address::Domain(domain.to_string(), 0), end))
            }
        }
    }

    /// Replace the port
    pub fn with_port(self, port: u16) -> Self {
        match self {
            Address::IPv4(ip, _) => Address::IPv4(ip, port),
            Address::IPv6(ip, _) => Address::IPv6(ip, port),
            Address::Domain(domain, _) => Address::Domain(domain, port),
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Address kind of this target
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::IPv4(..) => AddressKind::Ipv4,
            Address::IPv6(..) => AddressKind::Ipv6,
            Address::Domain(..) => AddressKind::Domain,
        }
    }

    /// Host string used for connecting.
    ///
    /// IPv6 is rendered as eight uncompressed hex groups, e.g.
    /// `2001:db8:0:0:0:0:0:1`.
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => ip
                .chunks_exact(2)
                .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                .collect::<Vec<_>>()
                .join(":"),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

/// Bounds-checked sub-slice for address bytes
fn slice(buf: &[u8], start: usize, end: usize) -> Result<&[u8], DecodeError> {
    buf.get(start..end)
        .ok_or(DecodeError::AddressLengthExceedsBuffer {
            needed: end,
            available: buf.len(),
        })
}

/// Read a big-endian u16 at `pos`, or fail as a short header
pub(crate) fn read_u16_be(buf: &[u8], pos: usize) -> Result<u16, DecodeError> {
    match buf.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DecodeError::HeaderTooShort {
            needed: pos + 2,
            available: buf.len(),
        }),
    }
}

/// Read one byte at `pos`, or fail as a short header
pub(crate) fn read_u8(buf: &[u8], pos: usize) -> Result<u8, DecodeError> {
    buf.get(pos).copied().ok_or(DecodeError::HeaderTooShort {
        needed: pos + 1,
        available: buf.len(),
    })
}

/// Header decode failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("header too short: need {needed} bytes, got {available}")]
    HeaderTooShort { needed: usize, available: usize },

    /// Deliberately carries nothing about the credentials that were tried
    #[error("invalid user")]
    AuthenticationFailed,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address kind {0:#04x}")]
    UnsupportedAddressKind(u8),

    #[error("address needs {needed} bytes, buffer has {available}")]
    AddressLengthExceedsBuffer { needed: usize, available: usize },

    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),

    #[error("missing CRLF after {0}")]
    MissingCrlf(&'static str),
}

/// Immutable result of decoding a session header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDescriptor {
    pub protocol: ProtocolKind,
    pub command: Command,
    pub address: Address,
    /// Offset in the first chunk where the client payload begins
    pub payload_offset: usize,
    /// VLESS version byte, echoed back in the response preamble
    pub version: Option<u8>,
}

impl HeaderDescriptor {
    pub fn target_host(&self) -> String {
        self.address.host()
    }

    pub fn target_port(&self) -> u16 {
        self.address.port()
    }

    pub fn address_kind(&self) -> AddressKind {
        self.address.kind()
    }

    pub fn is_udp(&self) -> bool {
        self.command == Command::Udp
    }

    /// Bytes sent ahead of the first server-to-client chunk.
    ///
    /// VLESS answers `[version, 0]`; Trojan has no response header.
    pub fn response_preamble(&self) -> Bytes {
        match (self.protocol, self.version) {
            (ProtocolKind::Vless, Some(v)) => Bytes::copy_from_slice(&[v, 0]),
            (ProtocolKind::Vless, None) => Bytes::from_static(&[0, 0]),
            (ProtocolKind::Trojan, _) => Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_host_ipv4() {
        let buf = [0xff, 192, 168, 1, 1, 0xee];
        let (addr, end) = Address::decode_host(&buf, 1, AddressKind::Ipv4).unwrap();
        assert_eq!(end, 5);
        assert_eq!(addr.with_port(8080), Address::IPv4([192, 168, 1, 1], 8080));
    }

    #[test]
    fn test_decode_host_domain() {
        let mut buf = vec![11];
        buf.extend_from_slice(b"example.com");
        let (addr, end) = Address::decode_host(&buf, 0, AddressKind::Domain).unwrap();
        assert_eq!(end, 12);
        assert_eq!(addr.host(), "example.com");
    }

    #[test]
    fn test_decode_host_domain_exceeds_buffer() {
        let buf = [20, b'a', b'b'];
        assert_eq!(
            Address::decode_host(&buf, 0, AddressKind::Domain),
            Err(DecodeError::AddressLengthExceedsBuffer {
                needed: 21,
                available: 3
            })
        );
        // length byte itself missing
        assert!(matches!(
            Address::decode_host(&buf, 3, AddressKind::Domain),
            Err(DecodeError::AddressLengthExceedsBuffer { .. })
        ));
    }

    #[test]
    fn test_decode_host_empty_domain() {
        let buf = [0u8, 0, 0];
        assert_eq!(
            Address::decode_host(&buf, 0, AddressKind::Domain),
            Err(DecodeError::InvalidAddress("empty domain"))
        );
    }

    #[test]
    fn test_decode_host_ipv6_truncated() {
        let buf = [0u8; 10];
        assert!(matches!(
            Address::decode_host(&buf, 0, AddressKind::Ipv6),
            Err(DecodeError::AddressLengthExceedsBuffer { needed: 16, .. })
        ));
    }

    #[test]
    fn test_ipv6_host_uncompressed_groups() {
        let mut ip = [0u8; 16];
        ip[0] = 0x20;
        ip[1] = 0x01;
        ip[2] = 0x0d;
        ip[3] = 0xb8;
        ip[15] = 1;
        let addr = Address::IPv6(ip, 443);
        assert_eq!(addr.host(), "2001:db8:0:0:0:0:0:1");
        assert_eq!(format!("{}", addr), "[2001:db8:0:0:0:0:0:1]:443");
        // still parseable when connecting
        assert!(addr.host().parse::<Ipv6Addr>().is_ok());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(
            format!("{}", Address::IPv4([192, 168, 1, 1], 8080)),
            "192.168.1.1:8080"
        );
        assert_eq!(
            format!("{}", Address::Domain("example.com".to_string(), 80)),
            "example.com:80"
        );
    }

    #[test]
    fn test_read_helpers_bounds() {
        let buf = [0x01, 0xbb];
        assert_eq!(read_u16_be(&buf, 0), Ok(443));
        assert!(matches!(
            read_u16_be(&buf, 1),
            Err(DecodeError::HeaderTooShort { .. })
        ));
        assert_eq!(read_u8(&buf, 1), Ok(0xbb));
        assert!(read_u8(&buf, 2).is_err());
    }

    #[test]
    fn test_response_preamble() {
        let mut desc = HeaderDescriptor {
            protocol: ProtocolKind::Vless,
            command: Command::Tcp,
            address: Address::Domain("a.b".into(), 1),
            payload_offset: 0,
            version: Some(0),
        };
        assert_eq!(desc.response_preamble().as_ref(), &[0, 0]);
        desc.version = Some(1);
        assert_eq!(desc.response_preamble().as_ref(), &[1, 0]);
        desc.protocol = ProtocolKind::Trojan;
        assert!(desc.response_preamble().is_empty());
    }
}
