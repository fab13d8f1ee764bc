//! VLESS request header codec
//!
//! Layout:
//! - version (1)
//! - user id (16)
//! - options length N (1), options (N)
//! - command (1): 1 = TCP, 2 = UDP
//! - port (2, big-endian)
//! - address kind (1): 1 = IPv4, 2 = domain, 3 = IPv6
//! - address
//! - payload

use super::credentials::CredentialSet;
use super::protocol::{
    read_u16_be, read_u8, Address, AddressKind, Command, DecodeError, HeaderDescriptor,
    ProtocolKind,
};

/// Shortest buffer worth looking at
pub const MIN_HEADER_LEN: usize = 24;

const UUID_RANGE: std::ops::Range<usize> = 1..17;
const OPT_LEN_POS: usize = 17;

const CMD_TCP: u8 = 1;
const CMD_UDP: u8 = 2;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 2;
const ATYP_IPV6: u8 = 3;

/// Decode a VLESS header from the first inbound chunk.
///
/// The user id is checked before anything past it is parsed.
pub fn decode(buf: &[u8], credentials: &CredentialSet) -> Result<HeaderDescriptor, DecodeError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(DecodeError::HeaderTooShort {
            needed: MIN_HEADER_LEN,
            available: buf.len(),
        });
    }

    let version = buf[0];
    if !credentials.verify_uuid(&buf[UUID_RANGE]) {
        return Err(DecodeError::AuthenticationFailed);
    }

    let opt_len = buf[OPT_LEN_POS] as usize;
    let cmd_pos = OPT_LEN_POS + 1 + opt_len;
    let command = match read_u8(buf, cmd_pos)? {
        CMD_TCP => Command::Tcp,
        CMD_UDP => Command::Udp,
        other => return Err(DecodeError::UnsupportedCommand(other)),
    };

    let port_pos = cmd_pos + 1;
    let port = read_u16_be(buf, port_pos)?;

    let atyp_pos = port_pos + 2;
    let kind = match read_u8(buf, atyp_pos)? {
        ATYP_IPV4 => AddressKind::Ipv4,
        ATYP_DOMAIN => AddressKind::Domain,
        ATYP_IPV6 => AddressKind::Ipv6,
        other => return Err(DecodeError::UnsupportedAddressKind(other)),
    };

    let (address, payload_offset) = Address::decode_host(buf, atyp_pos + 1, kind)?;

    Ok(HeaderDescriptor {
        protocol: ProtocolKind::Vless,
        command,
        address: address.with_port(port),
        payload_offset,
        version: Some(version),
    })
}
