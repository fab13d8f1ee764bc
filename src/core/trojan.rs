//! Trojan request header codec
//!
//! Layout:
//! - 56-byte password (SHA224 hex encoded)
//! - CRLF
//! - Command (1 byte: CONNECT=1, UDP_ASSOCIATE=3)
//! - Address (ATYP + address + port)
//! - optional CRLF
//! - Payload

use super::credentials::{CredentialSet, TROJAN_DIGEST_LEN};
use super::protocol::{
    read_u16_be, read_u8, Address, AddressKind, Command, DecodeError, HeaderDescriptor,
    ProtocolKind,
};

/// 56 (password) + 2 (CRLF) + 1 (cmd) + 1 (atyp) + 2 (port) + 2 (CRLF)
pub const MIN_HEADER_LEN: usize = TROJAN_DIGEST_LEN + 2 + 1 + 1 + 2 + 2;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const CRLF: &[u8; 2] = b"\r\n";

/// Decode a Trojan header from the first inbound chunk
pub fn decode(buf: &[u8], credentials: &CredentialSet) -> Result<HeaderDescriptor, DecodeError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(DecodeError::HeaderTooShort {
            needed: MIN_HEADER_LEN,
            available: buf.len(),
        });
    }

    if !credentials.verify_trojan(&buf[..TROJAN_DIGEST_LEN]) {
        return Err(DecodeError::AuthenticationFailed);
    }

    let mut pos = TROJAN_DIGEST_LEN;
    if &buf[pos..pos + 2] != CRLF {
        return Err(DecodeError::MissingCrlf("password"));
    }
    pos += 2;

    let command = match read_u8(buf, pos)? {
        CMD_CONNECT => Command::Tcp,
        CMD_UDP_ASSOCIATE => Command::Udp,
        other => return Err(DecodeError::UnsupportedCommand(other)),
    };
    pos += 1;

    let kind = match read_u8(buf, pos)? {
        ATYP_IPV4 => AddressKind::Ipv4,
        ATYP_DOMAIN => AddressKind::Domain,
        ATYP_IPV6 => AddressKind::Ipv6,
        other => return Err(DecodeError::UnsupportedAddressKind(other)),
    };
    pos += 1;

    let (address, host_end) = Address::decode_host(buf, pos, kind)?;
    let port = read_u16_be(buf, host_end)?;
    pos = host_end + 2;

    if buf.get(pos..pos + 2) == Some(CRLF.as_slice()) {
        pos += 2;
    }

    Ok(HeaderDescriptor {
        protocol: ProtocolKind::Trojan,
        command,
        address: address.with_port(port),
        payload_offset: pos,
        version: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::credentials::password_to_hex;
    use crate::core::vless::tests::TEST_UUID;

    pub(crate) const TEST_PASSWORD: &str = "trojan-secret";

    fn credentials() -> CredentialSet {
        CredentialSet::new(&[TEST_UUID], TEST_PASSWORD).unwrap()
    }

    /// Build a Trojan header; `addr` is the raw address bytes after ATYP
    pub(crate) fn build_header(
        password: &str,
        cmd: u8,
        atyp: u8,
        addr: &[u8],
        port: u16,
        trailing_crlf: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = password_to_hex(password).to_vec();
        buf.extend_from_slice(b"\r\n");
        buf.push(cmd);
        buf.push(atyp);
        buf.extend_from_slice(addr);
        buf.extend_from_slice(&port.to_be_bytes());
        if trailing_crlf {
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_min_header_len() {
        assert_eq!(MIN_HEADER_LEN, 64);
    }

    #[test]
    fn test_decode_connect_ipv4() {
        let buf = build_header(TEST_PASSWORD, 1, 1, &[127, 0, 0, 1], 8080, true, b"hello");
        let desc = decode(&buf, &credentials()).unwrap();
        assert_eq!(desc.protocol, ProtocolKind::Trojan);
        assert_eq!(desc.command, Command::Tcp);
        assert_eq!(desc.address, Address::IPv4([127, 0, 0, 1], 8080));
        assert_eq!(&buf[desc.payload_offset..], b"hello");
        assert!(desc.response_preamble().is_empty());
    }

    #[test]
    fn test_decode_without_trailing_crlf() {
        let buf = build_header(TEST_PASSWORD, 1, 1, &[1, 2, 3, 4], 443, false, b"abcdef");
        let desc = decode(&buf, &credentials()).unwrap();
        assert_eq!(&buf[desc.payload_offset..], b"abcdef");
    }

    #[test]
    fn test_decode_udp_domain() {
        let mut addr = vec![7u8];
        addr.extend_from_slice(b"udp.com");
        let buf = build_header(TEST_PASSWORD, 3, 3, &addr, 53, true, b"");
        let desc = decode(&buf, &credentials()).unwrap();
        assert!(desc.is_udp());
        assert_eq!(desc.address, Address::Domain("udp.com".to_string(), 53));
        assert_eq!(desc.payload_offset, buf.len());
    }

    #[test]
    fn test_decode_ipv6() {
        let mut ip = [0u8; 16];
        ip[15] = 1;
        let buf = build_header(TEST_PASSWORD, 1, 4, &ip, 443, true, b"");
        let desc = decode(&buf, &credentials()).unwrap();
        assert_eq!(desc.address_kind(), AddressKind::Ipv6);
        assert_eq!(desc.target_port(), 443);
    }

    #[test]
    fn test_decode_uppercase_digest() {
        let mut buf = build_header(TEST_PASSWORD, 1, 1, &[1, 1, 1, 1], 443, true, b"");
        buf[..56].make_ascii_uppercase();
        assert!(decode(&buf, &credentials()).is_ok());
    }

    #[test]
    fn test_decode_wrong_password() {
        let buf = build_header("nope", 1, 1, &[1, 1, 1, 1], 443, true, b"");
        assert_eq!(
            decode(&buf, &credentials()),
            Err(DecodeError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_decode_too_short() {
        let buf = build_header(TEST_PASSWORD, 1, 1, &[1, 1, 1, 1], 443, true, b"");
        for len in 0..MIN_HEADER_LEN {
            assert!(matches!(
                decode(&buf[..len], &credentials()),
                Err(DecodeError::HeaderTooShort { .. })
            ));
        }
    }

    #[test]
    fn test_decode_missing_crlf() {
        let mut buf = build_header(TEST_PASSWORD, 1, 1, &[1, 1, 1, 1], 443, true, b"");
        buf[56] = b'\n';
        buf[57] = b'\r';
        assert_eq!(
            decode(&buf, &credentials()),
            Err(DecodeError::MissingCrlf("password"))
        );
    }

    #[test]
    fn test_decode_unsupported_command() {
        let buf = build_header(TEST_PASSWORD, 2, 1, &[1, 1, 1, 1], 443, true, b"");
        assert_eq!(
            decode(&buf, &credentials()),
            Err(DecodeError::UnsupportedCommand(2))
        );
    }

    #[test]
    fn test_decode_unsupported_address_kind() {
        let buf = build_header(TEST_PASSWORD, 1, 2, &[1, 1, 1, 1], 443, true, b"");
        assert_eq!(
            decode(&buf, &credentials()),
            Err(DecodeError::UnsupportedAddressKind(2))
        );
    }

    #[test]
    fn test_decode_domain_exceeds_buffer() {
        let mut addr = vec![100u8];
        addr.extend_from_slice(b"abc");
        let buf = build_header(TEST_PASSWORD, 1, 3, &addr, 443, true, b"");
        assert!(matches!(
            decode(&buf, &credentials()),
            Err(DecodeError::AddressLengthExceedsBuffer { .. })
        ));
    }

    #[test]
    fn test_decode_ipv6_truncated() {
        // long enough for the minimum, too short for a 16-byte address
        let buf = build_header(TEST_PASSWORD, 1, 4, &[0u8; 4], 443, true, b"");
        assert!(buf.len() >= MIN_HEADER_LEN);
        assert!(matches!(
            decode(&buf, &credentials()),
            Err(DecodeError::AddressLengthExceedsBuffer { .. })
        ));
    }
}
