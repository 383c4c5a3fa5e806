//! PROXY protocol header generation.
//!
//! Wire formats (HAProxy PROXY protocol spec):
//! - v1: a single ASCII line, `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`
//!   (`TCP6` for IPv6 pairs), at most 107 bytes including CRLF.
//! - v2: 12-byte signature, one version/command byte, one family/transport
//!   byte, a two-byte big-endian payload length, then addresses and ports.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::ProxyVersion;

/// PROXY protocol v2 signature (12 bytes).
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low = command).
pub const V2_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks and the like).
pub const V2_COMMAND_LOCAL: u8 = 0x20;

/// Address family/transport: TCP over IPv4.
pub const V2_FAMILY_TCP4: u8 = 0x11;

/// Address family/transport: TCP over IPv6.
pub const V2_FAMILY_TCP6: u8 = 0x21;

/// IPv4 address block length (4 + 4 + 2 + 2).
pub const V2_ADDR_LEN_IPV4: u16 = 12;

/// IPv6 address block length (16 + 16 + 2 + 2).
pub const V2_ADDR_LEN_IPV6: u16 = 36;

/// Maximum v1 header length including CRLF.
pub const V1_MAX_LEN: usize = 107;

/// Encode a PROXY header of the given version.
#[must_use]
pub fn encode(version: ProxyVersion, source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    match version {
        ProxyVersion::V1 => encode_v1(source, destination),
        ProxyVersion::V2 => encode_v2(source, destination),
    }
}

/// Encode a v1 ASCII header line.
///
/// Mixed-family pairs are downgraded to the v4 form, extracting mapped
/// IPv4 addresses where possible.
#[must_use]
pub fn encode_v1(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    match (source.ip(), destination.ip()) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => format!(
            "PROXY TCP6 {src} {dst} {} {}\r\n",
            source.port(),
            destination.port()
        )
        .into_bytes(),
        (src, dst) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            as_v4(src),
            as_v4(dst),
            source.port(),
            destination.port()
        )
        .into_bytes(),
    }
}

/// Encode a v2 binary header.
#[must_use]
pub fn encode_v2(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    match (source.ip(), destination.ip()) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            encode_v2_v6(src, dst, source.port(), destination.port())
        }
        (src, dst) => encode_v2_v4(as_v4(src), as_v4(dst), source.port(), destination.port()),
    }
}

fn encode_v2_v4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + V2_ADDR_LEN_IPV4 as usize);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(V2_COMMAND_PROXY);
    buf.push(V2_FAMILY_TCP4);
    buf.extend_from_slice(&V2_ADDR_LEN_IPV4.to_be_bytes());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&sport.to_be_bytes());
    buf.extend_from_slice(&dport.to_be_bytes());
    buf
}

fn encode_v2_v6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + V2_ADDR_LEN_IPV6 as usize);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(V2_COMMAND_PROXY);
    buf.push(V2_FAMILY_TCP6);
    buf.extend_from_slice(&V2_ADDR_LEN_IPV6.to_be_bytes());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.extend_from_slice(&sport.to_be_bytes());
    buf.extend_from_slice(&dport.to_be_bytes());
    buf
}

/// Coerce an address to IPv4 for the v4 wire forms.
fn as_v4(ip: IpAddr) -> Ipv4Addr {
    match ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_v1_ipv4_line() {
        let header = encode_v1(
            "192.0.2.10:5555".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        );
        assert_eq!(header, b"PROXY TCP4 192.0.2.10 10.0.0.1 5555 8080\r\n");
    }

    #[test]
    fn test_encode_v1_ipv6_line() {
        let header = encode_v1(
            "[2001:db8::1]:5555".parse().unwrap(),
            "[2001:db8::2]:8080".parse().unwrap(),
        );
        assert_eq!(header, b"PROXY TCP6 2001:db8::1 2001:db8::2 5555 8080\r\n");
    }

    #[test]
    fn test_encode_v1_mixed_pair_downgrades_to_v4() {
        let header = encode_v1(
            "[::ffff:192.0.2.10]:5555".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        );
        assert_eq!(header, b"PROXY TCP4 192.0.2.10 10.0.0.1 5555 8080\r\n");
    }

    #[test]
    fn test_encode_v2_ipv4_layout() {
        let header = encode_v2(
            "192.0.2.10:5555".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        );
        assert_eq!(header.len(), 28);
        assert_eq!(&header[..12], &V2_SIGNATURE);
        assert_eq!(header[12], V2_COMMAND_PROXY);
        assert_eq!(header[13], V2_FAMILY_TCP4);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 12);
        assert_eq!(&header[16..20], &[192, 0, 2, 10]);
        assert_eq!(&header[20..24], &[10, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([header[24], header[25]]), 5555);
        assert_eq!(u16::from_be_bytes([header[26], header[27]]), 8080);
    }

    #[test]
    fn test_encode_v2_ipv6_layout() {
        let header = encode_v2(
            "[2001:db8::1]:5555".parse().unwrap(),
            "[2001:db8::2]:8080".parse().unwrap(),
        );
        assert_eq!(header.len(), 52);
        assert_eq!(header[13], V2_FAMILY_TCP6);
        assert_eq!(u16::from_be_bytes([header[14], header[15]]), 36);
    }

    #[test]
    fn test_encode_dispatches_on_version() {
        let src = "192.0.2.10:5555".parse().unwrap();
        let dst = "10.0.0.1:8080".parse().unwrap();
        assert!(encode(ProxyVersion::V1, src, dst).starts_with(b"PROXY TCP4 "));
        assert!(encode(ProxyVersion::V2, src, dst).starts_with(&V2_SIGNATURE));
    }
}
