//! Server-side PROXY header ingest.
//!
//! Reads a PROXY header off the front of an accepted connection and
//! yields the announced client addresses. The version is auto-detected
//! on the wire: the first byte distinguishes the v2 binary signature
//! from the v1 ASCII line, whatever version the mapping advertises.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::ProxyVersion;

use super::header::{
    V1_MAX_LEN, V2_ADDR_LEN_IPV4, V2_ADDR_LEN_IPV6, V2_COMMAND_LOCAL, V2_COMMAND_PROXY,
    V2_FAMILY_TCP4, V2_FAMILY_TCP6, V2_SIGNATURE,
};

/// Addresses carried by an ingested PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address.
    pub source: SocketAddr,
    /// Address the client originally connected to.
    pub destination: SocketAddr,
    /// Version observed on the wire.
    pub version: ProxyVersion,
}

/// Read one PROXY header from the front of a stream.
///
/// Returns `Ok(None)` for headers that carry no usable addresses (v2
/// LOCAL command, unsupported v2 families, v1 `UNKNOWN`); the caller
/// falls back to the immediate peer address. Exactly the header bytes
/// are consumed, so the payload that follows is untouched.
///
/// # Errors
///
/// Returns an error when the stream does not start with a well-formed
/// header of either version.
pub async fn read_proxy_header<S>(stream: &mut S) -> io::Result<Option<ProxyHeader>>
where
    S: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    match first[0] {
        b if b == V2_SIGNATURE[0] => read_v2(stream).await,
        b'P' => read_v1(stream).await,
        other => Err(invalid(format!(
            "connection does not start with a PROXY header (first byte 0x{other:02x})"
        ))),
    }
}

async fn read_v2<S>(stream: &mut S) -> io::Result<Option<ProxyHeader>>
where
    S: AsyncRead + Unpin,
{
    // First signature byte is already consumed.
    let mut rest = [0u8; 15];
    stream.read_exact(&mut rest).await?;
    if rest[..11] != V2_SIGNATURE[1..] {
        return Err(invalid("bad PROXY v2 signature"));
    }

    let version_command = rest[11];
    let family = rest[12];
    let len = u16::from_be_bytes([rest[13], rest[14]]) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;

    match version_command {
        V2_COMMAND_PROXY => {}
        V2_COMMAND_LOCAL => return Ok(None),
        other => return Err(invalid(format!("bad PROXY v2 version/command 0x{other:02x}"))),
    }

    let (source, destination) = match family {
        V2_FAMILY_TCP4 => {
            if len < V2_ADDR_LEN_IPV4 as usize {
                return Err(invalid("short PROXY v2 IPv4 address block"));
            }
            let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let dst = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            let sport = u16::from_be_bytes([payload[8], payload[9]]);
            let dport = u16::from_be_bytes([payload[10], payload[11]]);
            (
                SocketAddr::new(IpAddr::V4(src), sport),
                SocketAddr::new(IpAddr::V4(dst), dport),
            )
        }
        V2_FAMILY_TCP6 => {
            if len < V2_ADDR_LEN_IPV6 as usize {
                return Err(invalid("short PROXY v2 IPv6 address block"));
            }
            let src_octets: [u8; 16] = payload[..16].try_into().expect("length checked");
            let dst_octets: [u8; 16] = payload[16..32].try_into().expect("length checked");
            let sport = u16::from_be_bytes([payload[32], payload[33]]);
            let dport = u16::from_be_bytes([payload[34], payload[35]]);
            (
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), sport),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dport),
            )
        }
        // AF_UNSPEC or a transport we do not forward; addresses unusable.
        _ => return Ok(None),
    };

    Ok(Some(ProxyHeader {
        source,
        destination,
        version: ProxyVersion::V2,
    }))
}

async fn read_v1<S>(stream: &mut S) -> io::Result<Option<ProxyHeader>>
where
    S: AsyncRead + Unpin,
{
    // Leading 'P' is already consumed; collect the line byte by byte so
    // no payload is read past the CRLF.
    let mut line = vec![b'P'];
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > V1_MAX_LEN {
            return Err(invalid("PROXY v1 line exceeds 107 bytes"));
        }
    }

    let line = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| invalid("PROXY v1 line is not ASCII"))?;
    let fields: Vec<&str> = line.split(' ').collect();

    match fields.as_slice() {
        ["PROXY", "UNKNOWN", ..] => Ok(None),
        ["PROXY", proto @ ("TCP4" | "TCP6"), src, dst, sport, dport] => {
            let src_ip: IpAddr = src.parse().map_err(|_| invalid("bad PROXY v1 source"))?;
            let dst_ip: IpAddr = dst
                .parse()
                .map_err(|_| invalid("bad PROXY v1 destination"))?;
            if (*proto == "TCP4") != src_ip.is_ipv4() || src_ip.is_ipv4() != dst_ip.is_ipv4() {
                return Err(invalid("PROXY v1 address family mismatch"));
            }
            let sport: u16 = sport.parse().map_err(|_| invalid("bad PROXY v1 port"))?;
            let dport: u16 = dport.parse().map_err(|_| invalid("bad PROXY v1 port"))?;
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(src_ip, sport),
                destination: SocketAddr::new(dst_ip, dport),
                version: ProxyVersion::V1,
            }))
        }
        _ => Err(invalid("malformed PROXY v1 line")),
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
