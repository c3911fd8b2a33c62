//! SOCKS5 (RFC 1928, RFC 1929) wire pieces shared by the front-end state
//! machine, the backend-facing client and the UDP relay.

pub mod client;
pub mod handshake;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::endpoint::UnresolvedEndpoint;
use crate::error::Result;

pub use handshake::{negotiate, Handshake, HandshakeState, Negotiated, ProxyIntent, Step};

pub const VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub mod method {
    pub const NO_AUTH: u8 = 0x00;
    pub const USER_PASS: u8 = 0x02;
    pub const NO_ACCEPTABLE: u8 = 0xFF;
}

pub mod command {
    pub const CONNECT: u8 = 0x01;
    pub const BIND: u8 = 0x02;
    pub const UDP_ASSOCIATE: u8 = 0x03;
    /// Private extension between tunnel nodes: the address field carries a
    /// real `host:port` the receiving node must make restorable from its
    /// fake host.
    pub const REGISTER_FAKE: u8 = 0x80;
}

pub mod atype {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN_NAME: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocksError {
    #[error("invalid SOCKS version: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },
    #[error("no acceptable authentication methods")]
    NoAcceptableMethods,
    #[error("authentication failed for user: {username}")]
    AuthFailed { username: String },
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8Encoding { field: &'static str },
    #[error("command not supported: 0x{code:02x}")]
    CommandNotSupported { code: u8 },
    #[error("address type not supported: 0x{atype:02x}")]
    AddrTypeNotSupported { atype: u8 },
    #[error("domain length invalid: {len}")]
    InvalidDomainLength { len: usize },
    #[error("unexpected message in state {state}")]
    UnexpectedMessage { state: &'static str },
    #[error("fragmented UDP datagrams are not supported")]
    FragmentedDatagram,
    #[error("UDP packet too short")]
    UdpPacketTooShort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    pub fn unspecified_v4() -> Self {
        SocksAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn unspecified_v6() -> Self {
        SocksAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
    }

    /// An all-zero address carrying the given address type.
    pub fn zeroed(atyp: u8) -> Self {
        match atyp {
            atype::IPV6 => Self::unspecified_v6(),
            atype::DOMAIN_NAME => SocksAddr::Domain(String::new(), 0),
            _ => Self::unspecified_v4(),
        }
    }

    pub fn atype(&self) -> u8 {
        match self {
            SocksAddr::Ip(SocketAddr::V4(_)) => atype::IPV4,
            SocksAddr::Ip(SocketAddr::V6(_)) => atype::IPV6,
            SocksAddr::Domain(..) => atype::DOMAIN_NAME,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ip(addr) => addr.port(),
            SocksAddr::Domain(_, port) => *port,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            SocksAddr::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            SocksAddr::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            SocksAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> std::result::Result<(), SocksError> {
        match self {
            SocksAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(atype::IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            SocksAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(atype::IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            SocksAddr::Domain(domain, port) => {
                if domain.len() > u8::MAX as usize {
                    return Err(SocksError::InvalidDomainLength { len: domain.len() });
                }
                buf.put_u8(atype::DOMAIN_NAME);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Parses `ATYP ADDR PORT` from the front of `buf`. `Ok(None)` means more
    /// bytes are needed; otherwise returns the address and bytes consumed.
    pub fn parse(buf: &[u8]) -> std::result::Result<Option<(Self, usize)>, SocksError> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        match atyp {
            atype::IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((SocksAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7)))
            }
            atype::IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                let ip = Ipv6Addr::from(octets);
                Ok(Some((SocksAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19)))
            }
            atype::DOMAIN_NAME => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if buf.len() < 2 + len + 2 {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| SocksError::InvalidUtf8Encoding { field: "domain" })?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((SocksAddr::Domain(domain, port), 2 + len + 2)))
            }
            other => Err(SocksError::AddrTypeNotSupported { atype: other }),
        }
    }

    pub async fn read_from<R>(stream: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        let rest = match atyp {
            atype::IPV4 => 4 + 2,
            atype::IPV6 => 16 + 2,
            atype::DOMAIN_NAME => stream.read_u8().await? as usize + 2,
            other => return Err(SocksError::AddrTypeNotSupported { atype: other }.into()),
        };
        let mut buf = Vec::with_capacity(2 + rest);
        buf.push(atyp);
        if atyp == atype::DOMAIN_NAME {
            buf.push((rest - 2) as u8);
        }
        let start = buf.len();
        buf.resize(start + rest, 0);
        stream.read_exact(&mut buf[start..]).await?;

        match Self::parse(&buf)? {
            Some((addr, _)) => Ok(addr),
            None => Err(SocksError::AddrTypeNotSupported { atype: atyp }.into()),
        }
    }
}

impl From<&UnresolvedEndpoint> for SocksAddr {
    fn from(endpoint: &UnresolvedEndpoint) -> Self {
        match endpoint.socket_addr() {
            Some(addr) => SocksAddr::Ip(addr),
            None => SocksAddr::Domain(endpoint.host().to_string(), endpoint.port()),
        }
    }
}

impl From<SocksAddr> for UnresolvedEndpoint {
    fn from(addr: SocksAddr) -> Self {
        match addr {
            SocksAddr::Ip(addr) => UnresolvedEndpoint::from(addr),
            SocksAddr::Domain(host, port) => UnresolvedEndpoint::new(host, port),
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(addr) => write!(f, "{addr}"),
            SocksAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// `VER REP RSV ATYP BND.ADDR BND.PORT`
pub fn encode_reply(code: u8, bound: &SocksAddr) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(3 + bound.serialized_len());
    buf.put_slice(&[VERSION, code, 0x00]);
    if bound.write_to(&mut buf).is_err() {
        // Only reachable for an over-long domain; reply with a zero IPv4 bind.
        buf.truncate(3);
        let _ = SocksAddr::unspecified_v4().write_to(&mut buf);
    }
    buf.to_vec()
}

/// Splits a SOCKS5 UDP request `RSV(2) FRAG ATYP ADDR PORT DATA` into its
/// destination and payload. Fragmented datagrams are refused.
pub fn decode_udp_packet(packet: &[u8]) -> std::result::Result<(SocksAddr, &[u8]), SocksError> {
    if packet.len() < 4 {
        return Err(SocksError::UdpPacketTooShort);
    }
    if packet[2] != 0 {
        return Err(SocksError::FragmentedDatagram);
    }
    match SocksAddr::parse(&packet[3..])? {
        Some((addr, used)) => Ok((addr, &packet[3 + used..])),
        None => Err(SocksError::UdpPacketTooShort),
    }
}

pub fn encode_udp_packet(
    addr: &SocksAddr,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, SocksError> {
    let mut buf = BytesMut::with_capacity(3 + addr.serialized_len() + payload.len());
    buf.put_slice(&[0x00, 0x00, 0x00]);
    addr.write_to(&mut buf)?;
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_needs_more_on_partial_address() {
        assert_eq!(SocksAddr::parse(&[]).unwrap(), None);
        assert_eq!(SocksAddr::parse(&[atype::IPV4, 127, 0]).unwrap(), None);
        assert_eq!(SocksAddr::parse(&[atype::DOMAIN_NAME, 4, b'a']).unwrap(), None);
    }

    #[test]
    fn test_parse_domain() {
        let mut raw = vec![atype::DOMAIN_NAME, 12];
        raw.extend_from_slice(b"example.test");
        raw.extend_from_slice(&80u16.to_be_bytes());
        raw.push(0xAA); // trailing byte is not part of the address
        let (addr, used) = SocksAddr::parse(&raw).unwrap().unwrap();
        assert_eq!(addr, SocksAddr::Domain("example.test".into(), 80));
        assert_eq!(used, raw.len() - 1);
    }

    #[test]
    fn test_parse_rejects_unknown_atype() {
        assert_eq!(
            SocksAddr::parse(&[0x09, 0, 0]).unwrap_err(),
            SocksError::AddrTypeNotSupported { atype: 0x09 }
        );
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            encode_reply(reply::SUCCEEDED, &SocksAddr::unspecified_v4()),
            vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
        let v6 = encode_reply(reply::COMMAND_NOT_SUPPORTED, &SocksAddr::zeroed(atype::IPV6));
        assert_eq!(v6.len(), 3 + 19);
        assert_eq!(v6[1], reply::COMMAND_NOT_SUPPORTED);
        assert_eq!(v6[3], atype::IPV6);
    }

    #[test]
    fn test_endpoint_conversion() {
        let ip = UnresolvedEndpoint::new("10.0.0.1", 443);
        assert_eq!(SocksAddr::from(&ip), SocksAddr::Ip("10.0.0.1:443".parse().unwrap()));
        let host = UnresolvedEndpoint::new("example.test", 80);
        assert_eq!(SocksAddr::from(&host), SocksAddr::Domain("example.test".into(), 80));
        assert_eq!(UnresolvedEndpoint::from(SocksAddr::from(&host)), host);
    }

    #[test]
    fn test_udp_packet_header() {
        let addr = SocksAddr::Ip("192.0.2.1:53".parse().unwrap());
        let packet = encode_udp_packet(&addr, b"query").unwrap();
        let (decoded, payload) = decode_udp_packet(&packet).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(payload, b"query");

        let mut fragmented = packet.clone();
        fragmented[2] = 1;
        assert_eq!(decode_udp_packet(&fragmented).unwrap_err(), SocksError::FragmentedDatagram);
        assert_eq!(decode_udp_packet(&[0, 0]).unwrap_err(), SocksError::UdpPacketTooShort);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let mut raw: &[u8] = &[atype::DOMAIN_NAME, 3, b'a', b'b', b'c', 0x1F, 0x90];
        let addr = SocksAddr::read_from(&mut raw).await.unwrap();
        assert_eq!(addr, SocksAddr::Domain("abc".into(), 8080));
    }
}
