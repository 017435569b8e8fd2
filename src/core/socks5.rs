//! SOCKS5 protocol parsing (RFC 1928 subset)
//!
//! Implements the slice of the protocol this proxy speaks:
//! - Negotiation: `VER(1) NMETHODS(1) METHODS(n)`, answered with `05 00`
//!   when the no-auth method is offered
//! - Request: `VER(1) CMD(1) RSV(1) ATYP(1) DST.ADDR(var) DST.PORT(2, BE)`
//! - Success reply: `05 00 00 01 BND.ADDR(4) BND.PORT(2)`, always encoded
//!   with the IPv4 address type
//!
//! Failures never produce coded SOCKS error replies; the connection is
//! simply closed by the caller.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ForwardError, Result};

/// Protocol version
pub const VER: u8 = 5;

/// The only authentication method this proxy accepts
pub const METHOD_NO_AUTH: u8 = 0;

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Cmd {
    /// TCP connect
    Connect = 1,
    /// TCP bind (parsed, never relayed)
    Bind = 2,
    /// UDP associate (parsed, never relayed)
    UdpAssociate = 3,
}

impl TryFrom<u8> for Socks5Cmd {
    type Error = &'static str;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Socks5Cmd::Connect),
            2 => Ok(Socks5Cmd::Bind),
            3 => Ok(Socks5Cmd::UdpAssociate),
            _ => Err("invalid socks5 command"),
        }
    }
}

impl fmt::Display for Socks5Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Socks5Cmd::Connect => write!(f, "CONNECT"),
            Socks5Cmd::Bind => write!(f, "BIND"),
            Socks5Cmd::UdpAssociate => write!(f, "UDP"),
        }
    }
}

/// Destination address carried in a request
///
/// IPv6 is rejected at parse time, so it never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    IPv4(Ipv4Addr),
    Domain(String),
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestAddr::IPv4(ip) => write!(f, "{}", ip),
            DestAddr::Domain(name) => write!(f, "{}", name),
        }
    }
}

/// A parsed SOCKS5 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub cmd: Socks5Cmd,
    pub dest: DestAddr,
    pub port: u16,
}

impl fmt::Display for Socks5Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.cmd, self.dest, self.port)
    }
}

impl Socks5Request {
    /// Read one request off the wire
    ///
    /// The version byte is read but not checked, matching the negotiation
    /// phase: a client that got this far already spoke version 5.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await?;
        let [_ver, cmd, _rsv, atyp] = head;

        let cmd = Socks5Cmd::try_from(cmd).map_err(|e| ForwardError::Protocol(e.to_string()))?;

        let dest = match atyp {
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let name = String::from_utf8(name).map_err(|_| {
                    ForwardError::Protocol("destination name is not valid utf-8".to_string())
                })?;
                DestAddr::Domain(name)
            }
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                DestAddr::IPv4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                return Err(ForwardError::Unsupported(
                    "IPv6 destinations are not supported".to_string(),
                ))
            }
            other => {
                return Err(ForwardError::Protocol(format!(
                    "unknown address type: {}",
                    other
                )))
            }
        };

        let port = reader.read_u16().await?;
        Ok(Self { cmd, dest, port })
    }
}

/// Negotiate the no-auth method
///
/// Reads `VER NMETHODS METHODS`; replies `05 00` when method 0x00 is
/// offered. A client that never offers no-auth gets no reply at all, only
/// a protocol error (and therefore a closed connection).
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        return Err(ForwardError::Protocol(
            "client offered no acceptable authentication method".to_string(),
        ));
    }

    stream.write_all(&[VER, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Encode the 10-byte success reply
///
/// Carries the outbound socket's locally bound address. The reply address
/// type is always IPv4; a non-IPv4 bound address encodes as 0.0.0.0.
pub fn success_reply(bound: SocketAddr) -> [u8; 10] {
    let ip = match bound {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => [0, 0, 0, 0],
    };
    let port = bound.port().to_be_bytes();
    [
        VER, 0x00, 0x00, ATYP_IPV4, ip[0], ip[1], ip[2], ip[3], port[0], port[1],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_read_connect_ipv4() {
        let mut wire: &[u8] = &[5, 1, 0, 1, 93, 184, 216, 34, 0, 80];
        let req = Socks5Request::read_from(&mut wire).await.unwrap();
        assert_eq!(req.cmd, Socks5Cmd::Connect);
        assert_eq!(req.dest, DestAddr::IPv4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(req.port, 80);
    }

    #[tokio::test]
    async fn test_read_connect_domain() {
        let mut wire: Vec<u8> = vec![5, 1, 0, 3, 11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());
        let mut wire = wire.as_slice();
        let req = Socks5Request::read_from(&mut wire).await.unwrap();
        assert_eq!(req.dest, DestAddr::Domain("example.com".to_string()));
        assert_eq!(req.port, 443);
    }

    #[tokio::test]
    async fn test_port_is_big_endian() {
        let mut wire: &[u8] = &[5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90];
        let req = Socks5Request::read_from(&mut wire).await.unwrap();
        assert_eq!(req.port, 8080);
    }

    #[tokio::test]
    async fn test_ipv6_is_unsupported() {
        let mut wire: Vec<u8> = vec![5, 1, 0, 4];
        wire.extend_from_slice(&[0u8; 16]);
        wire.extend_from_slice(&443u16.to_be_bytes());
        let mut wire = wire.as_slice();
        let err = Socks5Request::read_from(&mut wire).await.unwrap_err();
        assert!(matches!(err, ForwardError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_unknown_atyp_is_a_protocol_error() {
        let mut wire: &[u8] = &[5, 1, 0, 9, 1, 2, 3, 4, 0, 80];
        let err = Socks5Request::read_from(&mut wire).await.unwrap_err();
        assert!(matches!(err, ForwardError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_bind_is_parsed() {
        let mut wire: &[u8] = &[5, 2, 0, 1, 10, 0, 0, 1, 0, 22];
        let req = Socks5Request::read_from(&mut wire).await.unwrap();
        assert_eq!(req.cmd, Socks5Cmd::Bind);
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let mut wire: &[u8] = &[5, 7, 0, 1, 10, 0, 0, 1, 0, 22];
        assert!(Socks5Request::read_from(&mut wire).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_request_is_an_error() {
        let mut wire: &[u8] = &[5, 1, 0, 1, 127, 0];
        assert!(Socks5Request::read_from(&mut wire).await.is_err());
    }

    #[tokio::test]
    async fn test_negotiate_replies_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[5, 2, 0, 2])
            .await
            .unwrap();

        negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
    }

    #[tokio::test]
    async fn test_negotiate_without_no_auth_fails() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[5, 1, 2])
            .await
            .unwrap();

        let err = negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, ForwardError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_negotiate_zero_methods_fails() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[5, 0])
            .await
            .unwrap();

        assert!(negotiate(&mut server).await.is_err());
    }

    #[test]
    fn test_success_reply_encoding() {
        let bound: SocketAddr = "192.168.1.5:4321".parse().unwrap();
        let reply = success_reply(bound);
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);
        assert_eq!(&reply[4..8], &[192, 168, 1, 5]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 4321);
    }

    #[test]
    fn test_success_reply_v6_bound_encodes_as_zeroes() {
        let bound: SocketAddr = "[::1]:9000".parse().unwrap();
        let reply = success_reply(bound);
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);
        assert_eq!(&reply[4..8], &[0, 0, 0, 0]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 9000);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Socks5Cmd::Connect.to_string(), "CONNECT");
        assert_eq!(Socks5Cmd::Bind.to_string(), "BIND");
        assert_eq!(Socks5Cmd::UdpAssociate.to_string(), "UDP");
    }
}
