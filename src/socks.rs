//! SOCKS5 (RFC 1928) wire format, CONNECT only.
//!
//! The greeting is always answered with "no authentication required"; the
//! offered method list is read and ignored. Replies echo the client's own
//! request with only the status byte changed, not the bound address the RFC
//! asks for. Permissive clients accept both.

use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SOCKS_VERSION: u8 = 0x05;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const METHOD_NO_AUTH: u8 = 0x00;

/// Reply to every well-formed greeting.
pub const GREETING_REPLY: [u8; 2] = [SOCKS_VERSION, METHOD_NO_AUTH];

/// Status byte written into the echoed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    /// Every channel failure collapses to this code.
    Failure = 0x05,
}

/// The peer is not speaking the subset of SOCKS5 served here.
///
/// None of these produce a reply: the connection is dropped.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("client socket: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

/// `[0x05, NMETHODS, METHOD...]`.
pub async fn read_greeting<R>(reader: &mut R) -> Result<Greeting, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }
    let count = reader.read_u8().await?;
    let mut methods = vec![0u8; usize::from(count)];
    reader.read_exact(&mut methods).await?;
    Ok(Greeting { methods })
}

/// Destination named by a CONNECT request, as the remote side should see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed CONNECT request together with its exact wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    destination: Destination,
    raw: Vec<u8>,
}

impl ConnectRequest {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The request bytes with byte 1 replaced by `code`.
    pub fn reply(&self, code: ReplyCode) -> Vec<u8> {
        let mut reply = self.raw.clone();
        reply[1] = code as u8;
        reply
    }
}

/// `[0x05, CMD, RSV, ATYP, DST.ADDR, DST.PORT]`.
pub async fn read_request<R>(reader: &mut R) -> Result<ConnectRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(HandshakeError::UnsupportedVersion(header[0]));
    }
    if header[1] != CMD_CONNECT {
        return Err(HandshakeError::UnsupportedCommand(header[1]));
    }

    let mut raw = header.to_vec();
    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            raw.extend_from_slice(&octets);
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            reader.read_exact(&mut name).await?;
            raw.push(len);
            raw.extend_from_slice(&name);
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            raw.extend_from_slice(&octets);
            ipv6_groups(&octets)
        }
        other => return Err(HandshakeError::UnsupportedAddressType(other)),
    };

    let port = reader.read_u16().await?;
    raw.extend_from_slice(&port.to_be_bytes());

    Ok(ConnectRequest {
        destination: Destination { host, port },
        raw,
    })
}

/// Eight colon-separated hex groups, no zero compression.
fn ipv6_groups(octets: &[u8; 16]) -> String {
    octets
        .chunks_exact(2)
        .map(|pair| format!("{:x}", u16::from_be_bytes([pair[0], pair[1]])))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn greeting_methods_are_read_but_not_judged() {
        let mut wire: &[u8] = &[0x05, 0x02, 0x02, 0x80];
        let greeting = read_greeting(&mut wire).await.unwrap();
        assert_eq!(greeting.methods, vec![0x02, 0x80]);
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn non_socks5_greeting_is_rejected() {
        let mut wire: &[u8] = &[0x04, 0x01, 0x00];
        let err = read_greeting(&mut wire).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion(0x04)));
    }

    #[tokio::test]
    async fn truncated_greeting_is_an_io_error() {
        let mut wire: &[u8] = &[0x05, 0x03, 0x00];
        let err = read_greeting(&mut wire).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }

    #[tokio::test]
    async fn ipv4_request_parses_dotted_quad_and_big_endian_port() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let mut wire: &[u8] = &bytes;
        let request = read_request(&mut wire).await.unwrap();
        assert_eq!(
            request.destination(),
            &Destination {
                host: "93.184.216.34".into(),
                port: 443
            }
        );
        assert_eq!(request.as_bytes(), &bytes);
    }

    #[tokio::test]
    async fn domain_request_uses_length_prefixed_name() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 11];
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&80u16.to_be_bytes());
        let mut wire: &[u8] = &bytes;
        let request = read_request(&mut wire).await.unwrap();
        assert_eq!(request.destination().host, "example.com");
        assert_eq!(request.destination().port, 80);
        assert_eq!(request.destination().to_string(), "example.com:80");
    }

    #[tokio::test]
    async fn ipv6_request_renders_uncompressed_groups() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x01,
        ]);
        bytes.extend_from_slice(&8080u16.to_be_bytes());
        let mut wire: &[u8] = &bytes;
        let request = read_request(&mut wire).await.unwrap();
        assert_eq!(request.destination().host, "2001:db8:0:0:0:0:0:1");
        assert_eq!(request.destination().to_string(), "[2001:db8:0:0:0:0:0:1]:8080");
    }

    #[tokio::test]
    async fn bind_and_udp_associate_are_unsupported() {
        for cmd in [0x02, 0x03] {
            let bytes = [0x05, cmd, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
            let mut wire: &[u8] = &bytes;
            let err = read_request(&mut wire).await.unwrap_err();
            assert!(matches!(err, HandshakeError::UnsupportedCommand(c) if c == cmd));
        }
    }

    #[tokio::test]
    async fn unknown_address_type_is_rejected() {
        let bytes = [0x05, 0x01, 0x00, 0x02, 0, 0, 0, 0, 0, 80];
        let mut wire: &[u8] = &bytes;
        let err = read_request(&mut wire).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedAddressType(0x02)));
    }

    #[tokio::test]
    async fn replies_echo_request_with_status_byte() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90];
        let mut wire: &[u8] = &bytes;
        let request = read_request(&mut wire).await.unwrap();

        let ok = request.reply(ReplyCode::Succeeded);
        let failed = request.reply(ReplyCode::Failure);
        assert_eq!(ok, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90]);
        assert_eq!(failed, [0x05, 0x05, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90]);
    }
}
