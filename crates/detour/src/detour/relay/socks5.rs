//! Minimal SOCKS5 server handshake: NO AUTH and CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("socks5: unsupported version {0:#04x}")]
    Version(u8),
    #[error("socks5: client offers no acceptable auth method")]
    NoAcceptableMethod,
    #[error("socks5: command {0:#04x} not supported")]
    Command(u8),
    #[error("socks5: address type {0:#04x} not supported")]
    AddressType(u8),
    #[error("socks5: bad domain name")]
    Domain,
    #[error("socks5: io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Runs the greeting and request phases and returns the requested target as
/// `host:port`. Unsupported requests are answered before the error returns.
pub async fn accept<S>(s: &mut S) -> Result<String, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = s.read_u8().await?;
    if ver != VERSION {
        return Err(Socks5Error::Version(ver));
    }
    let n = s.read_u8().await? as usize;
    let mut methods = vec![0u8; n];
    s.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        s.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    s.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 4];
    s.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Socks5Error::Version(head[0]));
    }
    if head[1] != CMD_CONNECT {
        write_reply(s, Reply::CommandNotSupported).await?;
        return Err(Socks5Error::Command(head[1]));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            s.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = s.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            s.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(n) if !n.is_empty() => n,
                _ => return Err(Socks5Error::Domain),
            }
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            s.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        other => {
            write_reply(s, Reply::AddressTypeNotSupported).await?;
            return Err(Socks5Error::AddressType(other));
        }
    };
    let port = s.read_u16().await?;
    Ok(format!("{host}:{port}"))
}

/// Writes a reply with an all-zero IPv4 bound address.
pub async fn write_reply<S>(s: &mut S, reply: Reply) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    s.write_all(&[VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    s.flush().await
}
