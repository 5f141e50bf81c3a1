//! SOCKS5 Client Handshake
//!
//! Drives the client side of the SOCKS5 negotiation over a stream that is
//! already connected to the proxy: method selection, optional RFC 1929
//! username/password sub-negotiation, and the CONNECT request/reply.

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::constants::*;
use crate::protocol::types::TargetAddr;
use crate::Result;

/// Maximum length of the bound address echoed back in the CONNECT reply.
/// Domain names are length-prefixed with a single byte, so nothing larger
/// can legitimately appear on the wire.
const MAX_BOUND_ADDR_LEN: usize = 255;

/// Negotiate with a SOCKS5 proxy and request a connection to `target:port`.
///
/// On success the stream is positioned as if directly connected to the
/// target. Any protocol violation or refusal fails the handshake.
pub async fn connect(
    stream: &mut TcpStream,
    target: &TargetAddr,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<()> {
    let offered_method = if auth.is_some() {
        SOCKS5_AUTH_USERPASS
    } else {
        SOCKS5_AUTH_NONE
    };

    // Method negotiation: offer exactly the one method we can speak
    stream
        .write_all(&[SOCKS5_VERSION, 1, offered_method])
        .await
        .map_err(|e| anyhow!("failed to send greeting: {}", e))?;

    let mut selection = [0u8; 2];
    stream
        .read_exact(&mut selection)
        .await
        .map_err(|e| anyhow!("failed to read method selection: {}", e))?;

    if selection[0] != SOCKS5_VERSION {
        return Err(anyhow!(
            "invalid SOCKS version in method selection: {}",
            selection[0]
        ));
    }
    if selection[1] != offered_method {
        return Err(anyhow!(
            "proxy selected unexpected auth method: offered {:#04x}, got {:#04x}",
            offered_method,
            selection[1]
        ));
    }

    if let Some((username, password)) = auth {
        authenticate(stream, username, password).await?;
    }

    send_connect_request(stream, target, port).await?;
    read_connect_reply(stream, target, port).await
}

/// RFC 1929 username/password sub-negotiation
async fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        return Err(anyhow!("username or password exceeds 255 bytes"));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(SOCKS5_USERPASS_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| anyhow!("failed to send auth request: {}", e))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| anyhow!("failed to read auth response: {}", e))?;

    if response[0] != SOCKS5_USERPASS_VERSION {
        return Err(anyhow!("invalid auth response version: {}", response[0]));
    }
    if response[1] != SOCKS5_USERPASS_SUCCESS {
        return Err(anyhow!(
            "proxy rejected username/password authentication (status {})",
            response[1]
        ));
    }

    debug!("SOCKS5 username/password authentication accepted");
    Ok(())
}

/// Send the CONNECT request: VER CMD RSV ATYP ADDR PORT
async fn send_connect_request(
    stream: &mut TcpStream,
    target: &TargetAddr,
    port: u16,
) -> Result<()> {
    let mut request = Vec::with_capacity(22);
    request.push(SOCKS5_VERSION);
    request.push(SOCKS5_CMD_CONNECT);
    request.push(SOCKS5_RESERVED);
    request.push(target.address_type());

    match target {
        TargetAddr::Ipv4(ip) => request.extend_from_slice(&ip.octets()),
        TargetAddr::Ipv6(ip) => request.extend_from_slice(&ip.octets()),
        TargetAddr::Domain(domain) => {
            if domain.len() > 255 {
                return Err(anyhow!("domain name too long: {}", domain.len()));
            }
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| anyhow!("failed to send connect request: {}", e))
}

/// Read and validate the CONNECT reply, discarding the bound address
async fn read_connect_reply(stream: &mut TcpStream, target: &TargetAddr, port: u16) -> Result<()> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| anyhow!("failed to read connect reply: {}", e))?;

    if header[0] != SOCKS5_VERSION {
        return Err(anyhow!("invalid SOCKS version in reply: {}", header[0]));
    }
    if header[1] != SOCKS5_REPLY_SUCCESS {
        return Err(anyhow!(
            "connect to {}:{} refused, reply code {} ({})",
            target,
            port,
            header[1],
            reply_code_message(header[1])
        ));
    }

    // The bound address is not interesting to a chaining client; consume
    // exactly the advertised number of bytes and move on.
    let addr_len = match header[3] {
        SOCKS5_ADDR_IPV4 => 4,
        SOCKS5_ADDR_IPV6 => 16,
        SOCKS5_ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| anyhow!("failed to read bound domain length: {}", e))?;
            len[0] as usize
        }
        other => return Err(anyhow!("unsupported bound address type: {}", other)),
    };
    if addr_len > MAX_BOUND_ADDR_LEN {
        return Err(anyhow!("bound address length {} out of range", addr_len));
    }

    let mut discard = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut discard)
        .await
        .map_err(|e| anyhow!("failed to read bound address: {}", e))?;

    debug!("SOCKS5 connect to {}:{} established", target, port);
    Ok(())
}
