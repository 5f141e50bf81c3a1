//! HTTP CONNECT Client Handshake

use anyhow::anyhow;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::types::TargetAddr;
use crate::Result;

/// Upper bound on the proxy's response head. Anything a well-behaved proxy
/// sends back to a CONNECT fits well within this.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Issue a CONNECT request to an HTTP proxy and wait for the 200 response.
///
/// Attaches `Proxy-Authorization: Basic` when credentials are given. Any
/// status other than 200 fails the handshake with the status text.
pub async fn connect(
    stream: &mut TcpStream,
    target: &TargetAddr,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<()> {
    let host = target.http_host();

    let mut request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n",
        host, port, host, port
    );
    if let Some((username, password)) = auth {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", credentials));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| anyhow!("failed to send CONNECT request: {}", e))?;

    let head = read_response_head(stream).await?;
    let status_line = head
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty response from proxy"))?;

    if !is_connect_success(status_line) {
        return Err(anyhow!(
            "proxy refused CONNECT to {}:{}: {}",
            host,
            port,
            status_line
        ));
    }

    debug!("HTTP CONNECT to {}:{} established", host, port);
    Ok(())
}

/// Read until the blank line ending the response head, bounded
async fn read_response_head(stream: &mut TcpStream) -> Result<String> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            return Ok(head);
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(anyhow!("proxy response head exceeds {} bytes", MAX_RESPONSE_HEAD));
        }
        let read = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| anyhow!("failed to read CONNECT response: {}", e))?;
        if read == 0 {
            return Err(anyhow!("proxy closed connection during CONNECT"));
        }
    }
}

fn is_connect_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    let version_ok = matches!(parts.next(), Some(v) if v.starts_with("HTTP/1."));
    version_ok && parts.next() == Some("200")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_recognition() {
        assert!(is_connect_success("HTTP/1.1 200 Connection Established"));
        assert!(is_connect_success("HTTP/1.0 200 OK"));
        assert!(!is_connect_success("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!is_connect_success("HTTP/1.1 503 Service Unavailable"));
        assert!(!is_connect_success("garbage"));
    }
}
