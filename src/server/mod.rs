//! Local Proxy Server
//!
//! Loopback HTTP proxy endpoint. Accepts client connections, optionally
//! checks Basic credentials, dials the requested target through the active
//! chain, and relays bytes until both directions drain.

use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use base64::Engine;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::ActiveChain;
use crate::Result;

/// Upper bound on a client's request head
const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Basic credentials required from local proxy clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// Check a `Proxy-Authorization` header value against these credentials
    fn matches(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.trim().strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        decoded == format!("{}:{}", self.username, self.password).into_bytes()
    }
}

/// The loopback proxy endpoint. Exactly one instance is active at a time;
/// stopping closes the listening socket and ends the accept loop.
pub struct LocalProxyServer {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl LocalProxyServer {
    /// Bind `127.0.0.1:port` and start accepting connections.
    ///
    /// Every accepted connection gets its own handler task; each handler
    /// reads the published chain at dial time, so a rebuild is picked up by
    /// the next connection without restarting the server.
    pub async fn start(
        port: u16,
        auth: Option<BasicAuth>,
        chain: ActiveChain,
    ) -> Result<Self> {
        let bind_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind local proxy to {}", bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!("local proxy listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(listener, auth, chain, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Close the listening socket and wait for the accept loop to end.
    /// In-flight connections are left to finish on their own.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.accept_task.await {
            if !e.is_cancelled() {
                warn!("accept task ended abnormally: {}", e);
            }
        }
        info!("local proxy on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    auth: Option<BasicAuth>,
    chain: ActiveChain,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("local proxy accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted client connection from {}", peer);
                        let auth = auth.clone();
                        let chain = chain.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, auth, chain).await {
                                debug!("connection from {} ended: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// Serve a single client connection end to end
async fn handle_client(
    mut client: TcpStream,
    auth: Option<BasicAuth>,
    chain: ActiveChain,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let head_len = loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break end + 4;
        }
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(anyhow!("request head exceeds {} bytes", MAX_REQUEST_HEAD));
        }
        let read = client.read_buf(&mut buf).await?;
        if read == 0 {
            // Peer went away before sending a full request
            return Ok(());
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(&buf[..head_len]) {
        Ok(httparse::Status::Complete(_)) => {}
        // Malformed input closes the connection silently
        _ => return Ok(()),
    }
    let method = request.method.unwrap_or("").to_string();
    let path = request.path.unwrap_or("").to_string();

    if let Some(expected) = &auth {
        let supplied = header_value(request.headers, "proxy-authorization");
        if !supplied.map(|v| expected.matches(v)).unwrap_or(false) {
            debug!("rejecting {} request without valid proxy credentials", method);
            respond(
                &mut client,
                "407 Proxy Authentication Required",
                &["Proxy-Authenticate: Basic realm=\"proxy\""],
                "",
            )
            .await?;
            return Ok(());
        }
    }

    let Some((host, port)) = request_target(&method, &path) else {
        return Ok(());
    };

    let Some(active) = chain.get().await else {
        warn!("no chain configured, refusing request for {}:{}", host, port);
        respond(&mut client, "500 Internal Server Error", &[], "proxy chain not configured\n")
            .await?;
        return Ok(());
    };

    debug!("proxying {} request for {}:{}", method, host, port);
    let mut upstream = match active.dial(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("chain dial to {}:{} failed: {:#}", host, port, e);
            respond(
                &mut client,
                "503 Service Unavailable",
                &[],
                &format!("upstream dial failed: {:#}\n", e),
            )
            .await?;
            return Ok(());
        }
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        // Bytes the client pipelined behind the CONNECT belong upstream
        if buf.len() > head_len {
            upstream.write_all(&buf[head_len..]).await?;
        }
    } else {
        let head = strip_proxy_headers(&buf[..head_len]);
        upstream.write_all(&head).await?;
        if buf.len() > head_len {
            upstream.write_all(&buf[head_len..]).await?;
        }
    }

    relay(client, upstream).await
}

/// Determine the target host and port for a request
fn request_target(method: &str, path: &str) -> Option<(String, u16)> {
    if method.eq_ignore_ascii_case("CONNECT") {
        // CONNECT authority form: host:port
        return split_host_port(path, 443);
    }
    // Plain proxying uses the absolute URI from the request line
    let url = Url::parse(path).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

/// Split `host:port`, tolerating bracketed IPv6 literals
fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

fn header_value<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// Drop the hop-by-hop proxy headers before forwarding the request head
fn strip_proxy_headers(head: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len());
    for line in head.split_inclusive(|&b| b == b'\n') {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with(b"proxy-authorization:") || lower.starts_with(b"proxy-connection:") {
            continue;
        }
        out.extend_from_slice(line);
    }
    out
}

/// Write a minimal HTTP response and close
async fn respond(
    client: &mut TcpStream,
    status: &str,
    extra_headers: &[&str],
    body: &str,
) -> Result<()> {
    let mut response = format!("HTTP/1.1 {}\r\n", status);
    for header in extra_headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    client.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Relay bytes both ways until both directions have drained
async fn relay(mut client: TcpStream, mut upstream: TcpStream) -> Result<()> {
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(
                "relay finished: {} bytes up, {} bytes down",
                to_upstream, to_client
            );
        }
        Err(e) => {
            // A reset mid-tunnel is normal teardown from the client's view
            debug!("relay terminated: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_matches_expected_token() {
        let auth = BasicAuth {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        // base64("u:p")
        assert!(auth.matches("Basic dTpw"));
        assert!(!auth.matches("Basic dTpx"));
        assert!(!auth.matches("Bearer dTpw"));
        assert!(!auth.matches("dTpw"));
    }

    #[test]
    fn connect_target_parsing() {
        assert_eq!(
            request_target("CONNECT", "example.com:443"),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            request_target("CONNECT", "[::1]:8443"),
            Some(("::1".to_string(), 8443))
        );
        assert_eq!(
            request_target("GET", "http://example.com/index.html"),
            Some(("example.com".to_string(), 80))
        );
        assert_eq!(
            request_target("GET", "http://example.com:8081/x"),
            Some(("example.com".to_string(), 8081))
        );
        assert_eq!(request_target("GET", "/index.html"), None);
    }

    #[test]
    fn proxy_headers_are_stripped() {
        let head = b"GET http://example.com/ HTTP/1.1\r\n\
                     Host: example.com\r\n\
                     Proxy-Authorization: Basic dTpw\r\n\
                     Proxy-Connection: keep-alive\r\n\
                     Accept: */*\r\n\r\n";
        let stripped = strip_proxy_headers(head);
        let text = String::from_utf8(stripped).unwrap();
        assert!(text.contains("Host: example.com"));
        assert!(text.contains("Accept: */*"));
        assert!(!text.to_lowercase().contains("proxy-authorization"));
        assert!(!text.to_lowercase().contains("proxy-connection"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
