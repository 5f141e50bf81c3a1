//! Tests for the client-side SOCKS5 and HTTP CONNECT handshakes

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxychain::protocol::{http, socks5, TargetAddr};

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn socks5_success_consumes_domain_bound_address_exactly() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        stream.write_all(&[5, 0]).await.unwrap();

        // VER CMD RSV ATYP LEN <domain> PORT
        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[5, 1, 0, 3]);
        let domain_len = head[4] as usize;
        let mut rest = vec![0u8; domain_len + 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest[..domain_len], b"example.com");
        assert_eq!(&rest[domain_len..], &443u16.to_be_bytes());

        // Success reply with a domain-typed bound address, then a sentinel
        // byte that must be the first thing the client sees afterwards
        let bound = b"relay.example";
        let mut reply = vec![5, 0, 0, 3, bound.len() as u8];
        reply.extend_from_slice(bound);
        reply.extend_from_slice(&1080u16.to_be_bytes());
        reply.push(0xEE);
        stream.write_all(&reply).await.unwrap();

        // Keep the socket alive until the client has read the sentinel
        let mut end = [0u8; 1];
        let _ = stream.read(&mut end).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    socks5::connect(&mut stream, &TargetAddr::parse("example.com"), 443, None)
        .await
        .unwrap();

    let mut sentinel = [0u8; 1];
    stream.read_exact(&mut sentinel).await.unwrap();
    assert_eq!(sentinel[0], 0xEE);

    drop(stream);
    server.await.unwrap();
}

#[tokio::test]
async fn socks5_unexpected_method_selection_is_fatal() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        // Select username/password even though only no-auth was offered
        stream.write_all(&[5, 2]).await.unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let err = socks5::connect(&mut stream, &TargetAddr::parse("example.com"), 80, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unexpected auth method"));
}

#[tokio::test]
async fn socks5_credential_rejection_is_distinguishable() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 2]);
        stream.write_all(&[5, 2]).await.unwrap();

        // Read the RFC 1929 sub-negotiation, then reject it
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let mut username = vec![0u8; header[1] as usize];
        stream.read_exact(&mut username).await.unwrap();
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await.unwrap();
        let mut password = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut password).await.unwrap();
        stream.write_all(&[1, 1]).await.unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let err = socks5::connect(
        &mut stream,
        &TargetAddr::parse("example.com"),
        80,
        Some(("user", "wrong")),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("rejected username/password"));
}

#[tokio::test]
async fn socks5_nonzero_reply_code_surfaces_in_error() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        stream.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; 6]; // IPv4 request remainder
        stream.read_exact(&mut rest).await.unwrap();

        // Reply code 5: connection refused
        stream
            .write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let err = socks5::connect(&mut stream, &TargetAddr::parse("192.0.2.1"), 80, None)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("reply code 5"));
    assert!(message.contains("connection refused"));
}

#[tokio::test]
async fn http_connect_succeeds_and_sends_basic_credentials() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        let request = String::from_utf8(buf).unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        // base64("u:p")
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    http::connect(
        &mut stream,
        &TargetAddr::parse("example.com"),
        443,
        Some(("u", "p")),
    )
    .await
    .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn http_connect_failure_surfaces_status_text() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let err = http::connect(&mut stream, &TargetAddr::parse("example.com"), 443, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("407 Proxy Authentication Required"));
}

#[tokio::test]
async fn http_connect_without_credentials_sends_no_auth_header() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        let request = String::from_utf8(buf).unwrap();
        assert!(!request.to_lowercase().contains("proxy-authorization"));
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    http::connect(&mut stream, &TargetAddr::parse("example.com"), 80, None)
        .await
        .unwrap();
    server.await.unwrap();
}
