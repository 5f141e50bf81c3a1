//! Proxy Chain
//!
//! The ordered, immutable sequence of upstream hops used to reach a
//! destination, and the sequential dial-and-handshake protocol that
//! traverses it.

pub mod builder;

pub use builder::ChainBuilder;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::{self, TargetAddr};
use crate::resolver::DohResolver;
use crate::Result;

/// Deadline for a full chain traversal, from client request to established
/// stream
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol spoken to an upstream hop.
///
/// An `https://` hop is an HTTP-protocol hop: the scheme only selects the
/// client handshake, no TLS is established to the hop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopProtocol {
    Socks5,
    Http,
}

impl HopProtocol {
    /// Port assumed when the hop URL omits one
    pub fn default_port(&self) -> u16 {
        match self {
            HopProtocol::Socks5 => 1080,
            HopProtocol::Http => 8080,
        }
    }
}

impl fmt::Display for HopProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopProtocol::Socks5 => write!(f, "socks5"),
            HopProtocol::Http => write!(f, "http"),
        }
    }
}

/// Credentials for an upstream hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopAuth {
    pub username: String,
    pub password: String,
}

/// A host and port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One upstream proxy in the chain.
///
/// `resolved` is always populated before the hop participates in a dial:
/// when resolution failed it carries the original host, so the TCP dial
/// fails explicitly instead of the hop being skipped.
#[derive(Debug, Clone)]
pub struct HopDescriptor {
    pub protocol: HopProtocol,
    pub original: HostPort,
    pub resolved: HostPort,
    pub auth: Option<HopAuth>,
}

impl HopDescriptor {
    fn auth_pair(&self) -> Option<(&str, &str)> {
        self.auth
            .as_ref()
            .map(|a| (a.username.as_str(), a.password.as_str()))
    }

    /// Run this hop's client handshake on an established stream, asking the
    /// hop to connect onward to `target:port`
    pub async fn connect_through(
        &self,
        stream: &mut TcpStream,
        target: &TargetAddr,
        port: u16,
    ) -> Result<()> {
        match self.protocol {
            HopProtocol::Socks5 => {
                protocol::socks5::connect(stream, target, port, self.auth_pair()).await
            }
            HopProtocol::Http => {
                protocol::http::connect(stream, target, port, self.auth_pair()).await
            }
        }
    }
}

/// The resolved hop sequence plus the resolver used for destination lookups
/// when no hop is present. Immutable once built; superseded, never mutated.
pub struct Chain {
    hops: Vec<HopDescriptor>,
    resolver: Option<Arc<DohResolver>>,
}

impl Chain {
    pub fn new(hops: Vec<HopDescriptor>, resolver: Option<Arc<DohResolver>>) -> Self {
        Self { hops, resolver }
    }

    pub fn hops(&self) -> &[HopDescriptor] {
        &self.hops
    }

    pub fn resolver(&self) -> Option<&Arc<DohResolver>> {
        self.resolver.as_ref()
    }

    /// Establish a stream to `host:port` through every hop in configured
    /// order, bounded by [`DIAL_TIMEOUT`]
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        match timeout(DIAL_TIMEOUT, self.dial_sequence(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "dial to {}:{} timed out after {:?}",
                host,
                port,
                DIAL_TIMEOUT
            )),
        }
    }

    async fn dial_sequence(&self, host: &str, port: u16) -> Result<TcpStream> {
        if self.hops.is_empty() {
            return match &self.resolver {
                Some(resolver) => resolver.dial(host, port).await,
                None => TcpStream::connect((host, port))
                    .await
                    .with_context(|| format!("failed to connect to {}:{}", host, port)),
            };
        }

        let first = &self.hops[0];
        debug!(
            "dialing {}:{} through {} hop chain",
            host,
            port,
            self.hops.len()
        );
        let mut stream = TcpStream::connect((first.resolved.host.as_str(), first.resolved.port))
            .await
            .with_context(|| format!("failed to connect to hop 0 ({})", first.original))?;

        // Each hop is asked to reach the next hop's resolved address; the
        // last hop is asked to reach the destination itself.
        for (i, hop) in self.hops.iter().enumerate() {
            let (target, target_port, label) = match self.hops.get(i + 1) {
                Some(next) => (
                    TargetAddr::parse(&next.resolved.host),
                    next.resolved.port,
                    next.original.to_string(),
                ),
                None => (TargetAddr::parse(host), port, format!("{}:{}", host, port)),
            };
            debug!("hop {} ({}) connecting to {}", i, hop.original, label);
            hop.connect_through(&mut stream, &target, target_port)
                .await
                .with_context(|| {
                    format!("hop {} ({}) failed to reach {}", i, hop.original, label)
                })?;
        }

        Ok(stream)
    }
}
