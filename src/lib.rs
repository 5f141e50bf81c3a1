//! Proxychain Library
//!
//! Local HTTP forward proxy that relays client traffic through an ordered
//! chain of upstream SOCKS5/HTTP proxies. Hop and destination hostnames are
//! resolved over DNS-over-HTTPS with optional public-key pinning.

pub mod chain;
pub mod engine;
pub mod protocol;
pub mod resolver;
pub mod server;

pub use chain::{Chain, ChainBuilder, HopAuth, HopDescriptor, HopProtocol};
pub use engine::{ActiveChain, ProxyEngine};
pub use resolver::DohResolver;
pub use server::{BasicAuth, LocalProxyServer};

/// Common error type for the proxy engine
pub type Result<T> = anyhow::Result<T>;
