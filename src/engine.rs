//! Proxy Engine
//!
//! Process-wide ownership of the active chain and the running local proxy.
//! The chain is single-writer/multi-reader: rebuilds are serialized by a
//! build lock and the finished chain is swapped in whole, so readers always
//! observe either the previous or the new chain, never a partial one.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine as _;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::chain::{Chain, ChainBuilder};
use crate::server::{BasicAuth, LocalProxyServer};
use crate::Result;

/// Shared read handle to the currently published chain.
///
/// Connection handlers capture a clone and read the chain at dial time;
/// dials that started under a previous chain continue unaffected because
/// chains are immutable once built.
#[derive(Clone)]
pub struct ActiveChain {
    inner: Arc<RwLock<Option<Arc<Chain>>>>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn get(&self) -> Option<Arc<Chain>> {
        self.inner.read().await.clone()
    }

    pub async fn publish(&self, chain: Chain) {
        *self.inner.write().await = Some(Arc::new(chain));
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}

impl Default for ActiveChain {
    fn default() -> Self {
        Self::new()
    }
}

/// The entry-point surface a host application drives
pub struct ProxyEngine {
    chain: ActiveChain,
    build_lock: Mutex<()>,
    server: Mutex<Option<LocalProxyServer>>,
}

impl ProxyEngine {
    pub fn new() -> Self {
        Self {
            chain: ActiveChain::new(),
            build_lock: Mutex::new(()),
            server: Mutex::new(None),
        }
    }

    /// Publish an initial empty chain. Returns a liveness indicator for the
    /// embedding layer.
    pub async fn init(&self) -> bool {
        self.chain.publish(Chain::new(Vec::new(), None)).await;
        info!("engine initialized with an empty chain");
        true
    }

    /// Rebuild the chain from a base64-encoded, newline-separated
    /// configuration and publish it.
    ///
    /// A malformed encoding aborts the update and leaves the previously
    /// published chain untouched. Unparsable lines and unresolved hops
    /// degrade inside the build instead of failing it.
    pub async fn update(&self, encoded_config: &str) -> Result<()> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded_config.trim())
            .context("configuration is not valid base64")?;
        let config =
            String::from_utf8(decoded).context("configuration is not valid UTF-8")?;

        // One build at a time; readers of the current chain are not blocked
        let _guard = self.build_lock.lock().await;
        let chain = ChainBuilder::build(&config).await?;
        info!("publishing chain with {} hops", chain.hops().len());
        self.chain.publish(chain).await;
        Ok(())
    }

    /// Start the local proxy on `127.0.0.1:port`, stopping any previous
    /// instance first so no two instances share a port.
    pub async fn start_local_proxy(&self, port: u16, auth: Option<BasicAuth>) -> Result<()> {
        let mut server = self.server.lock().await;
        if let Some(previous) = server.take() {
            info!("stopping previous local proxy before restart");
            previous.stop().await;
        }
        let started = LocalProxyServer::start(port, auth, self.chain.clone()).await?;
        *server = Some(started);
        Ok(())
    }

    /// Stop the local proxy if running; a second stop is a no-op
    pub async fn stop_local_proxy(&self) {
        let mut server = self.server.lock().await;
        match server.take() {
            Some(running) => running.stop().await,
            None => debug!("stop requested with no local proxy running"),
        }
    }

    /// Clear the active chain and stop any running local proxy
    pub async fn destroy(&self) {
        self.stop_local_proxy().await;
        self.chain.clear().await;
        info!("engine destroyed");
    }

    /// Read handle to the published chain
    pub fn active_chain(&self) -> ActiveChain {
        self.chain.clone()
    }

    /// Bound address of the running local proxy, if any
    pub async fn local_proxy_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr())
    }
}

impl Default for ProxyEngine {
    fn default() -> Self {
        Self::new()
    }
}
