//! DNS-over-HTTPS Resolver
//!
//! Resolves hostnames by POSTing wire-format DNS queries to an HTTPS
//! endpoint. The TLS session is pinned to the provider's SPKI hash when the
//! endpoint is a known provider, and also serves as the dialer for
//! destination hosts when the chain has no hops.

pub mod pins;
pub mod tls;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use crate::Result;

const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Client-level timeout for each DoH HTTP request
const DOH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// DNS-over-HTTPS resolver with optional SPKI pinning
pub struct DohResolver {
    endpoint: Url,
    client: reqwest::Client,
    strict: bool,
}

impl DohResolver {
    /// Create a resolver for the given HTTPS endpoint.
    ///
    /// The pin table is consulted with the endpoint hostname; a miss means
    /// root-store validation. `strict` records whether a failed lookup may
    /// fall back to the system resolver during chain construction.
    pub fn new(endpoint: &str, strict: bool) -> Result<Self> {
        let endpoint: Url = endpoint
            .parse()
            .with_context(|| format!("invalid DoH URL '{}'", endpoint))?;
        if endpoint.scheme() != "https" {
            return Err(anyhow!(
                "unsupported DoH URL scheme '{}'",
                endpoint.scheme()
            ));
        }
        let host = endpoint
            .host_str()
            .ok_or_else(|| anyhow!("missing host in DoH URL"))?;

        let pin = pins::pin_for_host(host).map(str::to_owned);
        match &pin {
            Some(_) => debug!("using built-in SPKI pin for DoH provider {}", host),
            None => debug!("no pin for DoH endpoint {}, using root-store validation", host),
        }

        let tls = tls::client_config(pin)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(DOH_REQUEST_TIMEOUT)
            .build()
            .context("failed to build DoH client")?;

        Ok(Self {
            endpoint,
            client,
            strict,
        })
    }

    /// Whether a failed DoH lookup is allowed to fall back to system DNS
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Resolve a host to its A-record addresses, in server-supplied order.
    ///
    /// Literal IP addresses are returned unchanged without a network round
    /// trip. No answers or a non-success HTTP status is a resolution error.
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let query = build_query(host)?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, DOH_CONTENT_TYPE)
            .body(query)
            .send()
            .await
            .with_context(|| format!("DoH request to {} failed", self.endpoint))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "DoH server {} returned {}",
                self.endpoint,
                response.status()
            ));
        }

        let body = response
            .bytes()
            .await
            .context("failed to read DoH response body")?;
        let addrs = parse_answers(&body)?;
        if addrs.is_empty() {
            return Err(anyhow!("DoH lookup for {} returned no A records", host));
        }

        debug!("resolved {} to {} addresses via DoH", host, addrs.len());
        Ok(addrs)
    }

    /// Lookup-then-connect path used for destination hosts when the chain
    /// has zero hops. Tries each resolved address in order.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs = self.lookup_ip(host).await?;

        let mut last_error = None;
        for ip in addrs {
            let addr = SocketAddr::new(ip, port);
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(anyhow!("failed to connect to {}:{}: {}", host, port, e)),
            None => Err(anyhow!("no addresses resolved for {}:{}", host, port)),
        }
    }
}

/// Encode a standard A-record query in DNS wire format
fn build_query(host: &str) -> Result<Vec<u8>> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{}.", host)
    };
    let name =
        Name::from_str(&fqdn).with_context(|| format!("invalid domain name '{}'", host))?;

    let mut message = Message::new();
    message.add_query(Query::query(name, RecordType::A));
    message.set_recursion_desired(true);
    message.to_vec().context("failed to encode DNS query")
}

/// Unpack a DNS response message, keeping A records in answer order
fn parse_answers(body: &[u8]) -> Result<Vec<IpAddr>> {
    let message = Message::from_vec(body).context("invalid DNS response message")?;
    let mut addrs = Vec::new();
    for record in message.answers() {
        if let Some(RData::A(a)) = record.data() {
            addrs.push(IpAddr::V4(a.0));
        }
    }
    Ok(addrs)
}
