//! Exposed management API probe
//!
//! Some DHT peers expose their node's management HTTP API to the open
//! internet. When configured to do so, the crawler probes every distinct
//! IP a peer advertises: an identity query always, and a routing-table
//! query only when neighbor persistence is requested. The routing-table
//! dump contains no addresses, so its entries are informational and never
//! extend the crawl frontier.

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Per-address probe timeout; both requests must finish within this
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default port the management API listens on
pub const DEFAULT_PORT: u16 = 5001;

/// Identity document returned by the management API
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IdDocument {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "AgentVersion", default)]
    pub agent_version: String,

    #[serde(rename = "ProtocolVersion", default)]
    pub protocol_version: String,

    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<String>,

    #[serde(rename = "Protocols", default)]
    pub protocols: Vec<String>,
}

/// Routing-table dump returned by the management API
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RoutingTableDocument {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Buckets", default)]
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Bucket {
    #[serde(rename = "LastRefresh", default)]
    pub last_refresh: String,

    #[serde(rename = "Peers", default)]
    pub peers: Vec<BucketPeer>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BucketPeer {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Connected", default)]
    pub connected: bool,

    #[serde(rename = "AgentVersion", default)]
    pub agent_version: String,
}

impl RoutingTableDocument {
    /// Total number of peer entries across all buckets
    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }
}

/// Result of probing one peer's exposed management API
#[derive(Debug, Clone, Default)]
pub struct ApiResult {
    /// Whether any address was actually probed
    pub attempted: bool,

    pub id: Option<IdDocument>,

    pub routing_table: Option<RoutingTableDocument>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("probe timed out")]
    Timeout,
}

/// HTTP client for the exposed management API
pub struct ExposedApiClient {
    http: reqwest::Client,
    port: u16,
}

impl ExposedApiClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_port(DEFAULT_PORT)
    }

    /// Builds a client probing a non-standard port (used by tests)
    pub fn with_port(port: u16) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, port })
    }

    /// Queries the identity endpoint of a node at `ip`
    pub async fn id(&self, ip: IpAddr) -> Result<IdDocument, ApiError> {
        let url = self.endpoint(ip, "/api/v0/id");
        let resp = self.http.post(url).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Queries the routing-table endpoint of a node at `ip`
    pub async fn routing_table(&self, ip: IpAddr) -> Result<RoutingTableDocument, ApiError> {
        let url = self.endpoint(ip, "/api/v0/stats/dht");
        let resp = self
            .http
            .post(url)
            .query(&[("arg", "wan")])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Probes the given IPs one after another until one answers
    ///
    /// Per IP the identity query and, when `fetch_routing_table` is set,
    /// the routing-table query run in parallel inside one
    /// [`REQUEST_TIMEOUT`] window; the first failure aborts that IP and
    /// the probe moves on. Cancelling `scope` abandons the whole probe.
    pub async fn probe(
        &self,
        ips: &[IpAddr],
        fetch_routing_table: bool,
        scope: &CancellationToken,
    ) -> ApiResult {
        let mut attempted = false;
        for &ip in ips {
            attempted = true;

            let outcome = tokio::select! {
                _ = scope.cancelled() => return ApiResult { attempted, ..Default::default() },
                outcome = self.probe_ip(ip, fetch_routing_table) => outcome,
            };

            match outcome {
                Ok((id, routing_table)) => {
                    return ApiResult {
                        attempted,
                        id: Some(id),
                        routing_table,
                    };
                }
                Err(err) => {
                    tracing::debug!(%ip, error = %err, "Management API probe failed");
                }
            }
        }
        ApiResult {
            attempted,
            ..Default::default()
        }
    }

    async fn probe_ip(
        &self,
        ip: IpAddr,
        fetch_routing_table: bool,
    ) -> Result<(IdDocument, Option<RoutingTableDocument>), ApiError> {
        let work = async {
            if fetch_routing_table {
                let (id, rt) = tokio::try_join!(self.id(ip), self.routing_table(ip))?;
                Ok((id, Some(rt)))
            } else {
                Ok((self.id(ip).await?, None))
            }
        };

        match tokio::time::timeout(REQUEST_TIMEOUT, work).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout),
        }
    }

    fn endpoint(&self, ip: IpAddr, path: &str) -> String {
        match ip {
            IpAddr::V4(ip) => format!("http://{}:{}{}", ip, self.port, path),
            IpAddr::V6(ip) => format!("http://[{}]:{}{}", ip, self.port, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn id_body() -> serde_json::Value {
        serde_json::json!({
            "ID": "12D3KooWExample",
            "AgentVersion": "kubo/0.18.0",
            "ProtocolVersion": "ipfs/0.1.0",
            "Addresses": ["/ip4/1.2.3.4/tcp/4001"],
            "Protocols": ["/ipfs/kad/1.0.0", "/ipfs/id/1.0.0"],
        })
    }

    fn routing_table_body() -> serde_json::Value {
        serde_json::json!({
            "Name": "wan",
            "Buckets": [
                { "LastRefresh": "1m", "Peers": [
                    { "ID": "12D3KooWNeighbor", "Connected": true, "AgentVersion": "kubo/0.17.0" },
                ]},
            ],
        })
    }

    async fn client_for(server: &MockServer) -> (ExposedApiClient, IpAddr) {
        let addr = server.address();
        let client = ExposedApiClient::with_port(addr.port()).unwrap();
        (client, addr.ip())
    }

    #[tokio::test]
    async fn test_id_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(id_body()))
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server).await;
        let id = client.id(ip).await.unwrap();
        assert_eq!(id.agent_version, "kubo/0.18.0");
        assert_eq!(id.protocols.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_without_routing_table() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(id_body()))
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server).await;
        let result = client
            .probe(&[ip], false, &CancellationToken::new())
            .await;

        assert!(result.attempted);
        assert!(result.id.is_some());
        assert!(result.routing_table.is_none());
    }

    #[tokio::test]
    async fn test_probe_with_routing_table() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(id_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v0/stats/dht"))
            .respond_with(ResponseTemplate::new(200).set_body_json(routing_table_body()))
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server).await;
        let result = client.probe(&[ip], true, &CancellationToken::new()).await;

        assert!(result.id.is_some());
        let rt = result.routing_table.unwrap();
        assert_eq!(rt.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_is_soft() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/id"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (client, ip) = client_for(&server).await;
        let result = client
            .probe(&[ip], false, &CancellationToken::new())
            .await;

        assert!(result.attempted);
        assert!(result.id.is_none());
    }

    #[tokio::test]
    async fn test_probe_no_ips() {
        let client = ExposedApiClient::new().unwrap();
        let result = client.probe(&[], false, &CancellationToken::new()).await;
        assert!(!result.attempted);
        assert!(result.id.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_probe_stops_immediately() {
        let client = ExposedApiClient::new().unwrap();
        let scope = CancellationToken::new();
        scope.cancel();

        // An unroutable documentation address; cancellation must win
        // before any network activity matters.
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let result = client.probe(&[ip], true, &scope).await;
        assert!(result.id.is_none());
    }
}
