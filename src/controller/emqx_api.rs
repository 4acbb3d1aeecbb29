//! Client for the EMQX management API
//!
//! Only the read endpoints the operator consumes are covered: nodes,
//! listeners, gateways and per-gateway listeners. A non-200 status or a body
//! that does not decode fails that call; listener discovery keeps the
//! results of the calls that succeeded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::crd::EmqxNode;
use crate::error::{Error, Result};

/// Dashboard / management API port inside EMQX pods
pub const MANAGEMENT_PORT: u16 = 18083;

/// Per-call timeout for management API requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const API_PREFIX: &str = "/api/v5";

/// A listener as reported by `GET /listeners` or `GET /gateway/{name}/listeners`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Listener {
    /// Listener identifier, e.g. `tcp:default` or `stomp:tcp:default`
    pub id: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Bind address; EMQX reports either a string or a bare port number
    #[serde(deserialize_with = "bind_as_string")]
    pub bind: String,
    /// Listener type, e.g. `tcp`, `ssl`, `ws`, `quic`, `udp`, `dtls`
    #[serde(rename = "type")]
    pub type_: String,
}

fn default_enable() -> bool {
    true
}

fn bind_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Bind {
        Text(String),
        Port(u64),
    }

    Ok(match Bind::deserialize(deserializer)? {
        Bind::Text(text) => text,
        Bind::Port(port) => port.to_string(),
    })
}

/// A protocol gateway as reported by `GET /gateway`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Gateway {
    pub name: String,
    /// `running`, `stopped` or `unloaded`
    #[serde(default)]
    pub status: String,
}

impl Gateway {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Read side of the EMQX management API
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn nodes(&self) -> Result<Vec<EmqxNode>>;
    async fn listeners(&self) -> Result<Vec<Listener>>;
    async fn gateways(&self) -> Result<Vec<Gateway>>;
    async fn gateway_listeners(&self, gateway: &str) -> Result<Vec<Listener>>;
}

/// Basic-auth credentials (bootstrap API key) for the management API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
}

/// HTTP implementation of [`AdminApi`]
#[derive(Clone, Debug)]
pub struct EmqxApiClient {
    http: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl EmqxApiClient {
    pub fn new(base_url: impl Into<String>, credentials: ApiCredentials) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("emqx-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}{}", self.base_url, API_PREFIX, path);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.credentials.key, Some(&self.credentials.secret))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AdminApiError {
                operation: format!("GET {path}"),
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::SerializationError(e).context(format!("decode response of GET {path}"))
        })
    }
}

#[async_trait]
impl AdminApi for EmqxApiClient {
    async fn nodes(&self) -> Result<Vec<EmqxNode>> {
        self.get_json("/nodes").await
    }

    async fn listeners(&self) -> Result<Vec<Listener>> {
        self.get_json("/listeners").await
    }

    async fn gateways(&self) -> Result<Vec<Gateway>> {
        self.get_json("/gateway").await
    }

    async fn gateway_listeners(&self, gateway: &str) -> Result<Vec<Listener>> {
        self.get_json(&format!("/gateway/{gateway}/listeners")).await
    }
}

/// Outcome of [`discover_listeners`]: what was found and which calls failed
#[derive(Debug, Default)]
pub struct ListenerDiscovery {
    pub listeners: Vec<Listener>,
    pub errors: Vec<Error>,
}

impl ListenerDiscovery {
    /// Discovery that never reached the API
    pub fn failed(error: Error) -> Self {
        Self {
            listeners: Vec::new(),
            errors: vec![error],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Failed calls joined into one line, for logs and events
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Every listener the cluster exposes: its own listeners plus those of each
/// running gateway, deduplicated by id (first occurrence wins).
///
/// A failing call does not discard what earlier calls returned; it is
/// recorded in [`ListenerDiscovery::errors`] and discovery moves on.
pub async fn discover_listeners(api: &dyn AdminApi) -> ListenerDiscovery {
    let mut discovery = ListenerDiscovery::default();

    match api.listeners().await {
        Ok(listeners) => discovery.listeners.extend(listeners),
        Err(e) => discovery.errors.push(e),
    }

    match api.gateways().await {
        Ok(gateways) => {
            for gateway in gateways {
                if !gateway.is_running() {
                    debug!("Skipping gateway {} ({})", gateway.name, gateway.status);
                    continue;
                }
                match api.gateway_listeners(&gateway.name).await {
                    Ok(listeners) => discovery.listeners.extend(listeners),
                    Err(e) => discovery.errors.push(e),
                }
            }
        }
        Err(e) => discovery.errors.push(e),
    }

    let mut seen = std::collections::HashSet::new();
    discovery.listeners.retain(|l| seen.insert(l.id.clone()));
    discovery
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeRole;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> ApiCredentials {
        ApiCredentials {
            key: "emqx-operator".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    async fn client_for(server: &MockServer) -> EmqxApiClient {
        EmqxApiClient::new(server.uri(), credentials()).unwrap()
    }

    #[tokio::test]
    async fn test_nodes_decodes_management_api_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/nodes"))
            .and(basic_auth("emqx-operator", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "node": "emqx@emqx-core-0.emqx-headless.default.svc.cluster.local",
                    "node_status": "running",
                    "otp_release": "24.3.4.2-3/12.3.2.2",
                    "version": "5.1.0",
                    "role": "core",
                    "edition": "Opensource",
                    "uptime": 120000
                },
                {
                    "node": "emqx@10.0.0.7",
                    "node_status": "stopped",
                    "version": "5.1.0",
                    "role": "replicant"
                }
            ])))
            .mount(&server)
            .await;

        let nodes = client_for(&server).await.nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].is_running());
        assert_eq!(nodes[0].role, NodeRole::Core);
        assert_eq!(nodes[1].host(), "10.0.0.7");
        assert!(!nodes[1].is_running());
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/nodes"))
            .respond_with(ResponseTemplate::new(401).set_body_string("BAD_API_KEY_OR_SECRET"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.nodes().await.unwrap_err();
        match err {
            Error::AdminApiError { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "BAD_API_KEY_OR_SECRET");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/listeners"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"not\":\"a list\"}"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.listeners().await.unwrap_err();
        assert_eq!(err.kind(), "serialization");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_discover_listeners_descends_into_running_gateways() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/listeners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "tcp:default", "enable": true, "bind": "0.0.0.0:1883", "type": "tcp"},
                {"id": "ws:default", "enable": true, "bind": "0.0.0.0:8083", "type": "ws"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "stomp", "status": "running"},
                {"name": "coap", "status": "unloaded"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway/stomp/listeners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "stomp:tcp:default", "enable": true, "bind": 61613, "type": "tcp"},
                {"id": "tcp:default", "enable": true, "bind": "1883", "type": "tcp"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let discovery = discover_listeners(&client).await;
        assert!(discovery.is_complete());
        let listeners = discovery.listeners;
        let ids: Vec<_> = listeners.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["tcp:default", "ws:default", "stomp:tcp:default"]);
        assert_eq!(listeners[0].bind, "0.0.0.0:1883");
        assert_eq!(listeners[2].bind, "61613");
    }

    #[tokio::test]
    async fn test_discover_listeners_keeps_results_when_gateway_call_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/listeners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "tcp:default", "enable": true, "bind": "0.0.0.0:1883", "type": "tcp"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let discovery = discover_listeners(&client).await;
        assert!(!discovery.is_complete());
        assert_eq!(discovery.listeners.len(), 1);
        assert_eq!(discovery.listeners[0].id, "tcp:default");
        assert_eq!(discovery.errors.len(), 1);
        assert!(discovery.error_summary().contains("GET /gateway"));
    }

    #[tokio::test]
    async fn test_discover_listeners_skips_a_failing_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/listeners"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "mqttsn", "status": "running"},
                {"name": "stomp", "status": "running"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway/mqttsn/listeners"))
            .respond_with(ResponseTemplate::new(404).set_body_string("NOT_FOUND"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v5/gateway/stomp/listeners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "stomp:tcp:default", "enable": true, "bind": 61613, "type": "tcp"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let discovery = discover_listeners(&client).await;
        let ids: Vec<_> = discovery.listeners.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["stomp:tcp:default"]);
        assert_eq!(discovery.errors.len(), 2);
    }
}
