//! Engine Client - interface to the ERP engine tenants are provisioned into
//!
//! Two seams are exposed:
//! - [`EngineAdapter`]: resource CRUD plus a raw `proxy` escape hatch
//! - [`EngineHealthProbe`]: reachability / authentication check
//!
//! ```text
//! provisioning steps  -->  EngineAdapter  -->  ERP engine (/api/resource/..)
//! health gate         -->  EngineHealthProbe
//! ```
//!
//! [`HttpEngineClient`] implements both over the engine's REST API. Every call
//! carries the client-wide timeout so a hung engine cannot stall a run.

mod types;

pub use reqwest::Method;
pub use types::*;

use std::{env, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// Default engine URL for local development
pub const DEFAULT_ENGINE_URL: &str = "http://localhost:8000";
pub const DEFAULT_HEALTH_PATH: &str = "/api/method/ping";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Fetch one document (`id` set) or list documents (`params` as filters).
    async fn get(
        &self,
        resource_type: &str,
        id: Option<&str>,
        params: Option<&Value>,
    ) -> Result<EngineResponse, EngineError>;

    async fn create(&self, resource_type: &str, data: &Value) -> Result<EngineResponse, EngineError>;

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Value,
    ) -> Result<EngineResponse, EngineError>;

    async fn delete(&self, resource_type: &str, id: &str) -> Result<EngineResponse, EngineError>;

    /// Raw call for endpoints that are not plain resources (RPC methods etc).
    async fn proxy(
        &self,
        method: Method,
        path: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<EngineResponse, EngineError>;
}

#[async_trait]
pub trait EngineHealthProbe: Send + Sync {
    /// Never fails; problems are reported through the returned status.
    async fn probe(&self, tenant_id: &str) -> EngineHealthReport;
}

#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub timeout: Duration,
    pub health_path: String,
}

impl EngineClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            api_secret: None,
            timeout: DEFAULT_TIMEOUT,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }

    /// Read `ENGINE_*` variables, falling back to local defaults.
    pub fn from_env() -> Self {
        let timeout = env::var("ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self {
            base_url: env::var("ENGINE_BASE_URL").unwrap_or_else(|_| DEFAULT_ENGINE_URL.to_string()),
            api_key: env::var("ENGINE_API_KEY").ok().filter(|v| !v.is_empty()),
            api_secret: env::var("ENGINE_API_SECRET").ok().filter(|v| !v.is_empty()),
            timeout,
            health_path: env::var("ENGINE_HEALTH_PATH")
                .unwrap_or_else(|_| DEFAULT_HEALTH_PATH.to_string()),
        }
    }

    fn authorization(&self) -> Option<String> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(format!("token {key}:{secret}")),
            _ => None,
        }
    }
}

/// REST client for the engine
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    base_url: String,
    health_path: String,
    authorization: Option<String>,
    client: reqwest::Client,
}

impl HttpEngineClient {
    pub fn new(config: &EngineClientConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::new("ClientError", format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_path: normalize_path(&config.health_path),
            authorization: config.authorization(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<EngineResponse, EngineError> {
        let url = format!("{}{}", self.base_url, normalize_path(path));
        debug!(method = method.as_str(), %url, "engine request");

        let mut request = self.client.request(method, &url);
        if let Some(auth) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        if let Some(params) = params {
            request = request.query(&query_pairs(params));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let error = EngineError::from_response(status.as_u16(), &text);
            debug!(status = status.as_u16(), kind = %error.kind, "engine call failed");
            return Err(error);
        }

        if text.trim().is_empty() {
            return Ok(EngineResponse::empty());
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            EngineError::new("DecodeError", format!("Failed to parse engine response: {e}"))
                .with_status(status.as_u16())
        })?;
        Ok(EngineResponse::from_body(body))
    }
}

#[async_trait]
impl EngineAdapter for HttpEngineClient {
    async fn get(
        &self,
        resource_type: &str,
        id: Option<&str>,
        params: Option<&Value>,
    ) -> Result<EngineResponse, EngineError> {
        self.send(Method::GET, &resource_path(resource_type, id), params, None)
            .await
    }

    async fn create(&self, resource_type: &str, data: &Value) -> Result<EngineResponse, EngineError> {
        self.send(Method::POST, &resource_path(resource_type, None), None, Some(data))
            .await
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        data: &Value,
    ) -> Result<EngineResponse, EngineError> {
        self.send(Method::PUT, &resource_path(resource_type, Some(id)), None, Some(data))
            .await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<EngineResponse, EngineError> {
        self.send(Method::DELETE, &resource_path(resource_type, Some(id)), None, None)
            .await
    }

    async fn proxy(
        &self,
        method: Method,
        path: &str,
        params: Option<&Value>,
        body: Option<&Value>,
    ) -> Result<EngineResponse, EngineError> {
        self.send(method, path, params, body).await
    }
}

#[async_trait]
impl EngineHealthProbe for HttpEngineClient {
    async fn probe(&self, tenant_id: &str) -> EngineHealthReport {
        match self.send(Method::GET, &self.health_path, None, None).await {
            Ok(_) => EngineHealthReport::online("Engine is reachable"),
            Err(e) => match e.status_code {
                Some(401) | Some(403) => {
                    warn!(tenant_id, "Engine rejected credentials: {}", e.message);
                    EngineHealthReport::offline("Engine authentication failed", Some(e.message))
                }
                Some(status) => {
                    warn!(tenant_id, status, "Engine answered health probe with an error");
                    EngineHealthReport::degraded(
                        format!("Engine responded with HTTP {status}"),
                        Some(e.message),
                    )
                }
                None => {
                    warn!(tenant_id, "Engine not reachable at {}: {}", self.base_url, e.message);
                    EngineHealthReport::offline("Engine is not reachable", Some(e.message))
                }
            },
        }
    }
}

/// `/api/resource/{type}[/{id}]`, with both segments percent-encoded.
pub fn resource_path(resource_type: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!(
            "/api/resource/{}/{}",
            urlencoding::encode(resource_type),
            urlencoding::encode(id)
        ),
        None => format!("/api/resource/{}", urlencoding::encode(resource_type)),
    }
}

/// Flatten a params object into query pairs. Non-string values (filters,
/// field lists) are sent JSON-encoded, which is what the engine expects.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    match params {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::timeout(format!("Engine request timed out: {e}"))
    } else if e.is_connect() {
        EngineError::connection(format!("Connection refused: {e}"))
    } else {
        EngineError::new("RequestError", format!("Engine request failed: {e}"))
    }
}
