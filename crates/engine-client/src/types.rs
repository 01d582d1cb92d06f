//! Wire-level types shared by every engine adapter implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Exception type reported for a refused / reset connection.
pub const CONNECTION_ERROR: &str = "ConnectionError";
/// Exception type reported when a call exceeds the client timeout.
pub const TIMEOUT_ERROR: &str = "Timeout";
/// Exception type used when the engine gave no type of its own.
pub const HTTP_ERROR: &str = "HTTPError";

/// Normalised success envelope. `data` is whatever the engine nested under
/// `data` or `message`, or the full body when neither is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub data: Value,
}

impl EngineResponse {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn empty() -> Self {
        Self { data: Value::Null }
    }

    /// Unwrap `{"data": ..}` / `{"message": ..}` envelopes.
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::Object(mut map) => {
                if let Some(data) = map.remove("data") {
                    Self::new(data)
                } else if let Some(message) = map.remove("message") {
                    Self::new(message)
                } else {
                    Self::new(Value::Object(map))
                }
            }
            other => Self::new(other),
        }
    }

    /// `name` of the returned document, if any.
    pub fn name(&self) -> Option<&str> {
        self.data.get("name").and_then(Value::as_str)
    }

    /// First row of a list response.
    pub fn first(&self) -> Option<&Value> {
        self.data.as_array().and_then(|rows| rows.first())
    }
}

/// Structured failure raised by an engine call.
///
/// `raw` keeps the decoded error body untouched; message extraction from the
/// (often nested) envelope happens in the error classifier.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct EngineError {
    pub status_code: Option<u16>,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub raw: Option<Value>,
}

impl EngineError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            kind: kind.into(),
            message: message.into(),
            raw: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(CONNECTION_ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TIMEOUT_ERROR, message)
    }

    /// Build an error from a non-2xx response body.
    pub fn from_response(status_code: u16, body: &str) -> Self {
        let raw = serde_json::from_str::<Value>(body).ok();

        let kind = raw
            .as_ref()
            .and_then(|v| v.get("exc_type").or_else(|| v.get("type")))
            .and_then(Value::as_str)
            .unwrap_or(HTTP_ERROR)
            .to_string();

        let message = raw
            .as_ref()
            .and_then(|v| {
                ["message", "exception", "error", "detail"]
                    .iter()
                    .find_map(|key| v.get(*key).and_then(Value::as_str))
            })
            .map(str::to_string)
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("Engine returned HTTP {status_code}")
                } else {
                    trimmed.chars().take(300).collect()
                }
            });

        let error = Self::new(kind, message).with_status(status_code);
        match raw {
            Some(raw) => error.with_raw(raw),
            None if !body.trim().is_empty() => error.with_raw(Value::String(body.to_string())),
            None => error,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.status_code.is_none() && (self.kind == CONNECTION_ERROR || self.kind == TIMEOUT_ERROR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineHealthStatus {
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for EngineHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineHealthStatus::Online => write!(f, "online"),
            EngineHealthStatus::Degraded => write!(f, "degraded"),
            EngineHealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Result of probing the engine on behalf of a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealthReport {
    pub status: EngineHealthStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineHealthReport {
    pub fn online(message: impl Into<String>) -> Self {
        Self {
            status: EngineHealthStatus::Online,
            message: message.into(),
            error: None,
        }
    }

    pub fn degraded(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status: EngineHealthStatus::Degraded,
            message: message.into(),
            error,
        }
    }

    pub fn offline(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status: EngineHealthStatus::Offline,
            message: message.into(),
            error,
        }
    }
}
