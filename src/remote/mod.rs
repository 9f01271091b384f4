//! Remote authority interface. Every failure is treated as "remote unavailable".

/// JSON encoding of records and server responses.
pub mod wire;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Duration;

/// HTTP-like request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw gateway response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded JSON body, `Null` when empty.
    pub body: Value,
}

impl RemoteResponse {
    /// Response with `status` and `body`.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Any reason the remote authority could not confirm a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote returned status {0}")]
    Status(u16),
    #[error("remote request timed out after {0} ms")]
    Timeout(u64),
    #[error("undecodable remote body: {0}")]
    Decode(String),
}

/// Request primitive consumed by the sync engine.
///
/// Implementations carry their own transport concerns; the engine adds an
/// overall timeout on top.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        auth_token: Option<&str>,
    ) -> Result<RemoteResponse, RemoteError>;
}

/// Fully resolved request, ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Request method.
    pub method: Method,
    /// Path relative to the API root, with resolved ids.
    pub path: String,
    /// JSON body for POST and PUT.
    pub body: Option<Value>,
}

/// Sends `request`, folding non-2xx statuses and timeouts into [`RemoteError`].
pub async fn send(
    gateway: &dyn RemoteGateway,
    request: &RemoteRequest,
    auth_token: Option<&str>,
    timeout_ms: u64,
) -> Result<Value, RemoteError> {
    let call = gateway.request(
        request.method,
        &request.path,
        request.body.as_ref(),
        auth_token,
    );
    let response = tokio::time::timeout(Duration::from_millis(timeout_ms), call)
        .await
        .map_err(|_| RemoteError::Timeout(timeout_ms))??;

    if !response.is_success() {
        return Err(RemoteError::Status(response.status));
    }
    Ok(response.body)
}
