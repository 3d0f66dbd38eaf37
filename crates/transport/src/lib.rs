//! Keel transport: one request/response exchange with the control plane.
//!
//! The transport never retries; retry policy belongs to the reconciler.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use keel_codec::ApiStatus;
use keel_core::TransportError;

pub mod cluster;
pub mod config;
pub mod memory;
pub mod query;

pub use config::ClusterConfig;
pub use cluster::{ConnectError, KubeTransport};
pub use memory::{Fault, MemoryApiServer, Verb};

pub const JSON: &str = "application/json";
pub const MERGE_PATCH: &str = "application/merge-patch+json";

/// A request against an API path (query string included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub content_type: &'static str,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::GET, path: path.into(), body: None, content_type: JSON }
    }

    pub fn post(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self { method: Method::POST, path: path.into(), body: Some(body), content_type: JSON }
    }

    pub fn put(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self { method: Method::PUT, path: path.into(), body: Some(body), content_type: JSON }
    }

    pub fn merge_patch(path: impl Into<String>, body: Vec<u8>) -> Self {
        Self { method: Method::PATCH, path: path.into(), body: Some(body), content_type: MERGE_PATCH }
    }

    pub fn delete(path: impl Into<String>, body: Option<Vec<u8>>) -> Self {
        Self { method: Method::DELETE, path: path.into(), body, content_type: JSON }
    }
}

/// Status code and raw body of a completed exchange. Non-2xx codes besides 401/403 are data
/// here; the store maps them onto its own errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self { status, body: body.into() }
    }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    /// Turn rejected credentials (401/403) into `TransportError::Unauthorized`.
    /// Every other status is handed back for the caller to classify.
    pub fn into_checked(self) -> Result<Self, TransportError> {
        if self.status != 401 && self.status != 403 {
            return Ok(self);
        }
        let message = ApiStatus::decode(&self.body)
            .map(|s| s.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP {}", self.status));
        Err(TransportError::Unauthorized(message))
    }
}

/// A connection to a control plane. Implementations must be safe to share
/// across concurrently running reconcile loops.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).request(req).await
    }
}
