//! HTTPS transport backed by a `kube::Client`.
//!
//! The client owns the connection pool, TLS and credential injection; this
//! layer only shapes raw requests and classifies failures.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::{ACCEPT, CONTENT_TYPE};
use keel_core::TransportError;
use ::kube::client::Body;
use ::kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use ::kube::{Client, Config};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{ApiRequest, ApiResponse, ClusterConfig, Transport, JSON};

/// Failure to build a transport from local configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("reading kubeconfig {path}: {source}")]
    Kubeconfig { path: String, #[source] source: KubeconfigError },
    #[error("building client: {0}")]
    Client(#[from] ::kube::Error),
}

pub struct KubeTransport {
    client: Client,
    timeout: Duration,
}

impl KubeTransport {
    /// Read the credentials file once and build a pooled client from it.
    pub async fn connect(cfg: &ClusterConfig) -> Result<Self, ConnectError> {
        let path = cfg.kubeconfig.display().to_string();
        let kubeconfig = Kubeconfig::read_from(&cfg.kubeconfig)
            .map_err(|source| ConnectError::Kubeconfig { path: path.clone(), source })?;
        let options = KubeConfigOptions { context: cfg.context.clone(), ..Default::default() };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|source| ConnectError::Kubeconfig { path: path.clone(), source })?;
        info!(kubeconfig = %path, context = ?cfg.context, cluster = %config.cluster_url, "transport configured");
        let client = Client::try_from(config)?;
        Ok(Self::from_client(client, cfg.request_timeout))
    }

    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn exchange(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = http::Request::builder()
            .method(req.method.clone())
            .uri(req.path.as_str())
            .header(ACCEPT, JSON);
        if req.body.is_some() {
            builder = builder.header(CONTENT_TYPE, req.content_type);
        }
        let http_request = builder
            .body(Body::from(req.body.unwrap_or_default()))
            .map_err(|e| TransportError::Unreachable(format!("invalid request {}: {}", req.path, e)))?;
        let response = self.client.send(http_request).await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.into_body().collect_bytes().await.map_err(classify)?;
        Ok(ApiResponse { status, body })
    }
}

fn classify(err: ::kube::Error) -> TransportError {
    match err {
        ::kube::Error::Auth(e) => TransportError::Unauthorized(e.to_string()),
        ::kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => TransportError::Unauthorized(ae.message),
        other => TransportError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl Transport for KubeTransport {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse, TransportError> {
        let t0 = Instant::now();
        let method = req.method.clone();
        let path = req.path.clone();
        debug!(%method, %path, "request");
        let res = match tokio::time::timeout(self.timeout, self.exchange(req)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };
        histogram!("keel_transport_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(resp) => {
                debug!(%method, %path, status = resp.status, bytes = resp.body.len(), "response");
                resp.into_checked().map_err(|e| {
                    counter!("keel_transport_errors_total", 1u64);
                    warn!(%method, %path, error = %e, "rejected credentials");
                    e
                })
            }
            Err(e) => {
                counter!("keel_transport_errors_total", 1u64);
                warn!(%method, %path, error = %e, "transport failure");
                Err(e)
            }
        }
    }
}
