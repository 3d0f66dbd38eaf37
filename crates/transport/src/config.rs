//! Cluster connection settings, read once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Kubeconfig-format credentials file (endpoint, CA, token or client cert).
    pub kubeconfig: PathBuf,
    /// Context to use; the file's current context when unset.
    pub context: Option<String>,
    /// Applied to every single network call.
    pub request_timeout: Duration,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn default_kubeconfig_path() -> PathBuf {
    if let Some(p) = env_nonempty("KEEL_KUBECONFIG") {
        return PathBuf::from(p);
    }
    // KUBECONFIG may be a list; the first entry wins.
    if let Some(list) = env_nonempty("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&list).next() {
            return first;
        }
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join(".kube").join("config")
}

impl ClusterConfig {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// `KEEL_KUBECONFIG`, then `KUBECONFIG`, then `$HOME/.kube/config`;
    /// `KEEL_CONTEXT`; `KEEL_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let request_timeout = env_nonempty("KEEL_REQUEST_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        Self {
            kubeconfig: default_kubeconfig_path(),
            context: env_nonempty("KEEL_CONTEXT"),
            request_timeout: Duration::from_millis(request_timeout),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
