use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Upper bound on write calls plus retried failures for one run.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { max_attempts: 5, backoff: Backoff::default() }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl ReconcileConfig {
    /// Defaults overridden by `KEEL_RECONCILE_MAX_ATTEMPTS`, `KEEL_BACKOFF_INITIAL_MS`
    /// and `KEEL_BACKOFF_MAX_MS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_u64("KEEL_RECONCILE_MAX_ATTEMPTS").filter(|n| *n > 0) {
            cfg.max_attempts = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = env_u64("KEEL_BACKOFF_INITIAL_MS") {
            cfg.backoff.initial = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("KEEL_BACKOFF_MAX_MS") {
            cfg.backoff.max = Duration::from_millis(ms);
        }
        if cfg.backoff.max < cfg.backoff.initial {
            cfg.backoff.max = cfg.backoff.initial;
        }
        cfg
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}
