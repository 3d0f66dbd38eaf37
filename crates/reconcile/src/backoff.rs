//! Exponential backoff with jitter between reconcile attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(100), max: Duration::from_secs(10), multiplier: 2.0, jitter: true }
    }
}

impl Backoff {
    pub fn none() -> Self {
        Self { initial: Duration::ZERO, max: Duration::ZERO, multiplier: 1.0, jitter: false }
    }

    pub fn timer(&self) -> BackoffTimer {
        BackoffTimer { cfg: self.clone(), next: self.initial }
    }
}

/// Delay sequence for one reconcile run.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    cfg: Backoff,
    next: Duration,
}

impl BackoffTimer {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next.min(self.cfg.max);
        self.next = Duration::from_secs_f64((base.as_secs_f64() * self.cfg.multiplier).min(self.cfg.max.as_secs_f64()));
        if self.cfg.jitter && !base.is_zero() {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        }
    }
}

/// Sleep unless cancelled first. Returns `false` when the token fired.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let cfg = Backoff { initial: Duration::from_millis(100), max: Duration::from_millis(500), multiplier: 2.0, jitter: false };
        let mut t = cfg.timer();
        let got: Vec<u128> = (0..5).map(|_| t.next_delay().as_millis()).collect();
        assert_eq!(got, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let mut t = Backoff { jitter: true, ..Default::default() }.timer();
        let d = t.next_delay();
        assert!(d >= Duration::from_millis(50) && d < Duration::from_millis(150), "{d:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            c.cancel();
        });
        let t0 = tokio::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(t0.elapsed() < Duration::from_secs(60));
        assert!(sleep_or_cancel(Duration::from_secs(1), &CancellationToken::new()).await);
    }
}
