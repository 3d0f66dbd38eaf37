//! Keel reconcile: drive one object toward its desired state.
//!
//! Each key moves through `Absent -> Pending -> Converging -> Converged`,
//! ending in `Failed` when the attempt budget runs out or the error cannot
//! heal. A conflicting write is always followed by a fresh read; the loop
//! never resubmits a stale `resourceVersion`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use keel_core::{ObjectKey, Resource, StoreError};
use keel_store::ResourceClient;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backoff;
pub mod config;
pub mod drift;

pub use backoff::{Backoff, BackoffTimer};
pub use config::ReconcileConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Absent,
    Pending,
    Converging,
    Converged,
    Failed,
}

/// A finished, successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Converged {
    pub resource: Resource,
    /// Budget consumed: write calls plus retried failures.
    pub attempts: u32,
    /// Phases visited in order, ending with `Converged`.
    pub path: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("{key} failed after {attempts} attempts: {source}")]
    Failed { key: ObjectKey, attempts: u32, #[source] source: StoreError },
    #[error("{key}: reconcile cancelled")]
    Cancelled { key: ObjectKey },
}

impl ReconcileError {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ReconcileError::Failed { key, .. } | ReconcileError::Cancelled { key } => key,
        }
    }
}

/// Result of a teardown; both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Teardown {
    Deleted,
    AlreadyAbsent,
}

enum State {
    Absent,
    Pending,
    Converging(Resource),
    Converged(Resource),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Absent => Phase::Absent,
            State::Pending => Phase::Pending,
            State::Converging(_) => Phase::Converging,
            State::Converged(_) => Phase::Converged,
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    client: ResourceClient,
    config: ReconcileConfig,
}

/// Bookkeeping for one run against one key.
struct Run<'a> {
    key: ObjectKey,
    cancel: &'a CancellationToken,
    max_attempts: u32,
    attempts: u32,
    timer: BackoffTimer,
    path: Vec<Phase>,
}

impl<'a> Run<'a> {
    fn enter(&mut self, state: &State) {
        let phase = state.phase();
        debug!(key = %self.key, ?phase, attempts = self.attempts, "phase");
        self.path.push(phase);
    }

    fn checkpoint(&self) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            info!(key = %self.key, "reconcile cancelled");
            return Err(ReconcileError::Cancelled { key: self.key.clone() });
        }
        Ok(())
    }

    fn fail(&mut self, source: StoreError) -> ReconcileError {
        self.path.push(Phase::Failed);
        counter!("keel_reconcile_failed_total", 1u64, "kind" => self.key.kind.clone());
        warn!(key = %self.key, attempts = self.attempts, error = %source, "reconcile failed");
        ReconcileError::Failed { key: self.key.clone(), attempts: self.attempts, source }
    }

    /// Claim one unit of budget for a call, or give up with the last error.
    fn spend(&mut self, last: Option<&StoreError>) -> Result<(), ReconcileError> {
        if self.attempts >= self.max_attempts {
            let err = last.cloned().unwrap_or_else(|| StoreError::Validation("attempt budget exhausted".into()));
            return Err(self.fail(err));
        }
        self.attempts += 1;
        Ok(())
    }

    /// Wait before trying again after a retryable error, unless the budget is spent.
    async fn back_off(&mut self, err: StoreError, last: &mut Option<StoreError>) -> Result<(), ReconcileError> {
        if self.attempts >= self.max_attempts {
            return Err(self.fail(err));
        }
        let delay = self.timer.next_delay();
        warn!(key = %self.key, attempts = self.attempts, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
        *last = Some(err);
        if !backoff::sleep_or_cancel(delay, self.cancel).await {
            info!(key = %self.key, "reconcile cancelled");
            return Err(ReconcileError::Cancelled { key: self.key.clone() });
        }
        Ok(())
    }
}

impl Reconciler {
    pub fn new(client: ResourceClient, config: ReconcileConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &ResourceClient { &self.client }

    pub fn config(&self) -> &ReconcileConfig { &self.config }

    fn start<'a>(&self, key: ObjectKey, cancel: &'a CancellationToken) -> Run<'a> {
        Run {
            key,
            cancel,
            max_attempts: self.config.max_attempts.max(1),
            attempts: 0,
            timer: self.config.backoff.timer(),
            path: Vec::new(),
        }
    }

    /// Read the current object, retrying transport failures. `None` when absent.
    async fn observe(&self, run: &mut Run<'_>, last: &mut Option<StoreError>) -> Result<Option<Resource>, ReconcileError> {
        loop {
            run.checkpoint()?;
            match self.client.get(run.key.namespace.as_str(), run.key.name.as_str()).await {
                Ok(r) => return Ok(Some(r)),
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(e) if e.is_retryable() => {
                    run.spend(Some(&e))?;
                    run.back_off(e, last).await?;
                }
                Err(e) => return Err(run.fail(e)),
            }
        }
    }

    /// Drive `desired` to convergence.
    pub async fn apply(&self, desired: &Resource, cancel: &CancellationToken) -> Result<Converged, ReconcileError> {
        let kind = self.client.kind();
        let mut desired = desired.clone();
        if !kind.namespaced {
            desired.metadata.namespace = None;
        }
        desired.metadata.resource_version = None;
        drift::normalize(kind, &mut desired);
        let mut run = self.start(desired.key(), cancel);
        if desired.kind != kind.kind {
            return Err(run.fail(StoreError::Validation(format!("{} reconciler cannot apply kind {}", kind.kind, desired.kind))));
        }

        let mut last: Option<StoreError> = None;
        let mut state = State::Absent;
        loop {
            run.enter(&state);
            state = match state {
                State::Absent => State::Pending,
                State::Pending => {
                    run.checkpoint()?;
                    run.spend(last.as_ref())?;
                    match self.client.create(&desired).await {
                        Ok(created) => State::Converged(created),
                        Err(e @ StoreError::AlreadyExists(_)) => match self.observe(&mut run, &mut last).await? {
                            Some(observed) => State::Converging(observed),
                            None => {
                                last = Some(e);
                                State::Absent
                            }
                        },
                        Err(e) if e.is_retryable() => {
                            run.back_off(e, &mut last).await?;
                            State::Pending
                        }
                        Err(e) => return Err(run.fail(e)),
                    }
                }
                State::Converging(observed) => {
                    let drifted = drift::drift(kind, &desired, &observed);
                    if drifted.is_empty() {
                        State::Converged(observed)
                    } else {
                        debug!(key = %run.key, fields = ?drifted, rv = ?observed.resource_version(), "drift");
                        run.checkpoint()?;
                        run.spend(last.as_ref())?;
                        match self.client.update(&drift::overlay(kind, &desired, &observed)).await {
                            Ok(updated) => State::Converged(updated),
                            Err(e @ StoreError::Conflict { .. }) => {
                                counter!("keel_reconcile_conflicts_total", 1u64, "kind" => kind.kind.clone());
                                run.back_off(e, &mut last).await?;
                                match self.observe(&mut run, &mut last).await? {
                                    Some(fresh) => State::Converging(fresh),
                                    None => State::Absent,
                                }
                            }
                            Err(e @ StoreError::NotFound(_)) => {
                                last = Some(e);
                                State::Absent
                            }
                            Err(e) if e.is_retryable() => {
                                run.back_off(e, &mut last).await?;
                                State::Converging(observed)
                            }
                            Err(e) => return Err(run.fail(e)),
                        }
                    }
                }
                State::Converged(resource) => {
                    counter!("keel_reconcile_converged_total", 1u64, "kind" => kind.kind.clone());
                    info!(key = %run.key, rv = ?resource.resource_version(), attempts = run.attempts, "converged");
                    return Ok(Converged { resource, attempts: run.attempts, path: run.path });
                }
            };
        }
    }

    /// Delete once. An object that is already gone counts as torn down.
    pub async fn teardown(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<Teardown, ReconcileError> {
        let ns = if self.client.kind().namespaced { namespace } else { "" };
        let mut run = self.start(ObjectKey::new(self.client.kind().kind.clone(), ns, name), cancel);
        let mut last: Option<StoreError> = None;
        loop {
            run.checkpoint()?;
            run.spend(last.as_ref())?;
            match self.client.delete(ns, name).await {
                Ok(()) => {
                    info!(key = %run.key, "torn down");
                    return Ok(Teardown::Deleted);
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(key = %run.key, "already absent");
                    return Ok(Teardown::AlreadyAbsent);
                }
                Err(e) if e.is_retryable() => run.back_off(e, &mut last).await?,
                Err(e) => return Err(run.fail(e)),
            }
        }
    }

    /// Reconcile many objects with up to `concurrency` loops in flight.
    /// Each key gets one loop; a repeated key keeps its last definition.
    pub async fn apply_all(
        &self,
        desired: Vec<Resource>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Vec<(ObjectKey, Result<Converged, ReconcileError>)> {
        let mut by_key: BTreeMap<ObjectKey, Resource> = BTreeMap::new();
        for r in desired {
            if let Some(prev) = by_key.insert(r.key(), r) {
                warn!(key = %prev.key(), "duplicate object, keeping the later definition");
            }
        }
        stream::iter(by_key.into_iter())
            .map(|(key, r)| async move {
                let res = self.apply(&r, cancel).await;
                (key, res)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}
