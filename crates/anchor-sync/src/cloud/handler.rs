//! Cloud anchor request handler.
//!
//! Every host or resolve request moves through
//!
//! ```text
//! Created ──submit──► Pending ──terminal state──► Completed
//! ```
//!
//! Submission and the insert into the pending table happen under one lock,
//! and delegate events are processed on the pump task, so an event can never
//! be looked up before its request is registered. Each request owns a
//! one-shot completion channel that fires exactly once.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use super::adapter::{
    CloudAnchorSnapshot, CloudSessionAdapter, CloudTaskEvent, CloudTaskHandle,
};
use super::state::{CloudAnchorState, CloudFailure};
use crate::error::{AnchorError, AnchorResult};
use crate::token::{AuthToken, TokenManager};
use crate::types::{TrackingAnchor, Transform};

/// What a cloud request is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudTarget {
    /// Hosting the local anchor registered under `name`
    Host {
        /// Local anchor name
        name: String,
    },
    /// Resolving the anchor hosted under `cloud_id`
    Resolve {
        /// Cloud identifier
        cloud_id: String,
    },
}

impl fmt::Display for CloudTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudTarget::Host { name } => write!(f, "host '{name}'"),
            CloudTarget::Resolve { cloud_id } => write!(f, "resolve '{cloud_id}'"),
        }
    }
}

/// Terminal result of a cloud request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CloudOutcome {
    /// The task finished
    Success {
        /// Cloud identifier of the hosted or resolved anchor
        cloud_id: String,
        /// World pose of the anchor
        transform: Transform,
    },
    /// The task failed
    Error {
        /// Failure reported by the service
        reason: CloudFailure,
    },
}

/// Completion delivered on a request's ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCompletion {
    /// Request the completion belongs to
    pub target: CloudTarget,
    /// How it ended
    pub outcome: CloudOutcome,
}

/// Receiving end of a submitted request.
#[derive(Debug)]
pub struct CloudTicket {
    target: CloudTarget,
    handle: CloudTaskHandle,
    rx: oneshot::Receiver<CloudCompletion>,
}

impl CloudTicket {
    /// Request this ticket waits for
    pub fn target(&self) -> &CloudTarget {
        &self.target
    }

    /// Handle of the first submission
    pub fn handle(&self) -> CloudTaskHandle {
        self.handle
    }

    /// Wait for the terminal outcome.
    ///
    /// If the request is abandoned without an outcome this resolves to an
    /// internal failure.
    pub async fn completion(self) -> CloudCompletion {
        let CloudTicket { target, handle, rx } = self;
        match rx.await {
            Ok(completion) => completion,
            Err(_) => {
                tracing::warn!(
                    %handle,
                    request = %target,
                    "Cloud request abandoned without outcome"
                );
                CloudCompletion {
                    target,
                    outcome: CloudOutcome::Error {
                        reason: CloudFailure::internal(),
                    },
                }
            }
        }
    }
}

/// Limits applied before a request reaches the cloud service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudRequestPolicy {
    /// TTL used when the caller gives none
    pub default_ttl_days: Option<u32>,
    /// Largest accepted TTL
    pub max_ttl_days: u32,
    /// Requests allowed in flight at once
    pub max_pending_requests: usize,
    /// Refresh the token and resubmit once on `NotAuthorized`
    pub retry_on_unauthorized: bool,
}

impl Default for CloudRequestPolicy {
    fn default() -> Self {
        Self {
            default_ttl_days: None,
            max_ttl_days: 365,
            max_pending_requests: 256,
            retry_on_unauthorized: true,
        }
    }
}

impl CloudRequestPolicy {
    /// Apply the default and check the range
    pub fn effective_ttl(&self, ttl_days: Option<u32>) -> AnchorResult<Option<u32>> {
        match ttl_days.or(self.default_ttl_days) {
            Some(ttl) if ttl == 0 || ttl > self.max_ttl_days => Err(AnchorError::InvalidTtl {
                ttl_days: ttl,
                max_days: self.max_ttl_days,
            }),
            ttl => Ok(ttl),
        }
    }
}

#[derive(Debug, Clone)]
enum CloudRequest {
    Host {
        name: String,
        anchor: TrackingAnchor,
        ttl_days: Option<u32>,
    },
    Resolve {
        cloud_id: String,
    },
}

impl CloudRequest {
    fn target(&self) -> CloudTarget {
        match self {
            CloudRequest::Host { name, .. } => CloudTarget::Host { name: name.clone() },
            CloudRequest::Resolve { cloud_id } => CloudTarget::Resolve {
                cloud_id: cloud_id.clone(),
            },
        }
    }
}

struct PendingRequest {
    request: CloudRequest,
    tx: oneshot::Sender<CloudCompletion>,
    token: Option<AuthToken>,
    retried: bool,
}

/// Correlates delegate events with in-flight requests.
pub struct CloudAnchorHandler {
    adapter: Arc<CloudSessionAdapter>,
    tokens: Arc<TokenManager>,
    policy: CloudRequestPolicy,
    pending: Mutex<HashMap<CloudTaskHandle, PendingRequest>>,
}

impl CloudAnchorHandler {
    /// Create a handler submitting through `adapter`
    pub fn new(
        adapter: Arc<CloudSessionAdapter>,
        tokens: Arc<TokenManager>,
        policy: CloudRequestPolicy,
    ) -> Self {
        Self {
            adapter,
            tokens,
            policy,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Adapter the handler submits through
    pub fn adapter(&self) -> &Arc<CloudSessionAdapter> {
        &self.adapter
    }

    /// Active request policy
    pub fn policy(&self) -> &CloudRequestPolicy {
        &self.policy
    }

    /// Host the local anchor `anchor` registered as `name`.
    ///
    /// Host completion never touches the registry.
    pub fn host(
        &self,
        name: &str,
        anchor: &TrackingAnchor,
        ttl_days: Option<u32>,
    ) -> AnchorResult<CloudTicket> {
        let ttl_days = self.policy.effective_ttl(ttl_days)?;
        self.submit(CloudRequest::Host {
            name: name.to_string(),
            anchor: *anchor,
            ttl_days,
        })
    }

    /// Resolve the anchor hosted under `cloud_id`
    pub fn resolve(&self, cloud_id: &str) -> AnchorResult<CloudTicket> {
        if cloud_id.is_empty() {
            return Err(AnchorError::invalid("cloud anchor id must not be empty"));
        }
        self.submit(CloudRequest::Resolve {
            cloud_id: cloud_id.to_string(),
        })
    }

    /// Requests still waiting for a terminal state
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop every in-flight request. Their tickets resolve to an internal failure.
    pub fn abandon_all(&self) -> usize {
        let abandoned: Vec<_> = self.pending.lock().drain().collect();
        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "Abandoned in-flight cloud requests");
        }
        abandoned.len()
    }

    /// Process one delegate event.
    pub async fn handle_event(&self, event: CloudTaskEvent) {
        let CloudTaskEvent {
            handle,
            state,
            anchor,
        } = event;

        if !state.is_terminal() {
            tracing::trace!(%handle, ?state, "Cloud task still running");
            return;
        }

        let entry = self.pending.lock().remove(&handle);
        let Some(entry) = entry else {
            tracing::warn!(%handle, ?state, "Cloud event for unknown request dropped");
            return;
        };

        if state == CloudAnchorState::ErrorNotAuthorized
            && self.policy.retry_on_unauthorized
            && !entry.retried
        {
            self.retry_unauthorized(handle, entry).await;
            return;
        }

        let outcome = outcome_for(&entry.request, state, anchor);
        deliver(entry, outcome);
    }

    /// Drain delegate events in arrival order until the sink side closes.
    ///
    /// A panic while handling one event is logged; the affected request is
    /// dropped and the pump keeps going.
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CloudTaskEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let handle = event.handle;
            let handled = AssertUnwindSafe(self.handle_event(event)).catch_unwind().await;
            if handled.is_err() {
                tracing::error!(%handle, "Panic while handling cloud event");
            }
        }
        tracing::debug!("Cloud event stream closed");
    }

    async fn retry_unauthorized(&self, handle: CloudTaskHandle, entry: PendingRequest) {
        tracing::info!(
            %handle,
            request = %entry.request.target(),
            "Cloud rejected token, refreshing"
        );

        let token = match self.tokens.refresh(entry.token.as_ref()).await {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(%handle, error = %err, "Token refresh failed");
                deliver(
                    entry,
                    CloudOutcome::Error {
                        reason: CloudFailure::NotAuthorized,
                    },
                );
                return;
            }
        };
        self.adapter.install_token(&token);

        let mut pending = self.pending.lock();
        match self.dispatch(&entry.request) {
            Ok(retry) => {
                tracing::debug!(%handle, %retry, "Resubmitted after token refresh");
                pending.insert(
                    retry,
                    PendingRequest {
                        token: Some(token),
                        retried: true,
                        ..entry
                    },
                );
            }
            Err(err) => {
                drop(pending);
                let reason = match err {
                    AnchorError::Cloud(failure) => failure,
                    _ => CloudFailure::NotAuthorized,
                };
                deliver(entry, CloudOutcome::Error { reason });
            }
        }
    }

    fn submit(&self, request: CloudRequest) -> AnchorResult<CloudTicket> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.policy.max_pending_requests {
            tracing::warn!(
                in_flight = pending.len(),
                limit = self.policy.max_pending_requests,
                "Too many cloud requests in flight"
            );
            return Err(CloudFailure::ResourceExhausted.into());
        }

        let token = self.adapter.current_token();
        let handle = self.dispatch(&request)?;
        let (tx, rx) = oneshot::channel();
        let target = request.target();
        let replaced = pending.insert(
            handle,
            PendingRequest {
                request,
                tx,
                token,
                retried: false,
            },
        );
        if replaced.is_some() {
            tracing::warn!(%handle, "Cloud service reused a live handle");
        }

        Ok(CloudTicket { target, handle, rx })
    }

    fn dispatch(&self, request: &CloudRequest) -> AnchorResult<CloudTaskHandle> {
        match request {
            CloudRequest::Host {
                anchor, ttl_days, ..
            } => self.adapter.host(anchor, *ttl_days),
            CloudRequest::Resolve { cloud_id } => self.adapter.resolve(cloud_id),
        }
    }
}

impl fmt::Debug for CloudAnchorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudAnchorHandler")
            .field("policy", &self.policy)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

fn outcome_for(
    request: &CloudRequest,
    state: CloudAnchorState,
    anchor: Option<CloudAnchorSnapshot>,
) -> CloudOutcome {
    if let Some(reason) = state.failure() {
        return CloudOutcome::Error { reason };
    }
    match (request, anchor) {
        (
            CloudRequest::Host { .. },
            Some(CloudAnchorSnapshot {
                cloud_id: Some(cloud_id),
                transform,
            }),
        ) => CloudOutcome::Success {
            cloud_id,
            transform,
        },
        (CloudRequest::Resolve { cloud_id }, Some(snapshot)) => CloudOutcome::Success {
            cloud_id: snapshot.cloud_id.unwrap_or_else(|| cloud_id.clone()),
            transform: snapshot.transform,
        },
        _ => {
            tracing::warn!(
                request = %request.target(),
                "Successful cloud task without an anchor"
            );
            CloudOutcome::Error {
                reason: CloudFailure::internal(),
            }
        }
    }
}

fn deliver(entry: PendingRequest, outcome: CloudOutcome) {
    let target = entry.request.target();
    let success = matches!(outcome, CloudOutcome::Success { .. });
    tracing::debug!(request = %target, success, "Cloud request completed");
    if entry.tx.send(CloudCompletion { target, outcome }).is_err() {
        tracing::debug!("Caller stopped waiting, completion discarded");
    }
}
