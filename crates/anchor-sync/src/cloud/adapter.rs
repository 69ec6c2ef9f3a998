//! Cloud session adapter.
//!
//! Wraps the vendor cloud anchor session behind [`CloudAnchorService`]. The
//! service reports every task through a single delegate, the
//! [`CloudEventSink`] it receives when connecting. The sink only enqueues;
//! events are processed in arrival order by the handler's pump task.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::state::{CloudAnchorState, CloudFailure};
use crate::error::{AnchorError, AnchorResult};
use crate::token::AuthToken;
use crate::types::{FrameUpdate, TrackingAnchor, Transform};

/// Correlation handle returned by the cloud service for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudTaskHandle(pub u64);

impl fmt::Display for CloudTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Cloud anchor as reported alongside a task state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAnchorSnapshot {
    /// Cloud identifier, present once hosting succeeded
    pub cloud_id: Option<String>,
    /// World pose of the anchor
    pub transform: Transform,
}

/// Delegate callback from the cloud service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudTaskEvent {
    /// Task the event belongs to
    pub handle: CloudTaskHandle,
    /// Reported task state
    pub state: CloudAnchorState,
    /// Anchor the task produced, if any
    pub anchor: Option<CloudAnchorSnapshot>,
}

/// Delegate handed to the cloud service when connecting.
#[derive(Debug, Clone)]
pub struct CloudEventSink {
    tx: mpsc::UnboundedSender<CloudTaskEvent>,
}

impl CloudEventSink {
    /// Create a sink and the receiving end drained by the pump task
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CloudTaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a task update. Never blocks.
    ///
    /// Returns `false` if the engine is no longer listening.
    pub fn on_task_complete(
        &self,
        handle: CloudTaskHandle,
        state: CloudAnchorState,
        anchor: Option<CloudAnchorSnapshot>,
    ) -> bool {
        let sent = self
            .tx
            .send(CloudTaskEvent {
                handle,
                state,
                anchor,
            })
            .is_ok();
        if !sent {
            tracing::debug!(%handle, ?state, "Cloud event after shutdown dropped");
        }
        sent
    }
}

/// Vendor cloud anchor session.
///
/// Submissions return immediately with a handle; the outcome arrives later
/// through the [`CloudEventSink`].
pub trait CloudAnchorService: Send + Sync {
    /// Install the credential used for subsequent requests
    fn set_auth_token(&self, token: &str);

    /// Start hosting `anchor`, optionally with a time-to-live in days
    fn host_anchor(
        &self,
        anchor: &TrackingAnchor,
        ttl_days: Option<u32>,
    ) -> Result<CloudTaskHandle, CloudFailure>;

    /// Start resolving the anchor hosted under `cloud_id`
    fn resolve_anchor(&self, cloud_id: &str) -> Result<CloudTaskHandle, CloudFailure>;

    /// Feed a tracking frame to the session
    fn update(&self, frame: &FrameUpdate) -> Result<(), CloudFailure>;
}

/// Creates cloud sessions.
pub trait CloudServiceConnector: Send + Sync {
    /// Open a session that reports to `sink`
    fn connect(&self, sink: CloudEventSink) -> Result<Arc<dyn CloudAnchorService>, String>;
}

/// Cloud session together with the credential installed on it.
///
/// Host and resolve are refused until a token is installed.
pub struct CloudSessionAdapter {
    service: Arc<dyn CloudAnchorService>,
    token: RwLock<Option<AuthToken>>,
}

impl CloudSessionAdapter {
    /// Wrap a connected service
    pub fn new(service: Arc<dyn CloudAnchorService>) -> Self {
        Self {
            service,
            token: RwLock::new(None),
        }
    }

    /// Install `token` on the service
    pub fn install_token(&self, token: &AuthToken) {
        self.service.set_auth_token(token.value());
        *self.token.write() = Some(token.clone());
        tracing::debug!(expires_at_ms = ?token.expires_at_ms(), "Installed cloud token");
    }

    /// Token currently installed
    pub fn current_token(&self) -> Option<AuthToken> {
        self.token.read().clone()
    }

    /// Whether a token has been installed
    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// Submit a host task
    pub fn host(
        &self,
        anchor: &TrackingAnchor,
        ttl_days: Option<u32>,
    ) -> AnchorResult<CloudTaskHandle> {
        self.ensure_token()?;
        let handle = self.service.host_anchor(anchor, ttl_days)?;
        tracing::debug!(%handle, anchor = %anchor.id, ?ttl_days, "Host submitted");
        Ok(handle)
    }

    /// Submit a resolve task
    pub fn resolve(&self, cloud_id: &str) -> AnchorResult<CloudTaskHandle> {
        self.ensure_token()?;
        let handle = self.service.resolve_anchor(cloud_id)?;
        tracing::debug!(%handle, cloud_id = %cloud_id, "Resolve submitted");
        Ok(handle)
    }

    /// Forward a tracking frame
    pub fn update_frame(&self, frame: &FrameUpdate) -> AnchorResult<()> {
        self.service.update(frame).map_err(AnchorError::from)
    }

    fn ensure_token(&self) -> AnchorResult<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(AnchorError::cloud_unavailable("no authentication token installed"))
        }
    }
}

impl fmt::Debug for CloudSessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSessionAdapter")
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCloudService;

    #[test]
    fn test_requests_refused_without_token() {
        let (sink, _rx) = CloudEventSink::channel();
        let service = Arc::new(InMemoryCloudService::new(sink));
        let adapter = CloudSessionAdapter::new(service.clone());

        let anchor = TrackingAnchor::new(Transform::IDENTITY);
        let err = adapter.host(&anchor, None).unwrap_err();
        assert!(matches!(err, AnchorError::CloudSessionInitFailed { .. }));
        assert!(service.submissions().is_empty());

        adapter.install_token(&AuthToken::new("t1"));
        assert_eq!(service.installed_tokens(), vec!["t1".to_string()]);
        adapter.host(&anchor, Some(3)).unwrap();
        assert_eq!(service.submissions().len(), 1);
    }

    #[test]
    fn test_sink_reports_closed_receiver() {
        let (sink, rx) = CloudEventSink::channel();
        assert!(sink.on_task_complete(CloudTaskHandle(1), CloudAnchorState::Success, None));
        drop(rx);
        assert!(!sink.on_task_complete(CloudTaskHandle(2), CloudAnchorState::Success, None));
    }
}
