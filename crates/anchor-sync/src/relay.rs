//! Result relay.
//!
//! Turns terminal cloud outcomes into caller-facing events. Each request
//! produces exactly one terminal message. Resolved anchors use a two-phase
//! registration: the caller receives the descriptor, answers with the name
//! it wants, and only then is the anchor added to the registry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cloud::{CloudOutcome, CloudTarget, CloudTicket};
use crate::error::{AnchorError, AnchorResult};
use crate::registry::AnchorRegistry;
use crate::types::{AnchorKind, LocalAnchor, Transform};

/// Caller channel failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The caller went away
    #[error("caller disconnected")]
    Disconnected,

    /// The message could not be delivered
    #[error("caller channel failed: {0}")]
    Failed(String),
}

/// Caller-side operation an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// `uploadAnchor`
    #[serde(rename = "uploadAnchor")]
    Upload,
    /// `downloadAnchor`
    #[serde(rename = "downloadAnchor")]
    Download,
    /// `initCloudMode`
    #[serde(rename = "initCloudMode")]
    InitCloudMode,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Upload => "uploadAnchor",
            Operation::Download => "downloadAnchor",
            Operation::InitCloudMode => "initCloudMode",
        };
        f.write_str(name)
    }
}

/// Resolved anchor offered to the caller for registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedAnchor {
    /// Anchor type code
    #[serde(rename = "type")]
    pub kind: i64,
    /// Suggested name
    pub name: String,
    /// Cloud identifier the anchor was resolved from
    #[serde(rename = "cloudanchorid")]
    pub cloud_id: String,
    /// World pose
    pub transform: Transform,
}

/// Message pushed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments")]
pub enum CallerEvent {
    /// A local anchor was hosted
    #[serde(rename = "onCloudAnchorUploaded")]
    CloudAnchorUploaded {
        /// Local anchor name
        name: String,
        /// Identifier assigned by the cloud service
        #[serde(rename = "cloudanchorid")]
        cloud_id: String,
    },

    /// A cloud anchor was resolved and awaits a name
    #[serde(rename = "onAnchorDownloadSuccess")]
    AnchorDownloadSuccess(DownloadedAnchor),

    /// An operation failed
    #[serde(rename = "onError")]
    Error {
        /// Operation that failed
        operation: Operation,
        /// Human-readable description
        message: String,
    },
}

impl CallerEvent {
    /// Wire method name
    pub fn method(&self) -> &'static str {
        match self {
            CallerEvent::CloudAnchorUploaded { .. } => "onCloudAnchorUploaded",
            CallerEvent::AnchorDownloadSuccess(_) => "onAnchorDownloadSuccess",
            CallerEvent::Error { .. } => "onError",
        }
    }
}

/// Connection to the remote caller.
#[async_trait]
pub trait CallerChannel: Send + Sync {
    /// Whether the caller is still attached
    fn is_connected(&self) -> bool;

    /// Push a one-way event
    async fn notify(&self, event: CallerEvent) -> Result<(), ChannelError>;

    /// Offer a resolved anchor and wait for the name the caller registers it
    /// under. `None` or an empty name means the caller declined.
    async fn request_registration(
        &self,
        anchor: &DownloadedAnchor,
    ) -> Result<Option<String>, ChannelError>;
}

/// Delivers terminal outcomes to the caller.
pub struct ResultRelay {
    channel: Arc<dyn CallerChannel>,
    registry: Arc<AnchorRegistry>,
    ack_timeout: Duration,
    result_timeout: Option<Duration>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ResultRelay {
    /// Create a relay.
    ///
    /// `ack_timeout` bounds the registration round-trip; `result_timeout`
    /// optionally bounds how long a relay waits for a cloud outcome.
    pub fn new(
        channel: Arc<dyn CallerChannel>,
        registry: Arc<AnchorRegistry>,
        ack_timeout: Duration,
        result_timeout: Option<Duration>,
    ) -> Self {
        Self {
            channel,
            registry,
            ack_timeout,
            result_timeout,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Wait for `ticket` and deliver its outcome.
    ///
    /// Returns the anchor registered for a resolve, `None` for a host, and the
    /// relayed error when the request failed.
    pub async fn relay(&self, ticket: CloudTicket) -> AnchorResult<Option<LocalAnchor>> {
        let operation = operation_for(ticket.target());
        let completion = match self.result_timeout {
            Some(limit) => match tokio::time::timeout(limit, ticket.completion()).await {
                Ok(completion) => completion,
                Err(_) => {
                    let err = AnchorError::CloudTaskTimeout {
                        waited_ms: limit.as_millis().try_into().unwrap_or(u64::MAX),
                    };
                    self.relay_error(operation, &err).await;
                    return Err(err);
                }
            },
            None => ticket.completion().await,
        };

        match (completion.target, completion.outcome) {
            (CloudTarget::Host { name }, CloudOutcome::Success { cloud_id, .. }) => {
                self.relay_upload(&name, &cloud_id).await;
                Ok(None)
            }
            (CloudTarget::Resolve { .. }, CloudOutcome::Success { cloud_id, transform }) => {
                self.relay_download(&cloud_id, transform).await.map(Some)
            }
            (target, CloudOutcome::Error { reason }) => {
                let err = AnchorError::Cloud(reason);
                tracing::info!(request = %target, error = %err, "Cloud request failed");
                self.relay_error(operation, &err).await;
                Err(err)
            }
        }
    }

    /// Report a hosted anchor
    pub async fn relay_upload(&self, name: &str, cloud_id: &str) -> bool {
        tracing::info!(name = %name, cloud_id = %cloud_id, "Anchor hosted");
        self.deliver(CallerEvent::CloudAnchorUploaded {
            name: name.to_string(),
            cloud_id: cloud_id.to_string(),
        })
        .await
    }

    /// Offer a resolved anchor to the caller and register it under the
    /// acknowledged name.
    ///
    /// Without a usable name the anchor is discarded and the tracking session
    /// is never touched.
    pub async fn relay_download(
        &self,
        cloud_id: &str,
        transform: Transform,
    ) -> AnchorResult<LocalAnchor> {
        let descriptor = DownloadedAnchor {
            kind: AnchorKind::Plane.code(),
            name: cloud_id.to_string(),
            cloud_id: cloud_id.to_string(),
            transform,
        };

        if !self.channel.is_connected() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cloud_id = %cloud_id, "Caller disconnected, resolved anchor discarded");
            return Err(AnchorError::rejected(cloud_id, "caller disconnected"));
        }

        let reply = tokio::time::timeout(
            self.ack_timeout,
            self.channel.request_registration(&descriptor),
        )
        .await;

        let name = match reply {
            Ok(Ok(Some(name))) if !name.is_empty() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                name
            }
            Ok(Ok(_)) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                return self.reject(cloud_id, "caller returned no name".to_string()).await;
            }
            Ok(Err(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return self.reject(cloud_id, err.to_string()).await;
            }
            Err(_) => {
                let waited_ms = self.ack_timeout.as_millis();
                return self
                    .reject(cloud_id, format!("no acknowledgment within {waited_ms}ms"))
                    .await;
            }
        };

        match self.registry.add(&name, transform).await {
            Ok(local) => {
                tracing::info!(name = %name, cloud_id = %cloud_id, "Resolved anchor registered");
                Ok(local)
            }
            Err(err) => self.reject(cloud_id, err.to_string()).await,
        }
    }

    /// Report a failed operation
    pub async fn relay_error(&self, operation: Operation, err: &AnchorError) -> bool {
        self.deliver(CallerEvent::Error {
            operation,
            message: error_message(operation, err),
        })
        .await
    }

    /// Events that reached the caller
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events dropped because the caller was gone
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn reject<T>(&self, cloud_id: &str, reason: String) -> AnchorResult<T> {
        let err = AnchorError::rejected(cloud_id, reason);
        tracing::warn!(cloud_id = %cloud_id, error = %err, "Resolved anchor not registered");
        self.relay_error(Operation::Download, &err).await;
        Err(err)
    }

    async fn deliver(&self, event: CallerEvent) -> bool {
        let method = event.method();
        if !self.channel.is_connected() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(method, "Caller disconnected, event dropped");
            return false;
        }
        match self.channel.notify(event).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(method, error = %err, "Failed to deliver caller event");
                false
            }
        }
    }
}

impl fmt::Debug for ResultRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultRelay")
            .field("ack_timeout", &self.ack_timeout)
            .field("result_timeout", &self.result_timeout)
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish_non_exhaustive()
    }
}

fn operation_for(target: &CloudTarget) -> Operation {
    match target {
        CloudTarget::Host { .. } => Operation::Upload,
        CloudTarget::Resolve { .. } => Operation::Download,
    }
}

fn error_message(operation: Operation, err: &AnchorError) -> String {
    match (operation, err) {
        (_, AnchorError::RegistrationRejected { .. }) => err.to_string(),
        (Operation::Upload, _) => format!("Error uploading anchor, state: {err}"),
        (Operation::Download, _) => format!("Error downloading anchor, state {err}"),
        (Operation::InitCloudMode, _) => err.to_string(),
    }
}
