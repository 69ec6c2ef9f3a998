//! Attachment gate.
//!
//! The tracking session binds a node to a freshly added anchor on its own
//! update cycle. Anything that attaches content to that node must wait for
//! it, so anchor creation parks on the gate until the session reports the
//! node. The wait is event driven: the registry arms a one-shot slot for
//! the anchor before handing it to the session, and the session callback
//! fills the slot.
//!
//! ```text
//! registry ── arm(id) ──► gate ◄── notify_attached(id, node) ── session thread
//!     │                    │
//!     └──── wait(..) ◄─────┘   (bounded by the configured timeout)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{AnchorError, AnchorResult};
use crate::session::TrackingSession;
use crate::types::{NodeId, TrackingAnchorId};

/// Armed attachment slot for one anchor.
#[derive(Debug)]
pub struct AttachmentWait {
    id: TrackingAnchorId,
    rx: oneshot::Receiver<NodeId>,
}

impl AttachmentWait {
    /// Anchor this slot waits for
    pub fn id(&self) -> TrackingAnchorId {
        self.id
    }
}

/// Wait/notify point between anchor creation and the tracking session.
#[derive(Debug)]
pub struct AttachmentGate {
    waiters: Mutex<HashMap<TrackingAnchorId, oneshot::Sender<NodeId>>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl AttachmentGate {
    /// Create a gate that gives up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Configured wait bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm a slot for `id`. Must happen before the anchor reaches the session.
    pub fn arm(&self, id: TrackingAnchorId) -> AnchorResult<AttachmentWait> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AnchorError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        Ok(AttachmentWait { id, rx })
    }

    /// Report that the session bound `node` to `id`.
    ///
    /// Safe to call from the session's update thread; it only takes a short
    /// lock. Returns `true` if a waiter was woken.
    pub fn notify_attached(&self, id: TrackingAnchorId, node: NodeId) -> bool {
        let waiter = self.waiters.lock().remove(&id);
        match waiter {
            Some(tx) => tx.send(node).is_ok(),
            None => {
                tracing::trace!(anchor = %id, %node, "Attachment reported for unarmed anchor");
                false
            }
        }
    }

    /// Wait until the session reports a node for the armed anchor.
    pub async fn wait(
        &self,
        wait: AttachmentWait,
        name: &str,
        session: &dyn TrackingSession,
    ) -> AnchorResult<NodeId> {
        let AttachmentWait { id, mut rx } = wait;

        // The session may already have bound a node without calling back.
        if let Some(node) = session.node_for(id) {
            self.disarm(id);
            return Ok(node);
        }

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(node)) => Ok(node),
            Ok(Err(_)) => Err(AnchorError::SessionClosed),
            Err(_) => {
                self.disarm(id);
                // A notification can land between the timeout firing and disarm.
                if let Ok(node) = rx.try_recv() {
                    return Ok(node);
                }
                if let Some(node) = session.node_for(id) {
                    return Ok(node);
                }
                let waited_ms: u64 = self.timeout.as_millis().try_into().unwrap_or(u64::MAX);
                tracing::warn!(
                    anchor = %id,
                    name = %name,
                    timeout_ms = waited_ms,
                    "Anchor never attached to a node"
                );
                Err(AnchorError::AttachmentTimeout {
                    name: name.to_string(),
                    waited_ms,
                })
            }
        }
    }

    /// Number of anchors currently waiting for a node
    pub fn armed_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wake every waiter with [`AnchorError::SessionClosed`] and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        drained.len()
    }

    pub(crate) fn disarm(&self, id: TrackingAnchorId) {
        self.waiters.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AttachmentMode, InMemoryTrackingSession};
    use crate::types::{TrackingAnchor, Transform};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let gate = Arc::new(AttachmentGate::new(Duration::from_secs(5)));
        let session = InMemoryTrackingSession::new(AttachmentMode::Manual);
        let anchor = TrackingAnchor::new(Transform::IDENTITY);

        let wait = gate.arm(anchor.id).unwrap();
        session.add_anchor(&anchor);

        let notifier = gate.clone();
        let id = anchor.id;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            notifier.notify_attached(id, NodeId(7));
        });

        let node = gate.wait(wait, "a", &session).await.unwrap();
        assert_eq!(node, NodeId(7));
        assert_eq!(gate.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_fast_path_uses_existing_node() {
        let gate = AttachmentGate::new(Duration::from_millis(10));
        let session = InMemoryTrackingSession::new(AttachmentMode::Immediate);
        let anchor = TrackingAnchor::new(Transform::IDENTITY);

        let wait = gate.arm(anchor.id).unwrap();
        session.add_anchor(&anchor);

        let node = gate.wait(wait, "a", &session).await.unwrap();
        assert_eq!(Some(node), session.node_for(anchor.id));
        assert_eq!(gate.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let gate = AttachmentGate::new(Duration::from_millis(20));
        let session = InMemoryTrackingSession::new(AttachmentMode::Manual);
        let anchor = TrackingAnchor::new(Transform::IDENTITY);

        let wait = gate.arm(anchor.id).unwrap();
        session.add_anchor(&anchor);

        let err = gate.wait(wait, "slow", &session).await.unwrap_err();
        assert_eq!(
            err,
            AnchorError::AttachmentTimeout {
                name: "slow".to_string(),
                waited_ms: 20,
            }
        );
        assert_eq!(gate.armed_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_closes_waiters() {
        let gate = AttachmentGate::new(Duration::from_secs(5));
        let session = InMemoryTrackingSession::new(AttachmentMode::Manual);
        let anchor = TrackingAnchor::new(Transform::IDENTITY);
        let wait = gate.arm(anchor.id).unwrap();

        assert_eq!(gate.cancel_all(), 1);
        let err = gate.wait(wait, "a", &session).await.unwrap_err();
        assert_eq!(err, AnchorError::SessionClosed);
        assert!(matches!(gate.arm(anchor.id), Err(AnchorError::SessionClosed)));
    }

    #[test]
    fn test_notify_without_waiter_is_ignored() {
        let gate = AttachmentGate::new(Duration::from_secs(1));
        assert!(!gate.notify_attached(TrackingAnchorId::new(), NodeId(1)));
    }
}
