//! Anchor registry
//!
//! Single source of truth for "does this name exist". Maps caller-assigned
//! names to anchors that are live in the tracking session.
//!
//! # Concurrency
//!
//! Lookups take a read lock on the map and may run concurrently from the
//! caller thread and the session callback thread. `add`, `remove` and
//! `clear` are serialized behind one async writer lock, which is held across
//! the attachment wait so that no two mutations interleave with the session.
//! An entry only becomes visible after its node is attached.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::error::{AnchorError, AnchorResult};
use crate::gate::AttachmentGate;
use crate::session::TrackingSession;
use crate::types::{LocalAnchor, TrackingAnchor, TrackingAnchorId, Transform};

/// Name to anchor mapping kept consistent with the tracking session.
pub struct AnchorRegistry {
    session: Arc<dyn TrackingSession>,
    gate: Arc<AttachmentGate>,
    anchors: RwLock<HashMap<String, LocalAnchor>>,
    writer: Mutex<()>,
}

impl AnchorRegistry {
    /// Create an empty registry bound to a tracking session
    pub fn new(session: Arc<dyn TrackingSession>, gate: Arc<AttachmentGate>) -> Self {
        Self {
            session,
            gate,
            anchors: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Create an anchor at `transform`, attach it to the session and register it.
    ///
    /// Returns only once the session has attached a node to the anchor. If the
    /// node never shows up the anchor is removed from the session again and the
    /// registry is left untouched.
    pub async fn add(&self, name: &str, transform: Transform) -> AnchorResult<LocalAnchor> {
        if name.is_empty() {
            return Err(AnchorError::invalid("anchor name must not be empty"));
        }

        let _writer = self.writer.lock().await;
        if self.anchors.read().contains_key(name) {
            return Err(AnchorError::duplicate(name));
        }

        let anchor = TrackingAnchor::new(transform);
        let wait = self.gate.arm(anchor.id)?;
        self.session.add_anchor(&anchor);
        // Also covers this future being dropped mid-wait, e.g. an aborted task.
        let rollback = SessionRollback {
            session: self.session.as_ref(),
            gate: &self.gate,
            id: anchor.id,
            armed: true,
        };

        let node = self.gate.wait(wait, name, self.session.as_ref()).await?;
        let local = LocalAnchor {
            name: name.to_string(),
            anchor,
            node,
        };
        self.anchors.write().insert(name.to_string(), local.clone());
        rollback.disarm();
        tracing::debug!(name = %name, anchor = %anchor.id, %node, "Anchor registered");
        Ok(local)
    }

    /// Remove the anchor registered under `name`.
    ///
    /// Removing an unknown name is a no-op and returns `None`.
    pub async fn remove(&self, name: &str) -> Option<LocalAnchor> {
        let _writer = self.writer.lock().await;
        let local = self.anchors.read().get(name).cloned()?;

        // Child content goes first so nothing renders against a dead anchor.
        if let Some(node) = self.session.node_for(local.id()) {
            self.session.detach_children(node);
        }
        self.session.remove_anchor(local.id());
        self.anchors.write().remove(name);

        tracing::debug!(name = %name, anchor = %local.id(), "Anchor removed");
        Some(local)
    }

    /// Look up an anchor by name
    pub fn lookup(&self, name: &str) -> Option<LocalAnchor> {
        self.anchors.read().get(name).cloned()
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.anchors.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.anchors.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered anchors
    pub fn len(&self) -> usize {
        self.anchors.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.anchors.read().is_empty()
    }

    /// Drop the entry whose tracking anchor the session removed on its own.
    ///
    /// Called from the session callback thread, so it only touches the map.
    pub fn forget_tracking_anchor(&self, id: TrackingAnchorId) -> Option<String> {
        let mut anchors = self.anchors.write();
        let name = anchors
            .iter()
            .find(|(_, local)| local.id() == id)
            .map(|(name, _)| name.clone())?;
        anchors.remove(&name);
        tracing::debug!(name = %name, anchor = %id, "Session dropped anchor");
        Some(name)
    }

    /// Remove every anchor from the session and empty the registry.
    pub async fn clear(&self) -> usize {
        let _writer = self.writer.lock().await;
        let drained: Vec<LocalAnchor> = self.anchors.write().drain().map(|(_, v)| v).collect();
        for local in &drained {
            if let Some(node) = self.session.node_for(local.id()) {
                self.session.detach_children(node);
            }
            self.session.remove_anchor(local.id());
        }
        drained.len()
    }
}

/// Removes a not yet registered anchor from the session when dropped armed.
struct SessionRollback<'a> {
    session: &'a dyn TrackingSession,
    gate: &'a AttachmentGate,
    id: TrackingAnchorId,
    armed: bool,
}

impl SessionRollback<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionRollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.disarm(self.id);
            self.session.remove_anchor(self.id);
            tracing::debug!(anchor = %self.id, "Unregistered anchor rolled back");
        }
    }
}
