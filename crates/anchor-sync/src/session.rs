//! Tracking session collaborator.
//!
//! The tracking session owns the live world map. The engine only adds and
//! removes anchors and asks which node the session bound to an anchor.
//! Node attachment happens on the session's own render/update cycle and is
//! reported back through [`crate::AnchorManager::on_node_attached`].
//!
//! Implementations must not call back into the engine synchronously from
//! these methods while holding their own locks; the engine may call them
//! from any thread.

use crate::types::{NodeId, TrackingAnchor, TrackingAnchorId};

/// Live tracking session.
pub trait TrackingSession: Send + Sync {
    /// Start tracking `anchor`. The session attaches a node asynchronously.
    fn add_anchor(&self, anchor: &TrackingAnchor);

    /// Stop tracking the anchor. Unknown identifiers are ignored.
    fn remove_anchor(&self, id: TrackingAnchorId);

    /// Node currently bound to the anchor, if the session attached one
    fn node_for(&self, id: TrackingAnchorId) -> Option<NodeId>;

    /// Detach every child node from `node`
    fn detach_children(&self, node: NodeId);

    /// Pause tracking
    fn pause(&self);
}
