//! Anchor-Sync: Spatial Anchor Registry and Cloud Anchor Synchronization
//!
//! This crate keeps a named registry of spatial anchors placed in an AR
//! tracking session and synchronizes them with a cloud anchor service.
//!
//! # Architecture Overview
//!
//! - [`AnchorRegistry`] maps caller-chosen names to tracking anchors and
//!   waits on the [`AttachmentGate`] until the session has bound a node
//! - [`TokenManager`] produces and refreshes cloud credentials from a
//!   [`TokenProvider`]
//! - [`CloudAnchorHandler`] correlates host/resolve requests with the cloud
//!   session's completion callbacks
//! - [`ResultRelay`] turns completions into caller events and registers
//!   resolved anchors under the name the caller picks
//! - [`AnchorManager`] owns all of the above and exposes the operations of
//!   the anchor method channel
//!
//! Platform collaborators are traits ([`TrackingSession`],
//! [`CloudAnchorService`], [`CallerChannel`]); the `memory` module has
//! in-process implementations used by the tests and the `anchor-sim` CLI,
//! compiled with the `simulation` feature.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use anchor_sync::memory::{
//!     AttachmentMode, InMemoryCloudConnector, InMemoryTrackingSession,
//!     RecordingCallerChannel, SequenceTokenProvider,
//! };
//! use anchor_sync::{AnchorKind, AnchorManager, Transform};
//!
//! # async fn demo() -> anchor_sync::AnchorResult<()> {
//! let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Immediate));
//! let manager = Arc::new(
//!     AnchorManager::builder()
//!         .tracking_session(session.clone())
//!         .token_provider(Arc::new(SequenceTokenProvider::new()))
//!         .cloud_connector(Arc::new(InMemoryCloudConnector::auto_completing()))
//!         .caller_channel(Arc::new(RecordingCallerChannel::new()))
//!         .build()?,
//! );
//! session.attach_to_manager(&manager);
//!
//! manager.add_anchor(AnchorKind::Plane, Transform::IDENTITY, "plane1").await?;
//! manager.init_cloud_mode().await?;
//! manager.upload_anchor("plane1", Some(30)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

/// Cloud session adapter, request correlation and state codes
pub mod cloud;

/// Layered engine configuration
pub mod config;

/// Method-channel command parsing and response shaping
pub mod dispatch;

/// Engine error type
pub mod error;

/// Attachment synchronization gate
pub mod gate;

/// Engine facade
pub mod manager;

/// In-memory collaborators for tests and simulation
#[cfg(any(test, feature = "simulation"))]
pub mod memory;

/// Named anchor registry
pub mod registry;

/// Cloud result delivery to the caller
pub mod relay;

/// Tracking session boundary
pub mod session;

/// Background task ownership
pub mod tasks;

/// Clock abstraction
pub mod time;

/// Cloud credential generation and caching
pub mod token;

/// Core value types
pub mod types;

pub use cloud::{
    CloudAnchorHandler, CloudAnchorService, CloudAnchorState, CloudFailure, CloudOutcome,
    CloudServiceConnector, CloudSessionAdapter, CloudTaskHandle,
};
pub use config::AnchorSyncConfig;
pub use dispatch::{AnchorCommand, MethodResponse};
pub use error::{AnchorError, AnchorResult};
pub use gate::AttachmentGate;
pub use manager::{AnchorManager, AnchorManagerBuilder};
pub use registry::AnchorRegistry;
pub use relay::{CallerChannel, CallerEvent, ChannelError, DownloadedAnchor, Operation, ResultRelay};
pub use session::TrackingSession;
pub use time::{Clock, ManualClock, SystemClock};
pub use token::{AuthToken, TokenError, TokenManager, TokenProvider};
pub use types::{
    AnchorKind, FrameUpdate, LocalAnchor, NodeId, TrackingAnchor, TrackingAnchorId, Transform,
};
