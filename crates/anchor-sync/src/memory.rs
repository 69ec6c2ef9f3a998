//! In-memory collaborators.
//!
//! Deterministic stand-ins for the tracking session, the cloud service, the
//! caller channel and token providers. The test suites and the `anchor-sim`
//! driver run the engine against these.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::cloud::{
    CloudAnchorService, CloudAnchorSnapshot, CloudAnchorState, CloudEventSink, CloudFailure,
    CloudServiceConnector, CloudTaskHandle,
};
use crate::manager::AnchorManager;
use crate::relay::{CallerChannel, CallerEvent, ChannelError, DownloadedAnchor};
use crate::session::TrackingSession;
use crate::time::{Clock, ManualClock};
use crate::token::{AuthToken, TokenError, TokenProvider};
use crate::types::{FrameUpdate, NodeId, TrackingAnchor, TrackingAnchorId, Transform};

// ---------------------------------------------------------------------------
// Tracking session
// ---------------------------------------------------------------------------

/// When the in-memory session binds a node to a new anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Inside `add_anchor`, before it returns
    Immediate,
    /// On a spawned task after `delay`
    Spawned {
        /// Simulated update-cycle latency
        delay: Duration,
    },
    /// Only when the test calls [`InMemoryTrackingSession::attach_pending`]
    Manual,
}

/// Session call as recorded by [`InMemoryTrackingSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    /// `add_anchor`
    Add(TrackingAnchorId),
    /// `remove_anchor`
    Remove(TrackingAnchorId),
    /// `detach_children`
    DetachChildren(NodeId),
    /// `pause`
    Pause,
}

type AttachmentListener = Arc<dyn Fn(TrackingAnchorId, NodeId) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    anchors: HashMap<TrackingAnchorId, Option<NodeId>>,
    children: HashMap<NodeId, usize>,
    calls: Vec<SessionCall>,
    paused: bool,
}

struct SessionShared {
    state: Mutex<SessionState>,
    listener: RwLock<Option<AttachmentListener>>,
    next_node: AtomicU64,
}

impl SessionShared {
    /// Bind a node if the anchor is still present and unattached.
    fn attach(&self, id: TrackingAnchorId) -> Option<NodeId> {
        let node = {
            let mut state = self.state.lock();
            let slot = state.anchors.get_mut(&id)?;
            if slot.is_some() {
                return None;
            }
            let node = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
            *slot = Some(node);
            node
        };
        // Listener runs without the state lock held.
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(id, node);
        }
        Some(node)
    }
}

/// Tracking session that keeps anchors in a map.
pub struct InMemoryTrackingSession {
    mode: AttachmentMode,
    shared: Arc<SessionShared>,
}

impl InMemoryTrackingSession {
    /// Create a session with the given attachment behavior
    pub fn new(mode: AttachmentMode) -> Self {
        Self {
            mode,
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::default()),
                listener: RwLock::new(None),
                next_node: AtomicU64::new(1),
            }),
        }
    }

    /// Callback invoked whenever a node is bound to an anchor
    pub fn set_attachment_listener(
        &self,
        listener: impl Fn(TrackingAnchorId, NodeId) + Send + Sync + 'static,
    ) {
        *self.shared.listener.write() = Some(Arc::new(listener));
    }

    /// Report attachments to `manager` without keeping it alive
    pub fn attach_to_manager(&self, manager: &Arc<AnchorManager>) {
        let manager: Weak<AnchorManager> = Arc::downgrade(manager);
        self.set_attachment_listener(move |id, node| {
            if let Some(manager) = manager.upgrade() {
                manager.on_node_attached(id, node);
            }
        });
    }

    /// Bind nodes to every anchor still waiting for one
    pub fn attach_pending(&self) -> usize {
        let waiting: Vec<TrackingAnchorId> = self
            .shared
            .state
            .lock()
            .anchors
            .iter()
            .filter(|(_, node)| node.is_none())
            .map(|(id, _)| *id)
            .collect();
        waiting
            .into_iter()
            .filter_map(|id| self.shared.attach(id))
            .count()
    }

    /// Bind a node to one anchor
    pub fn attach(&self, id: TrackingAnchorId) -> Option<NodeId> {
        self.shared.attach(id)
    }

    /// Drop an anchor as if the session lost it on its own
    pub fn drop_anchor(&self, id: TrackingAnchorId) -> bool {
        self.shared.state.lock().anchors.remove(&id).is_some()
    }

    /// Hang a child node under `node`
    pub fn add_child(&self, node: NodeId) {
        *self.shared.state.lock().children.entry(node).or_default() += 1;
    }

    /// Children currently under `node`
    pub fn child_count(&self, node: NodeId) -> usize {
        self.shared
            .state
            .lock()
            .children
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    /// Whether the session tracks `id`
    pub fn contains(&self, id: TrackingAnchorId) -> bool {
        self.shared.state.lock().anchors.contains_key(&id)
    }

    /// Number of tracked anchors
    pub fn anchor_count(&self) -> usize {
        self.shared.state.lock().anchors.len()
    }

    /// Whether `pause` was called
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<SessionCall> {
        self.shared.state.lock().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.shared.state.lock().calls.clear();
    }
}

impl TrackingSession for InMemoryTrackingSession {
    fn add_anchor(&self, anchor: &TrackingAnchor) {
        {
            let mut state = self.shared.state.lock();
            state.calls.push(SessionCall::Add(anchor.id));
            state.anchors.insert(anchor.id, None);
        }

        let id = anchor.id;
        match self.mode {
            AttachmentMode::Immediate => {
                self.shared.attach(id);
            }
            AttachmentMode::Spawned { delay } => {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.attach(id);
                });
            }
            AttachmentMode::Manual => {}
        }
    }

    fn remove_anchor(&self, id: TrackingAnchorId) {
        let mut state = self.shared.state.lock();
        state.calls.push(SessionCall::Remove(id));
        state.anchors.remove(&id);
    }

    fn node_for(&self, id: TrackingAnchorId) -> Option<NodeId> {
        self.shared.state.lock().anchors.get(&id).copied().flatten()
    }

    fn detach_children(&self, node: NodeId) {
        let mut state = self.shared.state.lock();
        state.calls.push(SessionCall::DetachChildren(node));
        state.children.remove(&node);
    }

    fn pause(&self) {
        let mut state = self.shared.state.lock();
        state.calls.push(SessionCall::Pause);
        state.paused = true;
    }
}

// ---------------------------------------------------------------------------
// Cloud service
// ---------------------------------------------------------------------------

/// Request received by [`InMemoryCloudService`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedRequest {
    /// `host_anchor`
    Host {
        /// Anchor to host
        anchor: TrackingAnchor,
        /// Requested time-to-live
        ttl_days: Option<u32>,
    },
    /// `resolve_anchor`
    Resolve {
        /// Cloud identifier to resolve
        cloud_id: String,
    },
}

/// Submission with the handle the service returned.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudSubmission {
    /// Handle returned to the engine
    pub handle: CloudTaskHandle,
    /// What was asked for
    pub request: SubmittedRequest,
    /// Token installed when the request arrived
    pub token: Option<String>,
}

impl CloudSubmission {
    /// TTL of a host request
    pub fn ttl_days(&self) -> Option<u32> {
        match &self.request {
            SubmittedRequest::Host { ttl_days, .. } => *ttl_days,
            SubmittedRequest::Resolve { .. } => None,
        }
    }

    /// Cloud identifier of a resolve request
    pub fn cloud_id(&self) -> Option<&str> {
        match &self.request {
            SubmittedRequest::Resolve { cloud_id } => Some(cloud_id),
            SubmittedRequest::Host { .. } => None,
        }
    }

    /// Whether this is a host request
    pub fn is_host(&self) -> bool {
        matches!(self.request, SubmittedRequest::Host { .. })
    }
}

#[derive(Default)]
struct CloudState {
    submissions: Vec<CloudSubmission>,
    tokens: Vec<String>,
    rejected_tokens: HashSet<String>,
    hosted: HashMap<String, Transform>,
    reject_submissions: Option<CloudFailure>,
    frames: usize,
    next_cloud_id: u64,
}

/// Cloud anchor service that records requests.
///
/// In manual mode the test completes tasks explicitly. With auto-complete
/// enabled every submission is answered immediately through the sink: hosts
/// succeed with a generated identifier, resolves succeed for identifiers
/// hosted earlier and fail with `ErrorCloudIdNotFound` otherwise, and any
/// request sent with a rejected token fails with `ErrorNotAuthorized`.
pub struct InMemoryCloudService {
    sink: CloudEventSink,
    auto_complete: AtomicBool,
    next_handle: AtomicU64,
    state: Mutex<CloudState>,
}

impl InMemoryCloudService {
    /// Create a service in manual mode
    pub fn new(sink: CloudEventSink) -> Self {
        Self {
            sink,
            auto_complete: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            state: Mutex::new(CloudState::default()),
        }
    }

    /// Create a service that answers every submission immediately
    pub fn auto_completing(sink: CloudEventSink) -> Self {
        let service = Self::new(sink);
        service.set_auto_complete(true);
        service
    }

    /// Toggle auto-complete
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// Make `host_anchor` and `resolve_anchor` fail synchronously
    pub fn reject_submissions(&self, failure: Option<CloudFailure>) {
        self.state.lock().reject_submissions = failure;
    }

    /// Treat requests carrying `token` as unauthorized (auto-complete only)
    pub fn reject_token(&self, token: &str) {
        self.state.lock().rejected_tokens.insert(token.to_string());
    }

    /// Register a hosted anchor that can be resolved
    pub fn seed_hosted(&self, cloud_id: &str, transform: Transform) {
        self.state
            .lock()
            .hosted
            .insert(cloud_id.to_string(), transform);
    }

    /// Pose stored for a hosted anchor
    pub fn hosted(&self, cloud_id: &str) -> Option<Transform> {
        self.state.lock().hosted.get(cloud_id).copied()
    }

    /// Requests received so far
    pub fn submissions(&self) -> Vec<CloudSubmission> {
        self.state.lock().submissions.clone()
    }

    /// Tokens installed so far, oldest first
    pub fn installed_tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }

    /// Frames received through `update`
    pub fn frame_count(&self) -> usize {
        self.state.lock().frames
    }

    /// Report an arbitrary state for `handle`
    pub fn report(
        &self,
        handle: CloudTaskHandle,
        state: CloudAnchorState,
        anchor: Option<CloudAnchorSnapshot>,
    ) -> bool {
        self.sink.on_task_complete(handle, state, anchor)
    }

    /// Complete a host task with `cloud_id`
    pub fn succeed_host(&self, handle: CloudTaskHandle, cloud_id: &str) -> bool {
        let transform = {
            let mut state = self.state.lock();
            let transform = state
                .submissions
                .iter()
                .find_map(|s| match (&s.request, s.handle == handle) {
                    (SubmittedRequest::Host { anchor, .. }, true) => Some(anchor.transform),
                    _ => None,
                })
                .unwrap_or_default();
            state.hosted.insert(cloud_id.to_string(), transform);
            transform
        };
        self.report(
            handle,
            CloudAnchorState::Success,
            Some(CloudAnchorSnapshot {
                cloud_id: Some(cloud_id.to_string()),
                transform,
            }),
        )
    }

    /// Complete a resolve task with `transform`
    pub fn succeed_resolve(&self, handle: CloudTaskHandle, transform: Transform) -> bool {
        let cloud_id = self
            .state
            .lock()
            .submissions
            .iter()
            .find(|s| s.handle == handle)
            .and_then(|s| s.cloud_id().map(str::to_string));
        self.report(
            handle,
            CloudAnchorState::Success,
            Some(CloudAnchorSnapshot {
                cloud_id,
                transform,
            }),
        )
    }

    /// Fail a task with `state`
    pub fn fail(&self, handle: CloudTaskHandle, state: CloudAnchorState) -> bool {
        self.report(handle, state, None)
    }

    fn record(&self, request: SubmittedRequest) -> Result<CloudTaskHandle, CloudFailure> {
        let mut state = self.state.lock();
        if let Some(failure) = state.reject_submissions {
            return Err(failure);
        }
        let handle = CloudTaskHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let token = state.tokens.last().cloned();
        state.submissions.push(CloudSubmission {
            handle,
            request,
            token,
        });
        Ok(handle)
    }

    fn auto_reply(&self, submission: &CloudSubmission) {
        let (state, anchor) = {
            let mut state = self.state.lock();
            let unauthorized = submission
                .token
                .as_ref()
                .map_or(true, |t| state.rejected_tokens.contains(t));
            if unauthorized {
                (CloudAnchorState::ErrorNotAuthorized, None)
            } else {
                match &submission.request {
                    SubmittedRequest::Host { anchor, .. } => {
                        state.next_cloud_id += 1;
                        let cloud_id = format!("cloud-{}", state.next_cloud_id);
                        state.hosted.insert(cloud_id.clone(), anchor.transform);
                        (
                            CloudAnchorState::Success,
                            Some(CloudAnchorSnapshot {
                                cloud_id: Some(cloud_id),
                                transform: anchor.transform,
                            }),
                        )
                    }
                    SubmittedRequest::Resolve { cloud_id } => match state.hosted.get(cloud_id) {
                        Some(transform) => (
                            CloudAnchorState::Success,
                            Some(CloudAnchorSnapshot {
                                cloud_id: Some(cloud_id.clone()),
                                transform: *transform,
                            }),
                        ),
                        None => (CloudAnchorState::ErrorCloudIdNotFound, None),
                    },
                }
            }
        };
        self.report(submission.handle, state, anchor);
    }

    fn submit(&self, request: SubmittedRequest) -> Result<CloudTaskHandle, CloudFailure> {
        let handle = self.record(request)?;
        if self.auto_complete.load(Ordering::SeqCst) {
            let submission = self
                .state
                .lock()
                .submissions
                .iter()
                .rev()
                .find(|s| s.handle == handle)
                .cloned();
            if let Some(submission) = submission {
                self.auto_reply(&submission);
            }
        }
        Ok(handle)
    }
}

impl CloudAnchorService for InMemoryCloudService {
    fn set_auth_token(&self, token: &str) {
        self.state.lock().tokens.push(token.to_string());
    }

    fn host_anchor(
        &self,
        anchor: &TrackingAnchor,
        ttl_days: Option<u32>,
    ) -> Result<CloudTaskHandle, CloudFailure> {
        self.submit(SubmittedRequest::Host {
            anchor: *anchor,
            ttl_days,
        })
    }

    fn resolve_anchor(&self, cloud_id: &str) -> Result<CloudTaskHandle, CloudFailure> {
        self.submit(SubmittedRequest::Resolve {
            cloud_id: cloud_id.to_string(),
        })
    }

    fn update(&self, _frame: &FrameUpdate) -> Result<(), CloudFailure> {
        self.state.lock().frames += 1;
        Ok(())
    }
}

/// Connector handing out [`InMemoryCloudService`] sessions.
#[derive(Default)]
pub struct InMemoryCloudConnector {
    auto_complete: bool,
    failure: Option<String>,
    seeded: Mutex<HashMap<String, Transform>>,
    services: Mutex<Vec<Arc<InMemoryCloudService>>>,
}

impl InMemoryCloudConnector {
    /// Connector producing manual-mode services
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector producing auto-completing services
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// Connector whose `connect` always fails
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Hosted anchor every new session starts with
    pub fn seed_hosted(&self, cloud_id: &str, transform: Transform) {
        self.seeded.lock().insert(cloud_id.to_string(), transform);
    }

    /// Most recently connected service
    pub fn service(&self) -> Option<Arc<InMemoryCloudService>> {
        self.services.lock().last().cloned()
    }

    /// Number of sessions opened
    pub fn connect_count(&self) -> usize {
        self.services.lock().len()
    }
}

impl CloudServiceConnector for InMemoryCloudConnector {
    fn connect(&self, sink: CloudEventSink) -> Result<Arc<dyn CloudAnchorService>, String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }
        let service = Arc::new(InMemoryCloudService::new(sink));
        service.set_auto_complete(self.auto_complete);
        for (cloud_id, transform) in self.seeded.lock().iter() {
            service.seed_hosted(cloud_id, *transform);
        }
        self.services.lock().push(service.clone());
        Ok(service)
    }
}

// ---------------------------------------------------------------------------
// Caller channel
// ---------------------------------------------------------------------------

/// How [`RecordingCallerChannel`] answers registration requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationReply {
    /// Register under this name
    Name(String),
    /// Register under the name the engine suggested
    AcceptSuggested,
    /// Answer without a name
    Decline,
    /// Disconnect instead of answering
    Disconnect,
    /// Never answer
    Hang,
}

/// Caller channel that records everything it receives.
pub struct RecordingCallerChannel {
    connected: AtomicBool,
    events: Mutex<Vec<CallerEvent>>,
    registrations: Mutex<Vec<DownloadedAnchor>>,
    reply: Mutex<RegistrationReply>,
    arrived: Notify,
}

impl Default for RecordingCallerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCallerChannel {
    /// Connected channel that declines registrations
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            reply: Mutex::new(RegistrationReply::Decline),
            arrived: Notify::new(),
        }
    }

    /// Change how registration requests are answered
    pub fn set_registration_reply(&self, reply: RegistrationReply) {
        *self.reply.lock() = reply;
    }

    /// Attach or detach the caller
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Events received, including registration offers
    pub fn events(&self) -> Vec<CallerEvent> {
        self.events.lock().clone()
    }

    /// Messages of received `onError` events
    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CallerEvent::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Registration offers received
    pub fn registrations(&self) -> Vec<DownloadedAnchor> {
        self.registrations.lock().clone()
    }

    /// Wait until at least `count` events arrived or `timeout` passes.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<CallerEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let events = self.events.lock();
                if events.len() >= count {
                    return events.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.events();
            }
        }
    }

    fn push(&self, event: CallerEvent) {
        self.events.lock().push(event);
        self.arrived.notify_waiters();
    }
}

#[async_trait]
impl CallerChannel for RecordingCallerChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn notify(&self, event: CallerEvent) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        self.push(event);
        Ok(())
    }

    async fn request_registration(
        &self,
        anchor: &DownloadedAnchor,
    ) -> Result<Option<String>, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        self.registrations.lock().push(anchor.clone());
        self.push(CallerEvent::AnchorDownloadSuccess(anchor.clone()));

        let reply = self.reply.lock().clone();
        match reply {
            RegistrationReply::Name(name) => Ok(Some(name)),
            RegistrationReply::AcceptSuggested => Ok(Some(anchor.name.clone())),
            RegistrationReply::Decline => Ok(None),
            RegistrationReply::Disconnect => {
                self.set_connected(false);
                Err(ChannelError::Disconnected)
            }
            RegistrationReply::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Token providers
// ---------------------------------------------------------------------------

/// Provider issuing `token-1`, `token-2`, ...
pub struct SequenceTokenProvider {
    issued: AtomicU64,
    expiry: Option<(Arc<dyn Clock>, u64)>,
}

impl Default for SequenceTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTokenProvider {
    /// Tokens that never expire
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            expiry: None,
        }
    }

    /// Tokens expiring `lifetime_ms` after issue on `clock`
    pub fn expiring_after(clock: Arc<ManualClock>, lifetime_ms: u64) -> Self {
        let clock: Arc<dyn Clock> = clock;
        Self {
            issued: AtomicU64::new(0),
            expiry: Some((clock, lifetime_ms)),
        }
    }

    /// Tokens issued so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for SequenceTokenProvider {
    async fn generate_token(&self) -> Result<AuthToken, TokenError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let value = format!("token-{n}");
        Ok(match &self.expiry {
            Some((clock, lifetime_ms)) => {
                AuthToken::expiring(value, clock.now_ms().saturating_add(*lifetime_ms))
            }
            None => AuthToken::new(value),
        })
    }
}

/// Provider that always fails.
pub struct FailingTokenProvider {
    reason: String,
    attempts: AtomicU64,
}

impl FailingTokenProvider {
    /// Fail with `reason`
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Calls to `generate_token` so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FailingTokenProvider {
    async fn generate_token(&self) -> Result<AuthToken, TokenError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TokenError::KeyUnavailable(self.reason.clone()))
    }
}
