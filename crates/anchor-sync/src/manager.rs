//! Anchor session controller.
//!
//! [`AnchorManager`] owns the registry, the attachment gate, the token
//! manager and, once cloud mode is on, the cloud handler. It exposes the
//! caller operations and the tracking-session callbacks.
//!
//! ```text
//! caller ──► AnchorManager ──► AnchorRegistry ──► TrackingSession
//!                 │                   ▲
//!                 ├──► CloudAnchorHandler ──► CloudSessionAdapter ──► cloud
//!                 │          │ (pump task)
//!                 └──► ResultRelay ◄─┘ ──► CallerChannel
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::cloud::{
    CloudAnchorHandler, CloudEventSink, CloudServiceConnector, CloudSessionAdapter,
    CloudTaskHandle, CloudTicket,
};
use crate::config::AnchorSyncConfig;
use crate::error::{AnchorError, AnchorResult};
use crate::gate::AttachmentGate;
use crate::registry::AnchorRegistry;
use crate::relay::{CallerChannel, Operation, ResultRelay};
use crate::session::TrackingSession;
use crate::tasks::TaskRegistry;
use crate::time::{Clock, SystemClock};
use crate::token::{KeyFileTokenProvider, TokenManager, TokenProvider};
use crate::types::{AnchorKind, FrameUpdate, LocalAnchor, NodeId, TrackingAnchorId, Transform};

/// Builder for [`AnchorManager`].
#[derive(Default)]
pub struct AnchorManagerBuilder {
    config: Option<AnchorSyncConfig>,
    session: Option<Arc<dyn TrackingSession>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    connector: Option<Arc<dyn CloudServiceConnector>>,
    channel: Option<Arc<dyn CallerChannel>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AnchorManagerBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: AnchorSyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Tracking session to manage anchors in
    pub fn tracking_session(mut self, session: Arc<dyn TrackingSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Credential source for the cloud service
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Factory for cloud sessions
    pub fn cloud_connector(mut self, connector: Arc<dyn CloudServiceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Channel to the remote caller
    pub fn caller_channel(mut self, channel: Arc<dyn CallerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Wall clock used for token expiry
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the manager.
    ///
    /// Without an explicit token provider, tokens are signed with the key
    /// file named by `token.key_path`.
    pub fn build(self) -> AnchorResult<AnchorManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let session = self
            .session
            .ok_or_else(|| AnchorError::config("a tracking session is required"))?;
        let channel = self
            .channel
            .ok_or_else(|| AnchorError::config("a caller channel is required"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let provider: Arc<dyn TokenProvider> = match (self.token_provider, &config.token.key_path)
        {
            (Some(provider), _) => provider,
            (None, Some(path)) => Arc::new(KeyFileTokenProvider::new(
                path.clone(),
                config.token.audience.clone(),
                config.token_lifetime(),
                clock.clone(),
            )),
            (None, None) => {
                return Err(AnchorError::config(
                    "a token provider or token.key_path is required",
                ))
            }
        };

        let gate = Arc::new(AttachmentGate::new(config.attachment_timeout()));
        let registry = Arc::new(AnchorRegistry::new(session.clone(), gate.clone()));
        let tokens = Arc::new(TokenManager::new(provider, clock, config.refresh_margin()));
        let relay = Arc::new(ResultRelay::new(
            channel,
            registry.clone(),
            config.acknowledgment_timeout(),
            config.result_timeout(),
        ));

        Ok(AnchorManager {
            config,
            session,
            gate,
            registry,
            tokens,
            connector: self.connector,
            relay,
            cloud: RwLock::new(None),
            init_lock: Mutex::new(()),
            tasks: TaskRegistry::new(),
            disposed: AtomicBool::new(false),
        })
    }
}

/// Anchor synchronization engine for one tracking session.
pub struct AnchorManager {
    config: AnchorSyncConfig,
    session: Arc<dyn TrackingSession>,
    gate: Arc<AttachmentGate>,
    registry: Arc<AnchorRegistry>,
    tokens: Arc<TokenManager>,
    connector: Option<Arc<dyn CloudServiceConnector>>,
    relay: Arc<ResultRelay>,
    cloud: RwLock<Option<Arc<CloudAnchorHandler>>>,
    init_lock: Mutex<()>,
    tasks: TaskRegistry,
    disposed: AtomicBool,
}

impl AnchorManager {
    /// Start building a manager
    pub fn builder() -> AnchorManagerBuilder {
        AnchorManagerBuilder::default()
    }

    /// Create an anchor of `kind` at `transform` and register it as `name`.
    ///
    /// Returns once the tracking session has attached a node to it.
    pub async fn add_anchor(
        &self,
        kind: AnchorKind,
        transform: Transform,
        name: &str,
    ) -> AnchorResult<LocalAnchor> {
        self.ensure_open()?;
        match kind {
            AnchorKind::Plane => self.registry.add(name, transform).await,
        }
    }

    /// Remove the anchor registered as `name`. Unknown names are ignored.
    pub async fn remove_anchor(&self, name: &str) -> Option<LocalAnchor> {
        self.registry.remove(name).await
    }

    /// Generate a token and open the cloud session.
    ///
    /// Calling this again once cloud mode is on does nothing. On failure no
    /// cloud session is kept and the caller also receives an `onError`.
    pub async fn init_cloud_mode(&self) -> AnchorResult<()> {
        self.ensure_open()?;
        let _init = self.init_lock.lock().await;
        if self.cloud.read().is_some() {
            tracing::debug!("Cloud mode already initialized");
            return Ok(());
        }

        match self.open_cloud_session().await {
            Ok(handler) => {
                *self.cloud.write() = Some(handler);
                tracing::info!("Cloud anchor mode enabled");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to initialize cloud anchor mode");
                self.relay.relay_error(Operation::InitCloudMode, &err).await;
                Err(err)
            }
        }
    }

    /// Host the anchor registered as `name`.
    ///
    /// The request is accepted once submitted; the cloud identifier or the
    /// failure arrives through the caller channel.
    pub async fn upload_anchor(
        &self,
        name: &str,
        ttl_days: Option<u32>,
    ) -> AnchorResult<CloudTaskHandle> {
        self.ensure_open()?;
        let handler = self.cloud_handler()?;
        let local = self
            .registry
            .lookup(name)
            .ok_or_else(|| AnchorError::not_found(name))?;
        self.install_fresh_token(&handler).await?;

        let ticket = handler.host(name, &local.anchor, ttl_days)?;
        let handle = ticket.handle();
        tracing::info!(name = %name, %handle, ?ttl_days, "Hosting initiated");
        self.spawn_relay(ticket);
        Ok(handle)
    }

    /// Resolve the anchor hosted under `cloud_id`.
    ///
    /// The resolved anchor is offered to the caller, who picks the name it is
    /// registered under.
    pub async fn download_anchor(&self, cloud_id: &str) -> AnchorResult<CloudTaskHandle> {
        self.ensure_open()?;
        let handler = self.cloud_handler()?;
        self.install_fresh_token(&handler).await?;
        let ticket = handler.resolve(cloud_id)?;
        let handle = ticket.handle();
        tracing::info!(cloud_id = %cloud_id, %handle, "Resolving initiated");
        self.spawn_relay(ticket);
        Ok(handle)
    }

    /// Tracking-session callback: a node was bound to an anchor.
    pub fn on_node_attached(&self, id: TrackingAnchorId, node: NodeId) {
        self.gate.notify_attached(id, node);
    }

    /// Tracking-session callback: the session dropped an anchor on its own.
    pub fn on_anchor_removed(&self, id: TrackingAnchorId) -> Option<String> {
        self.registry.forget_tracking_anchor(id)
    }

    /// Tracking-session callback: a new frame is available.
    ///
    /// Forwarded to the cloud session while cloud mode is on. Failures are
    /// only logged.
    pub fn on_frame(&self, frame: &FrameUpdate) {
        let handler = self.cloud.read().clone();
        if let Some(handler) = handler {
            if let Err(err) = handler.adapter().update_frame(frame) {
                tracing::warn!(
                    error = %err,
                    timestamp = frame.timestamp,
                    "Cloud frame update failed"
                );
            }
        }
    }

    /// Pause the session, stop background work and drop every anchor.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.pause();
        let cancelled = self.gate.cancel_all();
        let handler = self.cloud.write().take();
        let abandoned = handler.map_or(0, |handler| handler.abandon_all());
        // Relay tasks parked in a registration roll back their anchor when dropped.
        self.tasks.shutdown_and_join().await;
        let removed = self.registry.clear().await;
        tracing::info!(removed, cancelled, abandoned, "Anchor session disposed");
    }

    /// Whether `dispose` has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether cloud mode is on
    pub fn is_cloud_mode(&self) -> bool {
        self.cloud.read().is_some()
    }

    /// Cloud requests waiting for a terminal state
    pub fn pending_cloud_requests(&self) -> usize {
        self.cloud
            .read()
            .as_ref()
            .map_or(0, |handler| handler.pending_count())
    }

    /// Active configuration
    pub fn config(&self) -> &AnchorSyncConfig {
        &self.config
    }

    /// Anchor registry
    pub fn registry(&self) -> &Arc<AnchorRegistry> {
        &self.registry
    }

    /// Attachment gate
    pub fn attachment_gate(&self) -> &Arc<AttachmentGate> {
        &self.gate
    }

    /// Result relay
    pub fn relay(&self) -> &Arc<ResultRelay> {
        &self.relay
    }

    /// Token manager
    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    async fn open_cloud_session(&self) -> AnchorResult<Arc<CloudAnchorHandler>> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| AnchorError::cloud_unavailable("no cloud connector configured"))?;

        // No session is opened without a credential.
        let token = self.tokens.current_token().await?;

        let (sink, events) = CloudEventSink::channel();
        let service = connector.connect(sink).map_err(|reason| {
            AnchorError::cloud_unavailable(format!("Error initializing cloud session: {reason}"))
        })?;
        let adapter = Arc::new(CloudSessionAdapter::new(service));
        adapter.install_token(&token);

        let handler = Arc::new(CloudAnchorHandler::new(
            adapter,
            self.tokens.clone(),
            self.config.request_policy(),
        ));
        self.tasks.spawn_cancellable(handler.clone().run_event_pump(events));
        Ok(handler)
    }

    fn cloud_handler(&self) -> AnchorResult<Arc<CloudAnchorHandler>> {
        self.cloud
            .read()
            .clone()
            .ok_or_else(|| AnchorError::cloud_unavailable("cloud mode is not initialized"))
    }

    /// Replace the installed token before submitting if it went stale.
    async fn install_fresh_token(&self, handler: &CloudAnchorHandler) -> AnchorResult<()> {
        let token = self.tokens.current_token().await?;
        let adapter = handler.adapter();
        if adapter.current_token().as_ref() != Some(&token) {
            tracing::debug!("Installing refreshed cloud token before submission");
            adapter.install_token(&token);
        }
        Ok(())
    }

    fn spawn_relay(&self, ticket: CloudTicket) {
        let relay = self.relay.clone();
        self.tasks.spawn_cancellable(async move {
            // Outcomes, including failures, are delivered to the caller inside `relay`.
            let _ = relay.relay(ticket).await;
        });
    }

    fn ensure_open(&self) -> AnchorResult<()> {
        if self.is_disposed() {
            Err(AnchorError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for AnchorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorManager")
            .field("anchors", &self.registry.len())
            .field("cloud_mode", &self.is_cloud_mode())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        AttachmentMode, FailingTokenProvider, InMemoryCloudConnector, InMemoryTrackingSession,
        RecordingCallerChannel, RegistrationReply, SequenceTokenProvider, SessionCall,
    };
    use crate::relay::CallerEvent;
    use crate::time::ManualClock;
    use std::time::Duration;

    struct Harness {
        manager: Arc<AnchorManager>,
        session: Arc<InMemoryTrackingSession>,
        connector: Arc<InMemoryCloudConnector>,
        channel: Arc<RecordingCallerChannel>,
    }

    fn harness(provider: Arc<dyn TokenProvider>, connector: InMemoryCloudConnector) -> Harness {
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Immediate));
        let connector = Arc::new(connector);
        let channel = Arc::new(RecordingCallerChannel::new());
        let manager = Arc::new(
            AnchorManager::builder()
                .tracking_session(session.clone())
                .token_provider(provider)
                .cloud_connector(connector.clone())
                .caller_channel(channel.clone())
                .build()
                .unwrap(),
        );
        session.attach_to_manager(&manager);
        Harness {
            manager,
            session,
            connector,
            channel,
        }
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = AnchorManager::builder().build().unwrap_err();
        assert!(matches!(err, AnchorError::Config { .. }));

        let err = AnchorManager::builder()
            .tracking_session(Arc::new(InMemoryTrackingSession::new(AttachmentMode::Immediate)))
            .caller_channel(Arc::new(RecordingCallerChannel::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[tokio::test]
    async fn test_upload_without_cloud_mode_fails_fast() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        h.manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, "plane1")
            .await
            .unwrap();

        let err = h.manager.upload_anchor("plane1", None).await.unwrap_err();
        assert!(matches!(err, AnchorError::CloudSessionInitFailed { .. }));
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_of_missing_name_never_reaches_service() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        h.manager.init_cloud_mode().await.unwrap();

        let err = h.manager.upload_anchor("ghost", Some(1)).await.unwrap_err();
        assert_eq!(err, AnchorError::not_found("ghost"));
        assert!(h.connector.service().unwrap().submissions().is_empty());
    }

    #[tokio::test]
    async fn test_init_cloud_mode_is_idempotent() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        h.manager.init_cloud_mode().await.unwrap();
        h.manager.init_cloud_mode().await.unwrap();

        assert!(h.manager.is_cloud_mode());
        assert_eq!(h.connector.connect_count(), 1);
        assert_eq!(h.manager.token_manager().generated_count(), 1);
        assert_eq!(
            h.connector.service().unwrap().installed_tokens(),
            vec!["token-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_token_failure_leaves_cloud_mode_off() {
        let h = harness(
            Arc::new(FailingTokenProvider::new("cloudAnchorKey.json missing")),
            InMemoryCloudConnector::new(),
        );
        let err = h.manager.init_cloud_mode().await.unwrap_err();

        assert!(matches!(err, AnchorError::TokenGenerationFailed { .. }));
        assert!(!h.manager.is_cloud_mode());
        assert_eq!(h.connector.connect_count(), 0);
        assert_eq!(h.channel.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let h = harness(
            Arc::new(SequenceTokenProvider::new()),
            InMemoryCloudConnector::failing("no network"),
        );
        let err = h.manager.init_cloud_mode().await.unwrap_err();
        assert!(matches!(err, AnchorError::CloudSessionInitFailed { .. }));
        assert!(err.to_string().contains("no network"));
        assert!(!h.manager.is_cloud_mode());
    }

    #[tokio::test]
    async fn test_frames_forwarded_only_in_cloud_mode() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        let frame = FrameUpdate {
            timestamp: 1.0,
            camera: Transform::IDENTITY,
        };
        h.manager.on_frame(&frame);
        h.manager.init_cloud_mode().await.unwrap();
        h.manager.on_frame(&frame);
        h.manager.on_frame(&frame);
        assert_eq!(h.connector.service().unwrap().frame_count(), 2);
    }

    #[tokio::test]
    async fn test_session_removal_updates_registry() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        let local = h
            .manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, "plane1")
            .await
            .unwrap();

        h.session.drop_anchor(local.id());
        assert_eq!(h.manager.on_anchor_removed(local.id()), Some("plane1".to_string()));
        assert!(h.manager.registry().lookup("plane1").is_none());
    }

    #[tokio::test]
    async fn test_dispose_clears_everything() {
        let h = harness(Arc::new(SequenceTokenProvider::new()), InMemoryCloudConnector::new());
        h.manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, "a")
            .await
            .unwrap();
        h.manager.init_cloud_mode().await.unwrap();
        h.manager.download_anchor("abc123").await.unwrap();
        assert_eq!(h.manager.pending_cloud_requests(), 1);

        h.manager.dispose().await;
        assert!(h.session.is_paused());
        assert!(h.session.calls().contains(&SessionCall::Pause));
        assert_eq!(h.session.anchor_count(), 0);
        assert!(h.manager.registry().is_empty());
        assert!(!h.manager.is_cloud_mode());

        let err = h
            .manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, "b")
            .await
            .unwrap_err();
        assert_eq!(err, AnchorError::SessionClosed);
        h.manager.dispose().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_replaced_before_submission() {
        let clock = Arc::new(ManualClock::new(1_000));
        let provider = Arc::new(SequenceTokenProvider::expiring_after(clock.clone(), 3_600_000));
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Immediate));
        let connector = Arc::new(InMemoryCloudConnector::new());
        let manager = Arc::new(
            AnchorManager::builder()
                .tracking_session(session.clone())
                .token_provider(provider.clone())
                .cloud_connector(connector.clone())
                .caller_channel(Arc::new(RecordingCallerChannel::new()))
                .clock(clock.clone())
                .build()
                .unwrap(),
        );
        session.attach_to_manager(&manager);
        manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, "plane1")
            .await
            .unwrap();
        manager.init_cloud_mode().await.unwrap();

        clock.advance_ms(2 * 3_600_000);
        manager.upload_anchor("plane1", None).await.unwrap();
        manager.download_anchor("abc123").await.unwrap();

        let service = connector.service().unwrap();
        let tokens: Vec<Option<String>> =
            service.submissions().into_iter().map(|s| s.token).collect();
        assert_eq!(tokens, vec![Some("token-2".to_string()), Some("token-2".to_string())]);
        assert_eq!(service.installed_tokens(), vec!["token-1", "token-2"]);
        assert_eq!(provider.issued(), 2);
        assert_eq!(manager.token_manager().generated_count(), 2);
    }

    #[tokio::test]
    async fn test_dispose_during_registration_leaves_no_session_anchor() {
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Manual));
        let connector = Arc::new(InMemoryCloudConnector::auto_completing());
        connector.seed_hosted("abc123", Transform::from_translation(0.0, 0.0, -1.0));
        let channel = Arc::new(RecordingCallerChannel::new());
        channel.set_registration_reply(RegistrationReply::Name("copy".to_string()));
        let mut config = AnchorSyncConfig::default();
        config.attachment.timeout_ms = 5_000;
        let manager = Arc::new(
            AnchorManager::builder()
                .config(config)
                .tracking_session(session.clone())
                .token_provider(Arc::new(SequenceTokenProvider::new()))
                .cloud_connector(connector)
                .caller_channel(channel)
                .build()
                .unwrap(),
        );
        session.attach_to_manager(&manager);
        manager.init_cloud_mode().await.unwrap();
        manager.download_anchor("abc123").await.unwrap();

        // The relay has added the resolved anchor and is waiting for its node.
        tokio::time::timeout(Duration::from_secs(2), async {
            while session.anchor_count() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.anchor_count(), 1);

        manager.dispose().await;
        assert_eq!(session.anchor_count(), 0);
        assert!(manager.registry().is_empty());
        assert_eq!(manager.attachment_gate().armed_count(), 0);
    }

    #[tokio::test]
    async fn test_result_timeout_relays_error() {
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Immediate));
        let channel = Arc::new(RecordingCallerChannel::new());
        let mut config = AnchorSyncConfig::default();
        config.cloud.result_timeout_ms = Some(20);
        let manager = AnchorManager::builder()
            .config(config)
            .tracking_session(session)
            .token_provider(Arc::new(SequenceTokenProvider::new()))
            .cloud_connector(Arc::new(InMemoryCloudConnector::new()))
            .caller_channel(channel.clone())
            .build()
            .unwrap();

        manager.init_cloud_mode().await.unwrap();
        manager.download_anchor("abc123").await.unwrap();

        let events = channel.wait_for_events(1, Duration::from_secs(2)).await;
        assert!(matches!(
            &events[0],
            CallerEvent::Error { message, .. } if message.contains("timed out")
        ));
    }
}
