//! Simulated anchor session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use anchor_sync::memory::{
    AttachmentMode, InMemoryCloudConnector, InMemoryTrackingSession, RecordingCallerChannel,
    RegistrationReply, SequenceTokenProvider,
};
use anchor_sync::{AnchorKind, AnchorManager, AnchorSyncConfig, CallerEvent, Transform};

const EVENT_WAIT: Duration = Duration::from_secs(10);
const UPDATE_CYCLE: Duration = Duration::from_millis(16);

/// Anchor engine wired to in-memory collaborators.
pub struct Simulation {
    manager: Arc<AnchorManager>,
    channel: Arc<RecordingCallerChannel>,
    printed: AtomicUsize,
}

impl Simulation {
    /// Build the engine and enable cloud mode.
    ///
    /// `seed` pre-hosts an anchor so it can be resolved without hosting first.
    pub fn start(config: AnchorSyncConfig, seed: Option<&str>) -> Result<Self> {
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Spawned {
            delay: UPDATE_CYCLE,
        }));
        let connector = Arc::new(InMemoryCloudConnector::auto_completing());
        if let Some(cloud_id) = seed {
            connector.seed_hosted(cloud_id, Transform::from_translation(0.0, 0.0, -1.0));
        }
        let channel = Arc::new(RecordingCallerChannel::new());

        let mut builder = AnchorManager::builder()
            .tracking_session(session.clone())
            .cloud_connector(connector)
            .caller_channel(channel.clone());
        if config.token.key_path.is_none() {
            builder = builder.token_provider(Arc::new(SequenceTokenProvider::new()));
        }
        let manager = Arc::new(builder.config(config).build()?);
        session.attach_to_manager(&manager);

        Ok(Self {
            manager,
            channel,
            printed: AtomicUsize::new(0),
        })
    }

    /// Place `name` one meter ahead and host it. Returns the cloud identifier.
    pub async fn host(&self, name: &str, ttl_days: Option<u32>) -> Result<String> {
        self.ensure_cloud_mode().await?;
        let transform = Transform::from_translation(0.0, 0.0, -1.0);
        let local = self
            .manager
            .add_anchor(AnchorKind::Plane, transform, name)
            .await?;
        tracing::info!(name = %name, node = %local.node, "Anchor placed");

        self.manager.upload_anchor(name, ttl_days).await?;
        match self.next_event().await? {
            CallerEvent::CloudAnchorUploaded { cloud_id, .. } => Ok(cloud_id),
            CallerEvent::Error { message, .. } => bail!(message),
            other => bail!("unexpected event {}", other.method()),
        }
    }

    /// Resolve `cloud_id` and register it as `name`.
    pub async fn resolve(&self, cloud_id: &str, name: &str) -> Result<()> {
        self.ensure_cloud_mode().await?;
        self.channel
            .set_registration_reply(RegistrationReply::Name(name.to_string()));
        self.manager.download_anchor(cloud_id).await?;

        if let CallerEvent::Error { message, .. } = self.next_event().await? {
            bail!(message);
        }

        let registry = self.manager.registry().clone();
        tokio::time::timeout(EVENT_WAIT, async {
            while !registry.contains(name) {
                tokio::time::sleep(UPDATE_CYCLE).await;
            }
        })
        .await
        .map_err(|_| anyhow!("resolved anchor was never registered as '{name}'"))?;

        tracing::info!(name = %name, cloud_id = %cloud_id, "Resolved anchor registered");
        Ok(())
    }

    /// Print anything left over and dispose the engine.
    pub async fn finish(&self) {
        let events = self.channel.events();
        self.print_from(&events);
        tracing::info!(
            anchors = ?self.manager.registry().names(),
            delivered = self.manager.relay().delivered_count(),
            "Simulation finished"
        );
        self.manager.dispose().await;
    }

    async fn ensure_cloud_mode(&self) -> Result<()> {
        if !self.manager.is_cloud_mode() {
            self.manager.init_cloud_mode().await?;
        }
        Ok(())
    }

    async fn next_event(&self) -> Result<CallerEvent> {
        let seen = self.printed.load(Ordering::SeqCst);
        let events = self.channel.wait_for_events(seen + 1, EVENT_WAIT).await;
        if events.len() <= seen {
            bail!("no caller event within {}s", EVENT_WAIT.as_secs());
        }
        self.print_from(&events);
        Ok(events[seen].clone())
    }

    fn print_from(&self, events: &[CallerEvent]) {
        let seen = self.printed.swap(events.len(), Ordering::SeqCst);
        for event in events.iter().skip(seen) {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "Event not printable"),
            }
        }
    }
}
