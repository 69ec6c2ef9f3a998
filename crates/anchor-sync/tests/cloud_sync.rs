//! End-to-end cloud anchor flows against the in-memory collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anchor_sync::memory::{
    AttachmentMode, FailingTokenProvider, InMemoryCloudConnector, InMemoryTrackingSession,
    RecordingCallerChannel, RegistrationReply, SequenceTokenProvider,
};
use anchor_sync::{
    AnchorKind, AnchorManager, CallerEvent, CloudAnchorState, CloudTaskHandle, MethodResponse,
    Operation, TokenProvider, Transform,
};
use futures::future::join_all;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    manager: Arc<AnchorManager>,
    session: Arc<InMemoryTrackingSession>,
    connector: Arc<InMemoryCloudConnector>,
    channel: Arc<RecordingCallerChannel>,
}

impl Harness {
    fn new(provider: Arc<dyn TokenProvider>, connector: InMemoryCloudConnector) -> Self {
        let session = Arc::new(InMemoryTrackingSession::new(AttachmentMode::Spawned {
            delay: Duration::from_millis(2),
        }));
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
        Self {
            manager,
            session,
            connector,
            channel,
        }
    }

    fn with_tokens(connector: InMemoryCloudConnector) -> Self {
        Self::new(Arc::new(SequenceTokenProvider::new()), connector)
    }

    async fn add(&self, name: &str) {
        self.manager
            .add_anchor(AnchorKind::Plane, Transform::IDENTITY, name)
            .await
            .unwrap();
    }

    async fn wait_until_registered(&self, name: &str) {
        let registry = self.manager.registry().clone();
        tokio::time::timeout(WAIT, async {
            while !registry.contains(name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{name} never registered"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Upload(String),
    Download(String),
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_requests_each_complete_exactly_once() {
    const PER_KIND: usize = 50;

    let h = Harness::with_tokens(InMemoryCloudConnector::new());
    for i in 0..PER_KIND {
        h.add(&format!("anchor-{i}")).await;
    }
    h.manager.init_cloud_mode().await.unwrap();
    h.channel.set_registration_reply(RegistrationReply::AcceptSuggested);

    let submitters: Vec<_> = (0..PER_KIND)
        .flat_map(|i| {
            [
                Request::Upload(format!("anchor-{i}")),
                Request::Download(format!("remote-{i}")),
            ]
        })
        .map(|request| {
            let manager = h.manager.clone();
            tokio::spawn(async move {
                let handle = match &request {
                    Request::Upload(name) => manager.upload_anchor(name, Some(1)).await,
                    Request::Download(cloud_id) => manager.download_anchor(cloud_id).await,
                };
                (handle.unwrap(), request)
            })
        })
        .collect();

    let mut requests: HashMap<CloudTaskHandle, Request> = HashMap::new();
    for submitted in join_all(submitters).await {
        let (handle, request) = submitted.unwrap();
        assert!(requests.insert(handle, request).is_none(), "handle reused");
    }
    assert_eq!(requests.len(), 2 * PER_KIND);
    assert_eq!(h.manager.pending_cloud_requests(), 2 * PER_KIND);

    // Complete newest first, failing every fourth request.
    let service = h.connector.service().unwrap();
    let mut hosted: HashMap<String, String> = HashMap::new();
    let mut resolved: BTreeSet<String> = BTreeSet::new();
    let mut failed_uploads = 0;
    let mut failed_downloads = 0;
    for (n, submission) in service.submissions().iter().rev().enumerate() {
        let handle = submission.handle;
        let fail = n % 4 == 0;
        let completed = match &requests[&handle] {
            Request::Upload(_) if fail => {
                failed_uploads += 1;
                service.fail(handle, CloudAnchorState::ErrorServiceUnavailable)
            }
            Request::Download(_) if fail => {
                failed_downloads += 1;
                service.fail(handle, CloudAnchorState::ErrorCloudIdNotFound)
            }
            Request::Upload(name) => {
                let cloud_id = format!("cloud-{}", handle.0);
                hosted.insert(name.clone(), cloud_id.clone());
                service.succeed_host(handle, &cloud_id)
            }
            Request::Download(cloud_id) => {
                resolved.insert(cloud_id.clone());
                service.succeed_resolve(handle, Transform::from_translation(1.0, 0.0, 0.0))
            }
        };
        assert!(completed, "{handle} completed twice");
    }
    assert!(failed_uploads > 0 && failed_downloads > 0);

    let events = h.channel.wait_for_events(2 * PER_KIND, WAIT).await;
    assert_eq!(events.len(), 2 * PER_KIND);

    let mut uploaded: HashMap<String, String> = HashMap::new();
    let mut downloaded: BTreeSet<String> = BTreeSet::new();
    let mut upload_errors = 0;
    let mut download_errors = 0;
    for event in events {
        match event {
            CallerEvent::CloudAnchorUploaded { name, cloud_id } => {
                assert!(uploaded.insert(name, cloud_id).is_none(), "duplicate upload");
            }
            CallerEvent::AnchorDownloadSuccess(anchor) => {
                assert!(downloaded.insert(anchor.cloud_id), "duplicate download");
            }
            CallerEvent::Error {
                operation: Operation::Upload,
                ..
            } => upload_errors += 1,
            CallerEvent::Error {
                operation: Operation::Download,
                ..
            } => download_errors += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(uploaded, hosted);
    assert_eq!(downloaded, resolved);
    assert_eq!(upload_errors, failed_uploads);
    assert_eq!(download_errors, failed_downloads);

    for cloud_id in &resolved {
        h.wait_until_registered(cloud_id).await;
    }
    assert_eq!(h.manager.registry().len(), PER_KIND + resolved.len());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.channel.events().len(), 2 * PER_KIND);
    assert_eq!(h.manager.pending_cloud_requests(), 0);
}

#[tokio::test]
async fn test_hosting_reports_cloud_id_once() {
    let h = Harness::with_tokens(InMemoryCloudConnector::new());
    h.add("plane1").await;
    h.manager.init_cloud_mode().await.unwrap();
    let handle = h.manager.upload_anchor("plane1", Some(300)).await.unwrap();

    let service = h.connector.service().unwrap();
    let submission = service.submissions()[0].clone();
    assert!(submission.is_host());
    assert_eq!(submission.ttl_days(), Some(300));
    assert_eq!(submission.token.as_deref(), Some("token-1"));

    service.succeed_host(handle, "abc123");
    let events = h.channel.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![CallerEvent::CloudAnchorUploaded {
            name: "plane1".into(),
            cloud_id: "abc123".into(),
        }]
    );

    // A late duplicate callback for the same handle is ignored.
    service.succeed_host(handle, "abc123");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.channel.events().len(), 1);
}

#[tokio::test]
async fn test_resolved_anchor_registered_under_caller_name() {
    let connector = InMemoryCloudConnector::auto_completing();
    let pose = Transform::from_translation(0.5, 0.0, -1.0);
    connector.seed_hosted("abc123", pose);
    let h = Harness::with_tokens(connector);
    h.channel
        .set_registration_reply(RegistrationReply::Name("plane1-copy".into()));

    h.manager.init_cloud_mode().await.unwrap();
    h.manager.download_anchor("abc123").await.unwrap();
    h.wait_until_registered("plane1-copy").await;

    let offers = h.channel.registrations();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].cloud_id, "abc123");
    assert_eq!(offers[0].kind, AnchorKind::Plane.code());
    assert_eq!(offers[0].transform, pose);

    let local = h.manager.registry().lookup("plane1-copy").unwrap();
    assert_eq!(local.transform(), pose);
    assert!(h.session.contains(local.id()));
    assert!(h.channel.errors().is_empty());
}

#[tokio::test]
async fn test_token_failure_keeps_cloud_mode_off() {
    let provider = Arc::new(FailingTokenProvider::new("no service key"));
    let h = Harness::new(provider.clone(), InMemoryCloudConnector::auto_completing());
    h.add("plane1").await;

    let err = h.manager.init_cloud_mode().await.unwrap_err();
    assert_eq!(err.code(), "TokenGenerationFailed");
    assert_eq!(provider.attempts(), 1);
    assert_eq!(h.connector.connect_count(), 0);

    let events = h.channel.wait_for_events(1, WAIT).await;
    assert!(matches!(
        &events[0],
        CallerEvent::Error { operation: Operation::InitCloudMode, .. }
    ));

    let err = h.manager.upload_anchor("plane1", None).await.unwrap_err();
    assert_eq!(err.code(), "CloudSessionInitFailed");
    assert_eq!(h.connector.connect_count(), 0);
    assert!(!h.manager.is_cloud_mode());
}

#[tokio::test]
async fn test_disconnected_caller_leaves_registry_unchanged() {
    let connector = InMemoryCloudConnector::auto_completing();
    connector.seed_hosted("abc123", Transform::IDENTITY);
    let h = Harness::with_tokens(connector);
    h.channel
        .set_registration_reply(RegistrationReply::Name("copy".into()));

    h.manager.init_cloud_mode().await.unwrap();
    h.channel.set_connected(false);
    h.manager.download_anchor("abc123").await.unwrap();

    tokio::time::timeout(WAIT, async {
        while h.manager.relay().dropped_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(h.manager.registry().is_empty());
    assert_eq!(h.session.anchor_count(), 0);
    assert!(h.channel.registrations().is_empty());
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_and_request_resubmitted() {
    let h = Harness::with_tokens(InMemoryCloudConnector::auto_completing());
    h.add("plane1").await;
    h.manager.init_cloud_mode().await.unwrap();

    let service = h.connector.service().unwrap();
    service.reject_token("token-1");
    h.manager.upload_anchor("plane1", None).await.unwrap();

    let events = h.channel.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![CallerEvent::CloudAnchorUploaded {
            name: "plane1".into(),
            cloud_id: "cloud-1".into(),
        }]
    );

    let submissions = service.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].token.as_deref(), Some("token-1"));
    assert_eq!(submissions[1].token.as_deref(), Some("token-2"));
    assert_eq!(service.installed_tokens(), vec!["token-1", "token-2"]);
}

#[tokio::test]
async fn test_unknown_cloud_id_relays_download_error() {
    let h = Harness::with_tokens(InMemoryCloudConnector::auto_completing());
    h.manager.init_cloud_mode().await.unwrap();
    h.manager.download_anchor("missing").await.unwrap();

    let events = h.channel.wait_for_events(1, WAIT).await;
    match &events[0] {
        CallerEvent::Error { operation, message } => {
            assert_eq!(*operation, Operation::Download);
            assert!(message.starts_with("Error downloading anchor, state"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.manager.registry().is_empty());
}

#[tokio::test]
async fn test_method_channel_round_trip() {
    let h = Harness::with_tokens(InMemoryCloudConnector::auto_completing());
    h.channel
        .set_registration_reply(RegistrationReply::Name("plane1-copy".into()));
    let identity = json!(Transform::IDENTITY.to_column_major());

    let add = json!({"type": 0, "transform": identity, "name": "plane1"});
    let reply = h.manager.handle_method_call("addAnchor", &add).await;
    assert_eq!(reply, MethodResponse::success(true));

    let reply = h
        .manager
        .handle_method_call("initGoogleCloudAnchorMode", &json!({}))
        .await;
    assert_eq!(reply, MethodResponse::null());

    let upload = json!({"nodeName": "plane1", "ttl": 7});
    let reply = h.manager.handle_method_call("uploadAnchor", &upload).await;
    assert_eq!(reply, MethodResponse::success(true));

    let events = h.channel.wait_for_events(1, WAIT).await;
    let cloud_id = match &events[0] {
        CallerEvent::CloudAnchorUploaded { cloud_id, .. } => cloud_id.clone(),
        other => panic!("unexpected event {other:?}"),
    };

    let download = json!({"cloudanchorid": cloud_id});
    let reply = h.manager.handle_method_call("downloadAnchor", &download).await;
    assert_eq!(reply, MethodResponse::null());
    h.wait_until_registered("plane1-copy").await;
    assert_eq!(h.manager.registry().names(), vec!["plane1", "plane1-copy"]);

    h.manager.dispose().await;
    assert!(h.session.is_paused());
    assert_eq!(h.session.anchor_count(), 0);
    let reply = h.manager.handle_method_call("addAnchor", &add).await;
    assert_eq!(reply, MethodResponse::success(false));
}
