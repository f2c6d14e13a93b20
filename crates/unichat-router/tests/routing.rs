mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use unichat_core::{
    AttachmentUpload, BackendName, ChannelKind, ConfigError, ConnectionState, ErrorCode,
    FederationConfig, Message, Severity,
};
use unichat_router::{Router, RouterEvent};

use common::{full_matrix, FakeBackend};

struct Federation {
    router: Router,
    a: FakeBackend,
    b: FakeBackend,
    c: FakeBackend,
}

/// `{global: a, team: b, direct: c}`, connected.
async fn federation() -> Federation {
    let (a, adapter_a) = FakeBackend::new("a");
    let (b, adapter_b) = FakeBackend::new("b");
    let (c, adapter_c) = FakeBackend::new("c");
    let router = Router::builder()
        .route(ChannelKind::Global, adapter_a)
        .route(ChannelKind::Team, adapter_b)
        .route(ChannelKind::Direct, adapter_c)
        .build()
        .unwrap();
    router.connect().await.unwrap();
    Federation { router, a, b, c }
}

#[tokio::test]
async fn each_kind_is_served_by_its_own_adapter() {
    let f = federation().await;
    assert_eq!(f.router.backend_for(ChannelKind::Global), Some("a"));
    assert_eq!(f.router.backend_for(ChannelKind::Team), Some("b"));
    assert_eq!(f.router.backend_for(ChannelKind::Direct), Some("c"));
    assert_eq!(f.router.backend_for(ChannelKind::Thread), None);

    let global = f
        .router
        .create_channel("lobby", ChannelKind::Global, &[])
        .await
        .unwrap();
    let team = f
        .router
        .create_channel("ops", ChannelKind::Team, &["u1".to_string()])
        .await
        .unwrap();
    assert_eq!(global.backend, "a");
    assert_eq!(team.backend, "b");
    assert_eq!(f.router.channel_kind(&team.id), Some(ChannelKind::Team));

    f.router.send_message(&team.id, "hello team", vec![]).await.unwrap();
    assert_eq!(f.b.count("send"), 1);
    assert_eq!(f.a.count("send"), 0);
    assert_eq!(f.c.count("send"), 0);

    f.router.send_message(&global.id, "hello all", vec![]).await.unwrap();
    assert_eq!(f.a.count("send"), 1);
    assert_eq!(f.b.count("send"), 1);
}

#[tokio::test]
async fn prefix_hint_routes_channels_the_router_never_saw() {
    let f = federation().await;
    f.router.send_message("direct-xyz", "psst", vec![]).await.unwrap();
    assert_eq!(f.c.count("send"), 1);

    let err = f
        .router
        .send_message("lobby", "where am i", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidChannel);
    assert_eq!(err.backend(), "router");
    for backend in [&f.a, &f.b, &f.c] {
        assert_eq!(backend.count("send"), 0);
    }

    let err = f
        .router
        .send_message("thread-1", "unrouted kind", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidChannel);
}

#[tokio::test]
async fn missing_capability_is_low_and_never_reaches_the_backend() {
    let (a, adapter_a) = FakeBackend::new("a");
    let mut matrix = full_matrix("b");
    matrix.messaging.delete = false;
    let (b, adapter_b) = FakeBackend::with_matrix("b", matrix);
    let router = Router::builder()
        .route(ChannelKind::Global, adapter_a)
        .route(ChannelKind::Team, adapter_b)
        .build()
        .unwrap();
    router.connect().await.unwrap();

    let err = router.delete_message("team-1", "m1").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::FeatureNotSupported);
    assert_eq!(err.severity, Severity::Low);
    assert!(!err.recoverable);
    assert_eq!(b.count("delete"), 0);

    router.delete_message("global-1", "m1").await.unwrap();
    assert_eq!(a.count("delete"), 1);
}

#[tokio::test]
async fn leaving_forgets_the_recorded_kind() {
    let f = federation().await;
    let channel = f
        .router
        .create_channel("ops", ChannelKind::Team, &[])
        .await
        .unwrap();
    f.router.join_channel(&channel.id).await.unwrap();
    f.router.leave_channel(&channel.id).await.unwrap();
    assert_eq!(f.b.count("leave"), 1);

    let err = f
        .router
        .get_messages(&channel.id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidChannel);
}

#[tokio::test]
async fn listing_channels_teaches_the_router_their_kinds() {
    let (a, adapter_a) = FakeBackend::new("a");
    let (b, adapter_b) = FakeBackend::new("b");
    let first = Router::builder()
        .route(ChannelKind::Global, Arc::clone(&adapter_a))
        .route(ChannelKind::Team, Arc::clone(&adapter_b))
        .build()
        .unwrap();
    first.connect().await.unwrap();
    let created = first
        .create_channel("ops", ChannelKind::Team, &[])
        .await
        .unwrap();

    let second = Router::builder()
        .route(ChannelKind::Global, adapter_a)
        .route(ChannelKind::Team, adapter_b)
        .build()
        .unwrap();
    second.connect().await.unwrap();
    assert_eq!(second.channel_kind(&created.id), None);

    let listed = second.get_channels().await.unwrap();
    assert_eq!(listed.items.len(), 1);
    assert!(!listed.is_partial());
    assert_eq!(second.channel_kind(&created.id), Some(ChannelKind::Team));
    assert_eq!((a.count("list"), b.count("list")), (1, 1));

    second.send_message(&created.id, "found it", vec![]).await.unwrap();
    assert_eq!(b.count("send"), 1);
}

#[tokio::test]
async fn no_delivery_after_unsubscribe() {
    let f = federation().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = f
        .router
        .subscribe_to_messages(
            "team-general",
            Arc::new(move |m: Message| sink.lock().unwrap().push(m.content)),
        )
        .await
        .unwrap();

    assert_eq!(f.b.emit("team-general", "first"), 1);
    sub.unsubscribe();
    sub.unsubscribe();
    assert_eq!(f.b.emit("team-general", "second"), 0);
    assert_eq!(*seen.lock().unwrap(), vec!["first".to_string()]);
}

#[tokio::test]
async fn search_skips_adapters_without_search() {
    let (a, adapter_a) = FakeBackend::new("a");
    let mut matrix = full_matrix("b");
    matrix.messaging.search = false;
    let (b, adapter_b) = FakeBackend::with_matrix("b", matrix);
    let router = Router::builder()
        .route(ChannelKind::Global, adapter_a)
        .route(ChannelKind::Team, adapter_b)
        .build()
        .unwrap();
    router.connect().await.unwrap();
    router
        .send_message("global-1", "needle in global", vec![])
        .await
        .unwrap();

    let found = router.search_messages("needle", None).await.unwrap();
    assert_eq!(found.items.len(), 1);
    assert!(found.failures.is_empty());
    assert_eq!(a.count("search"), 1);
    assert_eq!(b.count("search"), 0);
}

#[tokio::test]
async fn search_without_any_capable_adapter_is_unsupported() {
    let mut matrix = full_matrix("a");
    matrix.messaging.search = false;
    let (_, adapter) = FakeBackend::with_matrix("a", matrix);
    let router = Router::builder()
        .route(ChannelKind::Global, adapter)
        .build()
        .unwrap();
    router.connect().await.unwrap();

    let err = router.search_messages("x", None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::FeatureNotSupported);
    assert_eq!(err.severity, Severity::Low);
}

#[tokio::test]
async fn upload_goes_to_the_first_adapter_that_accepts_it() {
    let mut small = full_matrix("a");
    small.attachments.max_size = 4;
    let (a, adapter_a) = FakeBackend::with_matrix("a", small);
    let (b, adapter_b) = FakeBackend::new("b");
    // direct sorts before team
    let router = Router::builder()
        .route(ChannelKind::Direct, adapter_a)
        .route(ChannelKind::Team, adapter_b)
        .build()
        .unwrap();
    router.connect().await.unwrap();

    let tiny = AttachmentUpload::new("a.txt", "text/plain", vec![1, 2]);
    let uploaded = router.upload_attachment(&tiny).await.unwrap();
    assert!(uploaded.id.starts_with("a."));

    let larger = AttachmentUpload::new("b.txt", "text/plain", vec![0; 64]);
    let uploaded = router.upload_attachment(&larger).await.unwrap();
    assert!(uploaded.id.starts_with("b."));
    assert_eq!((a.count("upload"), b.count("upload")), (1, 1));

    let huge = AttachmentUpload::new("c.bin", "application/octet-stream", vec![0; 4096]);
    let err = router.upload_attachment(&huge).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidMessage);
}

#[tokio::test]
async fn operations_require_a_connected_router() {
    let (a, adapter) = FakeBackend::new("a");
    let router = Router::builder()
        .route(ChannelKind::Global, adapter)
        .build()
        .unwrap();
    let err = router
        .send_message("global-1", "too early", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConnectionFailed);
    assert!(!err.recoverable);
    assert!(a.calls().is_empty());
}

#[tokio::test]
async fn state_changes_are_broadcast() {
    let (_, adapter) = FakeBackend::new("a");
    let router = Router::builder()
        .route(ChannelKind::Global, adapter)
        .build()
        .unwrap();
    let mut events = router.events();

    router.connect().await.unwrap();
    router.disconnect().await.unwrap();

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RouterEvent::StateChanged { to, .. } = event {
            states.push(to);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn kinds_sharing_an_adapter_connect_it_once() {
    let (b, adapter) = FakeBackend::new("b");
    let router = Router::builder()
        .route(ChannelKind::Team, Arc::clone(&adapter))
        .route(ChannelKind::Thread, adapter)
        .build()
        .unwrap();
    router.connect().await.unwrap();
    assert_eq!(b.count("connect"), 1);
    assert_eq!(router.routed_kinds(), vec![ChannelKind::Team, ChannelKind::Thread]);
}

#[test]
fn builder_rejects_empty_and_dangling_routes() {
    assert!(matches!(
        Router::builder().build(),
        Err(ConfigError::Invalid(_))
    ));

    let (_, adapter) = FakeBackend::new("a");
    let result = Router::builder()
        .route(ChannelKind::Global, adapter)
        .optional(ChannelKind::Thread)
        .build();
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn from_config_needs_an_adapter_per_routed_backend() {
    let config = FederationConfig::default();
    let (_, relay) = FakeBackend::new("relay");
    let (_, graph) = FakeBackend::new("graph");
    let mut adapters = HashMap::from([(BackendName::Relay, relay), (BackendName::Graph, graph)]);

    assert!(matches!(
        Router::from_config(&config, &adapters),
        Err(ConfigError::Invalid(_))
    ));

    let (_, secure) = FakeBackend::new("secure");
    adapters.insert(BackendName::Secure, secure);
    let router = Router::from_config(&config, &adapters).unwrap();
    assert_eq!(router.backend_for(ChannelKind::Direct), Some("secure"));
    assert_eq!(router.backend_for(ChannelKind::Thread), Some("graph"));
    assert_eq!(router.retry_policy().max_attempts(), config.retry.max_attempts);
}
