//! End-to-end lifecycle tests against the public API.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hush_silences::{
    sweep_once, BroadcastEmitter, BulkCoordinator, Clock, FileStore, LabelSet, ManagerConfig,
    ManualClock, Matcher, MemoryStore, PageRequest, RequestContext, SilenceError,
    SilenceEventKind, SilenceFilter, SilenceManager, SilencePatch, SilenceSpec, SilenceStatus,
    SilenceStore,
};

// ==================== Helper Functions ====================

struct Fixture {
    manager: Arc<SilenceManager>,
    clock: Arc<ManualClock>,
    emitter: BroadcastEmitter,
}

async fn fixture_with_store(store: Arc<dyn SilenceStore>) -> Fixture {
    let clock = Arc::new(ManualClock::default());
    let emitter = BroadcastEmitter::new(512);
    let manager = SilenceManager::new(store, ManagerConfig::default())
        .with_clock(clock.clone())
        .with_event_sink(Arc::new(emitter.clone()));
    manager
        .hydrate(&RequestContext::default())
        .await
        .expect("hydrate in test setup");
    Fixture {
        manager: Arc::new(manager),
        clock,
        emitter,
    }
}

async fn fixture() -> Fixture {
    fixture_with_store(Arc::new(MemoryStore::new())).await
}

fn cpu_spec(now: DateTime<Utc>, creator: &str) -> SilenceSpec {
    SilenceSpec::new(
        vec![
            Matcher::equal("alertname", "HighCPU"),
            Matcher::equal("severity", "critical"),
        ],
        now - Duration::hours(1),
        now + Duration::hours(1),
        creator,
        "planned maintenance",
    )
}

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect::<HashMap<_, _>>()
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_active_silence_suppresses_matching_alert() {
    let f = fixture().await;
    let ctx = RequestContext::default();

    let silence = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();
    assert_eq!(silence.status, SilenceStatus::Active);

    let result = f.manager.is_alert_silenced(&labels(&[
        ("alertname", "HighCPU"),
        ("severity", "critical"),
        ("instance", "x"),
    ]));
    assert!(result.silenced);
    assert_eq!(result.silence_ids, vec![silence.id]);
}

#[tokio::test]
async fn test_regex_alternation_silence() {
    let f = fixture().await;
    let now = f.clock.now();
    let mut spec = cpu_spec(now, "ops@x.com");
    spec.matchers = vec![Matcher::regex("severity", "critical|warning")];
    f.manager
        .create_silence(&RequestContext::default(), spec)
        .await
        .unwrap();

    assert!(f.manager.is_alert_silenced(&labels(&[("severity", "warning")])).silenced);
    assert!(!f.manager.is_alert_silenced(&labels(&[("severity", "info")])).silenced);
}

#[tokio::test]
async fn test_created_by_is_immutable() {
    let f = fixture().await;
    let ctx = RequestContext::default();
    let silence = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();

    let err = f
        .manager
        .update_silence(
            &ctx,
            &silence.id,
            &SilencePatch::new().created_by("intruder@x.com"),
            silence.version,
        )
        .await
        .unwrap_err();
    match err {
        SilenceError::Validation { reason } => assert!(reason.contains("immutable field")),
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(f.manager.get_silence(&silence.id).unwrap().created_by, "ops@x.com");
}

#[tokio::test]
async fn test_filtered_listing_pages() {
    let f = fixture().await;
    let ctx = RequestContext::default();

    for _ in 0..25 {
        f.manager
            .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
            .await
            .unwrap();
        f.clock.advance(Duration::seconds(1));
    }
    for _ in 0..5 {
        f.manager
            .create_silence(&ctx, cpu_spec(f.clock.now(), "dev@x.com"))
            .await
            .unwrap();
    }
    let mut pending = cpu_spec(f.clock.now(), "ops@x.com");
    pending.starts_at = f.clock.now() + Duration::hours(3);
    pending.ends_at = f.clock.now() + Duration::hours(4);
    f.manager.create_silence(&ctx, pending).await.unwrap();

    let filter = SilenceFilter::new()
        .status("active".parse().unwrap())
        .created_by("ops@x.com");
    let page = f
        .manager
        .list_silences(&filter, PageRequest::new(0, 10))
        .unwrap();

    assert_eq!(page.items.len(), 10);
    assert_eq!(page.total, 25);
    assert!(!page.stale);
    assert!(page
        .items
        .windows(2)
        .all(|w| w[0].created_at >= w[1].created_at));
    assert!(page.items.iter().all(|s| s.status == SilenceStatus::Active));
}

// ==================== Properties ====================

#[tokio::test]
async fn test_create_get_round_trip() {
    let f = fixture().await;
    let spec = cpu_spec(f.clock.now(), "ops@x.com");
    let created = f
        .manager
        .create_silence(&RequestContext::default(), spec.clone())
        .await
        .unwrap();

    let fetched = f.manager.get_silence(&created.id).unwrap();
    assert_eq!(fetched.matchers, spec.matchers);
    assert_eq!(fetched.starts_at, spec.starts_at);
    assert_eq!(fetched.ends_at, spec.ends_at);
    assert_eq!(fetched.created_by, spec.created_by);
    assert_eq!(fetched.comment, spec.comment);
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn test_second_delete_is_not_found() {
    let f = fixture().await;
    let ctx = RequestContext::default();
    let a = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();
    let b = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();

    f.manager.delete_silence(&ctx, &a.id).await.unwrap();
    let err = f.manager.delete_silence(&ctx, &a.id).await.unwrap_err();
    assert!(matches!(err, SilenceError::NotFound { .. }));

    let survivor = f.manager.get_silence(&b.id).unwrap();
    assert_eq!(survivor, b);
}

#[tokio::test]
async fn test_bulk_delete_partial_failure() {
    let f = fixture().await;
    let ctx = RequestContext::default();
    let mut valid = Vec::new();
    for _ in 0..12 {
        valid.push(
            f.manager
                .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
                .await
                .unwrap()
                .id,
        );
    }
    let invalid: Vec<String> = (0..4).map(|i| format!("ghost-{i}")).collect();
    let ids: Vec<String> = valid.iter().chain(invalid.iter()).cloned().collect();

    let bulk = BulkCoordinator::new(Arc::clone(&f.manager));
    let result = bulk.bulk_delete(&ctx, &ids).await.unwrap();

    assert_eq!(result.deleted, valid.len());
    assert_eq!(result.errors.len(), invalid.len());
    let failed: Vec<_> = result.errors.iter().map(|e| e.id.clone()).collect();
    assert_eq!(failed, invalid);
    for id in &valid {
        assert!(matches!(f.manager.get_silence(id), Err(SilenceError::NotFound { .. })));
    }
}

#[tokio::test]
async fn test_expiry_event_emitted_once() {
    let f = fixture().await;
    let ctx = RequestContext::default();
    let mut events = f.emitter.subscribe();

    let silence = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();
    f.clock.advance(Duration::hours(2));

    for _ in 0..10 {
        sweep_once(&f.manager, &ctx).await.unwrap();
    }

    let mut kinds = Vec::new();
    while let Some(event) = events.try_recv() {
        assert_eq!(event.silence_id, silence.id);
        kinds.push(event.kind);
    }
    assert_eq!(kinds, vec![SilenceEventKind::Created, SilenceEventKind::Expired]);
    assert_eq!(
        f.manager.get_silence(&silence.id).unwrap().status,
        SilenceStatus::Expired
    );
}

#[tokio::test]
async fn test_every_write_emits_one_event() {
    let f = fixture().await;
    let ctx = RequestContext::default();
    let mut events = f.emitter.subscribe();

    let silence = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();
    let updated = f
        .manager
        .update_silence(&ctx, &silence.id, &SilencePatch::new().comment("new comment"), 1)
        .await
        .unwrap();
    f.manager.delete_silence(&ctx, &silence.id).await.unwrap();

    let created = events.recv().await.unwrap();
    assert_eq!(created.kind, SilenceEventKind::Created);
    assert_eq!(created.version, 1);
    let changed = events.recv().await.unwrap();
    assert_eq!(changed.kind, SilenceEventKind::Updated);
    assert_eq!(changed.version, updated.version);
    assert_eq!(events.recv().await.unwrap().kind, SilenceEventKind::Deleted);
    assert!(events.try_recv().is_none());
}

// ==================== Durability ====================

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = RequestContext::default();

    let id = {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let f = fixture_with_store(store).await;
        let silence = f
            .manager
            .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
            .await
            .unwrap();
        f.manager
            .update_silence(&ctx, &silence.id, &SilencePatch::new().comment("kept on disk"), 1)
            .await
            .unwrap();
        silence.id
    };

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let f = fixture_with_store(store).await;
    let restored = f.manager.get_silence(&id).unwrap();
    assert_eq!(restored.comment, "kept on disk");
    assert_eq!(restored.version, 2);
    assert!(f.manager.is_alert_silenced(&labels(&[
        ("alertname", "HighCPU"),
        ("severity", "critical"),
    ])).silenced);
}

#[tokio::test]
async fn test_unavailable_store_keeps_reads_alive() {
    let store = Arc::new(MemoryStore::new());
    let f = fixture_with_store(store.clone()).await;
    let ctx = RequestContext::default();
    let silence = f
        .manager
        .create_silence(&ctx, cpu_spec(f.clock.now(), "ops@x.com"))
        .await
        .unwrap();

    store.set_available(false);
    let err = f
        .manager
        .update_silence(&ctx, &silence.id, &SilencePatch::new().comment("will not land"), 1)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let fetched = f.manager.get_silence(&silence.id).unwrap();
    assert_eq!(fetched.comment, "planned maintenance");
    assert_eq!(fetched.version, 1);
    assert!(f.manager.is_alert_silenced(&labels(&[
        ("alertname", "HighCPU"),
        ("severity", "critical"),
    ])).silenced);
    let page = f
        .manager
        .list_silences(&SilenceFilter::new(), PageRequest::default())
        .unwrap();
    assert!(page.stale);
}
