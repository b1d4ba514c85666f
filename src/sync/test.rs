use super::*;

use k8s_openapi::ByteString;
use std::collections::BTreeMap as Map;
use tokio::time::timeout;

pub(crate) fn secret(key: &ObjectKey, data: &[(&str, &[u8])]) -> Secret {
    Secret {
        metadata: key.metadata(),
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                .collect::<Map<_, _>>(),
        ),
        ..Default::default()
    }
}

/// Waits for `check` to hold, failing the test after a few seconds.
pub(crate) async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub(crate) fn synchronizer(store: &memory::MemoryStore, key: &ObjectKey) -> Arc<Synchronizer> {
    Builder {
        store: SecretStore::Memory(store.clone()),
        key: key.clone(),
        mode: SyncMode::Watch,
        poll_period: Duration::from_millis(10),
    }
    .build()
}

fn key() -> ObjectKey {
    ObjectKey::new("kubernetes-dashboard", "test-holder")
}

async fn cached(sync: &Synchronizer) -> Option<Secret> {
    sync.secret.lock().await.clone()
}

#[test]
fn test_name() {
    let sync = Builder {
        store: SecretStore::Memory(Default::default()),
        key: key(),
        mode: SyncMode::Poll,
        poll_period: SECRET_SYNC_PERIOD,
    }
    .build();
    assert_eq!("test-holder-kubernetes-dashboard", sync.name());
}

#[tokio::test]
async fn test_get_fetches_lazily() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    assert_eq!(None, sync.get().await);

    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();
    let got = sync.get().await.expect("secret should be fetched");
    assert_eq!(Some(b"1".to_vec()), got.data.unwrap().get("a").map(|v| v.0.clone()));
}

#[tokio::test]
async fn test_mutations_do_not_touch_cache() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    sync.create(&secret(&key(), &[("a", b"1")])).await.unwrap();
    assert_eq!(None, cached(&sync).await);
    assert!(store.get(&key()).await.is_some());

    assert!(
        sync.create(&secret(&key(), &[("a", b"2")]))
            .await
            .unwrap_err()
            .is_already_exists()
    );

    sync.delete().await.unwrap();
    assert!(store.get(&key()).await.is_none());
    assert!(sync.update(&secret(&key(), &[])).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_refresh() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();
    sync.get().await;

    store.update(secret(&key(), &[("a", b"2")])).await.unwrap();
    sync.refresh().await;

    let data = cached(&sync).await.unwrap().data.unwrap();
    assert_eq!(b"2".to_vec(), data["a"].0);
}

#[tokio::test]
async fn test_handlers_run_in_order_before_cache_update() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    let seen = Arc::new(Mutex::new(Vec::new()));

    for id in ["first", "second"] {
        let seen = seen.clone();
        let sync_ref = sync.clone();
        sync.register_action_handler(&[EventKind::Added], move |event| {
            let seen = seen.clone();
            let sync = sync_ref.clone();
            async move {
                let was_cached = cached(&sync).await.is_some();
                seen.lock().await.push((id, event.kind(), was_cached));
                Ok(())
            }
        })
        .await;
    }

    sync.start().await;
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();

    eventually("secret cached", || async { cached(&sync).await.is_some() }).await;

    assert_eq!(
        vec![
            ("first", EventKind::Added, false),
            ("second", EventKind::Added, false),
        ],
        *seen.lock().await
    );
}

#[tokio::test]
async fn test_deleted_clears_cache() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();

    sync.start().await;
    eventually("secret cached", || async { cached(&sync).await.is_some() }).await;

    store.delete(&key()).await.unwrap();
    eventually("cache cleared", || async { cached(&sync).await.is_none() }).await;

    // get() goes back to the store
    store.create(secret(&key(), &[("a", b"2")])).await.unwrap();
    assert!(sync.get().await.is_some());
}

#[tokio::test]
async fn test_watch_end_is_reported() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    sync.start().await;
    let errors = sync.error().await.expect("session should be running");
    assert!(sync.error().await.is_none(), "receiver is handed out once");

    store.end_watches().await;

    let err = timeout(Duration::from_secs(5), errors).await.unwrap().unwrap();
    assert_eq!(Error::WatchEnded(sync.name()), err);
    assert_eq!("test-holder-kubernetes-dashboard watch ended with timeout", err.to_string());
}

#[tokio::test]
async fn test_handler_error_ends_session() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    sync.register_action_handler(&[EventKind::Added], |_| async {
        Err(Error::internal("boom"))
    })
    .await;

    sync.start().await;
    let errors = sync.error().await.unwrap();

    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();

    let err = timeout(Duration::from_secs(5), errors).await.unwrap().unwrap();
    assert_eq!(Error::internal("boom"), err);
    // the failing event is not applied
    assert_eq!(None, cached(&sync).await);
}

#[tokio::test]
async fn test_falls_back_to_polling() {
    let store = memory::MemoryStore::default();
    store.set_watch_available(false).await;
    let sync = synchronizer(&store, &key());

    sync.start().await;
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();

    eventually("secret polled", || async { cached(&sync).await.is_some() }).await;
    assert!(sync.watch_failed.load(Ordering::Relaxed));

    store.update(secret(&key(), &[("a", b"2")])).await.unwrap();
    eventually("change polled", || async {
        cached(&sync)
            .await
            .and_then(|s| s.data)
            .is_some_and(|d| d["a"].0 == b"2")
    })
    .await;
}

async fn next_event(events: &mut EventStream) -> Event {
    (timeout(Duration::from_secs(5), events.next()).await)
        .expect("no event in time")
        .expect("stream ended")
}

#[tokio::test]
async fn test_poll_events() {
    let store = memory::MemoryStore::default();
    let mut events = poll::poll(
        SecretStore::Memory(store.clone()),
        key(),
        Duration::from_millis(10),
    );
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();
    assert_eq!(EventKind::Added, next_event(&mut events).await.kind());

    // metadata-only changes are not reported
    let mut relabeled = secret(&key(), &[("a", b"1")]);
    relabeled.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
    store.update(relabeled).await.unwrap();
    store.update(secret(&key(), &[("a", b"2")])).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(EventKind::Modified, event.kind());
    assert_eq!(b"2".to_vec(), event.into_object().unwrap().data.unwrap()["a"].0);

    store.delete(&key()).await.unwrap();
    assert_eq!(EventKind::Deleted, next_event(&mut events).await.kind());

    store.create(secret(&key(), &[("a", b"3")])).await.unwrap();
    assert_eq!(EventKind::Added, next_event(&mut events).await.kind());
}

#[tokio::test]
async fn test_poll_survives_fetch_errors() {
    let store = memory::MemoryStore::default();
    store.set_reads_failing(true).await;

    let mut events = poll::poll(
        SecretStore::Memory(store.clone()),
        key(),
        Duration::from_millis(10),
    );

    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();
    // several ticks fail without ending the stream
    assert!(timeout(Duration::from_millis(50), events.next()).await.is_err());

    store.set_reads_failing(false).await;
    assert_eq!(EventKind::Added, next_event(&mut events).await.kind());

    store.set_reads_failing(true).await;
    store.update(secret(&key(), &[("a", b"2")])).await.unwrap();
    assert!(timeout(Duration::from_millis(50), events.next()).await.is_err());

    store.set_reads_failing(false).await;
    let event = next_event(&mut events).await;
    assert_eq!(EventKind::Modified, event.kind());
    assert_eq!(b"2".to_vec(), event.into_object().unwrap().data.unwrap()["a"].0);
}

#[tokio::test]
async fn test_transient_watch_error_keeps_watching() {
    let store = memory::MemoryStore::default();
    // polling would not see anything within the test
    let sync = Builder {
        store: SecretStore::Memory(store.clone()),
        key: key(),
        mode: SyncMode::Watch,
        poll_period: SECRET_SYNC_PERIOD,
    }
    .build();

    let reset = Error::internal("watch failed: connection reset");
    assert_eq!(Err(reset.clone()), sync.handle_event(Event::Error(reset)).await);
    assert!(!sync.watch_failed.load(Ordering::Relaxed));

    sync.start().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();

    eventually("secret watched", || async { cached(&sync).await.is_some() }).await;
}

#[tokio::test]
async fn test_refused_watch_falls_back_to_polling() {
    let store = memory::MemoryStore::default();
    let sync = synchronizer(&store, &key());

    let refused = Error::Forbidden("watch refused: secrets is forbidden".into());
    assert_eq!(Err(refused.clone()), sync.handle_event(Event::Error(refused)).await);
    assert!(sync.watch_failed.load(Ordering::Relaxed));

    sync.start().await;
    store.create(secret(&key(), &[("a", b"1")])).await.unwrap();
    eventually("secret polled", || async { cached(&sync).await.is_some() }).await;
}
