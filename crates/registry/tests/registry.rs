use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_core::config::Settings;
use tether_core::{CacheKey, EndpointIdentity, Error, Gvk, ParentLink, ResourceIdentity, SchemaErrorKind};
use tether_kubehub::{MemoryStore, RemoteStore};
use tether_registry::{trigger_hook, CacheRegistry};
use tokio::sync::mpsc;

fn widget_gvk() -> Gvk {
    Gvk::new("example.io", "v1", "Widget")
}

fn store() -> Arc<MemoryStore> {
    let s = MemoryStore::new(EndpointIdentity::from_parts("https", "remote:6443", "/"));
    s.serve(widget_gvk(), true);
    Arc::new(s)
}

fn key_for(store: &MemoryStore, ns: Option<&str>) -> CacheKey {
    CacheKey::new(store.endpoint().clone(), ResourceIdentity::new(widget_gvk(), ns, "w1"))
}

fn parent() -> ParentLink {
    ParentLink { name: "widget-w1".into(), namespace: Some("tenants".into()) }
}

fn registry(sync_timeout: Duration) -> CacheRegistry {
    CacheRegistry::new(Settings { sync_timeout, ..Settings::default() })
}

fn counting_hook(reg: &CacheRegistry) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    reg.set_register_fn(move |_sub, _parent| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    calls
}

async fn wait_for_no_watches(s: &MemoryStore) {
    for _ in 0..200 {
        if s.active_watches() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} watch drivers still running", s.active_watches());
}

#[tokio::test]
async fn register_is_idempotent() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    let calls = counting_hook(&reg);
    let key = key_for(&s, Some("ns"));

    reg.register(&key, s.clone(), parent()).await.unwrap();
    reg.register(&key, s.clone(), parent()).await.unwrap();

    assert_eq!(reg.len(), 1);
    assert_eq!(s.watch_starts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(reg.started_count(&key), Some(1));
    assert_eq!(reg.parent_of(&key), Some(parent()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registers_keep_one_entry() {
    let s = store();
    let reg = Arc::new(registry(Duration::from_secs(2)));
    counting_hook(&reg);
    let key = key_for(&s, Some("ns"));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (reg, s, key) = (Arc::clone(&reg), s.clone(), key.clone());
        tasks.push(tokio::spawn(async move { reg.register(&key, s, parent()).await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.started_count(&key), Some(1));
    // losers dropped their drivers without running them
    assert_eq!(s.active_watches(), 1);
}

#[tokio::test]
async fn sync_timeout_rolls_back() {
    let s = store();
    s.set_never_sync(true);
    let reg = registry(Duration::from_millis(50));
    counting_hook(&reg);
    let key = key_for(&s, Some("ns"));

    let err = reg.register(&key, s.clone(), parent()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");
    assert!(!reg.contains(&key));
    assert!(reg.is_empty());
    wait_for_no_watches(&s).await;
}

#[tokio::test]
async fn sub_stream_failure_rolls_back() {
    let s = store();
    s.set_fail_sub_stream(true);
    let reg = registry(Duration::from_secs(2));
    let calls = counting_hook(&reg);
    let key = key_for(&s, Some("ns"));

    let err = reg.register(&key, s.clone(), parent()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(reg.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    wait_for_no_watches(&s).await;
}

#[tokio::test]
async fn missing_or_failing_hook_rolls_back() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    let key = key_for(&s, Some("ns"));

    let err = reg.register(&key, s.clone(), parent()).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(ref m) if m.contains("hook")), "{err}");
    assert!(reg.is_empty());

    reg.set_register_fn(|_sub, _parent| Err(Error::Transport("queue unavailable".into())));
    let err = reg.register(&key, s.clone(), parent()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(reg.is_empty());
}

#[tokio::test]
async fn unserved_kind_is_a_schema_error_without_entry() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    counting_hook(&reg);
    let key = CacheKey::new(
        s.endpoint().clone(),
        ResourceIdentity::new(Gvk::new("example.io", "v1", "Gadget"), Some("ns"), "g1"),
    );
    let err = reg.register(&key, s.clone(), parent()).await.unwrap_err();
    assert!(matches!(err, Error::Schema { kind: SchemaErrorKind::KindNotServed, .. }), "{err}");
    assert!(reg.is_empty());
    assert_eq!(s.watch_starts(), 0);
}

#[tokio::test]
async fn unregister_removes_and_tolerates_absent_keys() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    counting_hook(&reg);
    let key = key_for(&s, Some("ns"));

    reg.register(&key, s.clone(), parent()).await.unwrap();
    reg.unregister(&key).unwrap();
    assert!(!reg.contains(&key));
    reg.unregister(&key).unwrap();
    assert!(reg.is_empty());

    // registering again builds a fresh session
    reg.register(&key, s.clone(), parent()).await.unwrap();
    assert_eq!(s.watch_starts(), 2);
}

#[tokio::test]
async fn cached_object_defaults_namespace_and_follows_the_remote() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    counting_hook(&reg);
    let key = key_for(&s, None);

    reg.register(&key, s.clone(), parent()).await.unwrap();
    assert!(reg.cached_object(&key).unwrap_err().is_not_found());

    let manifest = json!({
        "apiVersion": "example.io/v1", "kind": "Widget",
        "metadata": { "name": "w1", "namespace": "default" },
        "spec": { "replicas": 2 }
    });
    s.apply(&manifest, false).await.unwrap();

    let mut seen = None;
    for _ in 0..100 {
        if let Ok(obj) = reg.cached_object(&key) {
            seen = Some(obj);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let obj = seen.expect("object reached the cache");
    assert_eq!(obj["spec"]["replicas"], 2);
    assert!(obj["metadata"].get("managedFields").is_none());
}

#[tokio::test]
async fn trigger_hook_forwards_changes_as_parent_links() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    let (tx, mut rx) = mpsc::channel(8);
    reg.set_register_fn(trigger_hook(tx));
    let key = key_for(&s, Some("ns"));
    reg.register(&key, s.clone(), parent()).await.unwrap();

    let manifest = json!({
        "apiVersion": "example.io/v1", "kind": "Widget",
        "metadata": { "name": "w1", "namespace": "ns" },
        "spec": { "replicas": 1 }
    });
    s.apply(&manifest, false).await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(got, Some(parent()));
}

#[tokio::test]
async fn unregister_stops_the_watch_and_closes_the_sub_stream() {
    let s = store();
    let reg = registry(Duration::from_secs(2));
    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);
    reg.set_register_fn(move |mut sub, _parent| {
        let closed_tx = closed_tx.clone();
        tokio::spawn(async move {
            while sub.next().await.is_some() {}
            let _ = closed_tx.send(()).await;
        });
        Ok(())
    });
    let key = key_for(&s, Some("ns"));
    reg.register(&key, s.clone(), parent()).await.unwrap();
    assert_eq!(s.active_watches(), 1);

    reg.unregister(&key).unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), closed_rx.recv()).await.unwrap();
    assert_eq!(closed, Some(()));
    wait_for_no_watches(&s).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_stops_every_watch() {
    let s = store();
    let reg = Arc::new(registry(Duration::from_secs(2)));
    counting_hook(&reg);
    let keys = [key_for(&s, Some("a")), key_for(&s, Some("b"))];
    let tasks: Vec<_> = keys
        .iter()
        .cloned()
        .map(|key| {
            let (reg, s) = (Arc::clone(&reg), s.clone());
            tokio::spawn(async move { reg.register(&key, s, parent()).await })
        })
        .collect();
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(reg.len(), 2);
    assert_eq!(s.active_watches(), 2);

    reg.clear();
    assert!(reg.is_empty());
    wait_for_no_watches(&s).await;
}
