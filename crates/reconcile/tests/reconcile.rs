use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_core::config::Settings;
use tether_core::{
    ConditionStatus, EndpointDescriptor, EndpointIdentity, Error, Gvk, Readiness, ReconcileSubject, ResourceIdentity, TYPE_READY,
    TYPE_SYNCED,
};
use tether_kubehub::{MemoryResolver, MemoryStore};
use tether_reconcile::{External, Observation, Outcome, Reconciler};
use tether_registry::{trigger_hook, CacheRegistry};
use tokio::sync::mpsc;

struct Fixture {
    store: Arc<MemoryStore>,
    registry: Arc<CacheRegistry>,
    reconciler: Reconciler,
    triggers: mpsc::Receiver<tether_core::ParentLink>,
}

fn fixture() -> Fixture {
    let store = MemoryStore::new(EndpointIdentity::from_parts("https", "remote.example:6443", "/"));
    store.serve(Gvk::new("example.io", "v1", "Widget"), true);
    store.serve(Gvk::new("example.io", "v1", "Zone"), false);
    let store = Arc::new(store);
    let resolver = MemoryResolver::new();
    resolver.insert("remote", store.clone());
    let registry = Arc::new(CacheRegistry::new(Settings { sync_timeout: Duration::from_secs(2), ..Settings::default() }));
    let (tx, triggers) = mpsc::channel(16);
    registry.set_register_fn(trigger_hook(tx));
    let reconciler = Reconciler::new(Arc::new(resolver), Arc::clone(&registry));
    Fixture { store, registry, reconciler, triggers }
}

fn subject(yaml: &str) -> ReconcileSubject {
    serde_yaml::from_str(yaml).unwrap()
}

fn widget_subject(policy: &str) -> ReconcileSubject {
    subject(&format!(
        r#"
name: widget-w1
namespace: tenants
generation: 1
spec:
  endpoint: {{ source: named, name: remote }}
  manifest:
    apiVersion: example.io/v1
    kind: Widget
    metadata: {{ name: w1, namespace: ns, labels: {{ app: w }} }}
    spec: {{ replicas: 3 }}
  readiness:
    {}
"#,
        policy
    ))
}

fn subject_readiness(policy: &str) -> Readiness {
    serde_yaml::from_str(policy).unwrap()
}

fn widget_id() -> ResourceIdentity {
    ResourceIdentity::new(Gvk::new("example.io", "v1", "Widget"), Some("ns"), "w1")
}

fn ready(s: &ReconcileSubject) -> Option<ConditionStatus> {
    s.status.condition(TYPE_READY).map(|c| c.status)
}

/// Observe until the watch has caught up with the remote object.
async fn observe_existing(ext: &External, s: &mut ReconcileSubject) -> Observation {
    for _ in 0..200 {
        let obs = ext.observe(s).await.unwrap();
        if obs.exists {
            return obs;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("observed object never reached the cache");
}

#[tokio::test]
async fn absent_widget_is_created_then_ready() {
    let f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");
    let ext = f.reconciler.connector().connect(&s).await.unwrap();

    let obs = ext.observe(&mut s).await.unwrap();
    assert!(!obs.exists);
    assert_eq!(f.registry.len(), 1);

    ext.create(&mut s).await.unwrap();
    assert_eq!(ready(&s), Some(ConditionStatus::True));
    assert_eq!(f.store.object(&widget_id()).unwrap()["spec"]["replicas"], 3);

    let obs = observe_existing(&ext, &mut s).await;
    assert!(obs.up_to_date, "diff: {}", obs.diff);
    assert_eq!(ready(&s), Some(ConditionStatus::True));
    let at_provider = s.status.at_provider.as_ref().unwrap();
    assert_eq!(at_provider["spec"]["replicas"], 3);
    assert!(at_provider["metadata"].get("managedFields").is_none());
}

#[tokio::test]
async fn reconcile_creates_detects_drift_and_updates() {
    let mut f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");

    assert_eq!(f.reconciler.reconcile(&mut s).await.unwrap(), Outcome::Created);
    assert_eq!(s.status.observed_generation, 1);
    assert_eq!(s.status.condition(TYPE_SYNCED).unwrap().status, ConditionStatus::True);

    let ext = f.reconciler.connector().connect(&s).await.unwrap();
    observe_existing(&ext, &mut s).await;
    assert_eq!(f.reconciler.reconcile(&mut s).await.unwrap(), Outcome::UpToDate);

    // the created object flows back through the watch
    let link = tokio::time::timeout(Duration::from_secs(2), f.triggers.recv()).await.unwrap().unwrap();
    assert_eq!(link.name, "widget-w1");

    s.generation = 2;
    s.spec.manifest["spec"]["replicas"] = json!(5);
    let obs = ext.observe(&mut s).await.unwrap();
    assert!(!obs.up_to_date);
    assert!(obs.diff.contains("spec.replicas"), "diff: {}", obs.diff);

    assert_eq!(f.reconciler.reconcile(&mut s).await.unwrap(), Outcome::Updated);
    assert_eq!(s.status.observed_generation, 2);
    assert_eq!(f.store.object(&widget_id()).unwrap()["spec"]["replicas"], 5);
}

#[tokio::test]
async fn label_change_is_drift() {
    let f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");
    f.reconciler.reconcile(&mut s).await.unwrap();
    let ext = f.reconciler.connector().connect(&s).await.unwrap();
    observe_existing(&ext, &mut s).await;

    s.spec.manifest["metadata"]["labels"]["app"] = json!("other");
    let obs = ext.observe(&mut s).await.unwrap();
    assert!(obs.exists);
    assert!(!obs.up_to_date);
}

#[tokio::test]
async fn expression_readiness_follows_remote_status() {
    let f = fixture();
    let mut s = widget_subject("{ policy: UseExpression, expression: 'status.replicas == spec.replicas' }");
    // the freshly applied object has no status to refer to yet
    let err = f.reconciler.reconcile(&mut s).await.unwrap_err();
    assert!(matches!(err, Error::Expression(_)), "{err}");
    assert!(f.store.object(&widget_id()).is_some());
    // the applied object is recorded even though readiness failed
    assert_eq!(s.status.at_provider.as_ref().unwrap()["spec"]["replicas"], 3);

    f.store.set_status(&widget_id(), json!({ "replicas": 1 })).unwrap();
    let ext = f.reconciler.connector().connect(&s).await.unwrap();
    let mut seen_unavailable = false;
    for _ in 0..200 {
        if let Ok(obs) = ext.observe(&mut s).await {
            if obs.exists && ready(&s) == Some(ConditionStatus::False) {
                seen_unavailable = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen_unavailable, "mismatch never observed: {:?}", s.status.conditions);

    f.store.set_status(&widget_id(), json!({ "replicas": 3 })).unwrap();
    let mut ok = false;
    for _ in 0..200 {
        if let Ok(obs) = ext.observe(&mut s).await {
            if obs.exists && ready(&s) == Some(ConditionStatus::True) {
                ok = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ok, "subject never became ready: {:?}", s.status.conditions);
}

#[tokio::test]
async fn deleting_subject_removes_object_and_cache() {
    let f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");
    f.reconciler.reconcile(&mut s).await.unwrap();
    assert_eq!(f.registry.len(), 1);

    s.deleting = true;
    assert_eq!(f.reconciler.reconcile(&mut s).await.unwrap(), Outcome::Deleted);
    assert!(f.store.is_empty());
    assert!(f.registry.is_empty());

    // already gone
    assert_eq!(f.reconciler.reconcile(&mut s).await.unwrap(), Outcome::Deleted);
}

#[tokio::test]
async fn empty_namespace_is_defaulted_for_namespaced_kinds_only() {
    let f = fixture();
    let mut s = subject(
        r#"
name: defaulted
spec:
  endpoint: { source: named, name: remote }
  manifest:
    apiVersion: example.io/v1
    kind: Widget
    metadata: { name: w2 }
    spec: { replicas: 1 }
"#,
    );
    f.reconciler.reconcile(&mut s).await.unwrap();
    let id = ResourceIdentity::new(Gvk::new("example.io", "v1", "Widget"), Some("default"), "w2");
    assert!(f.store.object(&id).is_some());

    let mut zone = subject(
        r#"
name: zone
spec:
  endpoint: { source: named, name: remote }
  manifest:
    apiVersion: example.io/v1
    kind: Zone
    metadata: { name: z1, namespace: ignored }
"#,
    );
    f.reconciler.reconcile(&mut zone).await.unwrap();
    let zid = ResourceIdentity::new(Gvk::new("example.io", "v1", "Zone"), None, "z1");
    assert!(f.store.object(&zid).unwrap()["metadata"].get("namespace").is_none());
}

#[tokio::test]
async fn failures_are_recorded_on_synced() {
    let f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");
    s.spec.endpoint = EndpointDescriptor::Named { name: "elsewhere".into() };
    let err = f.reconciler.reconcile(&mut s).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");
    let synced = s.status.condition(TYPE_SYNCED).unwrap();
    assert_eq!(synced.status, ConditionStatus::False);
    assert!(synced.message.as_deref().unwrap().contains("elsewhere"));

    let mut s = widget_subject("policy: Sometimes");
    assert!(matches!(f.reconciler.reconcile(&mut s).await, Err(Error::Policy(_))));

    let mut s = widget_subject("policy: SuccessfulCreate");
    f.store.set_fail_writes(true);
    assert!(matches!(f.reconciler.reconcile(&mut s).await, Err(Error::Transport(_))));
}

#[tokio::test]
async fn registration_failure_leaves_no_cache_entry() {
    let f = fixture();
    f.store.set_fail_sub_stream(true);
    let mut s = widget_subject("policy: SuccessfulCreate");
    assert!(matches!(f.reconciler.reconcile(&mut s).await, Err(Error::Transport(_))));
    assert!(f.registry.is_empty());
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn failed_readiness_still_records_the_observed_object() {
    let f = fixture();
    let mut s = widget_subject("policy: SuccessfulCreate");
    f.reconciler.reconcile(&mut s).await.unwrap();
    let ext = f.reconciler.connector().connect(&s).await.unwrap();
    observe_existing(&ext, &mut s).await;

    f.store.set_status(&widget_id(), json!({ "replicas": 2 })).unwrap();
    s.spec.readiness = subject_readiness("{ policy: UseExpression, expression: 'status.replicas.missing == 1' }");
    s.status.at_provider = None;
    let mut seen = None;
    for _ in 0..200 {
        match ext.observe(&mut s).await {
            Err(e) if s.status.at_provider.as_ref().map(|o| o["status"]["replicas"] == 2).unwrap_or(false) => {
                seen = Some(e);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    let err = seen.expect("observe with the new status never failed");
    assert!(matches!(err, Error::Expression(_)), "{err}");

    s.spec.readiness = subject_readiness("policy: Sometimes");
    s.status.at_provider = None;
    assert!(matches!(ext.observe(&mut s).await, Err(Error::Policy(_))));
    assert!(s.status.at_provider.is_some());
}
