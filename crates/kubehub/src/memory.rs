//! In-RAM store. Objects live in a map; watches are fed from a change broadcast.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tether_core::config::DEFAULT_FIELD_OWNER;
use tether_core::{
    Delta, DeltaKind, EndpointDescriptor, EndpointIdentity, Error, Gvk, ResourceIdentity, Result, SchemaErrorKind,
};
use tether_store::{spawn_ingest, CacheEvent};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{EndpointResolver, RemoteStore, SubStream, WatchSession};

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceIdentity, Value>,
    next_rv: u64,
}

/// Store double with knobs for the failure paths a real endpoint can hit.
pub struct MemoryStore {
    endpoint: EndpointIdentity,
    field_owner: String,
    served: Mutex<FxHashMap<Gvk, bool>>,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<(ResourceIdentity, DeltaKind, Value)>,
    never_sync: AtomicBool,
    fail_sub_stream: AtomicBool,
    fail_writes: AtomicBool,
    watch_starts: AtomicUsize,
    active_watches: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new(endpoint: EndpointIdentity) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            endpoint,
            field_owner: DEFAULT_FIELD_OWNER.to_string(),
            served: Mutex::new(FxHashMap::default()),
            state: Arc::new(Mutex::new(State::default())),
            events,
            never_sync: AtomicBool::new(false),
            fail_sub_stream: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            watch_starts: AtomicUsize::new(0),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_field_owner(mut self, owner: &str) -> Self {
        self.field_owner = owner.to_string();
        self
    }

    /// Serve `gvk`; unserved kinds fail with `Schema(KindNotServed)`.
    pub fn serve(&self, gvk: Gvk, namespaced: bool) {
        self.served.lock().unwrap_or_else(|e| e.into_inner()).insert(gvk, namespaced);
    }

    /// Watches never complete their initial listing.
    pub fn set_never_sync(&self, on: bool) { self.never_sync.store(on, Ordering::SeqCst); }

    pub fn set_fail_sub_stream(&self, on: bool) { self.fail_sub_stream.store(on, Ordering::SeqCst); }

    /// Apply and delete fail with a transport error.
    pub fn set_fail_writes(&self, on: bool) { self.fail_writes.store(on, Ordering::SeqCst); }

    /// How many watch sessions were built.
    pub fn watch_starts(&self) -> usize { self.watch_starts.load(Ordering::SeqCst) }

    /// Watch drivers built and not yet dropped.
    pub fn active_watches(&self) -> usize { self.active_watches.load(Ordering::SeqCst) }

    pub fn object(&self, id: &ResourceIdentity) -> Option<Value> {
        self.lock().objects.get(id).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Replace the status of a stored object, as a controller on the endpoint would.
    pub fn set_status(&self, id: &ResourceIdentity, status: Value) -> Result<()> {
        let updated = {
            let mut st = self.lock();
            st.next_rv += 1;
            let rv = st.next_rv.to_string();
            let obj = st.objects.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
            obj["status"] = status;
            obj["metadata"]["resourceVersion"] = json!(rv);
            obj.clone()
        };
        let _ = self.events.send((id.clone(), DeltaKind::Applied, updated));
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scope_of(&self, gvk: &Gvk) -> Result<bool> {
        self.served
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(gvk)
            .copied()
            .ok_or_else(|| Error::schema(SchemaErrorKind::KindNotServed, format!("{} is not served by {}", gvk, self.endpoint)))
    }

    fn check_writes(&self, what: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{}: injected failure", what)));
        }
        Ok(())
    }

    /// Server-side apply as seen from a single field owner: the manifest replaces the
    /// owned content while server-set metadata and status survive.
    fn merged(&self, existing: Option<&Value>, object: &Value, rv: Option<String>) -> Value {
        let mut out = object.clone();
        if let Some(spec_meta) = out.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            spec_meta.remove("resourceVersion");
            spec_meta.remove("uid");
            spec_meta.remove("generation");
            spec_meta.remove("creationTimestamp");
        }
        if let Some(m) = out.as_object_mut() {
            m.remove("status");
        }
        let (uid, created, mut generation, status) = match existing {
            Some(e) => (
                e.pointer("/metadata/uid").cloned(),
                e.pointer("/metadata/creationTimestamp").cloned(),
                e.pointer("/metadata/generation").and_then(|g| g.as_i64()).unwrap_or(1),
                e.get("status").cloned(),
            ),
            None => (None, None, 1, None),
        };
        if let Some(e) = existing {
            if strip_server_fields(e) != strip_server_fields(&out) {
                generation += 1;
            }
        }
        let meta = &mut out["metadata"];
        if let Some(uid) = uid {
            meta["uid"] = uid;
        }
        if let Some(created) = created {
            meta["creationTimestamp"] = created;
        }
        meta["generation"] = json!(generation);
        meta["managedFields"] = json!([{ "manager": self.field_owner, "operation": "Apply" }]);
        if let Some(rv) = rv {
            meta["resourceVersion"] = json!(rv);
        }
        if let Some(status) = status {
            out["status"] = status;
        }
        out
    }
}

fn strip_server_fields(v: &Value) -> Value {
    let mut v = v.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("status");
        if let Some(meta) = m.get_mut("metadata").and_then(|x| x.as_object_mut()) {
            for k in ["resourceVersion", "uid", "generation", "creationTimestamp", "managedFields"] {
                meta.remove(k);
            }
        }
    }
    v
}

fn matches(watch: &ResourceIdentity, id: &ResourceIdentity) -> bool {
    watch.gvk == id.gvk && watch.name == id.name && (watch.namespace.is_empty() || watch.namespace == id.namespace)
}

#[async_trait::async_trait]
impl RemoteStore for MemoryStore {
    fn endpoint(&self) -> &EndpointIdentity { &self.endpoint }

    async fn get(&self, id: &ResourceIdentity) -> Result<Value> {
        self.scope_of(&id.gvk)?;
        let mut v = self.object(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
        tether_core::normalize(&mut v);
        Ok(v)
    }

    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value> {
        self.check_writes("apply")?;
        let id = ResourceIdentity::of_object(object)?;
        let namespaced = self.scope_of(&id.gvk)?;
        if namespaced && id.namespace().is_none() {
            return Err(Error::Configuration(format!("{}: namespace required for namespaced kind", id)));
        }
        let mut object = object.clone();
        if !namespaced {
            if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove("namespace");
            }
        }
        let id = if namespaced { id } else { id.with_namespace("") };

        let applied = {
            let mut st = self.lock();
            let existing = st.objects.get(&id).cloned();
            if dry_run {
                let rv = existing
                    .as_ref()
                    .and_then(|e| e.pointer("/metadata/resourceVersion"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let mut v = self.merged(existing.as_ref(), &object, rv);
                if existing.is_none() {
                    v["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
                }
                return Ok(v);
            }
            st.next_rv += 1;
            let rv = st.next_rv.to_string();
            let mut v = self.merged(existing.as_ref(), &object, Some(rv));
            if existing.is_none() {
                v["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
                v["metadata"]["creationTimestamp"] = json!(chrono::Utc::now().to_rfc3339());
            }
            st.objects.insert(id.clone(), v.clone());
            v
        };
        debug!(id = %id, "memory apply");
        let _ = self.events.send((id, DeltaKind::Applied, applied.clone()));
        Ok(applied)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<()> {
        self.check_writes("delete")?;
        self.scope_of(&id.gvk)?;
        let removed = self.lock().objects.remove(id);
        if let Some(obj) = removed {
            let _ = self.events.send((id.clone(), DeltaKind::Deleted, obj));
        }
        Ok(())
    }

    async fn is_namespace_scoped(&self, gvk: &Gvk) -> Result<bool> {
        self.scope_of(gvk)
    }

    async fn watch_scoped(&self, id: &ResourceIdentity) -> Result<WatchSession> {
        self.scope_of(&id.gvk)?;
        self.watch_starts.fetch_add(1, Ordering::SeqCst);
        let active = ActiveWatch::new(Arc::clone(&self.active_watches));
        let (tx, cache) = spawn_ingest(64);
        let never_sync = self.never_sync.load(Ordering::SeqCst);
        let mut events = self.events.subscribe();
        let state = Arc::clone(&self.state);
        let watch = id.clone();
        let driver = async move {
            let _active = active;
            if never_sync {
                let _hold = tx;
                futures::future::pending::<()>().await;
                return;
            }
            let listing = |state: &Mutex<State>| -> Vec<Value> {
                state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .objects
                    .iter()
                    .filter(|(k, _)| matches(&watch, k))
                    .map(|(_, v)| v.clone())
                    .collect()
            };
            if tx.send(CacheEvent::Relist(listing(&state))).await.is_err() {
                return;
            }
            loop {
                match events.recv().await {
                    Ok((oid, kind, raw)) if matches(&watch, &oid) => {
                        if tx.send(CacheEvent::Delta(Delta { kind, raw })).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.send(CacheEvent::Relist(listing(&state))).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        Ok(WatchSession::new(id.clone(), cache, driver.boxed()))
    }

    fn sub_stream(&self, session: &WatchSession, gvk: &Gvk) -> Result<SubStream> {
        if self.fail_sub_stream.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("sub-stream for {}: injected failure", gvk)));
        }
        session.sub_stream(gvk)
    }
}

/// Counts a live driver until the future holding it is dropped.
struct ActiveWatch(Arc<AtomicUsize>);

impl ActiveWatch {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves `Named` descriptors (and optionally the injected identity) to registered stores.
#[derive(Default)]
pub struct MemoryResolver {
    stores: Mutex<FxHashMap<String, Arc<dyn RemoteStore>>>,
    injected: Mutex<Option<Arc<dyn RemoteStore>>>,
}

impl MemoryResolver {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, name: &str, store: Arc<dyn RemoteStore>) {
        self.stores.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_string(), store);
    }

    pub fn set_injected(&self, store: Arc<dyn RemoteStore>) {
        *self.injected.lock().unwrap_or_else(|e| e.into_inner()) = Some(store);
    }
}

#[async_trait::async_trait]
impl EndpointResolver for MemoryResolver {
    async fn resolve(&self, descriptor: &EndpointDescriptor) -> Result<Arc<dyn RemoteStore>> {
        let found = match descriptor {
            EndpointDescriptor::Named { name } => self.stores.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned(),
            EndpointDescriptor::InjectedIdentity => self.injected.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            _ => None,
        };
        found.ok_or_else(|| Error::Configuration(format!("cannot resolve endpoint {:?}", descriptor)))
    }
}
