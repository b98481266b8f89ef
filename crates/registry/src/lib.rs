//! Tether cache registry: one live watch session per [`CacheKey`].
//!
//! Registration builds the session, starts its driver on a background task, waits for
//! the first listing and hands a change sub-stream to the registry-wide hook. Any
//! failure along the way removes the entry and cancels the task again, so a failed
//! `register` leaves the table as it found it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwapOption;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tether_core::config::Settings;
use tether_core::{CacheKey, Error, ParentLink, ResourceIdentity, Result};
use tether_kubehub::{effective_identity, RemoteStore, SubStream, WatchSession};
use tether_store::ObjectCache;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called once per successful registration with the change stream of the new session.
pub type RegisterFn = Box<dyn Fn(SubStream, ParentLink) -> Result<()> + Send + Sync>;

struct CacheEntry {
    id: u64,
    cache: ObjectCache,
    cancel: CancellationToken,
    started: Arc<AtomicU32>,
    identity: ResourceIdentity,
    parent: ParentLink,
}

pub struct CacheRegistry {
    entries: Mutex<FxHashMap<CacheKey, CacheEntry>>,
    hook: ArcSwapOption<RegisterFn>,
    next_id: AtomicU64,
    settings: Settings,
}

impl CacheRegistry {
    pub fn new(settings: Settings) -> Self {
        Self { entries: Mutex::new(FxHashMap::default()), hook: ArcSwapOption::empty(), next_id: AtomicU64::new(1), settings }
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_register_fn<F>(&self, hook: F)
    where
        F: Fn(SubStream, ParentLink) -> Result<()> + Send + Sync + 'static,
    {
        self.hook.store(Some(Arc::new(Box::new(hook))));
    }

    pub fn contains(&self, key: &CacheKey) -> bool { self.lock().contains_key(key) }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<CacheKey> { self.lock().keys().cloned().collect() }

    /// How often the background task of `key` has started. Diagnostics only.
    pub fn started_count(&self, key: &CacheKey) -> Option<u32> {
        self.lock().get(key).map(|e| e.started.load(Ordering::SeqCst))
    }

    pub fn parent_of(&self, key: &CacheKey) -> Option<ParentLink> {
        self.lock().get(key).map(|e| e.parent.clone())
    }

    /// The locally cached object behind `key`. `NotFound` when the watch has not seen it.
    pub fn cached_object(&self, key: &CacheKey) -> Result<Arc<Value>> {
        let found = self.lock().get(key).map(|e| (e.cache.clone(), e.identity.clone()));
        let (cache, identity) =
            found.ok_or_else(|| Error::Configuration(format!("no cache registered for {}", key)))?;
        cache
            .get(identity.namespace(), &identity.name)
            .ok_or_else(|| Error::NotFound(format!("{} not present on {}", identity, key.endpoint)))
    }

    /// Start watching `key` unless a session for it already exists.
    pub async fn register(&self, key: &CacheKey, store: Arc<dyn RemoteStore>, parent: ParentLink) -> Result<()> {
        if self.contains(key) {
            debug!(key = %key, "cache already registered");
            return Ok(());
        }
        if store.endpoint() != &key.endpoint {
            return Err(Error::Configuration(format!(
                "store for {} cannot serve cache key {}",
                store.endpoint(),
                key
            )));
        }
        let identity = effective_identity(store.as_ref(), &key.resource, &self.settings.default_namespace).await?;
        let session = store.watch_scoped(&identity).await?;
        let driver = session
            .take_driver()
            .ok_or_else(|| Error::Transport(format!("watch for {} was already started", identity)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicU32::new(0));
        {
            let mut entries = self.lock();
            if entries.contains_key(key) {
                // lost the insert race; the unstarted driver goes with the session
                debug!(key = %key, "concurrent registration won");
                return Ok(());
            }
            entries.insert(
                key.clone(),
                CacheEntry {
                    id,
                    cache: session.cache().clone(),
                    cancel: cancel.clone(),
                    started: Arc::clone(&started),
                    identity: identity.clone(),
                    parent: parent.clone(),
                },
            );
        }

        let label = key.to_string();
        let own_cancel = cancel.clone();
        tokio::spawn(async move {
            started.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => debug!(key = %label, "watch cancelled"),
                _ = driver => warn!(key = %label, "watch driver ended"),
            }
        });

        match self.complete(key, store.as_ref(), &session, parent).await {
            Ok(()) => {
                metrics::counter!("registry_register_total", 1u64);
                info!(key = %key, identity = %identity, "cache registered");
                Ok(())
            }
            Err(e) => Err(self.rollback(key, id, &own_cancel, e)),
        }
    }

    async fn complete(&self, key: &CacheKey, store: &dyn RemoteStore, session: &WatchSession, parent: ParentLink) -> Result<()> {
        let timeout = self.settings.sync_timeout;
        if !session.wait_for_sync(timeout).await {
            return Err(Error::Timeout(format!("cache for {} did not sync within {:?}", key, timeout)));
        }
        let sub = store.sub_stream(session, &session.identity().gvk)?;
        let hook = self
            .hook
            .load_full()
            .ok_or_else(|| Error::Configuration("cache registry has no register hook".into()))?;
        (hook.as_ref())(sub, parent)
    }

    fn rollback(&self, key: &CacheKey, id: u64, cancel: &CancellationToken, original: Error) -> Error {
        metrics::counter!("registry_rollback_total", 1u64);
        warn!(key = %key, error = %original, "registration failed; rolling back");
        cancel.cancel();
        // a concurrent unregister may have replaced the entry; leave that one alone
        let owned = self.lock().get(key).map(|e| e.id == id).unwrap_or(false);
        if !owned {
            return original;
        }
        match self.unregister(key) {
            Ok(()) => original,
            Err(rollback) => Error::Rollback { original: Box::new(original), rollback: Box::new(rollback) },
        }
    }

    /// Cancel and forget the session of `key`. Does not wait for the task to exit.
    pub fn unregister(&self, key: &CacheKey) -> Result<()> {
        let removed = self.lock().remove(key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(key = %key, "cache unregistered");
                Ok(())
            }
            None => {
                debug!(key = %key, "unregister of unknown cache");
                Ok(())
            }
        }
    }

    /// Cancel every session; used at shutdown.
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for e in &drained {
            e.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "all caches unregistered");
        }
    }
}

/// Hook forwarding every change of a sub-stream into `tx` as the parent to re-reconcile.
pub fn trigger_hook(tx: mpsc::Sender<ParentLink>) -> impl Fn(SubStream, ParentLink) -> Result<()> + Send + Sync + 'static {
    move |mut sub: SubStream, parent: ParentLink| {
        if tx.is_closed() {
            return Err(Error::Configuration("trigger queue is closed".into()));
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(change) = sub.next().await {
                debug!(parent = %parent, object = %sub.identity(), epoch = change.epoch, kind = ?change.kind, "watched object changed");
                if tx.send(parent.clone()).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}
