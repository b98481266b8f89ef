//! Tether store: the in-RAM object cache behind one watch session.
//!
//! A watch driver feeds [`CacheEvent`]s into an ingest loop which coalesces them,
//! swaps immutable snapshots, flips the sync barrier after the first full listing
//! and broadcasts a [`Change`] per applied delta.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tether_core::{Delta, DeltaKind};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

/// `(namespace, name)`; the namespace is empty for cluster-scoped objects.
pub type ObjectKey = (String, String);

pub fn object_key(raw: &Value) -> Option<ObjectKey> {
    let meta = raw.get("metadata")?;
    let name = meta.get("name").and_then(|v| v.as_str())?;
    let ns = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
    Some((ns.to_string(), name.to_string()))
}

/// Input of the ingest loop.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Delta(Delta),
    /// Full listing; replaces the cache content and completes the initial sync.
    Relist(Vec<Value>),
}

/// Notification emitted for each applied delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub epoch: u64,
    pub kind: DeltaKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Synced,
    /// The driver went away; the cache will not change anymore.
    Closed,
}

/// Coalescing queue keyed by object with FIFO order and fixed capacity.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, Delta>,
    order: VecDeque<ObjectKey>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: Delta) {
        let Some(key) = object_key(&d.raw) else {
            debug!("dropping delta without metadata.name");
            return;
        };
        if !self.map.contains_key(&key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                }
            }
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub objects: FxHashMap<ObjectKey, Arc<Value>>,
}

/// Builds [`CacheSnapshot`]s from deltas and listings.
#[derive(Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    objects: FxHashMap<ObjectKey, Arc<Value>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    /// Apply a batch and return the change notifications it produced.
    pub fn apply(&mut self, batch: Vec<Delta>) -> Vec<Change> {
        self.epoch = self.epoch.saturating_add(1);
        let mut changes = Vec::with_capacity(batch.len());
        for mut d in batch {
            let Some(key) = object_key(&d.raw) else { continue };
            match d.kind {
                DeltaKind::Applied => {
                    tether_core::normalize(&mut d.raw);
                    self.objects.insert(key.clone(), Arc::new(d.raw));
                }
                DeltaKind::Deleted => {
                    self.objects.remove(&key);
                }
            }
            changes.push(Change { epoch: self.epoch, kind: d.kind, namespace: key.0, name: key.1 });
        }
        changes
    }

    /// Replace everything with a fresh listing. Objects that vanished are reported as deleted.
    pub fn relist(&mut self, items: Vec<Value>) -> Vec<Change> {
        let mut next: FxHashMap<ObjectKey, Arc<Value>> = FxHashMap::default();
        for mut raw in items {
            if let Some(key) = object_key(&raw) {
                tether_core::normalize(&mut raw);
                next.insert(key, Arc::new(raw));
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        let epoch = self.epoch;
        let mut changes: Vec<Change> = self
            .objects
            .keys()
            .filter(|k| !next.contains_key(*k))
            .map(|k| Change { epoch, kind: DeltaKind::Deleted, namespace: k.0.clone(), name: k.1.clone() })
            .collect();
        for (k, v) in next.iter() {
            if self.objects.get(k).map(|old| old.as_ref() != v.as_ref()).unwrap_or(true) {
                changes.push(Change { epoch, kind: DeltaKind::Applied, namespace: k.0.clone(), name: k.1.clone() });
            }
        }
        self.objects = next;
        changes
    }

    pub fn freeze(&self) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot { epoch: self.epoch, objects: self.objects.clone() })
    }
}

/// Read handle for one session's cache. Cheap to clone.
#[derive(Clone)]
pub struct ObjectCache {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    state_rx: watch::Receiver<SyncState>,
    changes: broadcast::Sender<Change>,
}

impl ObjectCache {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<Value>> {
        let key = (namespace.unwrap_or("").to_string(), name.to_string());
        self.snap.load().objects.get(&key).cloned()
    }

    pub fn state(&self) -> SyncState { *self.state_rx.borrow() }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> { self.changes.subscribe() }

    /// Wait until the first listing landed. False on timeout or if the driver ended first.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let wait = async move {
            loop {
                match *rx.borrow_and_update() {
                    SyncState::Synced => return true,
                    SyncState::Closed => return false,
                    SyncState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return matches!(*rx.borrow(), SyncState::Synced);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

/// Spawn an ingest loop consuming cache events and swapping snapshots. Returns a sender
/// for the watch driver and the read handle. Dropping every sender closes the cache.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<CacheEvent>, ObjectCache) {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<CacheEvent>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
    let (state_tx, state_rx) = watch::channel(SyncState::Pending);
    let (changes, _) = broadcast::channel::<Change>(cap);
    let snap_clone = Arc::clone(&snap);
    let changes_tx = changes.clone();

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = SnapshotBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let publish = |builder: &SnapshotBuilder, changes: Vec<Change>| {
            snap_clone.store(builder.freeze());
            for c in changes {
                let _ = changes_tx.send(c);
            }
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(CacheEvent::Delta(d)) => coalescer.push(d),
                        Some(CacheEvent::Relist(items)) => {
                            // pending deltas predate the listing
                            let _ = coalescer.drain_ready();
                            let n = items.len();
                            let changes = builder.relist(items);
                            publish(&builder, changes);
                            metrics::counter!("store_relist_total", 1u64);
                            if *state_tx.borrow() != SyncState::Synced {
                                debug!(objects = n, "initial listing applied; cache synced");
                                let _ = state_tx.send(SyncState::Synced);
                            }
                        }
                        None => {
                            debug!("event channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                let changes = builder.apply(batch);
                                publish(&builder, changes);
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        let changes = builder.apply(batch);
                        publish(&builder, changes);
                    }
                }
            }
        }
        if coalescer.dropped() > 0 {
            metrics::counter!("store_coalescer_dropped_total", coalescer.dropped());
        }
        let _ = state_tx.send(SyncState::Closed);
        info!("ingest loop stopped");
    });

    (tx, ObjectCache { snap, state_rx, changes })
}
