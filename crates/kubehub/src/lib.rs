//! Tether kubehub: the `RemoteStore` transport seam, watch sessions and endpoint
//! resolution. `KubeStore` talks to a real API server through kube-rs; `MemoryStore`
//! keeps objects in RAM and is what the tests drive.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tether_core::{EndpointDescriptor, EndpointIdentity, Error, Gvk, ResourceIdentity, Result, SchemaErrorKind};
use tether_store::{Change, ObjectCache, SyncState};
use tokio::sync::broadcast;
use tracing::warn;

mod cluster;
mod memory;

pub use crate::cluster::{KubeResolver, KubeStore};
pub use crate::memory::{MemoryResolver, MemoryStore};

/// Transport to one target endpoint.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    fn endpoint(&self) -> &EndpointIdentity;

    /// Live object, `Error::NotFound` when absent.
    async fn get(&self, id: &ResourceIdentity) -> Result<Value>;

    /// Server-side apply with forced ownership under the configured field owner.
    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value>;

    /// Absent objects count as deleted.
    async fn delete(&self, id: &ResourceIdentity) -> Result<()>;

    /// `Schema(KindNotServed)` when the endpoint does not serve the kind.
    async fn is_namespace_scoped(&self, gvk: &Gvk) -> Result<bool>;

    /// Build a watch session restricted to one object. Nothing runs until the
    /// caller takes and drives [`WatchSession::take_driver`].
    async fn watch_scoped(&self, id: &ResourceIdentity) -> Result<WatchSession>;

    fn sub_stream(&self, session: &WatchSession, gvk: &Gvk) -> Result<SubStream> {
        session.sub_stream(gvk)
    }
}

/// Resolves an endpoint descriptor into a store.
#[async_trait::async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, descriptor: &EndpointDescriptor) -> Result<Arc<dyn RemoteStore>>;
}

/// A not-yet-started watch plus the cache it feeds. Shared by reference across
/// awaits, so the driver sits behind a lock.
pub struct WatchSession {
    identity: ResourceIdentity,
    cache: ObjectCache,
    driver: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl WatchSession {
    pub fn new(identity: ResourceIdentity, cache: ObjectCache, driver: BoxFuture<'static, ()>) -> Self {
        Self { identity, cache, driver: Mutex::new(Some(driver)) }
    }

    pub fn identity(&self) -> &ResourceIdentity { &self.identity }

    pub fn cache(&self) -> &ObjectCache { &self.cache }

    /// The background work. Dropping the future stops the watch.
    pub fn take_driver(&self) -> Option<BoxFuture<'static, ()>> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub async fn wait_for_sync(&self, timeout: Duration) -> bool { self.cache.wait_for_sync(timeout).await }

    pub fn sub_stream(&self, gvk: &Gvk) -> Result<SubStream> {
        if &self.identity.gvk != gvk {
            return Err(Error::schema(
                SchemaErrorKind::KindUnrecognized,
                format!("session watches {} but a sub-stream for {} was requested", self.identity.gvk, gvk),
            ));
        }
        if self.cache.state() == SyncState::Closed {
            return Err(Error::Transport(format!("watch for {} already stopped", self.identity)));
        }
        Ok(SubStream { identity: self.identity.clone(), rx: self.cache.subscribe() })
    }
}


/// Change notifications for the watched object.
pub struct SubStream {
    identity: ResourceIdentity,
    rx: broadcast::Receiver<Change>,
}

impl SubStream {
    pub fn identity(&self) -> &ResourceIdentity { &self.identity }

    /// Next change; `None` once the session stopped.
    pub async fn next(&mut self) -> Option<Change> {
        loop {
            match self.rx.recv().await {
                Ok(c) => return Some(c),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, id = %self.identity, "sub-stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Namespace of `id` if the kind is namespaced (defaulted when empty), empty otherwise.
pub async fn effective_identity(
    store: &dyn RemoteStore,
    id: &ResourceIdentity,
    default_namespace: &str,
) -> Result<ResourceIdentity> {
    let namespaced = store.is_namespace_scoped(&id.gvk).await?;
    Ok(match (namespaced, id.namespace()) {
        (true, Some(_)) => id.clone(),
        (true, None) => id.with_namespace(default_namespace),
        (false, _) => id.with_namespace(""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tether_store::spawn_ingest;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn session_can_be_shared_across_tasks() {
        assert_send_sync::<WatchSession>();
    }

    #[tokio::test]
    async fn driver_is_taken_once_and_kind_must_match() {
        let id = ResourceIdentity::new(Gvk::new("example.io", "v1", "Widget"), Some("ns"), "w1");
        let (_tx, cache) = spawn_ingest(4);
        let session = WatchSession::new(id, cache, async {}.boxed());
        assert!(session.take_driver().is_some());
        assert!(session.take_driver().is_none());

        let err = session.sub_stream(&Gvk::new("example.io", "v1", "Gadget")).err().unwrap();
        assert!(matches!(err, Error::Schema { kind: SchemaErrorKind::KindUnrecognized, .. }), "{err}");
    }
}
