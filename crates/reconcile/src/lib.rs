//! Tether reconcile: drives one subject's remote object towards its manifest.
//!
//! [`External`] implements the four operations against a resolved store and the shared
//! cache registry; [`Reconciler`] wires them into a cycle and records the outcome on
//! the subject's status.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tether_core::{CacheKey, Condition, Desired, Result, ReconcileSubject, ResourceIdentity};
use tether_kubehub::{effective_identity, EndpointResolver, RemoteStore};
use tether_registry::CacheRegistry;
use tracing::{debug, info, warn};

mod readiness;

pub use readiness::apply_readiness;

/// Result of an observe step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub exists: bool,
    pub up_to_date: bool,
    /// Changed paths from the observed to the desired object; empty when undiffable.
    pub diff: String,
}

/// Operations against one subject's endpoint.
pub struct External {
    store: Arc<dyn RemoteStore>,
    registry: Arc<CacheRegistry>,
}

impl External {
    pub fn new(store: Arc<dyn RemoteStore>, registry: Arc<CacheRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> { &self.store }

    /// Desired object with the namespace the endpoint will actually use.
    async fn desired(&self, subject: &ReconcileSubject) -> Result<Desired> {
        let mut desired = subject.desired()?;
        let ns = &self.registry.settings().default_namespace;
        let identity = effective_identity(self.store.as_ref(), &desired.identity, ns).await?;
        if identity.namespace != desired.identity.namespace {
            if let Some(meta) = desired.object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                match identity.namespace() {
                    Some(ns) => {
                        meta.insert("namespace".into(), Value::String(ns.to_string()));
                    }
                    None => {
                        meta.remove("namespace");
                    }
                }
            }
        }
        desired.identity = identity;
        Ok(desired)
    }

    fn key(&self, id: &ResourceIdentity) -> CacheKey {
        CacheKey::new(self.store.endpoint().clone(), id.clone())
    }

    pub async fn observe(&self, subject: &mut ReconcileSubject) -> Result<Observation> {
        let desired = self.desired(subject).await?;
        let key = self.key(&desired.identity);
        if subject.deleting {
            self.registry.unregister(&key)?;
            return Ok(Observation { exists: true, up_to_date: true, diff: String::new() });
        }
        self.registry.register(&key, Arc::clone(&self.store), subject.parent_link()).await?;

        let observed = match self.registry.cached_object(&key) {
            Ok(o) => o,
            Err(e) if e.is_not_found() => {
                debug!(subject = %subject.name, object = %desired.identity, "observed object absent");
                return Ok(Observation::default());
            }
            Err(e) => return Err(e),
        };
        let dry_run = self.store.apply(&desired.object, true).await?;
        let up_to_date = !tether_drift::has_drifted(&observed, &dry_run);
        let diff = tether_drift::safe_diff(&observed, &desired.object);

        let mut at_provider = (*observed).clone();
        tether_core::normalize(&mut at_provider);
        record_observed(subject, at_provider)?;

        Ok(Observation { exists: true, up_to_date, diff })
    }

    pub async fn create(&self, subject: &mut ReconcileSubject) -> Result<()> {
        self.apply_desired(subject, "create").await
    }

    pub async fn update(&self, subject: &mut ReconcileSubject) -> Result<()> {
        self.apply_desired(subject, "update").await
    }

    async fn apply_desired(&self, subject: &mut ReconcileSubject, op: &str) -> Result<()> {
        let desired = self.desired(subject).await?;
        let t0 = Instant::now();
        let mut applied = self.store.apply(&desired.object, false).await?;
        histogram!("reconcile_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        tether_core::normalize(&mut applied);
        let diff = tether_drift::safe_diff(&desired.object, &applied);
        if !diff.is_empty() {
            debug!(subject = %subject.name, op, %diff, "server changes to the applied object");
        }
        info!(subject = %subject.name, object = %desired.identity, op, "applied desired object");
        record_observed(subject, applied)
    }

    /// Stop watching and remove the remote object; an absent object counts as deleted.
    pub async fn delete(&self, subject: &ReconcileSubject) -> Result<()> {
        let desired = self.desired(subject).await?;
        self.registry.unregister(&self.key(&desired.identity))?;
        self.store.delete(&desired.identity).await?;
        info!(subject = %subject.name, object = %desired.identity, "deleted remote object");
        Ok(())
    }
}

/// Store `observed` as the subject's `at_provider` and evaluate readiness against it.
/// The object is recorded even when the policy is invalid or its evaluation fails.
fn record_observed(subject: &mut ReconcileSubject, observed: Value) -> Result<()> {
    let res = subject
        .spec
        .readiness
        .policy()
        .and_then(|policy| apply_readiness(&mut subject.status, &policy, &observed));
    subject.status.at_provider = Some(observed);
    res
}

/// Resolves a subject's endpoint into an [`External`].
pub struct Connector {
    resolver: Arc<dyn EndpointResolver>,
    registry: Arc<CacheRegistry>,
}

impl Connector {
    pub fn new(resolver: Arc<dyn EndpointResolver>, registry: Arc<CacheRegistry>) -> Self {
        Self { resolver, registry }
    }

    pub async fn connect(&self, subject: &ReconcileSubject) -> Result<External> {
        let store = self
            .resolver
            .resolve(&subject.spec.endpoint)
            .await
            .map_err(|e| e.context(&format!("connecting subject {}", subject.name)))?;
        Ok(External::new(store, Arc::clone(&self.registry)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    UpToDate,
    Deleted,
}

/// One reconcile cycle per call: connect, observe, then create, update, delete or nothing.
pub struct Reconciler {
    connector: Connector,
    registry: Arc<CacheRegistry>,
}

impl Reconciler {
    pub fn new(resolver: Arc<dyn EndpointResolver>, registry: Arc<CacheRegistry>) -> Self {
        Self { connector: Connector::new(resolver, Arc::clone(&registry)), registry }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> { &self.registry }

    pub fn connector(&self) -> &Connector { &self.connector }

    /// Run one cycle. The `Synced` condition records the result; errors are also returned.
    pub async fn reconcile(&self, subject: &mut ReconcileSubject) -> Result<Outcome> {
        let t0 = Instant::now();
        subject.status.observed_generation = subject.generation;
        let res = self.cycle(subject).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => {
                counter!("reconcile_ok_total", 1u64);
                subject.status.set_condition(Condition::reconcile_success());
                debug!(subject = %subject.name, ?outcome, "reconcile finished");
            }
            Err(e) => {
                counter!("reconcile_err_total", 1u64, "reason" => e.label());
                warn!(subject = %subject.name, error = %e, "reconcile failed");
                subject.status.set_condition(Condition::reconcile_error(e));
            }
        }
        res
    }

    async fn cycle(&self, subject: &mut ReconcileSubject) -> Result<Outcome> {
        let external = self.connector.connect(subject).await?;
        let observation = external.observe(subject).await?;
        if subject.deleting {
            external.delete(subject).await?;
            return Ok(Outcome::Deleted);
        }
        if !observation.exists {
            external.create(subject).await?;
            return Ok(Outcome::Created);
        }
        if !observation.up_to_date {
            debug!(subject = %subject.name, diff = %observation.diff, "remote object drifted");
            external.update(subject).await?;
            return Ok(Outcome::Updated);
        }
        Ok(Outcome::UpToDate)
    }
}
