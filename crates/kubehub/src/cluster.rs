//! kube-rs backed store and resolver.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use futures::{FutureExt, StreamExt};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, Config,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tether_core::config::Settings;
use tether_core::{EndpointDescriptor, EndpointIdentity, Error, Gvk, ResourceIdentity, Result, SchemaErrorKind};
use tether_store::{spawn_ingest, CacheEvent};
use tracing::{debug, info, warn};

use crate::{EndpointResolver, RemoteStore, WatchSession};

fn kube_err(what: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(format!("{}: {}", what, ae.message)),
        other => Error::Transport(format!("{}: {}", what, other)),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Value> {
    let mut v = serde_json::to_value(obj).map_err(|e| Error::Transport(format!("serializing object: {}", e)))?;
    tether_core::normalize(&mut v);
    Ok(v)
}

/// One endpoint reached through a kube `Client`. Discovery results are cached per kind.
pub struct KubeStore {
    client: Client,
    endpoint: EndpointIdentity,
    field_owner: String,
    queue_cap: usize,
    resources: Mutex<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client, endpoint: EndpointIdentity, settings: &Settings) -> Self {
        Self {
            client,
            endpoint,
            field_owner: settings.field_owner.clone(),
            queue_cap: settings.queue_cap,
            resources: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn from_config(config: Config, settings: &Settings) -> Result<Self> {
        let endpoint = endpoint_of(&config);
        let client = Client::try_from(config).map_err(|e| Error::Configuration(format!("building client: {}", e)))?;
        Ok(Self::new(client, endpoint, settings))
    }

    async fn find_api_resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        let cached = self.resources.lock().unwrap_or_else(|e| e.into_inner()).get(gvk).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| kube_err("discovery", e))?;
        let want = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == want.group && ar.version == want.version && ar.kind == want.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.resources
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(gvk.clone(), (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(Error::schema(
            SchemaErrorKind::KindNotServed,
            format!("{} is not served by {}", gvk, self.endpoint),
        ))
    }

    async fn api_for(&self, id: &ResourceIdentity) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(&id.gvk).await?;
        Ok(match (namespaced, id.namespace()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        })
    }
}

/// Identity of the cluster a config points at.
pub fn endpoint_of(config: &Config) -> EndpointIdentity {
    let url = &config.cluster_url;
    EndpointIdentity::from_parts(
        url.scheme_str().unwrap_or("https"),
        url.authority().map(|a| a.as_str()).unwrap_or(""),
        url.path(),
    )
}

#[async_trait::async_trait]
impl RemoteStore for KubeStore {
    fn endpoint(&self) -> &EndpointIdentity { &self.endpoint }

    async fn get(&self, id: &ResourceIdentity) -> Result<Value> {
        let api = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(|e| kube_err("get", e))? {
            Some(obj) => to_json(&obj),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn apply(&self, object: &Value, dry_run: bool) -> Result<Value> {
        let id = ResourceIdentity::of_object(object)?;
        let api = self.api_for(&id).await?;
        let mut pp = PatchParams::apply(&self.field_owner).force();
        if dry_run {
            pp = pp.dry_run();
        }
        let t0 = std::time::Instant::now();
        let res = api.patch(&id.name, &pp, &Patch::Apply(object)).await;
        metrics::histogram!("remote_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(obj) => {
                metrics::counter!("remote_apply_ok", 1u64);
                to_json(&obj)
            }
            Err(e) => {
                metrics::counter!("remote_apply_err", 1u64);
                Err(kube_err(if dry_run { "dry-run apply" } else { "server-side apply" }, e))
            }
        }
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<()> {
        let api = self.api_for(id).await?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(id = %id, "remote object deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(id = %id, "remote object already absent");
                Ok(())
            }
            Err(e) => Err(kube_err("delete", e)),
        }
    }

    async fn is_namespace_scoped(&self, gvk: &Gvk) -> Result<bool> {
        Ok(self.find_api_resource(gvk).await?.1)
    }

    async fn watch_scoped(&self, id: &ResourceIdentity) -> Result<WatchSession> {
        let api = self.api_for(id).await?;
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", id.name));
        let (tx, cache) = spawn_ingest(self.queue_cap);
        let label = id.to_string();
        let driver = async move {
            let stream = watcher::watcher(api, cfg).default_backoff();
            futures::pin_mut!(stream);
            info!(id = %label, "watcher started");
            while let Some(ev) = stream.next().await {
                let out = match ev {
                    Ok(Event::Applied(o)) => event_for(&o, tether_core::DeltaKind::Applied),
                    Ok(Event::Deleted(o)) => event_for(&o, tether_core::DeltaKind::Deleted),
                    Ok(Event::Restarted(list)) => {
                        debug!(id = %label, count = list.len(), "watch restart");
                        list.iter()
                            .map(|o| serde_json::to_value(o).context("serializing listed object"))
                            .collect::<anyhow::Result<Vec<_>>>()
                            .map(CacheEvent::Relist)
                    }
                    Err(e) => {
                        warn!(id = %label, error = %e, "watch error; backing off");
                        continue;
                    }
                };
                match out {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(id = %label, error = %format!("{e:#}"), "dropping watch event"),
                }
            }
            warn!(id = %label, "watcher stream ended");
        };
        Ok(WatchSession::new(id.clone(), cache, driver.boxed()))
    }
}

fn event_for(obj: &DynamicObject, kind: tether_core::DeltaKind) -> anyhow::Result<CacheEvent> {
    let raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if raw.pointer("/metadata/name").is_none() {
        return Err(anyhow!("object missing metadata.name"));
    }
    Ok(CacheEvent::Delta(tether_core::Delta { kind, raw }))
}

/// Resolves descriptors through kubeconfig files, inline documents or ambient config.
/// Stores are kept per descriptor so discovery is not repeated every cycle.
pub struct KubeResolver {
    settings: Settings,
    stores: Mutex<FxHashMap<EndpointDescriptor, Arc<dyn RemoteStore>>>,
}

impl KubeResolver {
    pub fn new(settings: Settings) -> Self {
        Self { settings, stores: Mutex::new(FxHashMap::default()) }
    }

    async fn load_config(descriptor: &EndpointDescriptor) -> anyhow::Result<Config> {
        match descriptor {
            EndpointDescriptor::InjectedIdentity => Config::infer().await.context("inferring ambient kube config"),
            EndpointDescriptor::KubeconfigFile { path, context } => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path))?;
                let opts = KubeConfigOptions { context: context.clone(), ..Default::default() };
                Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")
            }
            EndpointDescriptor::KubeconfigInline { document, context } => {
                let kc = Kubeconfig::from_yaml(document).context("parsing inline kubeconfig")?;
                let opts = KubeConfigOptions { context: context.clone(), ..Default::default() };
                Config::from_custom_kubeconfig(kc, &opts).await.context("loading inline kubeconfig")
            }
            EndpointDescriptor::Named { name } => Err(anyhow!("named endpoint {:?} is not known to the kube resolver", name)),
        }
    }
}

#[async_trait::async_trait]
impl EndpointResolver for KubeResolver {
    async fn resolve(&self, descriptor: &EndpointDescriptor) -> Result<Arc<dyn RemoteStore>> {
        let cached = self.stores.lock().unwrap_or_else(|e| e.into_inner()).get(descriptor).cloned();
        if let Some(store) = cached {
            return Ok(store);
        }
        let config = Self::load_config(descriptor)
            .await
            .map_err(|e| Error::Configuration(format!("{e:#}")))?;
        let store: Arc<dyn RemoteStore> = Arc::new(KubeStore::from_config(config, &self.settings)?);
        info!(endpoint = %store.endpoint(), "endpoint resolved");
        self.stores
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(descriptor.clone(), Arc::clone(&store));
        Ok(store)
    }
}
