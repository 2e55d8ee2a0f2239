//! Reko kubehub: [`ObjectStore`] over a live Kubernetes API server.
//!
//! Kinds are registered up front (directly or through discovery) so each call
//! can build the matching `Api<DynamicObject>`. Watches use the kube runtime
//! watcher; its relists surface as [`WatchEvent::Restarted`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use reko_core::{ObjectKey, ObjectStore, Selector, StoreError, StoreResult, WatchEvent, WatchStream};
use tracing::{debug, info};

/// Parse `v1/Kind` or `group/version/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Items in list responses carry no apiVersion/kind; server-side apply
/// bookkeeping is never needed by the engine.
fn normalize(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj.metadata.managed_fields = None;
    obj
}

fn map_kube_err(key: &ObjectKey, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(key.clone()),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(key.clone()),
            409 => StoreError::conflict(key.clone(), resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            429 | 500..=599 => StoreError::Unavailable(format!("{} ({})", resp.message, resp.code)),
            _ => StoreError::Backend(anyhow!("{} ({} {})", resp.message, resp.code, resp.reason)),
        },
        other => StoreError::Backend(anyhow::Error::new(other)),
    }
}

#[derive(Clone)]
struct Registered {
    ar: ApiResource,
    namespaced: bool,
}

/// Cheaply cloneable; clones share the kube client connection pool.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    kinds: BTreeMap<String, Registered>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, kinds: BTreeMap::new() } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    pub fn register(mut self, ar: ApiResource, namespaced: bool) -> Self {
        self.kinds.insert(ar.kind.clone(), Registered { ar, namespaced });
        self
    }

    /// Register every GVK through one discovery run.
    pub async fn discover(mut self, gvks: &[GroupVersionKind]) -> Result<Self> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for gvk in gvks {
            let (ar, namespaced) = find_api_resource(&discovery, gvk)?;
            info!(kind = %ar.kind, api_version = %ar.api_version, namespaced, "registered kind");
            self = self.register(ar, namespaced);
        }
        Ok(self)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> { self.kinds.keys().map(|k| k.as_str()) }

    fn resolve(&self, kind: &str) -> StoreResult<&Registered> {
        self.kinds.get(kind).ok_or_else(|| StoreError::Invalid(format!("kind {kind} is not registered")))
    }

    fn api(&self, kind: &str, namespace: Option<&str>) -> StoreResult<(Api<DynamicObject>, &ApiResource)> {
        let reg = self.resolve(kind)?;
        let api = match (reg.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &reg.ar),
            _ => Api::all_with(self.client.clone(), &reg.ar),
        };
        Ok((api, &reg.ar))
    }

    fn api_for(&self, key: &ObjectKey) -> StoreResult<(Api<DynamicObject>, &ApiResource)> {
        let reg = self.resolve(&key.kind)?;
        if reg.namespaced && key.namespace.is_none() {
            return Err(StoreError::Invalid(format!("{key}: namespace required for namespaced kind")));
        }
        self.api(&key.kind, key.namespace.as_deref())
    }

    fn object_key(obj: &DynamicObject) -> StoreResult<ObjectKey> {
        ObjectKey::from_object(obj).map_err(|e| StoreError::Invalid(e.to_string()))
    }
}

fn list_params(selector: &Selector) -> ListParams {
    match selector.label_selector() {
        Some(labels) => ListParams::default().labels(&labels),
        None => ListParams::default(),
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let (api, ar) = self.api_for(key)?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(key, e))?;
        Ok(normalize(obj, ar))
    }

    async fn list(&self, kind: &str, selector: &Selector) -> StoreResult<Vec<DynamicObject>> {
        let (api, ar) = self.api(kind, selector.namespace.as_deref())?;
        let scope = ObjectKey::cluster(kind, "*");
        let list = api.list(&list_params(selector)).await.map_err(|e| map_kube_err(&scope, e))?;
        Ok(list.items.into_iter().map(|o| normalize(o, ar)).filter(|o| selector.matches(o)).collect())
    }

    async fn watch(&self, kind: &str, selector: &Selector) -> StoreResult<WatchStream> {
        let (api, ar) = self.api(kind, selector.namespace.as_deref())?;
        let ar = ar.clone();
        let mut cfg = watcher::Config::default();
        if let Some(labels) = selector.label_selector() {
            cfg = cfg.labels(&labels);
        }
        debug!(kind, ns = ?selector.namespace, "starting watcher");
        let stream = watcher::watcher(api, cfg).map(move |ev| match ev {
            Ok(Event::Applied(o)) => Ok(WatchEvent::Applied(normalize(o, &ar))),
            Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(normalize(o, &ar))),
            Ok(Event::Restarted(list)) => Ok(WatchEvent::Restarted(list.into_iter().map(|o| normalize(o, &ar)).collect())),
            Err(e) => Err(StoreError::Unavailable(format!("watch {}: {}", ar.kind, e))),
        });
        Ok(stream.boxed())
    }

    async fn create(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = Self::object_key(&obj)?;
        let (api, ar) = self.api_for(&key)?;
        counter!("store_writes_total", 1, "op" => "create");
        let created = api.create(&PostParams::default(), &obj).await.map_err(|e| map_kube_err(&key, e))?;
        Ok(normalize(created, ar))
    }

    async fn update(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = Self::object_key(&obj)?;
        let (api, ar) = self.api_for(&key)?;
        counter!("store_writes_total", 1, "op" => "update");
        let updated = api.replace(&key.name, &PostParams::default(), &obj).await.map_err(|e| map_kube_err(&key, e))?;
        Ok(normalize(updated, ar))
    }

    async fn update_status(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = Self::object_key(&obj)?;
        let (api, ar) = self.api_for(&key)?;
        let body = serde_json::to_vec(&obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        counter!("store_writes_total", 1, "op" => "update_status");
        let updated = api.replace_status(&key.name, &PostParams::default(), body).await.map_err(|e| map_kube_err(&key, e))?;
        Ok(normalize(updated, ar))
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let (api, _) = self.api_for(key)?;
        counter!("store_writes_total", 1, "op" => "delete");
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_err(key, e))?;
        Ok(())
    }
}
