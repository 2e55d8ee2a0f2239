#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reko_controller::components::JobComponent;
use reko_controller::{CleanupError, ComponentRegistry, DesiredStateError, Health, ManagedComponent, Reconciler};
use reko_core::{
    ApiResource, DynamicObject, EngineConfig, GroupVersionKind, ObjectExt, ObjectKey, ObjectStore, ResourceStatus,
    Selector, StoreResult, WatchStream,
};
use reko_store::InMemoryStore;

pub const KIND: &str = "Workload";

pub fn workload(name: &str, spec: serde_json::Value) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("reko.dev", "v1alpha1", KIND));
    DynamicObject::new(name, &ar).within("ns").data(serde_json::json!({ "spec": spec }))
}

pub fn managed_spec() -> serde_json::Value {
    serde_json::json!({ "managementState": "Managed", "replicas": 1, "image": "busybox" })
}

pub fn key(name: &str) -> ObjectKey { ObjectKey::namespaced(KIND, "ns", name) }

pub fn job_key(name: &str) -> ObjectKey { ObjectKey::namespaced("Job", "ns", format!("{name}-job")) }

pub fn status_of(store: &InMemoryStore, name: &str) -> ResourceStatus {
    store.peek(&key(name)).map(|o| ResourceStatus::from_object(&o)).unwrap_or_default()
}

/// Mark the Job of `name` as finished.
pub async fn complete_job(store: &InMemoryStore, name: &str) {
    let mut job = store.peek(&job_key(name)).expect("job exists");
    job.set_status(serde_json::json!({ "succeeded": 1 }));
    store.update_status(job).await.unwrap();
}

/// A component managing nothing in the store whose cleanup fails a set
/// number of times. It checks that the primary still holds its finalizer
/// whenever cleanup runs.
pub struct External {
    failures_left: AtomicU32,
    pub cleanups: AtomicU32,
    pub finalizer_seen: AtomicBool,
}

impl External {
    pub fn failing(times: u32) -> Self {
        Self { failures_left: AtomicU32::new(times), cleanups: AtomicU32::new(0), finalizer_seen: AtomicBool::new(true) }
    }
}

#[async_trait::async_trait]
impl ManagedComponent for External {
    fn name(&self) -> &str { "external" }

    fn kinds(&self) -> Vec<String> { Vec::new() }

    fn desired(&self, _primary: &DynamicObject) -> Result<Vec<DynamicObject>, DesiredStateError> { Ok(Vec::new()) }

    fn observe(&self, _object: &DynamicObject) -> Health { Health::Ready }

    async fn cleanup(&self, primary: &DynamicObject, store: &dyn ObjectStore) -> Result<(), CleanupError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        let live = store.get(&ObjectKey::from_object(primary).unwrap()).await.map_err(|e| CleanupError::new(e.to_string()))?;
        if !live.has_finalizer(reko_core::DEFAULT_FINALIZER) {
            self.finalizer_seen.store(false, Ordering::SeqCst);
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CleanupError::new("external endpoint unreachable"));
        }
        Ok(())
    }
}

pub fn reconciler(store: &InMemoryStore, extra: Option<Arc<External>>) -> Reconciler {
    let mut registry = ComponentRegistry::new();
    registry.register(Arc::new(JobComponent::default())).unwrap();
    if let Some(ext) = extra {
        registry.register(ext).unwrap();
    }
    Reconciler::new(Arc::new(store.clone()), Arc::new(registry), EngineConfig::default())
}

/// Store wrapper counting concurrent calls per object key.
#[derive(Clone)]
pub struct TrackingStore {
    inner: InMemoryStore,
    delay: Duration,
    in_flight: Arc<Mutex<HashMap<ObjectKey, (u32, u32)>>>,
}

struct Guard {
    key: ObjectKey,
    in_flight: Arc<Mutex<HashMap<ObjectKey, (u32, u32)>>>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(entry) = self.in_flight.lock().unwrap().get_mut(&self.key) {
            entry.0 -= 1;
        }
    }
}

impl TrackingStore {
    pub fn new(inner: InMemoryStore, delay: Duration) -> Self {
        Self { inner, delay, in_flight: Arc::default() }
    }

    fn enter(&self, key: ObjectKey) -> Guard {
        let mut map = self.in_flight.lock().unwrap();
        let entry = map.entry(key.clone()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        Guard { key, in_flight: Arc::clone(&self.in_flight) }
    }

    /// Highest number of simultaneous calls seen for any key of `kind`.
    pub fn max_concurrency(&self, kind: &str) -> u32 {
        self.in_flight.lock().unwrap().iter().filter(|(k, _)| k.kind == kind).map(|(_, v)| v.1).max().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ObjectStore for TrackingStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let _g = self.enter(key.clone());
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn list(&self, kind: &str, selector: &Selector) -> StoreResult<Vec<DynamicObject>> { self.inner.list(kind, selector).await }

    async fn watch(&self, kind: &str, selector: &Selector) -> StoreResult<WatchStream> { self.inner.watch(kind, selector).await }

    async fn create(&self, obj: DynamicObject) -> StoreResult<DynamicObject> { self.inner.create(obj).await }

    async fn update(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let _g = self.enter(ObjectKey::from_object(&obj).unwrap());
        tokio::time::sleep(self.delay).await;
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let _g = self.enter(ObjectKey::from_object(&obj).unwrap());
        tokio::time::sleep(self.delay).await;
        self.inner.update_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> { self.inner.delete(key).await }
}

/// Store wrapper whose reads of one key keep returning an old copy, as if
/// the object was deleted right after the read.
pub struct StaleReads {
    inner: InMemoryStore,
    stale: DynamicObject,
}

impl StaleReads {
    pub fn new(inner: InMemoryStore, stale: DynamicObject) -> Self { Self { inner, stale } }
}

#[async_trait::async_trait]
impl ObjectStore for StaleReads {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        if ObjectKey::from_object(&self.stale).ok().as_ref() == Some(key) {
            return Ok(self.stale.clone());
        }
        self.inner.get(key).await
    }

    async fn list(&self, kind: &str, selector: &Selector) -> StoreResult<Vec<DynamicObject>> { self.inner.list(kind, selector).await }

    async fn watch(&self, kind: &str, selector: &Selector) -> StoreResult<WatchStream> { self.inner.watch(kind, selector).await }

    async fn create(&self, obj: DynamicObject) -> StoreResult<DynamicObject> { self.inner.create(obj).await }

    async fn update(&self, obj: DynamicObject) -> StoreResult<DynamicObject> { self.inner.update(obj).await }

    async fn update_status(&self, obj: DynamicObject) -> StoreResult<DynamicObject> { self.inner.update_status(obj).await }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> { self.inner.delete(key).await }
}

pub fn registry() -> Arc<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    registry.register(Arc::new(JobComponent::default())).unwrap();
    Arc::new(registry)
}

/// Poll until `check` holds or the deadline passes.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
