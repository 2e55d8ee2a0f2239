//! Reko in-RAM object store.
//!
//! Behaves like an API server for the parts the engine relies on: monotonic
//! resourceVersions with conflict detection, generation bumps on spec change,
//! a status-only write path, finalizer-gated deletion, background garbage
//! collection through owner references, and list+watch streams.

#![forbid(unsafe_code)]

mod faults;

pub use faults::{Fault, FaultKind, StoreCall, StoreOp};

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::counter;
use reko_core::{
    DynamicObject, ObjectExt, ObjectKey, ObjectStore, Selector, StoreError, StoreResult, WatchEvent, WatchStream,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    rv: u64,
    faults: Vec<Fault>,
    calls: VecDeque<StoreCall>,
    call_log_cap: usize,
}

/// Default bound on the recorded call log; older calls are dropped first.
pub const DEFAULT_CALL_LOG: usize = 4096;

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

/// Cheaply cloneable handle; clones share one store.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self { Self::new() }
}

fn key_of(obj: &DynamicObject) -> StoreResult<ObjectKey> {
    ObjectKey::from_object(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn same(a: &DynamicObject, b: &DynamicObject) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

fn strip_status(obj: &mut DynamicObject) {
    if let Some(map) = obj.data.as_object_mut() {
        map.remove("status");
    }
}

fn check_rv(key: &ObjectKey, incoming: &DynamicObject, live: &DynamicObject) -> StoreResult<()> {
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if Some(rv) != live.metadata.resource_version.as_deref() => Err(StoreError::conflict(
            key.clone(),
            format!("resourceVersion {} is stale (live {})", rv, live.metadata.resource_version.as_deref().unwrap_or("")),
        )),
        _ => Ok(()),
    }
}

fn event_matches(ev: &WatchEvent, kind: &str, selector: &Selector) -> bool {
    match ev {
        WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o.kind() == Some(kind) && selector.matches(o),
        WatchEvent::Restarted(_) => false,
    }
}

impl InMemoryStore {
    pub fn new() -> Self { Self::with_capacity(1024) }

    /// `cap` bounds how far a watcher may lag before its stream errors out.
    pub fn with_capacity(cap: usize) -> Self {
        let (events, _) = broadcast::channel(cap.max(1));
        let state = State {
            objects: BTreeMap::new(),
            rv: 0,
            faults: Vec::new(),
            calls: VecDeque::new(),
            call_log_cap: DEFAULT_CALL_LOG,
        };
        Self { shared: Arc::new(Shared { state: Mutex::new(state), events }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and consume a matching scripted fault, if any.
    fn enter(st: &mut State, op: StoreOp, key: &ObjectKey) -> StoreResult<()> {
        if st.call_log_cap > 0 {
            if st.calls.len() == st.call_log_cap {
                st.calls.pop_front();
            }
            st.calls.push_back(StoreCall { op, target: key.to_string() });
        }
        if op.is_mutation() {
            counter!("store_writes_total", 1, "op" => op.as_str());
        }
        if let Some(fault) = st.faults.iter_mut().find(|f| f.hits(op, &key.kind)) {
            fault.times -= 1;
            let err = fault.to_error(key);
            debug!(op = op.as_str(), key = %key, error = %err, "injected store fault");
            st.faults.retain(|f| f.times > 0);
            return Err(err);
        }
        Ok(())
    }

    fn next_rv(st: &mut State) -> String {
        st.rv += 1;
        st.rv.to_string()
    }

    fn emit(&self, ev: WatchEvent) {
        // no receivers is fine
        let _ = self.shared.events.send(ev);
    }

    /// Remove an object, then collect dependents whose owner is gone.
    /// Dependents holding finalizers are only marked for deletion.
    fn remove_cascading(&self, st: &mut State, key: &ObjectKey) {
        let mut pending = vec![key.clone()];
        while let Some(k) = pending.pop() {
            let Some(gone) = st.objects.remove(&k) else { continue };
            trace!(key = %k, "object removed");
            let uid = gone.metadata.uid.clone();
            self.emit(WatchEvent::Deleted(gone));
            let Some(uid) = uid else { continue };
            let dependents: Vec<ObjectKey> = st
                .objects
                .iter()
                .filter(|(_, o)| o.metadata.owner_references.as_ref().map(|refs| refs.iter().any(|r| r.uid == uid)).unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                let has_finalizers = st.objects.get(&dep).and_then(|o| o.metadata.finalizers.as_ref()).map(|f| !f.is_empty()).unwrap_or(false);
                if has_finalizers {
                    self.mark_deleting(st, &dep);
                } else {
                    debug!(owner = %k, dependent = %dep, "garbage collecting dependent");
                    pending.push(dep);
                }
            }
        }
    }

    fn mark_deleting(&self, st: &mut State, key: &ObjectKey) {
        if st.objects.get(key).map(|o| o.is_deleting()).unwrap_or(true) {
            return;
        }
        let rv = Self::next_rv(st);
        if let Some(obj) = st.objects.get_mut(key) {
            obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            obj.metadata.generation = Some(obj.generation() + 1);
            obj.metadata.resource_version = Some(rv);
            let snapshot = obj.clone();
            self.emit(WatchEvent::Applied(snapshot));
        }
    }

    pub fn inject(&self, fault: Fault) { self.lock().faults.push(fault); }

    /// Keep at most `cap` recorded calls; zero turns recording off.
    pub fn with_call_log(self, cap: usize) -> Self {
        {
            let mut st = self.lock();
            st.call_log_cap = cap;
            while st.calls.len() > cap {
                st.calls.pop_front();
            }
        }
        self
    }

    pub fn calls(&self) -> Vec<StoreCall> { self.lock().calls.iter().cloned().collect() }

    pub fn mutations(&self) -> Vec<StoreCall> {
        self.lock().calls.iter().filter(|c| c.op.is_mutation()).cloned().collect()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    /// Read without recording a call.
    pub fn peek(&self, key: &ObjectKey) -> Option<DynamicObject> { self.lock().objects.get(key).cloned() }

    /// All objects of a kind, without recording a call.
    pub fn snapshot(&self, kind: &str) -> Vec<DynamicObject> {
        self.lock().objects.values().filter(|o| o.kind() == Some(kind)).cloned().collect()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject> {
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::Get, key)?;
        st.objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, kind: &str, selector: &Selector) -> StoreResult<Vec<DynamicObject>> {
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::List, &ObjectKey::cluster(kind, "*"))?;
        Ok(st.objects.values().filter(|o| o.kind() == Some(kind) && selector.matches(o)).cloned().collect())
    }

    async fn watch(&self, kind: &str, selector: &Selector) -> StoreResult<WatchStream> {
        let (rx, initial) = {
            let mut st = self.lock();
            Self::enter(&mut st, StoreOp::Watch, &ObjectKey::cluster(kind, "*"))?;
            // subscribe under the lock so the relist and the event tail line up
            let rx = self.shared.events.subscribe();
            let initial: Vec<DynamicObject> =
                st.objects.values().filter(|o| o.kind() == Some(kind) && selector.matches(o)).cloned().collect();
            (rx, initial)
        };
        let kind = kind.to_string();
        let selector = selector.clone();
        let head = stream::once(async move { Ok(WatchEvent::Restarted(initial)) });
        let tail = stream::unfold(Some(rx), move |rx| {
            let kind = kind.clone();
            let selector = selector.clone();
            async move {
                let mut rx = rx?;
                loop {
                    match rx.recv().await {
                        Ok(ev) if event_matches(&ev, &kind, &selector) => return Some((Ok(ev), Some(rx))),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::Unavailable(format!("watch lagged by {n} events"))), None))
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(head.chain(tail).boxed())
    }

    async fn create(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = key_of(&obj)?;
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::Create, &key)?;
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        strip_status(&mut obj);
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        obj.metadata.deletion_timestamp = None;
        obj.metadata.resource_version = Some(Self::next_rv(&mut st));
        st.objects.insert(key, obj.clone());
        self.emit(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = key_of(&obj)?;
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::Update, &key)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_rv(&key, &obj, &live)?;

        // server-owned fields and status are not writable through this path
        obj.metadata.uid = live.metadata.uid.clone();
        obj.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
        obj.metadata.deletion_timestamp = live.metadata.deletion_timestamp.clone();
        obj.metadata.resource_version = live.metadata.resource_version.clone();
        obj.metadata.generation = live.metadata.generation;
        match live.data.get("status") {
            Some(s) => obj.set_status(s.clone()),
            None => strip_status(&mut obj),
        }
        if obj.spec() != live.spec() {
            obj.metadata.generation = Some(live.generation() + 1);
        }
        if same(&obj, &live) {
            return Ok(live);
        }

        let released = live.is_deleting() && obj.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
        if released {
            debug!(key = %key, "last finalizer removed; deleting");
            self.remove_cascading(&mut st, &key);
            return Ok(obj);
        }
        obj.metadata.resource_version = Some(Self::next_rv(&mut st));
        st.objects.insert(key, obj.clone());
        self.emit(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update_status(&self, obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = key_of(&obj)?;
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::UpdateStatus, &key)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))?;
        check_rv(&key, &obj, &live)?;
        let mut next = live.clone();
        match obj.status() {
            Some(s) => next.set_status(s.clone()),
            None => strip_status(&mut next),
        }
        if same(&next, &live) {
            return Ok(live);
        }
        next.metadata.resource_version = Some(Self::next_rv(&mut st));
        st.objects.insert(key, next.clone());
        self.emit(WatchEvent::Applied(next.clone()));
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut st = self.lock();
        Self::enter(&mut st, StoreOp::Delete, key)?;
        let live = st.objects.get(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let has_finalizers = live.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if has_finalizers {
            self.mark_deleting(&mut st, key);
        } else {
            self.remove_cascading(&mut st, key);
        }
        Ok(())
    }
}
