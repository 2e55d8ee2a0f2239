//! Watch dispatch: one task per watched kind turns store watch events into
//! reconciliation keys on the shared work queue.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use kube::core::DynamicObject;
use metrics::counter;
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use reko_core::{ObjectExt, ObjectKey, ObjectStore, Selector, WatchEvent};
use reko_queue::{ExponentialBackoff, WorkQueue};

use crate::predicate::{spec_changes, Event, Predicate, Predicates};

pub type Keys = SmallVec<[ObjectKey; 1]>;
pub type MapFn = Arc<dyn Fn(&DynamicObject) -> Keys + Send + Sync>;

/// How an event on a watched object turns into primary keys.
#[derive(Clone)]
pub enum Mapper {
    /// The object is itself a primary.
    Primary,
    /// Follow the controller owner reference to a primary of `owner_kind`.
    Owned { owner_kind: String },
    /// Related but not owned objects; may fan out to any number of primaries.
    Mapped(MapFn),
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("Primary"),
            Self::Owned { owner_kind } => f.debug_struct("Owned").field("owner_kind", owner_kind).finish(),
            Self::Mapped(_) => f.write_str("Mapped"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("object has no usable identity: {0}")]
    Identity(#[from] reko_core::CoreError),
    #[error("owner reference on {0} has an empty name")]
    MalformedOwner(String),
}

impl Mapper {
    /// Keys to enqueue for `obj`. Owner lookup reads only the object's own
    /// owner references and never walks further.
    pub fn resolve(&self, obj: &DynamicObject) -> Result<Keys, ResolveError> {
        match self {
            Self::Primary => Ok(smallvec![ObjectKey::from_object(obj)?]),
            Self::Owned { owner_kind } => {
                let Some(owner) = obj.controller_owner() else { return Ok(Keys::new()) };
                if owner.kind != *owner_kind {
                    return Ok(Keys::new());
                }
                if owner.name.is_empty() {
                    return Err(ResolveError::MalformedOwner(obj.metadata.name.clone().unwrap_or_default()));
                }
                Ok(smallvec![ObjectKey::new(owner_kind.clone(), obj.metadata.namespace.as_deref(), owner.name.clone())])
            }
            Self::Mapped(f) => Ok(f(obj)),
        }
    }
}

/// One watched kind: what to watch, how to map it, what to let through.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub kind: String,
    pub selector: Selector,
    pub mapper: Mapper,
    pub predicates: Predicates,
    /// `predicates` is a default that the first explicit predicate replaces.
    defaulted: bool,
}

impl WatchSpec {
    pub fn new(kind: impl Into<String>, mapper: Mapper) -> Self {
        Self { kind: kind.into(), selector: Selector::all(), mapper, predicates: Predicates::all(), defaulted: false }
    }

    /// Primary watch filtered by [`spec_changes`] until a predicate is set, so
    /// the engine's own status writes do not trigger another pass.
    pub fn primary(kind: impl Into<String>) -> Self {
        let mut spec = Self::new(kind, Mapper::Primary);
        spec.predicates = Predicates::all().and(spec_changes());
        spec.defaulted = true;
        spec
    }

    pub fn owned(kind: impl Into<String>, owner_kind: impl Into<String>) -> Self {
        Self::new(kind, Mapper::Owned { owner_kind: owner_kind.into() })
    }

    pub fn mapped<F>(kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(&DynamicObject) -> Keys + Send + Sync + 'static,
    {
        Self::new(kind, Mapper::Mapped(Arc::new(f)))
    }

    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn predicate(mut self, p: impl Predicate + 'static) -> Self {
        if std::mem::take(&mut self.defaulted) {
            self.predicates = Predicates::all();
        }
        self.predicates = self.predicates.and(p);
        self
    }
}

/// Last-seen objects of one watch, used to turn watch events into
/// create/update/delete events.
#[derive(Default)]
pub struct WatchCache {
    objects: FxHashMap<ObjectKey, DynamicObject>,
}

impl WatchCache {
    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn apply(&mut self, ev: WatchEvent) -> Vec<Event> {
        match ev {
            WatchEvent::Applied(obj) => match ObjectKey::from_object(&obj) {
                Ok(key) => match self.objects.insert(key, obj.clone()) {
                    Some(old) => vec![Event::Update { old, new: obj }],
                    None => vec![Event::Create(obj)],
                },
                Err(_) => vec![Event::Generic(obj)],
            },
            WatchEvent::Deleted(obj) => {
                if let Ok(key) = ObjectKey::from_object(&obj) {
                    self.objects.remove(&key);
                }
                vec![Event::Delete(obj)]
            }
            WatchEvent::Restarted(list) => {
                let mut previous = std::mem::take(&mut self.objects);
                let mut out = Vec::with_capacity(list.len());
                for obj in list {
                    let Ok(key) = ObjectKey::from_object(&obj) else {
                        out.push(Event::Generic(obj));
                        continue;
                    };
                    match previous.remove(&key) {
                        Some(old) => out.push(Event::Update { old, new: obj.clone() }),
                        None => out.push(Event::Create(obj.clone())),
                    }
                    self.objects.insert(key, obj);
                }
                // gone while the stream was down
                out.extend(previous.into_values().map(Event::Delete));
                out
            }
        }
    }
}

/// Filter and map one event onto the queue. Returns the number of keys added.
pub fn dispatch(spec: &WatchSpec, queue: &WorkQueue<ObjectKey>, event: &Event) -> usize {
    if let Some(by) = spec.predicates.rejected_by(event) {
        trace!(kind = %spec.kind, event = event.as_str(), predicate = by, "event filtered");
        counter!("dispatch_dropped_total", 1, "kind" => spec.kind.clone(), "reason" => "predicate");
        return 0;
    }
    match spec.mapper.resolve(event.object()) {
        Ok(keys) => {
            for key in &keys {
                trace!(kind = %spec.kind, event = event.as_str(), key = %key, "enqueue");
                queue.add(key.clone());
            }
            counter!("dispatch_events_total", keys.len() as u64, "kind" => spec.kind.clone());
            keys.len()
        }
        Err(e) => {
            warn!(kind = %spec.kind, event = event.as_str(), error = %e, "dropping event");
            counter!("dispatch_dropped_total", 1, "kind" => spec.kind.clone(), "reason" => "unresolved");
            0
        }
    }
}

/// Run one watch until `token` is cancelled. Stream failures restart the
/// watch after a capped backoff; the relist on restart covers the gap.
pub async fn run_watch(
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    spec: WatchSpec,
    backoff: ExponentialBackoff,
    token: CancellationToken,
) {
    let mut cache = WatchCache::default();
    let mut failures: u32 = 0;
    info!(kind = %spec.kind, mapper = ?spec.mapper, predicates = ?spec.predicates, "watch started");

    loop {
        let opened = tokio::select! {
            _ = token.cancelled() => break,
            r = store.watch(&spec.kind, &spec.selector) => r,
        };
        match opened {
            Ok(mut stream) => loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    n = stream.next() => n,
                };
                match next {
                    Some(Ok(ev)) => {
                        failures = 0;
                        for event in cache.apply(ev) {
                            dispatch(&spec, &queue, &event);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(kind = %spec.kind, error = %e, "watch stream error");
                        break;
                    }
                    None => {
                        debug!(kind = %spec.kind, "watch stream ended");
                        break;
                    }
                }
            },
            Err(e) => warn!(kind = %spec.kind, error = %e, "watch failed to start"),
        }
        if token.is_cancelled() {
            break;
        }
        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        debug!(kind = %spec.kind, delay_ms = delay.as_millis() as u64, "restarting watch");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!(kind = %spec.kind, cached = cache.len(), "watch stopped");
}
