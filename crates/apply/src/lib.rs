//! Reko apply: keeps managed resources in line with what a component desires.
//!
//! Only the fields a desired object declares are owned: every top-level
//! `data` key other than `status`, plus the desired labels and annotations.
//! Anything else on the live object (server defaults, fields written by other
//! actors) is left alone. A managed resource has exactly one controller owner;
//! objects controlled by someone else are never touched.
//!
//! Fields the store refuses to change in place can be declared immutable:
//! drift there deletes the object so the next apply creates it afresh.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use metrics::counter;
use reko_core::{CoreError, ObjectExt, ObjectKey, ObjectStore, Selector, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{key} is controlled by another owner (uid {owner_uid})")]
    ForeignOwner { key: ObjectKey, owner_uid: String },
    #[error("invalid object: {0}")]
    Invalid(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApplyError {
    /// Create races and stale writes settle on the next pass.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type ApplyResult<T> = Result<T, ApplyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    /// Deleted for recreation; the object returned is the terminating copy.
    Replaced,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Replaced => "replaced",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// The object as the store holds it after the call.
#[derive(Debug, Clone)]
pub struct Applied {
    pub object: DynamicObject,
    pub outcome: Outcome,
}

/// Controller owner reference pointing at `owner`.
pub fn owner_reference(owner: &DynamicObject) -> ApplyResult<OwnerReference> { Ok(owner.owner_reference()?) }

fn owner_uid(owner: &DynamicObject) -> ApplyResult<&str> {
    owner.metadata.uid.as_deref().ok_or(ApplyError::Invalid(CoreError::MissingField("metadata.uid")))
}

/// Add `oref` unless an entry for the same uid is already present.
/// Returns whether the list changed.
fn link_owner(obj: &mut DynamicObject, oref: &OwnerReference) -> bool {
    let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
    if refs.iter().any(|r| r.uid == oref.uid) {
        return false;
    }
    refs.push(oref.clone());
    true
}

/// `want` is satisfied by `have`: objects compare key by key (keys only in
/// `have` are ignored), everything else compares equal.
fn contains(want: &Json, have: &Json) -> bool {
    match (want, have) {
        (Json::Object(w), Json::Object(h)) => {
            w.iter().all(|(k, wv)| match h.get(k) {
                Some(hv) => contains(wv, hv),
                None => wv.is_null(),
            })
        }
        (Json::Array(w), Json::Array(h)) => w.len() == h.len() && w.iter().zip(h).all(|(a, b)| contains(a, b)),
        _ => want == have,
    }
}

fn map_contains(want: &Option<BTreeMap<String, String>>, have: &Option<BTreeMap<String, String>>) -> bool {
    let Some(want) = want else { return true };
    want.iter().all(|(k, v)| have.as_ref().and_then(|h| h.get(k)) == Some(v))
}

fn owned_keys(desired: &DynamicObject) -> impl Iterator<Item = (&String, &Json)> {
    desired.data.as_object().into_iter().flat_map(|m| m.iter()).filter(|(k, _)| k.as_str() != "status")
}

fn pointer_in_sync(desired: &DynamicObject, live: &DynamicObject, pointer: &str) -> bool {
    match desired.data.pointer(pointer) {
        Some(want) => live.data.pointer(pointer).map(|have| contains(want, have)).unwrap_or(want.is_null()),
        None => true,
    }
}

/// Whether `live` already carries every owned field of `desired`.
pub fn in_sync(desired: &DynamicObject, live: &DynamicObject) -> bool {
    owned_keys(desired).all(|(k, v)| live.data.get(k).map(|have| contains(v, have)).unwrap_or(v.is_null()))
        && map_contains(&desired.metadata.labels, &live.metadata.labels)
        && map_contains(&desired.metadata.annotations, &live.metadata.annotations)
}

/// Write `want` under `key`, recursing into objects so keys `want` does not
/// name are left alone. Scalars and arrays replace; `null` removes.
fn merge_into(target: &mut serde_json::Map<String, Json>, key: &str, want: &Json) {
    match want {
        Json::Null => {
            target.remove(key);
        }
        Json::Object(w) => {
            let slot = target.entry(key.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()));
            if !slot.is_object() {
                *slot = Json::Object(serde_json::Map::new());
            }
            if let Some(inner) = slot.as_object_mut() {
                for (k, v) in w {
                    merge_into(inner, k, v);
                }
            }
        }
        _ => {
            target.insert(key.to_string(), want.clone());
        }
    }
}

/// Overwrite the owned fields of `live` with the desired values.
fn merge_owned(desired: &DynamicObject, live: &mut DynamicObject) {
    if !live.data.is_object() {
        live.data = Json::Object(serde_json::Map::new());
    }
    if let Some(target) = live.data.as_object_mut() {
        for (k, v) in owned_keys(desired) {
            merge_into(target, k, v);
        }
    }
    for (want, have) in [
        (&desired.metadata.labels, &mut live.metadata.labels),
        (&desired.metadata.annotations, &mut live.metadata.annotations),
    ] {
        if let Some(want) = want {
            let have = have.get_or_insert_with(BTreeMap::new);
            for (k, v) in want {
                have.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Create `desired` as a resource controlled by `owner`, or bring an existing
/// one back in line with it.
///
/// The desired object inherits the owner's namespace when it names none. An
/// existing object without a controller is adopted; one controlled by another
/// owner is refused with [`ApplyError::ForeignOwner`]. Writes go through the
/// live `resourceVersion`, so a concurrent change surfaces as a transient
/// conflict.
pub async fn create_or_update(store: &dyn ObjectStore, owner: &DynamicObject, desired: DynamicObject) -> ApplyResult<Applied> {
    apply_with(store, owner, desired, &[]).await
}

/// [`create_or_update`] for objects with immutable fields, given as JSON
/// pointers into `data` (e.g. `/spec/template`). When one of them drifted the
/// live object is deleted and [`Outcome::Replaced`] returned; the following
/// apply creates it again once the deletion finished.
pub async fn apply_with(
    store: &dyn ObjectStore,
    owner: &DynamicObject,
    mut desired: DynamicObject,
    immutable: &[&str],
) -> ApplyResult<Applied> {
    let oref = owner_reference(owner)?;
    if desired.metadata.namespace.is_none() {
        desired.metadata.namespace = owner.metadata.namespace.clone();
    }
    let key = ObjectKey::from_object(&desired)?;

    let Some(mut live) = store.get_opt(&key).await? else {
        desired.metadata.resource_version = None;
        desired.metadata.uid = None;
        link_owner(&mut desired, &oref);
        let object = store.create(desired).await?;
        counter!("managed_apply_total", 1, "outcome" => Outcome::Created.as_str());
        info!(key = %key, owner = ?owner.metadata.name, "managed resource created");
        return Ok(Applied { object, outcome: Outcome::Created });
    };

    if let Some(controller) = live.controller_owner() {
        if controller.uid != oref.uid {
            return Err(ApplyError::ForeignOwner { key, owner_uid: controller.uid.clone() });
        }
    }

    if live.is_deleting() && live.is_controlled_by(&oref.uid) {
        debug!(key = %key, "managed resource still terminating");
        return Ok(Applied { object: live, outcome: Outcome::Replaced });
    }
    if let Some(field) = immutable.iter().copied().find(|p| !pointer_in_sync(&desired, &live, p)) {
        info!(key = %key, field, "immutable field drifted; recreating managed resource");
        match store.delete(&key).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        counter!("managed_apply_total", 1, "outcome" => Outcome::Replaced.as_str());
        return Ok(Applied { object: live, outcome: Outcome::Replaced });
    }

    let adopted = live.controller_owner().is_none() && link_owner(&mut live, &oref);
    if !adopted && in_sync(&desired, &live) {
        counter!("managed_apply_total", 1, "outcome" => Outcome::Unchanged.as_str());
        return Ok(Applied { object: live, outcome: Outcome::Unchanged });
    }

    let summary = object_diff(&desired, &live);
    debug!(key = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, adopted, "updating managed resource");
    merge_owned(&desired, &mut live);
    let object = store.update(live).await?;
    counter!("managed_apply_total", 1, "outcome" => Outcome::Updated.as_str());
    Ok(Applied { object, outcome: Outcome::Updated })
}

/// Objects of `kind` in the owner's namespace whose controller is `owner`.
pub async fn list_owned(store: &dyn ObjectStore, owner: &DynamicObject, kind: &str) -> ApplyResult<Vec<DynamicObject>> {
    let uid = owner_uid(owner)?;
    let all = store.list(kind, &Selector::in_namespace(owner.metadata.namespace.as_deref())).await?;
    Ok(all.into_iter().filter(|o| o.is_controlled_by(uid)).collect())
}

/// Request deletion of every owned object of `kinds` not in `keep`.
/// Returns how many owned objects were still present, including ones already
/// terminating. Objects that vanish mid-way count as deleted.
pub async fn prune_owned(
    store: &dyn ObjectStore,
    owner: &DynamicObject,
    kinds: &[String],
    keep: &BTreeSet<ObjectKey>,
) -> ApplyResult<usize> {
    let mut remaining = 0;
    for kind in kinds {
        for obj in list_owned(store, owner, kind).await? {
            let key = ObjectKey::from_object(&obj)?;
            if keep.contains(&key) {
                continue;
            }
            remaining += 1;
            if obj.is_deleting() {
                continue;
            }
            match store.delete(&key).await {
                Ok(()) => debug!(key = %key, "owned object deleted"),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(remaining)
}

/// Delete every owned object of `kinds`; see [`prune_owned`] for the count.
pub async fn delete_owned(store: &dyn ObjectStore, owner: &DynamicObject, kinds: &[String]) -> ApplyResult<usize> {
    prune_owned(store, owner, kinds, &BTreeSet::new()).await
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "ownerReferences"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count field-level differences between a desired and a live object,
/// ignoring server-populated metadata and status.
pub fn object_diff(desired: &DynamicObject, live: &DynamicObject) -> DiffSummary {
    let a = serde_json::to_value(desired).map(strip_noisy).unwrap_or(Json::Null);
    let b = serde_json::to_value(live).map(strip_noisy).unwrap_or(Json::Null);
    diff_summary(&a, &b)
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    out.updates += 1;
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}
