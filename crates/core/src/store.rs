//! Contract for the object store the engine reads from and writes to.

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use kube::core::DynamicObject;

use crate::{ObjectExt, ObjectKey, StoreError, StoreResult};

/// One change from a watch stream, shaped like kube's runtime watcher events.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object added or modified.
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist; objects missing from it were deleted while the stream was down.
    Restarted(Vec<DynamicObject>),
}

pub type WatchStream = BoxStream<'static, StoreResult<WatchEvent>>;

/// Namespace + equality label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn all() -> Self { Self::default() }

    pub fn in_namespace(ns: Option<&str>) -> Self {
        Self { namespace: ns.map(|s| s.to_string()), ..Self::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.metadata.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        let labels = obj.metadata.labels.as_ref();
        self.labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)).map(|have| have == v).unwrap_or(false))
    }

    /// `k=v,k2=v2` form for API-server list/watch calls.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
    }
}

/// Typed-object store consumed by the engine.
///
/// `update` writes metadata and spec and must ignore `status`; `update_status`
/// writes only `status`. Both reject a stale `resourceVersion` with
/// [`StoreError::Conflict`]. `delete` on an object with finalizers only marks
/// it for deletion.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<DynamicObject>;
    async fn list(&self, kind: &str, selector: &Selector) -> StoreResult<Vec<DynamicObject>>;
    async fn watch(&self, kind: &str, selector: &Selector) -> StoreResult<WatchStream>;
    async fn create(&self, obj: DynamicObject) -> StoreResult<DynamicObject>;
    async fn update(&self, obj: DynamicObject) -> StoreResult<DynamicObject>;
    async fn update_status(&self, obj: DynamicObject) -> StoreResult<DynamicObject>;
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    async fn get_status(&self, key: &ObjectKey) -> StoreResult<serde_json::Value> {
        let obj = self.get(key).await?;
        Ok(obj.status().cloned().unwrap_or(serde_json::Value::Null))
    }

    /// `get` that maps NotFound to `None`.
    async fn get_opt(&self, key: &ObjectKey) -> StoreResult<Option<DynamicObject>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    #[test]
    fn selector_matches_namespace_and_labels() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut obj = DynamicObject::new("cm", &ar).within("a");
        obj.metadata.labels = Some([("app".to_string(), "web".to_string())].into_iter().collect());

        assert!(Selector::all().matches(&obj));
        assert!(Selector::in_namespace(Some("a")).matches(&obj));
        assert!(!Selector::in_namespace(Some("b")).matches(&obj));
        assert!(Selector::all().with_label("app", "web").matches(&obj));
        assert!(!Selector::all().with_label("app", "db").matches(&obj));
        assert!(!Selector::all().with_label("tier", "web").matches(&obj));
    }

    #[test]
    fn label_selector_renders_sorted_pairs() {
        let sel = Selector::all().with_label("b", "2").with_label("a", "1");
        assert_eq!(sel.label_selector().as_deref(), Some("a=1,b=2"));
        assert_eq!(Selector::all().label_selector(), None);
    }
}
