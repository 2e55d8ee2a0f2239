//! The capability contract every managed component implements, and the
//! name-keyed registry the reconciler iterates.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::DynamicObject;

use reko_core::ObjectStore;

use crate::status::Health;
use crate::ControllerError;

/// The primary's spec cannot be turned into desired objects.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DesiredStateError {
    #[error("spec.{field}: {message}")]
    Field { field: String, message: String },
    #[error("{0}")]
    Invalid(String),
}

impl DesiredStateError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field { field: field.into(), message: message.into() }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CleanupError {
    pub message: String,
}

impl CleanupError {
    pub fn new(message: impl Into<String>) -> Self { Self { message: message.into() } }
}

/// One kind of managed resource a primary owns.
///
/// `desired` must be pure: same primary in, same objects out. Owned objects
/// are garbage collected through their owner reference once the primary is
/// gone; `cleanup` is for state outside the store.
#[async_trait::async_trait]
pub trait ManagedComponent: Send + Sync {
    fn name(&self) -> &str;

    /// Kinds of the objects `desired` returns; owned objects of these kinds
    /// that are no longer desired get pruned.
    fn kinds(&self) -> Vec<String>;

    fn desired(&self, primary: &DynamicObject) -> Result<Vec<DynamicObject>, DesiredStateError>;

    fn observe(&self, object: &DynamicObject) -> Health;

    /// JSON pointers into `data` the store will not change in place; drift
    /// there recreates the object.
    fn immutable_fields(&self) -> &[&'static str] { &[] }

    async fn cleanup(&self, _primary: &DynamicObject, _store: &dyn ObjectStore) -> Result<(), CleanupError> { Ok(()) }
}

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Arc<dyn ManagedComponent>>,
}

impl ComponentRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, component: Arc<dyn ManagedComponent>) -> Result<(), ControllerError> {
        let name = component.name().to_string();
        if name.is_empty() {
            return Err(ControllerError::InvalidComponent("component name must not be empty".into()));
        }
        if self.components.contains_key(&name) {
            return Err(ControllerError::DuplicateComponent(name));
        }
        self.components.insert(name, component);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ManagedComponent>> { self.components.get(name) }

    /// Components in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ManagedComponent>> { self.components.values() }

    pub fn len(&self) -> usize { self.components.len() }

    pub fn is_empty(&self) -> bool { self.components.is_empty() }

    /// Every kind any component manages, deduplicated and sorted.
    pub fn owned_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.iter().flat_map(|c| c.kinds()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}
