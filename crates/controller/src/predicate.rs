//! Event filters deciding whether a watch event is worth a reconciliation pass.
//!
//! Built-in predicates approve `Create`, `Delete` and `Generic` events and
//! only look at the relevant fields of an `Update`.

use std::fmt;
use std::sync::Arc;

use kube::core::DynamicObject;

use reko_core::ObjectExt;

/// A change observed on a watched kind.
#[derive(Debug, Clone)]
pub enum Event {
    Create(DynamicObject),
    Update { old: DynamicObject, new: DynamicObject },
    Delete(DynamicObject),
    /// Externally triggered, no before/after pair.
    Generic(DynamicObject),
}

impl Event {
    /// The object the event is about: the new state, or the last known one for deletes.
    pub fn object(&self) -> &DynamicObject {
        match self {
            Self::Create(o) | Self::Delete(o) | Self::Generic(o) => o,
            Self::Update { new, .. } => new,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
            Self::Generic(_) => "generic",
        }
    }
}

pub trait Predicate: Send + Sync {
    fn should_enqueue(&self, event: &Event) -> bool;

    fn name(&self) -> &str { "custom" }
}

fn on_update(event: &Event, changed: impl Fn(&DynamicObject, &DynamicObject) -> bool) -> bool {
    match event {
        Event::Update { old, new } => changed(old, new),
        _ => true,
    }
}

/// Default filter: any write to the object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceVersionChanged;

impl Predicate for ResourceVersionChanged {
    fn should_enqueue(&self, event: &Event) -> bool {
        on_update(event, |old, new| old.metadata.resource_version != new.metadata.resource_version)
    }

    fn name(&self) -> &str { "resource_version" }
}

/// Spec changes (and deletion requests, which bump generation).
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationChanged;

impl Predicate for GenerationChanged {
    fn should_enqueue(&self, event: &Event) -> bool { on_update(event, |old, new| old.generation() != new.generation()) }

    fn name(&self) -> &str { "generation" }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LabelsChanged;

impl Predicate for LabelsChanged {
    fn should_enqueue(&self, event: &Event) -> bool {
        on_update(event, |old, new| old.metadata.labels != new.metadata.labels)
    }

    fn name(&self) -> &str { "labels" }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationsChanged;

impl Predicate for AnnotationsChanged {
    fn should_enqueue(&self, event: &Event) -> bool {
        on_update(event, |old, new| old.metadata.annotations != new.metadata.annotations)
    }

    fn name(&self) -> &str { "annotations" }
}

/// Any of the JSON pointers (into `data`, e.g. `/status/succeeded`) differs.
#[derive(Debug, Clone)]
pub struct FieldChanged {
    pointers: Vec<String>,
}

impl FieldChanged {
    pub fn new<I, S>(pointers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { pointers: pointers.into_iter().map(Into::into).collect() }
    }
}

impl Predicate for FieldChanged {
    fn should_enqueue(&self, event: &Event) -> bool {
        on_update(event, |old, new| self.pointers.iter().any(|p| old.data.pointer(p) != new.data.pointer(p)))
    }

    fn name(&self) -> &str { "field" }
}

/// Updates that set `deletionTimestamp`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionRequested;

impl Predicate for DeletionRequested {
    fn should_enqueue(&self, event: &Event) -> bool { on_update(event, |old, new| !old.is_deleting() && new.is_deleting()) }

    fn name(&self) -> &str { "deletion" }
}

/// Closure-backed predicate.
pub struct FnPredicate<F>(pub F);

impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn should_enqueue(&self, event: &Event) -> bool { (self.0)(event) }
}

/// Logical OR of its members; empty approves nothing.
#[derive(Clone, Default)]
pub struct AnyOf(Vec<Arc<dyn Predicate>>);

impl AnyOf {
    pub fn new() -> Self { Self::default() }

    pub fn or(mut self, p: impl Predicate + 'static) -> Self {
        self.0.push(Arc::new(p));
        self
    }
}

impl Predicate for AnyOf {
    fn should_enqueue(&self, event: &Event) -> bool { self.0.iter().any(|p| p.should_enqueue(event)) }

    fn name(&self) -> &str { "any_of" }
}

/// Changes a primary's reconciliation depends on: spec (generation),
/// deletion requests and labels. Status-only writes do not match.
pub fn spec_changes() -> AnyOf { AnyOf::new().or(GenerationChanged).or(DeletionRequested).or(LabelsChanged) }

/// Predicates attached to one watch; all must approve. An empty set falls
/// back to [`ResourceVersionChanged`].
#[derive(Clone, Default)]
pub struct Predicates(Vec<Arc<dyn Predicate>>);

impl Predicates {
    pub fn all() -> Self { Self::default() }

    pub fn and(mut self, p: impl Predicate + 'static) -> Self {
        self.0.push(Arc::new(p));
        self
    }

    pub fn push(&mut self, p: Arc<dyn Predicate>) { self.0.push(p); }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn should_enqueue(&self, event: &Event) -> bool {
        if self.0.is_empty() {
            return ResourceVersionChanged.should_enqueue(event);
        }
        self.0.iter().all(|p| p.should_enqueue(event))
    }

    /// Name of the first predicate that rejects the event.
    pub fn rejected_by(&self, event: &Event) -> Option<&str> {
        if self.0.is_empty() {
            return (!ResourceVersionChanged.should_enqueue(event)).then_some("resource_version");
        }
        self.0.iter().find(|p| !p.should_enqueue(event)).map(|p| p.name())
    }
}

impl fmt::Debug for Predicates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|p| p.name())).finish()
    }
}
