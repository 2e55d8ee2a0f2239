//! Reko controller runtime.
//!
//! Watches feed keys into one deduplicating work queue; workers run the
//! reconciler for one key at a time. Managed resources come from registered
//! [`ManagedComponent`]s, and their health is folded into the primary's
//! status.

#![forbid(unsafe_code)]

pub mod component;
pub mod components;
pub mod controller;
pub mod dispatch;
pub mod predicate;
pub mod reconciler;
pub mod status;

pub use component::{CleanupError, ComponentRegistry, DesiredStateError, ManagedComponent};
pub use controller::{Controller, ControllerBuilder, ControllerError};
pub use dispatch::{Keys, Mapper, WatchCache, WatchSpec};
pub use predicate::{
    AnnotationsChanged, AnyOf, DeletionRequested, Event, FieldChanged, FnPredicate, GenerationChanged, LabelsChanged,
    Predicate, Predicates, ResourceVersionChanged, spec_changes,
};
pub use reconciler::{Action, ReconcileError, ReconcileResult, Reconciler};
pub use status::{compute_status, merge_status, Health, Observation};
