//! Reko core types: object identity, object accessors, conditions and status,
//! the object store contract, and engine configuration.

#![forbid(unsafe_code)]

mod condition;
mod config;
mod error;
mod key;
mod object;
mod store;

pub use condition::{
    find_condition, new_condition, now, remove_condition, set_condition, ConditionStatus, Phase, ResourceStatus,
    FINALIZING, READY,
};
pub use config::{EngineConfig, DEFAULT_FINALIZER};
pub use error::{CoreError, StoreError, StoreResult};
pub use key::ObjectKey;
pub use object::{ManagementState, ObjectExt};
pub use store::{ObjectStore, Selector, WatchEvent, WatchStream};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference};
pub use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

pub mod prelude {
    pub use super::{
        DynamicObject, EngineConfig, ManagementState, ObjectExt, ObjectKey, ObjectStore, Phase, ResourceStatus,
        Selector, StoreError, StoreResult, WatchEvent,
    };
}
