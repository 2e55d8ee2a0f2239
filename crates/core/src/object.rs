//! Accessors for the parts of a `DynamicObject` the engine reads and writes.
//!
//! `spec` and `status` live in the flattened `data` map; everything else is
//! standard `ObjectMeta`.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::CoreError;

/// How the engine treats a primary resource, read from `spec.managementState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ManagementState {
    /// Actively reconciled.
    #[default]
    Managed,
    /// Skipped entirely.
    Unmanaged,
    /// Managed resources are torn down; the primary is left alone.
    Removed,
}

impl ManagementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Managed => "Managed",
            Self::Unmanaged => "Unmanaged",
            Self::Removed => "Removed",
        }
    }
}

impl FromStr for ManagementState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Managed" => Ok(Self::Managed),
            "Unmanaged" => Ok(Self::Unmanaged),
            "Removed" => Ok(Self::Removed),
            other => Err(CoreError::InvalidManagementState(other.to_string())),
        }
    }
}

impl fmt::Display for ManagementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub trait ObjectExt {
    fn kind(&self) -> Option<&str>;
    fn api_version(&self) -> Option<&str>;
    fn spec(&self) -> Option<&Json>;
    fn status(&self) -> Option<&Json>;
    fn set_status(&mut self, status: Json);
    fn generation(&self) -> i64;
    fn is_deleting(&self) -> bool;
    fn has_finalizer(&self, token: &str) -> bool;
    /// Returns false when the token was already present.
    fn add_finalizer(&mut self, token: &str) -> bool;
    /// Returns false when the token was not present.
    fn remove_finalizer(&mut self, token: &str) -> bool;
    fn management_state(&self) -> Result<ManagementState, CoreError>;
    /// The owner reference flagged `controller: true`, if any.
    fn controller_owner(&self) -> Option<&OwnerReference>;
    fn is_controlled_by(&self, uid: &str) -> bool;
    /// A controller owner reference pointing at this object.
    fn owner_reference(&self) -> Result<OwnerReference, CoreError>;
}

impl ObjectExt for DynamicObject {
    fn kind(&self) -> Option<&str> { self.types.as_ref().map(|t| t.kind.as_str()) }

    fn api_version(&self) -> Option<&str> { self.types.as_ref().map(|t| t.api_version.as_str()) }

    fn spec(&self) -> Option<&Json> { self.data.get("spec") }

    fn status(&self) -> Option<&Json> { self.data.get("status").filter(|s| !s.is_null()) }

    fn set_status(&mut self, status: Json) {
        if !self.data.is_object() {
            self.data = Json::Object(serde_json::Map::new());
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert("status".into(), status);
        }
    }

    fn generation(&self) -> i64 { self.metadata.generation.unwrap_or(0) }

    fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    fn has_finalizer(&self, token: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|f| f.iter().any(|t| t == token)).unwrap_or(false)
    }

    fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.metadata.finalizers.get_or_insert_with(Vec::new).push(token.to_string());
        true
    }

    fn remove_finalizer(&mut self, token: &str) -> bool {
        let Some(list) = self.metadata.finalizers.as_mut() else { return false };
        let before = list.len();
        list.retain(|t| t != token);
        list.len() != before
    }

    fn management_state(&self) -> Result<ManagementState, CoreError> {
        match self.spec().and_then(|s| s.get("managementState")) {
            None | Some(Json::Null) => Ok(ManagementState::default()),
            Some(Json::String(s)) => s.parse(),
            Some(other) => Err(CoreError::InvalidManagementState(other.to_string())),
        }
    }

    fn controller_owner(&self) -> Option<&OwnerReference> {
        self.metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
    }

    fn is_controlled_by(&self, uid: &str) -> bool {
        self.controller_owner().map(|r| r.uid == uid).unwrap_or(false)
    }

    fn owner_reference(&self) -> Result<OwnerReference, CoreError> {
        let types = self.types.as_ref().ok_or(CoreError::MissingField("apiVersion/kind"))?;
        Ok(OwnerReference {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name: self.metadata.name.clone().ok_or(CoreError::MissingField("metadata.name"))?,
            uid: self.metadata.uid.clone().ok_or(CoreError::MissingField("metadata.uid"))?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}
