use std::fmt;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Identity of an object and the unit of work-queue deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    pub fn namespaced(kind: impl Into<String>, namespace: &str, name: impl Into<String>) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, None, name)
    }

    /// Key of an object; requires `kind` in the type meta and `metadata.name`.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, CoreError> {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .filter(|k| !k.is_empty())
            .ok_or(CoreError::MissingField("kind"))?;
        let name = obj.metadata.name.as_deref().ok_or(CoreError::MissingField("metadata.name"))?;
        Ok(Self::new(kind, obj.metadata.namespace.as_deref(), name))
    }

    /// Same namespace and name under another kind.
    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}
