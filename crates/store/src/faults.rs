//! Call recording and scripted failures, for exercising engine error paths.

use reko_core::{ObjectKey, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    List,
    Watch,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::UpdateStatus => "update_status",
            Self::Delete => "delete",
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::UpdateStatus | Self::Delete)
    }
}

/// One recorded call. `target` is the object key, or `kind/*` for list and watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Unavailable,
    Conflict,
    Timeout,
}

/// Fail the next `times` calls of `op` (optionally only for one kind).
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: StoreOp,
    pub kind: Option<String>,
    pub times: u32,
    pub error: FaultKind,
}

impl Fault {
    pub fn new(op: StoreOp, error: FaultKind) -> Self { Self { op, kind: None, times: 1, error } }

    pub fn for_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.times = n;
        self
    }

    pub(crate) fn hits(&self, op: StoreOp, kind: &str) -> bool {
        self.times > 0 && self.op == op && self.kind.as_deref().map(|k| k == kind).unwrap_or(true)
    }

    pub(crate) fn to_error(&self, key: &ObjectKey) -> StoreError {
        match self.error {
            FaultKind::Unavailable => StoreError::Unavailable(format!("injected {} failure", self.op.as_str())),
            FaultKind::Conflict => StoreError::conflict(key.clone(), "injected conflict"),
            FaultKind::Timeout => StoreError::Timeout,
        }
    }
}
