//! Aggregates per-object health into the primary's phase and `Ready` condition.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

use reko_core::{new_condition, set_condition, ConditionStatus, ObjectKey, Phase, ResourceStatus, READY};

/// Health of one managed object as its component reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Exists but has not started converging.
    Pending,
    Progressing,
    /// Steady-state and serving.
    Ready,
    /// Ran to completion (batch-style objects).
    Complete,
    Failed { reason: String, message: String },
}

impl Health {
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into(), message: message.into() }
    }

    pub fn is_ready(&self) -> bool { matches!(self, Self::Ready | Self::Complete) }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Progressing => "Progressing",
            Self::Ready => "Ready",
            Self::Complete => "Complete",
            Self::Failed { .. } => "Failed",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub component: String,
    pub key: ObjectKey,
    pub health: Health,
}

/// Phase and conditions for a set of observations.
///
/// Any failure wins, then anything progressing, then anything pending (or
/// nothing observed at all); only when every object is ready or complete is
/// the primary `Succeeded`.
pub fn compute_status(observations: &[Observation], generation: Option<i64>) -> (Phase, Vec<Condition>) {
    let total = observations.len();
    let ready = observations.iter().filter(|o| o.health.is_ready()).count();

    if let Some((o, reason, message)) = observations.iter().find_map(|o| match &o.health {
        Health::Failed { reason, message } => Some((o, reason, message)),
        _ => None,
    }) {
        let msg = format!("{} {}: {}", o.component, o.key, message);
        return (Phase::Failed, vec![new_condition(READY, ConditionStatus::False, reason, msg, generation)]);
    }
    if observations.iter().any(|o| o.health == Health::Progressing) {
        let msg = format!("{ready}/{total} managed resources ready");
        return (Phase::Running, vec![new_condition(READY, ConditionStatus::Unknown, "Progressing", msg, generation)]);
    }
    if total == 0 {
        let cond = new_condition(READY, ConditionStatus::Unknown, "NoManagedResources", "no managed resources observed", generation);
        return (Phase::Pending, vec![cond]);
    }
    if observations.iter().any(|o| o.health == Health::Pending) {
        let msg = format!("waiting for {} of {total} managed resources", total - ready);
        return (Phase::Pending, vec![new_condition(READY, ConditionStatus::Unknown, "Pending", msg, generation)]);
    }
    let msg = format!("all {total} managed resources ready");
    (Phase::Succeeded, vec![new_condition(READY, ConditionStatus::True, "Reconciled", msg, generation)])
}

/// `current` with the computed phase and conditions merged in.
/// Unchanged condition statuses keep their `lastTransitionTime`, so merging
/// the same result twice yields an equal status.
pub fn merge_status(
    current: &ResourceStatus,
    phase: Phase,
    conditions: Vec<Condition>,
    observations: &[Observation],
    generation: i64,
) -> ResourceStatus {
    let mut next = current.clone();
    next.phase = Some(phase);
    for cond in conditions {
        set_condition(&mut next.conditions, cond);
    }
    next.observed_generation = Some(generation);
    next.managed = observations.len() as u32;
    next.ready = observations.iter().filter(|o| o.health.is_ready()).count() as u32;
    next
}
