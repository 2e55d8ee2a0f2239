//! One reconciliation pass for one primary key.
//!
//! Pass order: fetch, deletion handling, management state, finalizer,
//! desired state, apply and prune, status, requeue decision. Every step is
//! idempotent; a pass that finds nothing to change writes nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use reko_apply::{apply_with, delete_owned, prune_owned, ApplyError, Outcome};
use reko_core::{
    new_condition, remove_condition, set_condition, ConditionStatus, EngineConfig, ManagementState, ObjectExt,
    ObjectKey, ObjectStore, Phase, ResourceStatus, StoreError, FINALIZING, READY,
};

use crate::component::{CleanupError, ComponentRegistry, DesiredStateError};
use crate::status::{compute_status, merge_status, Health, Observation};

/// What the worker does with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next watch event.
    Await,
    /// Re-run after the delay; zero means right away.
    Requeue(Duration),
}

impl Action {
    pub fn requeue_now() -> Self { Self::Requeue(Duration::ZERO) }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("cleanup by {component} failed: {source}")]
    Cleanup {
        component: String,
        #[source]
        source: CleanupError,
    },
    #[error("pass timed out after {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Store(e) if e.is_transient() => "store_transient",
            Self::Store(_) => "store",
            Self::Apply(e) if e.is_transient() => "apply_transient",
            Self::Apply(_) => "apply",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::Cleanup { .. } => "cleanup",
            Self::Timeout(_) => "timeout",
        }
    }

    /// A not-found error for `key` itself.
    pub fn is_not_found(&self, key: &ObjectKey) -> bool {
        match self {
            Self::Store(StoreError::NotFound(k)) | Self::Apply(ApplyError::Store(StoreError::NotFound(k))) => k == key,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Apply(e) => e.is_transient(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<DesiredStateError> for ReconcileError {
    fn from(e: DesiredStateError) -> Self { Self::InvalidSpec(e.to_string()) }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Store and components are injected; one reconciler serves every worker.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    components: Arc<ComponentRegistry>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, components: Arc<ComponentRegistry>, config: EngineConfig) -> Self {
        Self { store, components, config }
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub fn components(&self) -> &ComponentRegistry { &self.components }

    /// Run one pass. The primary vanishing mid-pass ends it without error.
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult<Action> {
        match self.pass(key).await {
            Err(e) if e.is_not_found(key) => {
                debug!(key = %key, "primary deleted mid-pass");
                Ok(Action::Await)
            }
            other => other,
        }
    }

    async fn pass(&self, key: &ObjectKey) -> ReconcileResult<Action> {
        let Some(primary) = self.store.get_opt(key).await? else {
            debug!(key = %key, "primary gone");
            return Ok(Action::Await);
        };

        if primary.is_deleting() {
            return self.finalize(key, primary).await;
        }

        let state = match primary.management_state() {
            Ok(state) => state,
            Err(e) => return Err(self.record_invalid_spec(key, &primary, e.to_string()).await),
        };
        match state {
            ManagementState::Unmanaged => {
                debug!(key = %key, "unmanaged; skipping");
                return Ok(Action::Await);
            }
            ManagementState::Removed => return self.remove(key, primary).await,
            ManagementState::Managed => {}
        }

        let token = &self.config.finalizer_token;
        if !primary.has_finalizer(token) {
            let mut next = primary;
            next.add_finalizer(token);
            self.store.update(next).await?;
            info!(key = %key, finalizer = %token, "finalizer added");
            return Ok(Action::requeue_now());
        }

        // every component's desired state first, so a bad spec writes nothing
        let mut plan = Vec::with_capacity(self.components.len());
        for component in self.components.iter() {
            match component.desired(&primary) {
                Ok(objects) => plan.push((component, objects)),
                Err(e) => {
                    let message = format!("{}: {}", component.name(), e);
                    return Err(self.record_invalid_spec(key, &primary, message).await);
                }
            }
        }

        let mut observations = Vec::new();
        for (component, objects) in plan {
            let mut keep = BTreeSet::new();
            for desired in objects {
                let applied = apply_with(self.store.as_ref(), &primary, desired, component.immutable_fields()).await?;
                let obj_key = ObjectKey::from_object(&applied.object).map_err(|e| ReconcileError::InvalidSpec(e.to_string()))?;
                let health = match applied.outcome {
                    Outcome::Replaced => Health::Progressing,
                    _ => component.observe(&applied.object),
                };
                debug!(key = %key, object = %obj_key, outcome = %applied.outcome, health = %health, "managed resource");
                keep.insert(obj_key.clone());
                observations.push(Observation { component: component.name().to_string(), key: obj_key, health });
            }
            let stale = prune_owned(self.store.as_ref(), &primary, &component.kinds(), &keep).await?;
            if stale > 0 {
                info!(key = %key, component = component.name(), stale, "pruned managed resources");
            }
        }

        let generation = primary.generation();
        let (phase, conditions) = compute_status(&observations, Some(generation));
        let current = ResourceStatus::from_object(&primary);
        let mut next = merge_status(&current, phase, conditions, &observations, generation);
        remove_condition(&mut next.conditions, FINALIZING);
        self.write_status(key, primary, &current, &next).await?;

        let completed = observations.iter().any(|o| o.health == Health::Complete);
        Ok(match phase {
            Phase::Pending | Phase::Running => Action::Requeue(self.config.requeue_interval),
            Phase::Failed => Action::Requeue(self.config.terminal_requeue_interval),
            Phase::Succeeded if completed => Action::Requeue(self.config.terminal_requeue_interval),
            Phase::Succeeded | Phase::Removed => Action::Await,
        })
    }

    /// Deletion requested: run cleanup, then release the finalizer.
    async fn finalize(&self, key: &ObjectKey, primary: DynamicObject) -> ReconcileResult<Action> {
        let token = &self.config.finalizer_token;
        if !primary.has_finalizer(token) {
            return Ok(Action::Await);
        }
        for component in self.components.iter() {
            if let Err(source) = component.cleanup(&primary, self.store.as_ref()).await {
                warn!(key = %key, component = component.name(), error = %source, "cleanup failed; keeping finalizer");
                let cond = new_condition(
                    FINALIZING,
                    ConditionStatus::False,
                    "CleanupFailed",
                    format!("{}: {}", component.name(), source),
                    Some(primary.generation()),
                );
                self.record_condition(key, &primary, cond, None).await;
                return Err(ReconcileError::Cleanup { component: component.name().to_string(), source });
            }
        }
        let mut next = primary;
        next.remove_finalizer(token);
        match self.store.update(next).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {
                info!(key = %key, "cleanup done; finalizer removed");
                Ok(Action::Await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `managementState: Removed`: tear down owned objects, keep the primary.
    async fn remove(&self, key: &ObjectKey, primary: DynamicObject) -> ReconcileResult<Action> {
        let remaining = delete_owned(self.store.as_ref(), &primary, &self.components.owned_kinds()).await?;
        if remaining > 0 {
            info!(key = %key, remaining, "removing managed resources");
            return Ok(Action::Requeue(self.config.removal_requeue_interval));
        }
        let generation = primary.generation();
        let current = ResourceStatus::from_object(&primary);
        let mut next = current.clone();
        next.phase = Some(Phase::Removed);
        next.observed_generation = Some(generation);
        next.managed = 0;
        next.ready = 0;
        set_condition(
            &mut next.conditions,
            new_condition(READY, ConditionStatus::False, "Removed", "managed resources removed", Some(generation)),
        );
        self.write_status(key, primary, &current, &next).await?;
        Ok(Action::Await)
    }

    async fn record_invalid_spec(&self, key: &ObjectKey, primary: &DynamicObject, message: String) -> ReconcileError {
        warn!(key = %key, error = %message, "invalid spec");
        let cond = new_condition(READY, ConditionStatus::False, "InvalidSpec", message.clone(), Some(primary.generation()));
        self.record_condition(key, primary, cond, Some(Phase::Failed)).await;
        ReconcileError::InvalidSpec(message)
    }

    /// Best-effort status write on an error path; failures are only logged.
    async fn record_condition(&self, key: &ObjectKey, primary: &DynamicObject, cond: reko_core::Condition, phase: Option<Phase>) {
        let current = ResourceStatus::from_object(primary);
        let mut next = current.clone();
        set_condition(&mut next.conditions, cond);
        if phase.is_some() {
            next.phase = phase;
        }
        if let Err(e) = self.write_status(key, primary.clone(), &current, &next).await {
            warn!(key = %key, error = %e, "failed to record status condition");
        }
    }

    /// Status-path write, skipped when nothing changed.
    async fn write_status(&self, key: &ObjectKey, mut primary: DynamicObject, current: &ResourceStatus, next: &ResourceStatus) -> ReconcileResult<()> {
        if current == next {
            debug!(key = %key, "status unchanged");
            return Ok(());
        }
        primary.set_status(next.to_json());
        match self.store.update_status(primary).await {
            Ok(_) => {
                debug!(key = %key, phase = ?next.phase, "status written");
                Ok(())
            }
            // deleted mid-pass
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
