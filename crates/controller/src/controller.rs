//! Controller assembly and the worker runtime.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reko_core::{CoreError, EngineConfig, ObjectKey, ObjectStore, Selector};
use reko_queue::{ExponentialBackoff, WorkQueue};

use crate::component::{ComponentRegistry, ManagedComponent};
use crate::dispatch::{run_watch, WatchSpec};
use crate::predicate::Predicate;
use crate::reconciler::{Action, ReconcileError, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("no managed components registered")]
    NoComponents,
    #[error("component {0:?} registered twice")]
    DuplicateComponent(String),
    #[error("invalid component: {0}")]
    InvalidComponent(String),
    #[error(transparent)]
    InvalidConfig(#[from] CoreError),
}

pub struct ControllerBuilder {
    store: Arc<dyn ObjectStore>,
    primary: WatchSpec,
    config: EngineConfig,
    registry: ComponentRegistry,
    watches: Vec<WatchSpec>,
    error: Option<ControllerError>,
}

impl ControllerBuilder {
    pub fn new(store: Arc<dyn ObjectStore>, primary_kind: impl Into<String>) -> Self {
        Self {
            store,
            primary: WatchSpec::primary(primary_kind),
            config: EngineConfig::default(),
            registry: ComponentRegistry::new(),
            watches: Vec::new(),
            error: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn primary_selector(mut self, selector: Selector) -> Self {
        self.primary = self.primary.selector(selector);
        self
    }

    pub fn primary_predicate(mut self, p: impl Predicate + 'static) -> Self {
        self.primary = self.primary.predicate(p);
        self
    }

    pub fn component(mut self, component: impl ManagedComponent + 'static) -> Self {
        if let Err(e) = self.registry.register(Arc::new(component)) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Extra watch, e.g. an owned kind with its own predicates or a mapped
    /// related kind. Owned kinds of registered components are watched
    /// without this.
    pub fn watches(mut self, spec: WatchSpec) -> Self {
        self.watches.push(spec);
        self
    }

    pub fn build(self) -> Result<Controller, ControllerError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(ControllerError::NoComponents);
        }
        let primary_kind = self.primary.kind.clone();
        let mut watches = vec![self.primary];
        watches.extend(self.watches);
        for kind in self.registry.owned_kinds() {
            if !watches.iter().any(|w| w.kind == kind) {
                watches.push(WatchSpec::owned(kind, primary_kind.clone()));
            }
        }

        let backoff = ExponentialBackoff::new(self.config.base_backoff, self.config.max_backoff);
        let queue = Arc::new(WorkQueue::new("reconcile", backoff));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&self.store), Arc::new(self.registry), self.config));
        Ok(Controller { store: self.store, reconciler, queue, watches, backoff, token: CancellationToken::new() })
    }
}

pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    watches: Vec<WatchSpec>,
    backoff: ExponentialBackoff,
    token: CancellationToken,
}

impl Controller {
    pub fn builder(store: Arc<dyn ObjectStore>, primary_kind: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(store, primary_kind)
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.queue }

    pub fn reconciler(&self) -> &Arc<Reconciler> { &self.reconciler }

    pub fn watches(&self) -> &[WatchSpec] { &self.watches }

    /// Cancelling the token stops [`run`](Self::run).
    pub fn shutdown_token(&self) -> CancellationToken { self.token.clone() }

    /// Request a pass for `key` outside of any watch event.
    pub fn trigger(&self, key: ObjectKey) { self.queue.add(key); }

    /// Run watches and workers until the shutdown token is cancelled.
    /// Queued keys are abandoned; in-flight passes are cancelled at their
    /// next await point.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();
        for spec in self.watches {
            let store = Arc::clone(&self.store);
            let queue = Arc::clone(&self.queue);
            tasks.spawn(run_watch(store, queue, spec, self.backoff, self.token.child_token()));
        }
        let workers = self.reconciler.config().worker_count;
        for id in 0..workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            tasks.spawn(run_worker(id, queue, reconciler, self.token.child_token()));
        }
        info!(workers, "controller started");

        self.token.cancelled().await;
        info!(queued = self.queue.len(), in_flight = self.queue.in_flight(), "controller shutting down");
        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "controller task failed");
            }
        }
        info!("controller stopped");
    }
}

async fn run_worker(id: usize, queue: Arc<WorkQueue<ObjectKey>>, reconciler: Arc<Reconciler>, token: CancellationToken) {
    let pass_timeout = reconciler.config().pass_timeout;
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(worker = id, key = %key, "pass cancelled");
                queue.done(&key);
                break;
            }
            r = tokio::time::timeout(pass_timeout, reconciler.reconcile(&key)) => {
                r.unwrap_or(Err(ReconcileError::Timeout(pass_timeout)))
            }
        };
        histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(action) => {
                counter!("reconcile_total", 1, "result" => "ok");
                queue.forget(&key);
                match action {
                    Action::Await => debug!(worker = id, key = %key, "reconciled"),
                    Action::Requeue(delay) => {
                        debug!(worker = id, key = %key, delay_ms = delay.as_millis() as u64, "reconciled; requeue");
                        queue.add_after(key.clone(), delay);
                    }
                }
            }
            Err(e) => {
                counter!("reconcile_total", 1, "result" => "error");
                counter!("reconcile_errors_total", 1, "reason" => e.reason());
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    worker = id,
                    key = %key,
                    error = %e,
                    transient = e.is_transient(),
                    attempts = queue.num_requeues(&key),
                    retry_in_ms = delay.as_millis() as u64,
                    "reconcile failed"
                );
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
