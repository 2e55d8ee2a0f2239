#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reko_controller::{Action, ReconcileError, Reconciler};
use reko_core::{EngineConfig, ObjectExt, ObjectStore, Phase, StoreError, DEFAULT_FINALIZER, FINALIZING, READY};
use reko_store::{Fault, FaultKind, InMemoryStore, StoreOp};

#[tokio::test]
async fn create_then_complete_then_drift_check() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let r = reconciler(&store, None);

    // finalizer first, nothing else
    store.clear_calls();
    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::requeue_now());
    let writes = store.mutations();
    assert_eq!(writes.len(), 1, "{writes:?}");
    assert_eq!(writes[0].op, StoreOp::Update);
    assert!(store.peek(&key("w")).unwrap().has_finalizer(DEFAULT_FINALIZER));
    assert!(store.peek(&job_key("w")).is_none());

    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Requeue(Duration::from_secs(60)));
    assert!(store.peek(&job_key("w")).is_some());
    let status = status_of(&store, "w");
    assert_eq!(status.phase, Some(Phase::Pending));
    assert_eq!((status.managed, status.ready), (1, 0));

    complete_job(&store, "w").await;
    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Requeue(Duration::from_secs(300)));
    let status = status_of(&store, "w");
    assert_eq!(status.phase, Some(Phase::Succeeded));
    assert_eq!(status.condition(READY).map(|c| c.status.as_str()), Some("True"));
    assert_eq!(status.observed_generation, Some(1));
}

#[tokio::test]
async fn repeated_passes_write_nothing() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let r = reconciler(&store, None);
    r.reconcile(&key("w")).await.unwrap();
    r.reconcile(&key("w")).await.unwrap();

    let before = store.peek(&key("w")).unwrap();
    store.clear_calls();
    for _ in 0..3 {
        assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Requeue(Duration::from_secs(60)));
    }
    assert!(store.mutations().is_empty(), "{:?}", store.mutations());
    let after = store.peek(&key("w")).unwrap();
    assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
}

#[tokio::test]
async fn removed_tears_down_and_keeps_primary() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let r = reconciler(&store, None);
    r.reconcile(&key("w")).await.unwrap();
    r.reconcile(&key("w")).await.unwrap();
    assert!(store.peek(&job_key("w")).is_some());

    let mut w = store.peek(&key("w")).unwrap();
    w.data["spec"]["managementState"] = "Removed".into();
    store.update(w).await.unwrap();

    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Requeue(Duration::from_secs(5)));
    assert!(store.peek(&job_key("w")).is_none());

    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Await);
    assert!(store.peek(&key("w")).is_some(), "primary survives removal");
    let status = status_of(&store, "w");
    assert_eq!(status.phase, Some(Phase::Removed));
    assert_eq!(status.managed, 0);
}

#[tokio::test]
async fn failing_cleanup_holds_the_finalizer() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let ext = Arc::new(External::failing(1));
    let r = reconciler(&store, Some(Arc::clone(&ext)));
    r.reconcile(&key("w")).await.unwrap();
    r.reconcile(&key("w")).await.unwrap();

    store.delete(&key("w")).await.unwrap();
    let err = r.reconcile(&key("w")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cleanup { .. }), "{err:?}");
    let primary = store.peek(&key("w")).expect("held by finalizer");
    assert!(primary.has_finalizer(DEFAULT_FINALIZER));
    let status = status_of(&store, "w");
    let cond = status.condition(FINALIZING).expect("finalizing condition");
    assert_eq!((cond.status.as_str(), cond.reason.as_str()), ("False", "CleanupFailed"));

    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Await);
    assert!(store.peek(&key("w")).is_none());
    assert!(store.peek(&job_key("w")).is_none(), "owned job collected with its owner");
    assert_eq!(ext.cleanups.load(Ordering::SeqCst), 2);
    assert!(ext.finalizer_seen.load(Ordering::SeqCst), "cleanup ran after the finalizer was dropped");
}

#[tokio::test]
async fn unmanaged_makes_no_mutating_calls() {
    let store = InMemoryStore::new();
    store.create(workload("w", serde_json::json!({ "managementState": "Unmanaged", "image": "busybox" }))).await.unwrap();
    let r = reconciler(&store, None);
    store.clear_calls();
    for _ in 0..2 {
        assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Await);
    }
    assert!(store.mutations().is_empty());
}

#[tokio::test]
async fn invalid_spec_is_reported_without_managed_writes() {
    let store = InMemoryStore::new();
    store.create(workload("bad", serde_json::json!({ "managementState": "Sometimes" }))).await.unwrap();
    store.create(workload("noimage", serde_json::json!({ "replicas": 1 }))).await.unwrap();
    let r = reconciler(&store, None);

    let err = r.reconcile(&key("bad")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidSpec(_)));
    assert!(!err.is_transient());
    let status = status_of(&store, "bad");
    assert_eq!(status.phase, Some(Phase::Failed));
    assert_eq!(status.condition(READY).map(|c| c.reason.as_str()), Some("InvalidSpec"));

    r.reconcile(&key("noimage")).await.unwrap();
    let err = r.reconcile(&key("noimage")).await.unwrap_err();
    assert!(err.to_string().contains("spec.image"), "{err}");
    assert!(store.peek(&job_key("noimage")).is_none());
}

#[tokio::test]
async fn missing_primary_is_a_no_op() {
    let store = InMemoryStore::new();
    let r = reconciler(&store, None);
    assert_eq!(r.reconcile(&key("ghost")).await.unwrap(), Action::Await);
    assert!(store.mutations().is_empty());
}

#[tokio::test]
async fn image_change_recreates_the_job() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let r = reconciler(&store, None);
    r.reconcile(&key("w")).await.unwrap();
    r.reconcile(&key("w")).await.unwrap();
    let old_uid = store.peek(&job_key("w")).unwrap().metadata.uid;

    let mut w = store.peek(&key("w")).unwrap();
    w.data["spec"]["image"] = "alpine".into();
    store.update(w).await.unwrap();

    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Requeue(Duration::from_secs(60)));
    assert!(store.peek(&job_key("w")).is_none());
    assert_eq!(status_of(&store, "w").phase, Some(Phase::Running));

    r.reconcile(&key("w")).await.unwrap();
    let job = store.peek(&job_key("w")).unwrap();
    assert_ne!(job.metadata.uid, old_uid);
    assert_eq!(job.data["spec"]["template"]["spec"]["containers"][0]["image"], "alpine");
}

#[tokio::test]
async fn primary_deleted_mid_pass_ends_quietly() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    let stale = store.peek(&key("w")).unwrap();
    store.delete(&key("w")).await.unwrap();
    assert!(store.peek(&key("w")).is_none());

    let r = Reconciler::new(Arc::new(StaleReads::new(store.clone(), stale)), registry(), EngineConfig::default());
    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::Await);

    let other = ReconcileError::Store(StoreError::NotFound(job_key("w")));
    assert!(!other.is_not_found(&key("w")));
}

#[tokio::test]
async fn store_conflicts_are_transient() {
    let store = InMemoryStore::new();
    store.create(workload("w", managed_spec())).await.unwrap();
    store.inject(Fault::new(StoreOp::Update, FaultKind::Conflict).for_kind("Workload"));
    let r = reconciler(&store, None);
    let err = r.reconcile(&key("w")).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(r.reconcile(&key("w")).await.unwrap(), Action::requeue_now());
}
