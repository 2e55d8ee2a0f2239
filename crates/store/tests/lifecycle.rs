#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt;
use reko_core::{ApiResource, DynamicObject, GroupVersionKind, ObjectExt, ObjectKey, ObjectStore, Selector, StoreError, WatchEvent};
use reko_store::InMemoryStore;

fn ar(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("reko.dev", "v1alpha1", kind))
}

fn obj(kind: &str, name: &str, spec: serde_json::Value) -> DynamicObject {
    DynamicObject::new(name, &ar(kind)).within("ns").data(serde_json::json!({ "spec": spec }))
}

fn key(kind: &str, name: &str) -> ObjectKey { ObjectKey::namespaced(kind, "ns", name) }

#[tokio::test]
async fn stale_resource_version_conflicts() {
    let store = InMemoryStore::new();
    let created = store.create(obj("Workload", "w", serde_json::json!({ "replicas": 1 }))).await.unwrap();

    let mut first = created.clone();
    first.data["spec"]["replicas"] = 2.into();
    store.update(first).await.unwrap();

    let mut stale = created;
    stale.data["spec"]["replicas"] = 3.into();
    let err = store.update(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn generation_tracks_spec_only() {
    let store = InMemoryStore::new();
    let created = store.create(obj("Workload", "w", serde_json::json!({ "replicas": 1 }))).await.unwrap();
    assert_eq!(created.generation(), 1);

    let mut labelled = created.clone();
    labelled.metadata.labels = Some([("a".to_string(), "b".to_string())].into_iter().collect());
    let labelled = store.update(labelled).await.unwrap();
    assert_eq!(labelled.generation(), 1);

    let mut with_status = labelled.clone();
    with_status.set_status(serde_json::json!({ "phase": "Running" }));
    let with_status = store.update_status(with_status).await.unwrap();
    assert_eq!(with_status.generation(), 1);

    let mut respec = with_status.clone();
    respec.data["spec"]["replicas"] = 5.into();
    let respec = store.update(respec).await.unwrap();
    assert_eq!(respec.generation(), 2);
    // update never touches status
    assert_eq!(respec.status().unwrap()["phase"], "Running");
}

#[tokio::test]
async fn no_op_writes_keep_resource_version() {
    let store = InMemoryStore::new();
    let created = store.create(obj("Workload", "w", serde_json::json!({}))).await.unwrap();
    let again = store.update(created.clone()).await.unwrap();
    assert_eq!(again.metadata.resource_version, created.metadata.resource_version);
    let status_again = store.update_status(created.clone()).await.unwrap();
    assert_eq!(status_again.metadata.resource_version, created.metadata.resource_version);
}

#[tokio::test]
async fn finalizers_gate_deletion_and_owners_cascade() {
    let store = InMemoryStore::new();
    let mut parent = obj("Workload", "w", serde_json::json!({}));
    parent.metadata.finalizers = Some(vec!["reko.dev/cleanup".into()]);
    let parent = store.create(parent).await.unwrap();

    let mut child = obj("Job", "w-job", serde_json::json!({}));
    child.metadata.owner_references = Some(vec![parent.owner_reference().unwrap()]);
    store.create(child).await.unwrap();

    store.delete(&key("Workload", "w")).await.unwrap();
    let marked = store.peek(&key("Workload", "w")).expect("still present while finalized");
    assert!(marked.is_deleting());
    assert_eq!(marked.generation(), 2);
    assert!(store.peek(&key("Job", "w-job")).is_some());

    let mut released = marked;
    released.remove_finalizer("reko.dev/cleanup");
    store.update(released).await.unwrap();
    assert!(store.peek(&key("Workload", "w")).is_none());
    assert!(store.peek(&key("Job", "w-job")).is_none(), "owned child collected");
    assert!(matches!(store.get(&key("Workload", "w")).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn watch_relists_then_streams_matching_changes() {
    let store = InMemoryStore::new();
    store.create(obj("Workload", "a", serde_json::json!({}))).await.unwrap();
    store.create(obj("Job", "ignored", serde_json::json!({}))).await.unwrap();

    let mut stream = store.watch("Workload", &Selector::all()).await.unwrap();
    match stream.next().await {
        Some(Ok(WatchEvent::Restarted(items))) => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].metadata.name.as_deref(), Some("a"));
        }
        other => panic!("expected relist, got {other:?}"),
    }

    store.create(obj("Job", "still-ignored", serde_json::json!({}))).await.unwrap();
    store.create(obj("Workload", "b", serde_json::json!({}))).await.unwrap();
    store.delete(&key("Workload", "a")).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(WatchEvent::Applied(ref o))) if o.metadata.name.as_deref() == Some("b")));
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
    assert!(matches!(next, Some(Ok(WatchEvent::Deleted(ref o))) if o.metadata.name.as_deref() == Some("a")));
}

#[tokio::test]
async fn lagging_watch_errors_out() {
    let store = InMemoryStore::with_capacity(2);
    let mut stream = store.watch("Workload", &Selector::all()).await.unwrap();
    assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Restarted(_)))));
    for i in 0..5 {
        store.create(obj("Workload", &format!("w{i}"), serde_json::json!({}))).await.unwrap();
    }
    let first = stream.next().await;
    assert!(matches!(first, Some(Err(StoreError::Unavailable(_)))), "got {first:?}");
    assert!(stream.next().await.is_none());
}
