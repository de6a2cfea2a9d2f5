mod common;

use serde_json::json;
use uuid::Uuid;

use jobflow::reference::{
    find_and_resolve_references, resolve_references, OnMissing, OutputReference,
    ReferenceResolutionError, ResolutionCache,
};
use jobflow::store::{JobStore, MemoryStore, SaveRequest};

async fn store_with(uuid: Uuid, output: serde_json::Value) -> JobStore {
    let store = JobStore::memory();
    store
        .save(SaveRequest::new(uuid, 1, output, "producer"))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_resolve_reference_with_path() {
    let uuid = Uuid::new_v4();
    let store = store_with(uuid, json!({"x": [10, 20, 30]})).await;

    let reference = OutputReference::new(uuid).attr("x").index(1);
    let mut cache = ResolutionCache::default();
    let value = reference
        .resolve(&store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(value, json!(20));
}

#[tokio::test]
async fn test_resolution_uses_highest_index() {
    let uuid = Uuid::new_v4();
    let store = store_with(uuid, json!("old")).await;
    store
        .save(SaveRequest::new(uuid, 2, json!("new"), "producer"))
        .await
        .unwrap();

    let reference = OutputReference::new(uuid);
    let mut cache = ResolutionCache::default();
    let value = reference
        .resolve(&store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(value, json!("new"));
}

#[tokio::test]
async fn test_resolve_tree_replaces_nested_references() {
    let uuid = Uuid::new_v4();
    let store = store_with(uuid, json!({"x": 5})).await;

    let reference = OutputReference::new(uuid).attr("x");
    let tree = json!({
        "args": [1, {"value": reference.to_value()}],
        "twice": [reference.to_value(), reference.to_value()],
    });
    let mut cache = ResolutionCache::default();
    let resolved = find_and_resolve_references(&tree, &store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(
        resolved,
        json!({"args": [1, {"value": 5}], "twice": [5, 5]})
    );
}

#[tokio::test]
async fn test_on_missing_variants() {
    let store = JobStore::memory();
    let reference = OutputReference::new(Uuid::new_v4());
    let tree = json!([reference.to_value()]);

    let mut cache = ResolutionCache::default();
    let err = find_and_resolve_references(&tree, &store, &mut cache, OnMissing::Error)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReferenceResolutionError::MissingOutput { .. }
    ));

    let substituted = find_and_resolve_references(&tree, &store, &mut cache, OnMissing::None)
        .await
        .unwrap();
    assert_eq!(substituted, json!([null]));

    let passed = find_and_resolve_references(&tree, &store, &mut cache, OnMissing::Pass)
        .await
        .unwrap();
    assert_eq!(passed, tree);
}

#[tokio::test]
async fn test_cache_shared_across_references() {
    let uuid = Uuid::new_v4();
    let store = store_with(uuid, json!({"a": 1, "b": 2})).await;

    let refs = vec![
        OutputReference::new(uuid).attr("a"),
        OutputReference::new(uuid).attr("b"),
    ];
    let mut cache = ResolutionCache::default();
    let resolved = resolve_references(&refs, &store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(resolved[&refs[0]], json!(1));
    assert_eq!(resolved[&refs[1]], json!(2));
    assert_eq!(cache.len(), 1);

    // A cached uuid is not re-fetched: removing the record does not affect
    // later resolutions through the same cache.
    store.remove(uuid, 1).await.unwrap();
    let again = resolve_references(&refs, &store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(again[&refs[0]], json!(1));
}

#[tokio::test]
async fn test_bad_path_carries_location() {
    let uuid = Uuid::new_v4();
    let store = store_with(uuid, json!({"x": [10]})).await;

    let reference = OutputReference::new(uuid).attr("x").index(3);
    let mut cache = ResolutionCache::default();
    let err = reference
        .resolve(&store, &mut cache, OnMissing::Error)
        .await
        .unwrap_err();
    match err {
        ReferenceResolutionError::PathStep { uuid: u, step, .. } => {
            assert_eq!(u, uuid);
            assert_eq!(step, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_source_stores_route_blob_loading() {
    let store =
        JobStore::new(MemoryStore::new()).with_additional_store("blobs", MemoryStore::new());
    let uuid = Uuid::new_v4();
    let mut request = SaveRequest::new(uuid, 1, json!({"big": [1, 2, 3]}), "producer");
    request.store_names.insert("big".into(), "blobs".into());
    store.save(request).await.unwrap();

    let routed = OutputReference::new(uuid)
        .attr("big")
        .with_source_stores(["blobs".to_string()]);
    let mut cache = ResolutionCache::default();
    let value = routed
        .resolve(&store, &mut cache, OnMissing::Error)
        .await
        .unwrap();
    assert_eq!(value, json!([1, 2, 3]));
}
