mod common;

use serde_json::json;
use uuid::Uuid;

use jobflow::store::{
    Criteria, DocumentStore, GetOutputError, JobStore, Load, MemoryStore, SaveRequest, StoreError,
    Which,
};

fn save_request(uuid: Uuid, index: u32, output: serde_json::Value) -> SaveRequest {
    SaveRequest::new(uuid, index, output, "test job")
}

#[tokio::test]
async fn test_save_and_get_output_idempotent() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    store
        .save(save_request(uuid, 1, json!({"answer": 42})))
        .await
        .unwrap();

    let first = store.get_output(uuid, Which::Last, &Load::All).await.unwrap();
    let second = store.get_output(uuid, Which::Last, &Load::All).await.unwrap();
    assert_eq!(first, json!({"answer": 42}));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_get_output_picks_requested_index() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    store.save(save_request(uuid, 1, json!("one"))).await.unwrap();
    store.save(save_request(uuid, 2, json!("two"))).await.unwrap();

    assert_eq!(
        store.get_output(uuid, Which::Last, &Load::All).await.unwrap(),
        json!("two")
    );
    assert_eq!(
        store.get_output(uuid, Which::First, &Load::All).await.unwrap(),
        json!("one")
    );
    assert_eq!(
        store
            .get_output(uuid, Which::Index(1), &Load::All)
            .await
            .unwrap(),
        json!("one")
    );
    assert_eq!(
        store.all_outputs(uuid, &Load::All).await.unwrap(),
        vec![json!("one"), json!("two")]
    );
}

#[tokio::test]
async fn test_missing_output_errors() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    let err = store
        .get_output(uuid, Which::Last, &Load::All)
        .await
        .unwrap_err();
    match err {
        GetOutputError::NotFound(not_found) => assert_eq!(not_found.uuid, uuid),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_record_layout() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    let mut request = save_request(uuid, 1, json!(5));
    request
        .metadata
        .insert("project".into(), json!("demo"));
    let host = Uuid::new_v4();
    request.hosts = vec![host];
    store.save(request).await.unwrap();

    let doc = store
        .query_one(&Criteria::new().field("uuid", uuid.to_string()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["uuid"], json!(uuid.to_string()));
    assert_eq!(doc["index"], json!(1));
    assert_eq!(doc["output"], json!(5));
    assert_eq!(doc["name"], json!("test job"));
    assert_eq!(doc["metadata"]["project"], json!("demo"));
    assert_eq!(doc["hosts"], json!([host.to_string()]));
    assert!(doc["completed_at"].is_string());
}

#[tokio::test]
async fn test_blob_routing_and_reconstruction() {
    let store =
        JobStore::new(MemoryStore::new()).with_additional_store("blobs", MemoryStore::new());
    let uuid = Uuid::new_v4();
    let big = json!([1, 2, 3, 4, 5, 6, 7, 8]);
    let mut request = save_request(uuid, 1, json!({"big": big, "small": 1}));
    request.store_names.insert("big".into(), "blobs".into());
    store.save(request).await.unwrap();

    // Main record carries a marker, the auxiliary store the payload.
    let raw = store
        .query_one(&Criteria::new().field("uuid", uuid.to_string()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["output"]["small"], json!(1));
    assert_eq!(raw["output"]["big"]["@class"], json!("Blob"));
    assert_eq!(raw["output"]["big"]["store"], json!("blobs"));

    // Blob integrity: loading reconstructs the original output.
    let loaded = store.get_output(uuid, Which::Last, &Load::All).await.unwrap();
    assert_eq!(loaded, json!({"big": big, "small": 1}));

    // Restricting the load leaves the marker in place.
    let partial = store
        .get_output(uuid, Which::Last, &Load::Stores(vec!["other".into()]))
        .await
        .unwrap();
    assert_eq!(partial["big"]["@class"], json!("Blob"));
}

#[tokio::test]
async fn test_unknown_store_name_fails_save() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    let mut request = save_request(uuid, 1, json!({"big": 1}));
    request.store_names.insert("big".into(), "nowhere".into());
    let err = store.save(request).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownStore { .. }));
}

#[tokio::test]
async fn test_remove_deletes_main_record_and_blobs() {
    let aux = MemoryStore::new();
    let store = JobStore::new(MemoryStore::new()).with_additional_store("blobs", aux.clone());
    let uuid = Uuid::new_v4();
    let mut request = save_request(uuid, 1, json!({"big": [1, 2, 3]}));
    request.store_names.insert("big".into(), "blobs".into());
    store.save(request).await.unwrap();
    assert_eq!(aux.count(&Criteria::new()).await.unwrap(), 1);

    store.remove(uuid, 1).await.unwrap();
    assert_eq!(aux.count(&Criteria::new()).await.unwrap(), 0);
    assert!(matches!(
        store.get_output(uuid, Which::Last, &Load::All).await,
        Err(GetOutputError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_blob_tagged_with_job_identity() {
    let aux = MemoryStore::new();
    let store = JobStore::new(MemoryStore::new()).with_additional_store("blobs", aux.clone());
    let uuid = Uuid::new_v4();
    let mut request = save_request(uuid, 3, json!({"big": "payload"}));
    request.store_names.insert("big".into(), "blobs".into());
    store.save(request).await.unwrap();

    let blob = aux.query_one(&Criteria::new(), None).await.unwrap().unwrap();
    assert_eq!(blob["job_uuid"], json!(uuid.to_string()));
    assert_eq!(blob["job_index"], json!(3));
    assert_eq!(blob["data"], json!("payload"));
}

#[tokio::test]
async fn test_self_referencing_output_is_a_cycle() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    let self_ref = jobflow::reference::OutputReference::new(uuid).to_value();
    store
        .save(save_request(uuid, 1, json!({ "loop": self_ref })))
        .await
        .unwrap();
    assert!(matches!(
        store.get_output(uuid, Which::Last, &Load::All).await,
        Err(GetOutputError::Cycle { .. })
    ));
}

#[tokio::test]
async fn test_highest_index() {
    let store = JobStore::memory();
    let uuid = Uuid::new_v4();
    assert_eq!(store.highest_index(uuid).await.unwrap(), None);
    store.save(save_request(uuid, 1, json!(1))).await.unwrap();
    store.save(save_request(uuid, 2, json!(2))).await.unwrap();
    assert_eq!(store.highest_index(uuid).await.unwrap(), Some(2));
}
