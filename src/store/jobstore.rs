//! Multi-store router for job outputs.
//!
//! A [`JobStore`] wraps one **main** document store holding the primary
//! output record per `(uuid, index)` and any number of **named auxiliary**
//! stores holding large or specially-routed blobs extracted from those
//! outputs. On save, subtrees whose enclosing key matches a job's routing
//! table are swapped for [`BlobMarker`]s and written to the named auxiliary
//! store *before* the main record is committed; on load, markers are
//! expanded back, optionally restricted to a subset of store names.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{self, JsonMap, ObjectRegistry, SerializationError, CLASS_KEY, ENGINE_MODULE, MODULE_KEY};
use crate::utils::find::{find_key, get_at, update_at};

use super::{Criteria, DocumentStore, MemoryStore, Sort, StoreError};

/// Class discriminator of a blob marker in its wire form.
pub const BLOB_CLASS: &str = "Blob";

/// Placeholder left in a main record where a routed subtree was extracted.
///
/// Wire form: `{"@module": "jobflow", "@class": "Blob", "blob_uuid": ...,
/// "store": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMarker {
    pub blob_uuid: Uuid,
    pub store: String,
}

impl BlobMarker {
    /// A fresh marker destined for the named auxiliary store.
    #[must_use]
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            blob_uuid: Uuid::new_v4(),
            store: store.into(),
        }
    }

    /// The typed-object wire form of this marker.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = JsonMap::new();
        map.insert(MODULE_KEY.into(), Value::String(ENGINE_MODULE.into()));
        map.insert(CLASS_KEY.into(), Value::String(BLOB_CLASS.into()));
        map.insert("blob_uuid".into(), Value::String(self.blob_uuid.to_string()));
        map.insert("store".into(), Value::String(self.store.clone()));
        Value::Object(map)
    }

    /// Whether a tree node is a blob marker in wire form.
    #[must_use]
    pub fn is_marker(value: &Value) -> bool {
        codec::is_class(value, ENGINE_MODULE, BLOB_CLASS)
    }

    /// Rehydrate a marker from its wire form.
    pub fn from_value(value: &Value) -> Result<Self, SerializationError> {
        #[derive(Deserialize)]
        struct Wire {
            blob_uuid: Uuid,
            store: String,
        }
        let wire: Wire =
            serde_json::from_value(value.clone()).map_err(|e| SerializationError::Decode {
                class: BLOB_CLASS.into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            blob_uuid: wire.blob_uuid,
            store: wire.store,
        })
    }

    /// Validate the shape of a tagged map claiming to be a blob marker.
    pub fn validate_wire(map: &JsonMap) -> Result<(), SerializationError> {
        Self::from_value(&Value::Object(map.clone())).map(|_| ())
    }
}

/// Which stored index of a uuid to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Which {
    /// Highest stored index (the default).
    #[default]
    Last,
    /// Lowest stored index.
    First,
    /// A specific index.
    Index(u32),
}

impl Which {
    fn requested_index(self) -> Option<u32> {
        match self {
            Which::Index(n) => Some(n),
            _ => None,
        }
    }
}

/// Which auxiliary stores to expand blob markers from on load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Load {
    /// Expand markers from every auxiliary store.
    #[default]
    All,
    /// Leave every marker in place.
    None,
    /// Expand only markers routed to the named stores.
    Stores(Vec<String>),
}

impl Load {
    /// Whether markers routed to `store` should be expanded.
    #[must_use]
    pub fn includes(&self, store: &str) -> bool {
        match self {
            Load::All => true,
            Load::None => false,
            Load::Stores(names) => names.iter().any(|n| n == store),
        }
    }
}

/// A requested `(uuid, index)` has no record in the main store.
#[derive(Debug, Error, Diagnostic)]
#[error("no stored output for {uuid}{}", match .index { Some(i) => format!(" (index {i})"), None => String::new() })]
#[diagnostic(
    code(jobflow::store::output_not_found),
    help("The job has not completed, or its record was removed.")
)]
pub struct OutputNotFoundError {
    pub uuid: Uuid,
    pub index: Option<u32>,
}

/// Errors raised while fetching or removing an output.
#[derive(Debug, Error, Diagnostic)]
pub enum GetOutputError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    NotFound(#[from] OutputNotFoundError),

    /// The stored output references its own uuid.
    #[error("stored output of {uuid} references itself")]
    #[diagnostic(code(jobflow::store::reference_cycle))]
    Cycle { uuid: Uuid },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(jobflow::store::decode))]
    Serialization(#[from] SerializationError),
}

/// Everything needed to persist one completed job run.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub uuid: Uuid,
    pub index: u32,
    pub output: Value,
    pub name: String,
    pub metadata: JsonMap,
    pub hosts: Vec<Uuid>,
    /// Routing table: output key → auxiliary store name.
    pub store_names: FxHashMap<String, String>,
    pub stored_data: Option<Value>,
}

impl SaveRequest {
    #[must_use]
    pub fn new(uuid: Uuid, index: u32, output: Value, name: impl Into<String>) -> Self {
        Self {
            uuid,
            index,
            output,
            name: name.into(),
            metadata: JsonMap::new(),
            hosts: Vec::new(),
            store_names: FxHashMap::default(),
            stored_data: None,
        }
    }
}

/// Router over one main document store and named auxiliary stores.
///
/// The `JobStore` is the only communication channel between jobs: the
/// scheduler persists every response output through it, and reference
/// resolution reads outputs back out of it.
#[derive(Clone)]
pub struct JobStore {
    main: Arc<dyn DocumentStore>,
    additional: FxHashMap<String, Arc<dyn DocumentStore>>,
    registry: ObjectRegistry,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("additional", &self.additional.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobStore {
    /// A job store over the given main document store, with no auxiliary
    /// stores.
    #[must_use]
    pub fn new(main: impl DocumentStore + 'static) -> Self {
        Self {
            main: Arc::new(main),
            additional: FxHashMap::default(),
            registry: ObjectRegistry::with_builtins(),
        }
    }

    /// An in-memory job store; the default for tests and local runs.
    #[must_use]
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Register a named auxiliary store.
    #[must_use]
    pub fn with_additional_store(
        mut self,
        name: impl Into<String>,
        store: impl DocumentStore + 'static,
    ) -> Self {
        self.additional.insert(name.into(), Arc::new(store));
        self
    }

    /// Use a custom typed-object registry when decoding loaded outputs.
    #[must_use]
    pub fn with_registry(mut self, registry: ObjectRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn main_store(&self) -> &Arc<dyn DocumentStore> {
        &self.main
    }

    /// Names of the registered auxiliary stores.
    pub fn additional_store_names(&self) -> impl Iterator<Item = &str> {
        self.additional.keys().map(String::as_str)
    }

    #[must_use]
    pub fn has_store(&self, name: &str) -> bool {
        self.additional.contains_key(name)
    }

    /// Connect the main store and every auxiliary store.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.main.connect().await?;
        for store in self.additional.values() {
            store.connect().await?;
        }
        Ok(())
    }

    /// Close the main store and every auxiliary store.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.main.close().await?;
        for store in self.additional.values() {
            store.close().await?;
        }
        Ok(())
    }

    /// Persist one completed job run.
    ///
    /// Routed subtrees are written to their auxiliary stores before the
    /// rewritten main record is committed, so a committed marker always
    /// names an existing blob.
    pub async fn save(&self, request: SaveRequest) -> Result<(), StoreError> {
        let SaveRequest {
            uuid,
            index,
            mut output,
            name,
            metadata,
            hosts,
            store_names,
            stored_data,
        } = request;

        let mut routes: Vec<(&String, &String)> = store_names.iter().collect();
        routes.sort();
        for (pattern, store_name) in routes {
            let store = self
                .additional
                .get(store_name)
                .ok_or_else(|| StoreError::UnknownStore {
                    name: store_name.clone(),
                })?;
            for location in find_key(&output, pattern, true) {
                let subtree = get_at(&output, &location).cloned().unwrap_or(Value::Null);
                let marker = BlobMarker::new(store_name.clone());
                let mut blob = JsonMap::new();
                blob.insert(
                    "blob_uuid".into(),
                    Value::String(marker.blob_uuid.to_string()),
                );
                blob.insert("store".into(), Value::String(store_name.clone()));
                blob.insert("data".into(), subtree);
                blob.insert("job_uuid".into(), Value::String(uuid.to_string()));
                blob.insert("job_index".into(), Value::from(index));
                store.update(vec![Value::Object(blob)], &["blob_uuid"]).await?;
                update_at(&mut output, &location, marker.to_value());
            }
        }

        let mut doc = JsonMap::new();
        doc.insert("uuid".into(), Value::String(uuid.to_string()));
        doc.insert("index".into(), Value::from(index));
        doc.insert("output".into(), output);
        doc.insert("name".into(), Value::String(name));
        doc.insert("metadata".into(), Value::Object(metadata));
        doc.insert(
            "hosts".into(),
            Value::Array(
                hosts
                    .iter()
                    .map(|h| Value::String(h.to_string()))
                    .collect(),
            ),
        );
        doc.insert(
            "completed_at".into(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        if let Some(stored_data) = stored_data {
            doc.insert("stored_data".into(), stored_data);
        }
        self.main
            .update(vec![Value::Object(doc)], &["uuid", "index"])
            .await
    }

    /// Highest stored index for a uuid, if any run has completed.
    pub async fn highest_index(&self, uuid: Uuid) -> Result<Option<u32>, StoreError> {
        let doc = self
            .main
            .query_one(
                &Criteria::new().field("uuid", uuid.to_string()),
                Some(&Sort::descending("index")),
            )
            .await?;
        Ok(doc
            .and_then(|d| d.get("index").and_then(Value::as_u64))
            .map(|i| i as u32))
    }

    /// Fetch the stored output of a uuid.
    ///
    /// Blob markers are expanded according to `load`; markers excluded by
    /// `load` stay in place. Loaded trees pass through the typed-object
    /// registry, and an output that references its own uuid is rejected as
    /// a cycle.
    pub async fn get_output(
        &self,
        uuid: Uuid,
        which: Which,
        load: &Load,
    ) -> Result<Value, GetOutputError> {
        let mut criteria = Criteria::new().field("uuid", uuid.to_string());
        let sort = match which {
            Which::Last => Sort::descending("index"),
            Which::First => Sort::ascending("index"),
            Which::Index(n) => {
                criteria = criteria.field("index", n);
                Sort::ascending("index")
            }
        };
        let doc = self
            .main
            .query_one(&criteria, Some(&sort))
            .await
            .map_err(GetOutputError::Store)?
            .ok_or(OutputNotFoundError {
                uuid,
                index: which.requested_index(),
            })?;
        let output = doc.get("output").cloned().unwrap_or(Value::Null);
        self.rehydrate(uuid, output, load).await
    }

    /// Every stored output of a uuid, lowest index first.
    pub async fn all_outputs(&self, uuid: Uuid, load: &Load) -> Result<Vec<Value>, GetOutputError> {
        let docs = self
            .main
            .query(
                &Criteria::new().field("uuid", uuid.to_string()),
                Some(&Sort::ascending("index")),
                0,
            )
            .await
            .map_err(GetOutputError::Store)?;
        if docs.is_empty() {
            return Err(OutputNotFoundError { uuid, index: None }.into());
        }
        let mut outputs = Vec::with_capacity(docs.len());
        for doc in docs {
            let output = doc.get("output").cloned().unwrap_or(Value::Null);
            outputs.push(self.rehydrate(uuid, output, load).await?);
        }
        Ok(outputs)
    }

    async fn rehydrate(
        &self,
        uuid: Uuid,
        output: Value,
        load: &Load,
    ) -> Result<Value, GetOutputError> {
        let output = self.expand_blobs(output, load).await?;
        let output = self.registry.decode_tree(&output)?;
        let cyclic = crate::reference::find_and_get_references(&output)
            .iter()
            .any(|r| r.uuid() == uuid);
        if cyclic {
            return Err(GetOutputError::Cycle { uuid });
        }
        Ok(output)
    }

    async fn expand_blobs(&self, mut output: Value, load: &Load) -> Result<Value, GetOutputError> {
        if matches!(load, Load::None) {
            return Ok(output);
        }
        for location in find_key(&output, "blob_uuid", false) {
            let Some(node) = get_at(&output, &location) else {
                continue;
            };
            if !BlobMarker::is_marker(node) {
                continue;
            }
            let marker = BlobMarker::from_value(node).map_err(StoreError::Serialization)?;
            if !load.includes(&marker.store) {
                continue;
            }
            let store =
                self.additional
                    .get(&marker.store)
                    .ok_or_else(|| StoreError::UnknownStore {
                        name: marker.store.clone(),
                    })?;
            let blob = store
                .query_one(
                    &Criteria::new().field("blob_uuid", marker.blob_uuid.to_string()),
                    None,
                )
                .await
                .map_err(GetOutputError::Store)?;
            // A missing blob leaves the marker observable; this only
            // happens after an explicit remove.
            if let Some(blob) = blob {
                let data = blob.get("data").cloned().unwrap_or(Value::Null);
                update_at(&mut output, &location, data);
            }
        }
        Ok(output)
    }

    /// Delete the `(uuid, index)` main record along with every auxiliary
    /// blob its markers name.
    pub async fn remove(&self, uuid: Uuid, index: u32) -> Result<(), GetOutputError> {
        let criteria = Criteria::new()
            .field("uuid", uuid.to_string())
            .field("index", index);
        let doc = self
            .main
            .query_one(&criteria, None)
            .await
            .map_err(GetOutputError::Store)?
            .ok_or(OutputNotFoundError {
                uuid,
                index: Some(index),
            })?;
        let output = doc.get("output").cloned().unwrap_or(Value::Null);
        for location in find_key(&output, "blob_uuid", false) {
            let Some(node) = get_at(&output, &location) else {
                continue;
            };
            if !BlobMarker::is_marker(node) {
                continue;
            }
            let marker = BlobMarker::from_value(node).map_err(StoreError::Serialization)?;
            if let Some(store) = self.additional.get(&marker.store) {
                store
                    .remove(&Criteria::new().field("blob_uuid", marker.blob_uuid.to_string()))
                    .await
                    .map_err(GetOutputError::Store)?;
            }
        }
        self.main
            .remove(&criteria)
            .await
            .map_err(GetOutputError::Store)?;
        Ok(())
    }
}

// The router itself satisfies the capability set over its main store, so
// callers can run ad-hoc queries against job records.
#[async_trait]
impl DocumentStore for JobStore {
    async fn connect(&self) -> Result<(), StoreError> {
        JobStore::connect(self).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        JobStore::close(self).await
    }

    async fn query(
        &self,
        criteria: &Criteria,
        sort: Option<&Sort>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        self.main.query(criteria, sort, limit).await
    }

    async fn update(&self, docs: Vec<Value>, key: &[&str]) -> Result<(), StoreError> {
        self.main.update(docs, key).await
    }

    async fn remove(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        self.main.remove(criteria).await
    }

    async fn count(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        self.main.count(criteria).await
    }

    async fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>, StoreError> {
        self.main.distinct(field, criteria).await
    }
}

// Serialize/Deserialize are provided for the marker so it can ride inside
// serde-built trees the same way references do.
impl Serialize for BlobMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
