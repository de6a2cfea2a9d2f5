//! Volatile in-memory document store.
//!
//! The default backend for tests and for `run_locally` when no store is
//! supplied. Documents live in a shared vector behind a `parking_lot`
//! read/write lock; clones of a `MemoryStore` share the same documents.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{sort_docs, Criteria, DocumentStore, Sort, StoreError};

/// In-memory [`DocumentStore`]. Suitable only for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<Vec<Value>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

fn key_of(doc: &Value, key: &[&str]) -> Result<Vec<Value>, StoreError> {
    key.iter()
        .map(|field| {
            doc.get(*field)
                .cloned()
                .ok_or_else(|| StoreError::MissingKeyField {
                    field: (*field).to_string(),
                })
        })
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn query(
        &self,
        criteria: &Criteria,
        sort: Option<&Sort>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let mut matched: Vec<Value> = self
            .docs
            .read()
            .iter()
            .filter(|doc| criteria.matches(doc))
            .cloned()
            .collect();
        if let Some(sort) = sort {
            sort_docs(&mut matched, sort);
        }
        if limit > 0 {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn update(&self, docs: Vec<Value>, key: &[&str]) -> Result<(), StoreError> {
        let mut stored = self.docs.write();
        for doc in docs {
            let doc_key = key_of(&doc, key)?;
            let existing = stored.iter_mut().find(|candidate| {
                key.iter()
                    .zip(&doc_key)
                    .all(|(field, value)| candidate.get(*field) == Some(value))
            });
            match existing {
                Some(slot) => *slot = doc,
                None => stored.push(doc),
            }
        }
        Ok(())
    }

    async fn remove(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        let mut stored = self.docs.write();
        let before = stored.len();
        stored.retain(|doc| !criteria.matches(doc));
        Ok((before - stored.len()) as u64)
    }

    async fn count(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        Ok(self
            .docs
            .read()
            .iter()
            .filter(|doc| criteria.matches(doc))
            .count() as u64)
    }

    async fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>, StoreError> {
        let mut values: Vec<Value> = Vec::new();
        for doc in self.docs.read().iter() {
            if !criteria.matches(doc) {
                continue;
            }
            if let Some(value) = doc.get(field) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }
}
