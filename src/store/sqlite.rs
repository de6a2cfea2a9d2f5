//! SQLite-backed document store.
//!
//! Durable [`DocumentStore`] keeping each document as a JSON text row.
//! The table is created on [`connect`](SqliteStore::connect); filtering and
//! sorting reuse the same matcher as the in-memory store after fetch, which
//! keeps the SQL surface to inserts, deletes, and full scans. Suitable for
//! single-host runs; it is not a high-throughput backend.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use super::{sort_docs, Criteria, DocumentStore, Sort, StoreError};

/// Durable [`DocumentStore`] over a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("table", &self.table)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `url`, e.g.
    /// `sqlite://jobflow.db` or `sqlite::memory:`.
    pub async fn connect_url(url: &str) -> Result<Self, StoreError> {
        Self::connect_url_with_table(url, "jobflow_docs").await
    }

    /// Like [`connect_url`](Self::connect_url) with an explicit table name,
    /// so several stores (main plus auxiliaries) can share one database.
    pub async fn connect_url_with_table(url: &str, table: &str) -> Result<Self, StoreError> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Backend(format!(
                "invalid table name '{table}'"
            )));
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        let store = Self {
            pool,
            table: table.to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, doc TEXT NOT NULL)",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<(i64, Value)>, StoreError> {
        let select = format!("SELECT id, doc FROM {}", self.table);
        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let text: String = row.get("doc");
            let doc: Value = serde_json::from_str(&text)
                .map_err(|e| StoreError::Backend(format!("corrupt document row {id}: {e}")))?;
            docs.push((id, doc));
        }
        Ok(docs)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.ensure_table().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }

    async fn query(
        &self,
        criteria: &Criteria,
        sort: Option<&Sort>,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let mut matched: Vec<Value> = self
            .fetch_all()
            .await?
            .into_iter()
            .map(|(_, doc)| doc)
            .filter(|doc| criteria.matches(doc))
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
        let existing = self.fetch_all().await?;
        let delete = format!("DELETE FROM {} WHERE id = ?", self.table);
        let insert = format!("INSERT INTO {} (doc) VALUES (?)", self.table);
        for doc in docs {
            for field in key {
                if doc.get(*field).is_none() {
                    return Err(StoreError::MissingKeyField {
                        field: (*field).to_string(),
                    });
                }
            }
            for (id, candidate) in &existing {
                let same_key = key
                    .iter()
                    .all(|field| candidate.get(*field) == doc.get(*field));
                if same_key {
                    sqlx::query(&delete).bind(*id).execute(&self.pool).await?;
                }
            }
            let text = serde_json::to_string(&doc)
                .map_err(|e| StoreError::Backend(format!("unencodable document: {e}")))?;
            sqlx::query(&insert).bind(text).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn remove(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        let delete = format!("DELETE FROM {} WHERE id = ?", self.table);
        let mut removed = 0;
        for (id, doc) in self.fetch_all().await? {
            if criteria.matches(&doc) {
                sqlx::query(&delete).bind(id).execute(&self.pool).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count(&self, criteria: &Criteria) -> Result<u64, StoreError> {
        Ok(self
            .fetch_all()
            .await?
            .iter()
            .filter(|(_, doc)| criteria.matches(doc))
            .count() as u64)
    }

    async fn distinct(&self, field: &str, criteria: &Criteria) -> Result<Vec<Value>, StoreError> {
        let mut values: Vec<Value> = Vec::new();
        for (_, doc) in self.fetch_all().await? {
            if !criteria.matches(&doc) {
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
