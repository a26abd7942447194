//! Read access to the host's document storage.
//!
//! Progress and notification settings live as JSON documents in the `storage`
//! table, addressed by `(collection, key, user_id)`. The engine only ever reads
//! them, through a small query capability: filter by collection, optionally by
//! key, by equality on top-level document fields and by field presence.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::RwLock;
use uuid::Uuid;

use nudge_common::error::AppError;

/// One stored document.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StorageObject {
    pub collection: String,
    pub key: String,
    pub user_id: Uuid,
    pub value: Value,
}

/// Filter over storage documents. All conditions are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageQuery {
    pub collection: String,
    pub key: Option<String>,
    /// `value ->> field = expected`
    pub field_equals: Vec<(String, String)>,
    /// `value ->> field IS NOT NULL`
    pub field_present: Vec<String>,
}

impl StorageQuery {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn field_eq(mut self, field: impl Into<String>, expected: impl Into<String>) -> Self {
        self.field_equals.push((field.into(), expected.into()));
        self
    }

    pub fn field_present(mut self, field: impl Into<String>) -> Self {
        self.field_present.push(field.into());
        self
    }

    /// Evaluate the filter in memory with the same semantics as Postgres `->>`.
    pub fn matches(&self, object: &StorageObject) -> bool {
        if object.collection != self.collection {
            return false;
        }
        if let Some(key) = &self.key
            && &object.key != key
        {
            return false;
        }
        let equals_ok = self
            .field_equals
            .iter()
            .all(|(field, expected)| text_field(&object.value, field).as_deref() == Some(expected));
        let present_ok = self
            .field_present
            .iter()
            .all(|field| text_field(&object.value, field).is_some());
        equals_ok && present_ok
    }
}

/// Text projection of a top-level field, as `value ->> field` would return it.
fn text_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
pub trait StorageReader: Send + Sync {
    async fn query(&self, query: &StorageQuery) -> Result<Vec<StorageObject>, AppError>;
}

/// Storage reader over the host's Postgres `storage` table.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageReader for PgStorage {
    async fn query(&self, query: &StorageQuery) -> Result<Vec<StorageObject>, AppError> {
        let mut sql: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT collection, key, user_id, value FROM storage WHERE collection = ",
        );
        sql.push_bind(query.collection.clone());

        if let Some(key) = &query.key {
            sql.push(" AND key = ").push_bind(key.clone());
        }
        for (field, expected) in &query.field_equals {
            sql.push(" AND value ->> ")
                .push_bind(field.clone())
                .push(" = ")
                .push_bind(expected.clone());
        }
        for field in &query.field_present {
            sql.push(" AND value ->> ")
                .push_bind(field.clone())
                .push(" IS NOT NULL");
        }

        let rows = sql
            .build_query_as::<StorageObject>()
            .fetch_all(&self.pool)
            .await?;

        tracing::debug!(
            collection = %query.collection,
            key = ?query.key,
            rows = rows.len(),
            "Storage query"
        );
        Ok(rows)
    }
}

/// In-process storage, used by tests and local tooling.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<Vec<StorageObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the document at `(collection, key, user_id)`.
    pub async fn put(&self, collection: &str, key: &str, user_id: Uuid, value: Value) {
        let mut objects = self.objects.write().await;
        objects.retain(|o| !(o.collection == collection && o.key == key && o.user_id == user_id));
        objects.push(StorageObject {
            collection: collection.to_string(),
            key: key.to_string(),
            user_id,
            value,
        });
    }
}

#[async_trait]
impl StorageReader for MemoryStorage {
    async fn query(&self, query: &StorageQuery) -> Result<Vec<StorageObject>, AppError> {
        let objects = self.objects.read().await;
        Ok(objects.iter().filter(|o| query.matches(o)).cloned().collect())
    }
}
