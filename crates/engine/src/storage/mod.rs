//! Storage boundary.
//!
//! The engine never talks to a driver directly: compiled plans are handed
//! to a [`StorageConnection`], and rows come back as [`EntityRecord`]
//! values. A sqlx/sea-query PostgreSQL adapter lives in [`postgres`]; tests
//! plug in an in-memory implementation.

pub mod loader;
mod postgres;

pub use postgres::PgStorage;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{ApiError, ApiResult};
use crate::metadata::{EntityMetadata, FieldKind, RelationMeta};
use crate::sql::SelectPlan;

/// A loaded relation value. A missing key in
/// [`EntityRecord::relations`] means "not loaded", distinct from loaded
/// and empty/absent.
#[derive(Debug, Clone)]
pub enum RelationValue {
    One(Option<Box<EntityRecord>>),
    Many(Vec<EntityRecord>),
}

/// One loaded row, with any resolved relations attached.
///
/// Records are constructed field by field and returned by value; the
/// engine never mutates a live storage object in place.
#[derive(Debug, Clone, Default)]
pub struct EntityRecord {
    /// Column values keyed by column name.
    pub values: serde_json::Map<String, serde_json::Value>,

    /// Resolved relations keyed by relation name.
    pub relations: HashMap<String, RelationValue>,
}

impl EntityRecord {
    pub fn new(values: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            values,
            relations: HashMap::new(),
        }
    }

    /// Column value by name.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.values.get(column)
    }

    /// Primary key value of this record.
    pub fn id_value(&self, meta: &EntityMetadata) -> ApiResult<serde_json::Value> {
        self.get(&meta.primary_key.name).cloned().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!(
                "record of '{}' has no primary key column '{}'",
                meta.name,
                meta.primary_key.name
            ))
        })
    }

    /// Stringified primary key, as exposed in resource documents.
    pub fn id_string(&self, meta: &EntityMetadata) -> ApiResult<String> {
        match self.id_value(meta)? {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Ok(other.to_string()),
        }
    }
}

/// Coerce a public (string) id into the primary key's value type.
pub fn coerce_id(meta: &EntityMetadata, id: &str) -> serde_json::Value {
    match meta.primary_key.kind {
        FieldKind::Number => match id.parse::<i64>() {
            Ok(n) => serde_json::Value::Number(n.into()),
            Err(_) => serde_json::Value::String(id.to_string()),
        },
        _ => serde_json::Value::String(id.to_string()),
    }
}

/// Stringify a stored value for use as a public id or map key.
pub fn value_to_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// A connection to storage, optionally holding an open transaction.
///
/// All statements issued after [`begin`](Self::begin) run inside the
/// transaction until [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
#[async_trait]
pub trait StorageConnection: Send {
    async fn begin(&mut self) -> ApiResult<()>;
    async fn commit(&mut self) -> ApiResult<()>;
    async fn rollback(&mut self) -> ApiResult<()>;

    /// Execute a select plan.
    async fn select(
        &mut self,
        meta: &EntityMetadata,
        plan: &SelectPlan,
    ) -> ApiResult<Vec<EntityRecord>>;

    /// Count rows matching a plan (ignoring pagination).
    async fn count(&mut self, meta: &EntityMetadata, plan: &SelectPlan) -> ApiResult<u64>;

    /// Insert a row; returns the primary key value.
    async fn insert(
        &mut self,
        meta: &EntityMetadata,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> ApiResult<serde_json::Value>;

    /// Update a row by primary key; false when the row does not exist.
    async fn update(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> ApiResult<bool>;

    /// Delete a row by primary key; false when the row does not exist.
    async fn delete(&mut self, meta: &EntityMetadata, id: &serde_json::Value) -> ApiResult<bool>;

    /// Bulk existence check: which of `ids` exist, as public id strings.
    async fn existing_ids(
        &mut self,
        meta: &EntityMetadata,
        ids: &[String],
    ) -> ApiResult<Vec<String>>;

    /// Join-table pairs `(source id, target id)` for a many-to-many
    /// relation, restricted to the given source ids.
    async fn join_pairs(
        &mut self,
        meta: &EntityMetadata,
        relation: &RelationMeta,
        source_ids: &[serde_json::Value],
    ) -> ApiResult<Vec<(String, String)>>;

    /// Point a to-one relation at `target` (or clear it with `None`).
    async fn set_to_one(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        target: Option<&str>,
    ) -> ApiResult<()>;

    /// Replace the full membership of a to-many relation.
    async fn replace_to_many(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()>;

    /// Add members to a to-many relation.
    async fn add_to_many(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()>;

    /// Remove members from a to-many relation.
    async fn remove_from_many(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::FieldMeta;

    fn meta(kind: FieldKind) -> EntityMetadata {
        EntityMetadata::new(
            "Users",
            "users",
            FieldMeta {
                name: "id".to_string(),
                kind,
                nullable: false,
            },
            vec![],
            vec![],
        )
    }

    #[test]
    fn numeric_ids_coerce_to_numbers() {
        let value = coerce_id(&meta(FieldKind::Number), "42");
        assert_eq!(value, serde_json::json!(42));
    }

    #[test]
    fn string_ids_stay_strings() {
        let value = coerce_id(&meta(FieldKind::String), "42");
        assert_eq!(value, serde_json::json!("42"));
    }

    #[test]
    fn id_string_stringifies_numbers() {
        let meta = meta(FieldKind::Number);
        let mut values = serde_json::Map::new();
        values.insert("id".to_string(), serde_json::json!(7));
        let record = EntityRecord::new(values);
        assert_eq!(record.id_string(&meta).unwrap(), "7");
    }
}
