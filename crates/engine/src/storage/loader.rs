//! Bulk relation loading.
//!
//! Loads the relations named in an include list for a whole batch of
//! records at once: to-one by join-column ids, has-many by foreign column,
//! many-to-many through the join table. Loaded relations are attached to
//! each record; relations not in the include list stay unloaded.

use std::collections::{HashMap, HashSet};

use super::{value_to_key, EntityRecord, RelationValue, StorageConnection};
use crate::error::{ApiError, ApiResult};
use crate::metadata::{EntityMetadata, EntityRegistry, RelationLink, RelationMeta};
use crate::query::SparseFields;
use crate::sql::SelectPlan;

/// Load every relation in `include` and attach the results to `records`.
pub async fn load_includes(
    conn: &mut dyn StorageConnection,
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    records: &mut [EntityRecord],
    include: &[String],
    fields: &SparseFields,
) -> ApiResult<()> {
    if records.is_empty() {
        return Ok(());
    }
    for name in include {
        let Some(relation) = meta.relation(name) else {
            return Err(ApiError::validation(
                format!("'{name}' is not a relation of '{}'", meta.resource_type),
                format!("include.{name}"),
            ));
        };
        load_relation(conn, registry, meta, records, relation, fields.get(name)).await?;
    }
    Ok(())
}

/// Load one relation for a batch of records.
pub async fn load_relation(
    conn: &mut dyn StorageConnection,
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    records: &mut [EntityRecord],
    relation: &RelationMeta,
    fields: Option<&[String]>,
) -> ApiResult<()> {
    let target = registry.target_of(relation)?;

    match &relation.link {
        RelationLink::JoinColumn { column } => {
            let mut wanted: HashSet<String> = HashSet::new();
            let mut keys = Vec::new();
            for record in records.iter() {
                if let Some(value) = record.get(column) {
                    if !value.is_null() && wanted.insert(value_to_key(value)) {
                        keys.push(value.clone());
                    }
                }
            }

            let loaded = if keys.is_empty() {
                HashMap::new()
            } else {
                let plan = SelectPlan::by_ids(&target, keys, fields);
                index_by(&target, conn.select(&target, &plan).await?)?
            };

            for record in records.iter_mut() {
                let related = record
                    .get(column)
                    .filter(|v| !v.is_null())
                    .and_then(|v| loaded.get(&value_to_key(v)))
                    .cloned()
                    .map(Box::new);
                record
                    .relations
                    .insert(relation.name.clone(), RelationValue::One(related));
            }
        }
        RelationLink::ForeignColumn { column } => {
            let ids = record_ids(meta, records)?;
            let plan = SelectPlan::by_column_values(&target, column, ids, fields);
            let rows = conn.select(&target, &plan).await?;

            let mut grouped: HashMap<String, Vec<EntityRecord>> = HashMap::new();
            for row in rows {
                let Some(owner) = row.get(column).filter(|v| !v.is_null()) else {
                    continue;
                };
                grouped.entry(value_to_key(owner)).or_default().push(row);
            }

            for record in records.iter_mut() {
                let key = record.id_string(meta)?;
                let related = grouped.remove(&key).unwrap_or_default();
                record
                    .relations
                    .insert(relation.name.clone(), RelationValue::Many(related));
            }
        }
        RelationLink::JoinTable { .. } => {
            let ids = record_ids(meta, records)?;
            let pairs = conn.join_pairs(meta, relation, &ids).await?;

            let mut target_keys: Vec<serde_json::Value> = Vec::new();
            let mut seen = HashSet::new();
            for (_, target_id) in &pairs {
                if seen.insert(target_id.clone()) {
                    target_keys.push(super::coerce_id(&target, target_id));
                }
            }

            let loaded = if target_keys.is_empty() {
                HashMap::new()
            } else {
                let plan = SelectPlan::by_ids(&target, target_keys, fields);
                index_by(&target, conn.select(&target, &plan).await?)?
            };

            let mut membership: HashMap<String, Vec<String>> = HashMap::new();
            for (source_id, target_id) in pairs {
                membership.entry(source_id).or_default().push(target_id);
            }

            for record in records.iter_mut() {
                let key = record.id_string(meta)?;
                let related = membership
                    .remove(&key)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|target_id| loaded.get(&target_id).cloned())
                    .collect();
                record
                    .relations
                    .insert(relation.name.clone(), RelationValue::Many(related));
            }
        }
    }
    Ok(())
}

fn record_ids(meta: &EntityMetadata, records: &[EntityRecord]) -> ApiResult<Vec<serde_json::Value>> {
    records.iter().map(|r| r.id_value(meta)).collect()
}

fn index_by(
    meta: &EntityMetadata,
    records: Vec<EntityRecord>,
) -> ApiResult<HashMap<String, EntityRecord>> {
    let mut map = HashMap::with_capacity(records.len());
    for record in records {
        map.insert(record.id_string(meta)?, record);
    }
    Ok(map)
}
