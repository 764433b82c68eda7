//! Relationship resolution and validation.
//!
//! Validates relationship-mutation payloads (cardinality, declared type,
//! existence) and bulk-loads the referenced rows. Existence is checked in
//! one query per relation, and every missing id is reported together
//! rather than failing on the first.

use async_stream::try_stream;
use futures_core::Stream;

use crate::error::{ApiError, ApiResult, ErrorObject};
use crate::metadata::{Cardinality, EntityMetadata, EntityRegistry};
use crate::sql::SelectPlan;
use crate::storage::{coerce_id, EntityRecord, StorageConnection};

/// Validated relationship reference ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIds {
    /// To-one target, `None` to clear.
    One(Option<String>),
    /// To-many membership, possibly empty.
    Many(Vec<String>),
}

/// A relation resolved to loaded records.
#[derive(Debug, Clone)]
pub enum ResolvedRelation {
    One(Option<EntityRecord>),
    Many(Vec<EntityRecord>),
}

/// Validate the `data` member of a relationship payload.
///
/// Enforces cardinality (array for to-many, object or null for to-one),
/// checks every item's declared `type` against the relation target's
/// resource type (listing each offending index), then runs one bulk
/// existence check and reports all missing ids in a single error.
pub async fn validate_relation_input_data(
    conn: &mut dyn StorageConnection,
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    relation_name: &str,
    data: &serde_json::Value,
    pointer: &str,
) -> ApiResult<ResolvedIds> {
    let Some(relation) = meta.relation(relation_name) else {
        return Err(ApiError::validation(
            format!(
                "'{relation_name}' is not a relation of '{}'",
                meta.resource_type
            ),
            pointer,
        ));
    };
    let target = registry.target_of(relation)?;

    let ids = match relation.cardinality {
        Cardinality::Many => {
            let Some(items) = data.as_array() else {
                return Err(ApiError::unprocessable(
                    format!("relationship '{relation_name}' is to-many and expects an array"),
                    pointer,
                ));
            };

            let mut type_errors = Vec::new();
            let mut ids = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                match parse_identifier(item, &target.resource_type) {
                    Ok(id) => ids.push(id),
                    Err(detail) => {
                        type_errors.push(ErrorObject::new(detail, format!("{pointer}/{index}")));
                    }
                }
            }
            if !type_errors.is_empty() {
                return Err(ApiError::Unprocessable(type_errors));
            }
            ResolvedIds::Many(ids)
        }
        Cardinality::One => {
            if data.is_null() {
                ResolvedIds::One(None)
            } else if data.is_array() {
                return Err(ApiError::unprocessable(
                    format!("relationship '{relation_name}' is to-one and expects a single object"),
                    pointer,
                ));
            } else {
                match parse_identifier(data, &target.resource_type) {
                    Ok(id) => ResolvedIds::One(Some(id)),
                    Err(detail) => {
                        return Err(ApiError::unprocessable(detail, pointer));
                    }
                }
            }
        }
    };

    check_existence(conn, &target, &ids, pointer).await?;
    Ok(ids)
}

/// Lazily resolve each relation in a `relationships` payload, yielding
/// `(relation name, loaded records)` one relation at a time so callers can
/// start persisting as soon as each relation resolves.
pub fn find_relationships<'a>(
    conn: &'a mut dyn StorageConnection,
    registry: &'a EntityRegistry,
    meta: &'a EntityMetadata,
    relationships: &'a serde_json::Map<String, serde_json::Value>,
) -> impl Stream<Item = ApiResult<(String, ResolvedRelation)>> + 'a {
    try_stream! {
        for (name, entry) in relationships {
            let pointer = format!("data/relationships/{name}/data");
            let data = entry.get("data").ok_or_else(|| {
                ApiError::unprocessable(
                    format!("relationship '{name}' is missing its data member"),
                    format!("data/relationships/{name}"),
                )
            })?;

            let ids =
                validate_relation_input_data(conn, registry, meta, name, data, &pointer).await?;
            let relation = meta
                .relation(name)
                .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("relation vanished")))?;
            let target = registry.target_of(relation)?;

            let resolved = match ids {
                ResolvedIds::One(None) => ResolvedRelation::One(None),
                ResolvedIds::One(Some(id)) => {
                    let records = load_in_id_order(conn, &target, &[id]).await?;
                    ResolvedRelation::One(records.into_iter().next())
                }
                ResolvedIds::Many(ids) => {
                    let records = load_in_id_order(conn, &target, &ids).await?;
                    ResolvedRelation::Many(records)
                }
            };

            yield (name.clone(), resolved);
        }
    }
}

/// Load records by public id, preserving the input order.
pub async fn load_in_id_order(
    conn: &mut dyn StorageConnection,
    target: &EntityMetadata,
    ids: &[String],
) -> ApiResult<Vec<EntityRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> = ids.iter().map(|id| coerce_id(target, id)).collect();
    let plan = SelectPlan::by_ids(target, values, None);
    let mut loaded = conn.select(target, &plan).await?;

    let mut ordered = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(position) = loaded
            .iter()
            .position(|r| r.id_string(target).map(|s| &s == id).unwrap_or(false))
        {
            ordered.push(loaded.swap_remove(position));
        }
    }
    Ok(ordered)
}

fn parse_identifier(value: &serde_json::Value, expected_type: &str) -> Result<String, String> {
    let Some(object) = value.as_object() else {
        return Err("resource identifier must be an object with type and id".to_string());
    };
    let declared = object.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if declared != expected_type {
        return Err(format!(
            "expected resource type '{expected_type}', got '{declared}'"
        ));
    }
    match object.get("id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err("resource identifier is missing an id".to_string()),
    }
}

async fn check_existence(
    conn: &mut dyn StorageConnection,
    target: &EntityMetadata,
    ids: &ResolvedIds,
    pointer: &str,
) -> ApiResult<()> {
    let wanted: Vec<String> = match ids {
        ResolvedIds::One(None) => return Ok(()),
        ResolvedIds::One(Some(id)) => vec![id.clone()],
        ResolvedIds::Many(ids) => {
            if ids.is_empty() {
                return Ok(());
            }
            let mut deduped = ids.clone();
            deduped.sort();
            deduped.dedup();
            deduped
        }
    };

    let existing = conn.existing_ids(target, &wanted).await?;
    let missing: Vec<&String> = wanted.iter().filter(|id| !existing.contains(*id)).collect();
    if missing.is_empty() {
        return Ok(());
    }

    let errors = missing
        .into_iter()
        .map(|id| {
            ErrorObject::new(
                format!(
                    "resource of type '{}' with id '{}' does not exist",
                    target.resource_type, id
                ),
                pointer.to_string(),
            )
        })
        .collect();
    Err(ApiError::NotFound(errors))
}
