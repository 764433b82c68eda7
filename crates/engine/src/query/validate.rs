//! Semantic validation of parsed queries against entity metadata.
//!
//! Every referenced field, relation, include, and sort path must exist on
//! the target entity. Problems are collected and reported together, each
//! with its position in the original query.

use tracing::warn;

use super::{Filter, FilterNode, FilterOperator, Page, ResourceQuery};
use crate::error::{ApiError, ApiResult, ErrorObject};
use crate::metadata::{Cardinality, EntityMetadata, EntityRegistry};

/// Validate a parsed query against the target entity's metadata.
///
/// Mutates the query only to resolve pagination: the page size is clamped
/// to `max_page_size` and defaulted when absent.
pub fn validate_query(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    query: &mut ResourceQuery,
    max_page_size: u32,
    default_page_size: u32,
) -> ApiResult<()> {
    let mut errors = Vec::new();

    validate_filter(registry, meta, &query.filter, &mut errors);

    for name in &query.include {
        if meta.relation(name).is_none() {
            errors.push(ErrorObject::new(
                format!("'{name}' is not a relation of '{}'", meta.resource_type),
                format!("include.{name}"),
            ));
        }
    }

    validate_sparse_fields(registry, meta, query, &mut errors);
    validate_sort(registry, meta, query, &mut errors);

    if let Some(page) = &mut query.page {
        resolve_page(page, max_page_size, default_page_size);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}

fn validate_filter(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    filter: &Filter,
    errors: &mut Vec<ErrorObject>,
) {
    for node in &filter.target {
        validate_target_node(meta, node, errors);
    }

    for branch in &filter.relation {
        let pointer = format!("filter.relation.{}", branch.relation);
        let Some(relation) = meta.relation(&branch.relation) else {
            errors.push(ErrorObject::new(
                format!(
                    "'{}' is not a relation of '{}'",
                    branch.relation, meta.resource_type
                ),
                pointer,
            ));
            continue;
        };
        let Ok(target) = registry.target_of(relation) else {
            errors.push(ErrorObject::new(
                format!("relation '{}' has no registered target", branch.relation),
                pointer,
            ));
            continue;
        };
        for node in &branch.nested {
            if let FilterNode::Field {
                field,
                operator,
                value,
            } = node
            {
                let field_pointer = format!("{pointer}.{field}");
                if target.field(field).is_none() {
                    errors.push(ErrorObject::new(
                        format!("unknown field '{}' on '{}'", field, target.resource_type),
                        field_pointer,
                    ));
                    continue;
                }
                check_sequence_operators(*operator, value, &field_pointer, errors);
            }
        }
    }
}

fn validate_target_node(meta: &EntityMetadata, node: &FilterNode, errors: &mut Vec<ErrorObject>) {
    match node {
        FilterNode::Field {
            field,
            operator,
            value,
        } => {
            let pointer = format!("filter.target.{field}");
            if meta.field(field).is_some() {
                check_sequence_operators(*operator, value, &pointer, errors);
            } else if meta.relation(field).is_some() {
                // Relation-name shorthand: only a null-check makes sense.
                let null_check = matches!(operator, FilterOperator::Eq | FilterOperator::Ne)
                    && value.is_null_literal();
                if !null_check {
                    errors.push(ErrorObject::new(
                        format!(
                            "relation '{field}' in a target filter only supports eq/ne against \"null\""
                        ),
                        pointer,
                    ));
                }
            } else {
                errors.push(ErrorObject::new(
                    format!("unknown field '{}' on '{}'", field, meta.resource_type),
                    pointer,
                ));
            }
        }
        FilterNode::And(children) | FilterNode::Or(children) => {
            for child in children {
                validate_target_node(meta, child, errors);
            }
        }
        FilterNode::Not(child) => validate_target_node(meta, child, errors),
        FilterNode::Relation { .. } => {
            // Relation predicates arrive through the relation branch.
        }
    }
}

fn check_sequence_operators(
    operator: FilterOperator,
    value: &super::FilterValue,
    pointer: &str,
    errors: &mut Vec<ErrorObject>,
) {
    if matches!(operator, FilterOperator::In | FilterOperator::Nin) {
        let list = value.to_list();
        let empty = list.is_empty()
            || list
                .iter()
                .all(|v| matches!(v, super::FilterValue::String(s) if s.is_empty()));
        if empty {
            errors.push(ErrorObject::new(
                "in/nin require a non-empty sequence of values",
                pointer.to_string(),
            ));
        }
    }
}

fn validate_sparse_fields(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    query: &ResourceQuery,
    errors: &mut Vec<ErrorObject>,
) {
    for (key, names) in &query.fields.0 {
        if key == "target" {
            for name in names {
                if meta.field(name).is_none() {
                    errors.push(ErrorObject::new(
                        format!("unknown field '{}' on '{}'", name, meta.resource_type),
                        format!("fields.target.{name}"),
                    ));
                }
            }
            continue;
        }

        let Some(relation) = meta.relation(key) else {
            errors.push(ErrorObject::new(
                format!("'{key}' is not a relation of '{}'", meta.resource_type),
                format!("fields.{key}"),
            ));
            continue;
        };
        let Ok(target) = registry.target_of(relation) else {
            continue;
        };
        for name in names {
            if target.field(name).is_none() {
                errors.push(ErrorObject::new(
                    format!("unknown field '{}' on '{}'", name, target.resource_type),
                    format!("fields.{key}.{name}"),
                ));
            }
        }
    }
}

fn validate_sort(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    query: &ResourceQuery,
    errors: &mut Vec<ErrorObject>,
) {
    for spec in &query.sort {
        let pointer = format!("sort.{}", spec.path);
        match spec.path.split_once('.') {
            None => {
                if meta.field(&spec.path).is_none() {
                    errors.push(ErrorObject::new(
                        format!(
                            "unknown sort field '{}' on '{}'",
                            spec.path, meta.resource_type
                        ),
                        pointer,
                    ));
                }
            }
            Some((relation_name, field)) => {
                let Some(relation) = meta.relation(relation_name) else {
                    errors.push(ErrorObject::new(
                        format!(
                            "'{relation_name}' is not a relation of '{}'",
                            meta.resource_type
                        ),
                        pointer,
                    ));
                    continue;
                };
                if relation.cardinality == Cardinality::Many {
                    errors.push(ErrorObject::new(
                        format!("cannot sort by to-many relation '{relation_name}'"),
                        pointer,
                    ));
                    continue;
                }
                if let Ok(target) = registry.target_of(relation) {
                    if target.field(field).is_none() {
                        errors.push(ErrorObject::new(
                            format!("unknown field '{}' on '{}'", field, target.resource_type),
                            pointer,
                        ));
                    }
                }
            }
        }
    }
}

fn resolve_page(page: &mut Page, max_page_size: u32, default_page_size: u32) {
    if page.size == 0 {
        page.size = default_page_size;
    }
    if page.size > max_page_size {
        warn!(
            requested = page.size,
            capped = max_page_size,
            "page size exceeds maximum, capping"
        );
        page.size = max_page_size;
    }
    if page.number == 0 {
        page.number = 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::{FieldKind, FieldMeta, RelationLink, RelationMeta};
    use crate::query::ResourceQuery;
    use serde_json::json;

    struct Fixture;

    impl crate::metadata::EntityMetadataProvider for Fixture {
        fn entity_names(&self) -> Vec<String> {
            vec!["Users".to_string(), "Roles".to_string()]
        }

        fn table(&self, entity: &str) -> anyhow::Result<String> {
            Ok(entity.to_lowercase())
        }

        fn fields(&self, entity: &str) -> anyhow::Result<Vec<FieldMeta>> {
            let mut fields = vec![
                FieldMeta {
                    name: "id".to_string(),
                    kind: FieldKind::Number,
                    nullable: false,
                },
                FieldMeta {
                    name: "created".to_string(),
                    kind: FieldKind::Date,
                    nullable: false,
                },
            ];
            if entity == "Users" {
                fields.push(FieldMeta {
                    name: "login".to_string(),
                    kind: FieldKind::String,
                    nullable: false,
                });
            } else {
                fields.push(FieldMeta {
                    name: "key".to_string(),
                    kind: FieldKind::String,
                    nullable: false,
                });
            }
            Ok(fields)
        }

        fn primary_key(&self, _entity: &str) -> anyhow::Result<FieldMeta> {
            Ok(FieldMeta {
                name: "id".to_string(),
                kind: FieldKind::Number,
                nullable: false,
            })
        }

        fn relations(&self, entity: &str) -> anyhow::Result<Vec<RelationMeta>> {
            if entity == "Users" {
                Ok(vec![RelationMeta {
                    name: "roles".to_string(),
                    cardinality: Cardinality::Many,
                    nullable: true,
                    target: "Roles".to_string(),
                    link: RelationLink::JoinTable {
                        table: "users_have_roles".to_string(),
                        source_column: "user_id".to_string(),
                        target_column: "role_id".to_string(),
                    },
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    fn setup() -> (EntityRegistry, std::sync::Arc<EntityMetadata>) {
        let registry = EntityRegistry::from_provider(&Fixture).unwrap();
        let meta = registry.get("Users").unwrap();
        (registry, meta)
    }

    #[test]
    fn unknown_field_reports_position() {
        let (registry, meta) = setup();
        let mut query = ResourceQuery::from_value(&json!({
            "filter": { "target": { "nmae": { "eq": "x" } } }
        }))
        .unwrap();

        let err = validate_query(&registry, &meta, &mut query, 100, 20).unwrap_err();
        let ApiError::Validation(objects) = err else {
            panic!("expected validation error");
        };
        assert_eq!(
            objects[0].source.as_ref().unwrap().pointer,
            "filter.target.nmae"
        );
    }

    #[test]
    fn relation_shorthand_requires_null_literal() {
        let (registry, meta) = setup();
        let mut query = ResourceQuery::from_value(&json!({
            "filter": { "target": { "roles": { "eq": "admin" } } }
        }))
        .unwrap();

        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_err());

        let mut query = ResourceQuery::from_value(&json!({
            "filter": { "target": { "roles": { "ne": "null" } } }
        }))
        .unwrap();
        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_ok());
    }

    #[test]
    fn empty_in_sequence_rejected() {
        let (registry, meta) = setup();
        let mut query = ResourceQuery::from_value(&json!({
            "filter": { "target": { "login": { "in": "" } } }
        }))
        .unwrap();

        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_err());
    }

    #[test]
    fn page_size_clamped_and_defaulted() {
        let (registry, meta) = setup();
        let mut query =
            ResourceQuery::from_value(&json!({ "page": { "number": 2, "size": 500 } })).unwrap();
        validate_query(&registry, &meta, &mut query, 100, 20).unwrap();
        assert_eq!(query.page.unwrap().size, 100);

        let mut query = ResourceQuery::from_value(&json!({ "page": { "number": 1 } })).unwrap();
        validate_query(&registry, &meta, &mut query, 100, 20).unwrap();
        assert_eq!(query.page.unwrap().size, 20);
    }

    #[test]
    fn sort_by_to_many_relation_rejected() {
        let (registry, meta) = setup();
        let mut query = ResourceQuery::from_value(&json!({ "sort": "roles.key" })).unwrap();
        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_err());

        let mut query = ResourceQuery::from_value(&json!({ "sort": "-created" })).unwrap();
        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_ok());
    }

    #[test]
    fn include_must_be_declared_relation() {
        let (registry, meta) = setup();
        let mut query = ResourceQuery::from_value(&json!({ "include": "comments" })).unwrap();
        assert!(validate_query(&registry, &meta, &mut query, 100, 20).is_err());
    }
}
