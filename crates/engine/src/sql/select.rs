//! Select-plan translation.
//!
//! Maps a validated query (sorts, sparse fieldsets, pagination) plus
//! compiled filter fragments into a dialect-neutral select plan: column
//! set, join requirements, ordering, and paging. Only the storage adapter
//! renders the plan into concrete SQL.

use std::collections::BTreeSet;

use super::naming::alias_for_relation;
use super::{BoundParam, BracketedPredicate, SqlFragment};
use crate::error::{ApiError, ApiResult};
use crate::metadata::{Cardinality, EntityMetadata, EntityRegistry, RelationLink};
use crate::query::{ResourceQuery, SortDirection};

/// One selected column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectColumn {
    pub alias: String,
    pub column: String,
}

/// A LEFT JOIN requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSpec {
    pub table: String,
    pub alias: String,
    /// Alias-qualified column on the already-joined side.
    pub left: String,
    /// Alias-qualified column on the newly-joined side.
    pub right: String,
}

/// One ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderClause {
    pub alias: String,
    pub column: String,
    pub direction: SortDirection,
}

/// A complete, dialect-neutral select plan.
#[derive(Debug, Clone, Default)]
pub struct SelectPlan {
    pub table: String,
    pub base_alias: String,
    pub columns: Vec<SelectColumn>,
    pub joins: Vec<JoinSpec>,
    /// Set when a join to a to-many relation could duplicate base rows.
    pub distinct: bool,
    pub conditions: Vec<SqlFragment>,
    pub access_rules: Option<BracketedPredicate>,
    pub order: Vec<OrderClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectPlan {
    /// Plan selecting rows whose `column` is in `values`.
    ///
    /// Used by the relation loader and existence checks; selects the full
    /// column set unless `fields` narrows it.
    pub fn by_column_values(
        meta: &EntityMetadata,
        column: &str,
        values: Vec<serde_json::Value>,
        fields: Option<&[String]>,
    ) -> Self {
        let parameter = BoundParam::new(
            format!("params_{column}_load"),
            serde_json::Value::Array(values),
        );
        let condition = SqlFragment::column(
            format!("{}.{}", meta.query_alias, column),
            format!("IN (:params_{column}_load)"),
            parameter,
        );
        let mut columns = base_columns(meta, fields);
        // The filter column is needed to group loaded rows, even when a
        // sparse fieldset excludes it.
        if !columns.iter().any(|c| c.column == column) {
            columns.push(SelectColumn {
                alias: meta.query_alias.clone(),
                column: column.to_string(),
            });
        }
        Self {
            table: meta.table.clone(),
            base_alias: meta.query_alias.clone(),
            columns,
            conditions: vec![condition],
            ..Default::default()
        }
    }

    /// Plan selecting rows by primary key.
    pub fn by_ids(
        meta: &EntityMetadata,
        ids: Vec<serde_json::Value>,
        fields: Option<&[String]>,
    ) -> Self {
        let primary_key = meta.primary_key.name.clone();
        Self::by_column_values(meta, &primary_key, ids, fields)
    }
}

/// Translate query + compiled predicates into a select plan.
pub fn build_select_plan(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    query: &ResourceQuery,
    conditions: Vec<SqlFragment>,
    access_rules: Option<BracketedPredicate>,
) -> ApiResult<SelectPlan> {
    // Aliases that must be joined: relation-filter fragments announce
    // theirs via `select_alias`; dotted sorts add more below.
    let mut needed: BTreeSet<String> = conditions
        .iter()
        .filter_map(|f| f.select_alias.clone())
        .collect();

    let mut order = Vec::new();
    for spec in &query.sort {
        match spec.path.split_once('.') {
            None => order.push(OrderClause {
                alias: meta.query_alias.clone(),
                column: spec.path.clone(),
                direction: spec.direction,
            }),
            Some((relation_name, field)) => {
                let Some(relation) = meta.relation(relation_name) else {
                    return Err(ApiError::validation(
                        format!(
                            "'{relation_name}' is not a relation of '{}'",
                            meta.resource_type
                        ),
                        format!("sort.{}", spec.path),
                    ));
                };
                let rel_alias = alias_for_relation(&meta.query_alias, relation);
                needed.insert(rel_alias.clone());
                order.push(OrderClause {
                    alias: rel_alias,
                    column: field.to_string(),
                    direction: spec.direction,
                });
            }
        }
    }

    let mut joins = Vec::new();
    let mut distinct = false;
    for alias in &needed {
        let Some(relation) = meta
            .relations
            .iter()
            .find(|r| alias_for_relation(&meta.query_alias, r) == *alias)
        else {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "no relation resolves to join alias '{alias}'"
            )));
        };
        let target = registry.target_of(relation)?;
        let join = match &relation.link {
            RelationLink::JoinColumn { column } => JoinSpec {
                table: target.table.clone(),
                alias: alias.clone(),
                left: format!("{}.{}", meta.query_alias, column),
                right: format!("{}.{}", alias, target.primary_key.name),
            },
            RelationLink::ForeignColumn { column } => {
                if relation.cardinality == Cardinality::Many {
                    distinct = true;
                }
                JoinSpec {
                    table: target.table.clone(),
                    alias: alias.clone(),
                    left: format!("{}.{}", meta.query_alias, meta.primary_key.name),
                    right: format!("{}.{}", alias, column),
                }
            }
            RelationLink::JoinTable { .. } => {
                // Many-to-many predicates compile to IN-subqueries and never
                // request a join.
                return Err(ApiError::Internal(anyhow::anyhow!(
                    "many-to-many relation '{}' cannot be joined directly",
                    relation.name
                )));
            }
        };
        joins.push(join);
    }

    let (limit, offset) = match query.page {
        Some(page) => (
            Some(u64::from(page.size)),
            Some(u64::from(page.number.saturating_sub(1)) * u64::from(page.size)),
        ),
        None => (None, None),
    };

    Ok(SelectPlan {
        table: meta.table.clone(),
        base_alias: meta.query_alias.clone(),
        columns: base_columns(meta, query.fields.get("target")),
        joins,
        distinct,
        conditions,
        access_rules,
        order,
        limit,
        offset,
    })
}

/// Column set for an entity: the primary key, the (possibly narrowed)
/// scalar fields, and every to-one join column. Join columns are needed to
/// resolve relation identifiers even when not requested as attributes.
pub(crate) fn base_columns(meta: &EntityMetadata, fields: Option<&[String]>) -> Vec<SelectColumn> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    let mut push = |name: &str, columns: &mut Vec<SelectColumn>| {
        if seen.insert(name.to_string()) {
            columns.push(SelectColumn {
                alias: meta.query_alias.clone(),
                column: name.to_string(),
            });
        }
    };

    push(&meta.primary_key.name, &mut columns);
    match fields {
        Some(subset) => {
            for name in subset {
                if meta.field(name).is_some() {
                    push(name, &mut columns);
                }
            }
        }
        None => {
            for field in &meta.fields {
                push(&field.name, &mut columns);
            }
        }
    }
    for relation in &meta.relations {
        if let RelationLink::JoinColumn { column } = &relation.link {
            push(column, &mut columns);
        }
    }
    columns
}
