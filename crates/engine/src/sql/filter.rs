//! Filter expression compiler.
//!
//! Compiles validated filter trees into predicate fragments. Scalar
//! predicates become `alias.column <op> :param` templates; relation
//! predicates become joins (signaled via `select_alias`) or correlated
//! subqueries, depending on the relation's SQL linkage.

use super::naming::{alias_for_relation, join_table_alias, ParamNamer};
use super::{BoundParam, SqlFragment, Subquery};
use crate::error::{ApiError, ApiResult};
use crate::metadata::{EntityMetadata, EntityRegistry, RelationLink, RelationMeta};
use crate::query::{FilterNode, FilterOperator, FilterValue, RelationBranch};

/// Compile target-entity filter nodes into predicate fragments.
pub fn compile_target_filter(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    nodes: &[FilterNode],
    namer: &mut ParamNamer,
) -> ApiResult<Vec<SqlFragment>> {
    let mut fragments = Vec::new();
    for node in nodes {
        fragments.extend(compile_target_node(registry, meta, node, namer)?);
    }
    Ok(fragments)
}

/// Compile relation-qualified filter branches.
///
/// Joinable relations produce one fragment per field predicate, aliased to
/// the relation alias and tagged with `select_alias` so the caller knows to
/// join. Many-to-many branches collapse into a single `IN (subquery)`
/// fragment over the join table: evaluating the predicates against the join
/// table avoids duplicating base rows.
pub fn compile_relation_filter(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    branches: &[RelationBranch],
    namer: &mut ParamNamer,
) -> ApiResult<Vec<SqlFragment>> {
    let mut fragments = Vec::new();
    for branch in branches {
        fragments.extend(compile_relation_branch(
            registry,
            meta,
            &branch.relation,
            &branch.nested,
            namer,
        )?);
    }
    Ok(fragments)
}

fn compile_target_node(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    node: &FilterNode,
    namer: &mut ParamNamer,
) -> ApiResult<Vec<SqlFragment>> {
    match node {
        FilterNode::Field {
            field,
            operator,
            value,
        } => {
            if let Some(field_meta) = meta.field(field) {
                let column_ref = format!("{}.{}", meta.query_alias, field_meta.name);
                Ok(vec![scalar_predicate(
                    &column_ref,
                    field,
                    *operator,
                    value,
                    namer,
                    &format!("filter.target.{field}"),
                )?])
            } else if let Some(relation) = meta.relation(field) {
                Ok(vec![relation_null_check(
                    registry, meta, relation, *operator, value,
                )?])
            } else {
                Err(ApiError::validation(
                    format!("unknown field '{}' on '{}'", field, meta.resource_type),
                    format!("filter.target.{field}"),
                ))
            }
        }
        FilterNode::And(children) => {
            let mut fragments = Vec::new();
            for child in children {
                fragments.extend(compile_target_node(registry, meta, child, namer)?);
            }
            Ok(fragments)
        }
        FilterNode::Or(children) => {
            let mut branches = Vec::new();
            for child in children {
                let fragments = compile_target_node(registry, meta, child, namer)?;
                branches.push(combine(fragments, " AND "));
            }
            Ok(vec![combine(branches, " OR ")])
        }
        FilterNode::Not(child) => {
            let fragments = compile_target_node(registry, meta, child, namer)?;
            let inner = combine(fragments, " AND ");
            Ok(vec![SqlFragment::group(
                format!("NOT {}", inner.expression),
                inner.parameters,
            )])
        }
        FilterNode::Relation { relation, nested } => {
            compile_relation_branch(registry, meta, relation, nested, namer)
        }
    }
}

/// Null-check shorthand for a relation name used directly in a target
/// filter. Dispatches by linkage: a join column gets a direct null check;
/// anything reached through another table gets a correlated existence
/// subquery on the current primary key.
fn relation_null_check(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    relation: &RelationMeta,
    operator: FilterOperator,
    value: &FilterValue,
) -> ApiResult<SqlFragment> {
    let pointer = format!("filter.target.{}", relation.name);
    if !matches!(operator, FilterOperator::Eq | FilterOperator::Ne) || !value.is_null_literal() {
        return Err(ApiError::validation(
            format!(
                "relation '{}' in a target filter only supports eq/ne against \"null\"",
                relation.name
            ),
            pointer,
        ));
    }
    // eq:"null" means "no related row"; ne:"null" means "at least one".
    let wants_present = operator == FilterOperator::Ne;

    match &relation.link {
        RelationLink::JoinColumn { column } => Ok(SqlFragment::null_check(
            format!("{}.{}", meta.query_alias, column),
            wants_present,
        )),
        RelationLink::ForeignColumn { column } => {
            let target = registry.target_of(relation)?;
            let rel_alias = alias_for_relation(&meta.query_alias, relation);
            let sql = format!(
                "SELECT 1 FROM {} {} WHERE {}.{} = {}.{}",
                target.table,
                rel_alias,
                rel_alias,
                column,
                meta.query_alias,
                meta.primary_key.name
            );
            Ok(SqlFragment::exists(
                Subquery {
                    sql,
                    parameters: Vec::new(),
                },
                !wants_present,
            ))
        }
        RelationLink::JoinTable {
            table,
            source_column,
            ..
        } => {
            let jt = join_table_alias(&meta.query_alias, relation);
            let sql = format!(
                "SELECT 1 FROM {} {} WHERE {}.{} = {}.{}",
                table, jt, jt, source_column, meta.query_alias, meta.primary_key.name
            );
            Ok(SqlFragment::exists(
                Subquery {
                    sql,
                    parameters: Vec::new(),
                },
                !wants_present,
            ))
        }
    }
}

fn compile_relation_branch(
    registry: &EntityRegistry,
    meta: &EntityMetadata,
    relation_name: &str,
    nested: &[FilterNode],
    namer: &mut ParamNamer,
) -> ApiResult<Vec<SqlFragment>> {
    let pointer = format!("filter.relation.{relation_name}");
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
    let rel_alias = alias_for_relation(&meta.query_alias, relation);

    match &relation.link {
        RelationLink::JoinColumn { .. } | RelationLink::ForeignColumn { .. } => {
            let mut fragments = Vec::new();
            for node in nested {
                let fragment =
                    compile_on_alias(&target, &rel_alias, relation_name, node, namer)?;
                fragments.push(fragment.requiring_join(rel_alias.clone()));
            }
            Ok(fragments)
        }
        RelationLink::JoinTable {
            table,
            source_column,
            target_column,
        } => {
            let jt = join_table_alias(&meta.query_alias, relation);
            let mut clauses = Vec::new();
            let mut parameters = Vec::new();
            for node in nested {
                let fragment =
                    compile_on_alias(&target, &rel_alias, relation_name, node, namer)?;
                parameters.extend(fragment.collect_parameters().into_iter().cloned());
                clauses.push(fragment.to_sql());
            }

            let mut sql = format!(
                "SELECT {}.{} FROM {} {} INNER JOIN {} {} ON {}.{} = {}.{}",
                jt,
                source_column,
                table,
                jt,
                target.table,
                rel_alias,
                rel_alias,
                target.primary_key.name,
                jt,
                target_column
            );
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }

            Ok(vec![SqlFragment::in_subquery(
                format!("{}.{}", meta.query_alias, meta.primary_key.name),
                Subquery { sql, parameters },
            )])
        }
    }
}

fn compile_on_alias(
    target: &EntityMetadata,
    alias: &str,
    relation_name: &str,
    node: &FilterNode,
    namer: &mut ParamNamer,
) -> ApiResult<SqlFragment> {
    match node {
        FilterNode::Field {
            field,
            operator,
            value,
        } => {
            let pointer = format!("filter.relation.{relation_name}.{field}");
            let Some(field_meta) = target.field(field) else {
                return Err(ApiError::validation(
                    format!("unknown field '{}' on '{}'", field, target.resource_type),
                    pointer,
                ));
            };
            scalar_predicate(
                &format!("{}.{}", alias, field_meta.name),
                &format!("{relation_name}.{field}"),
                *operator,
                value,
                namer,
                &pointer,
            )
        }
        FilterNode::And(children) => {
            let mut fragments = Vec::new();
            for child in children {
                fragments.push(compile_on_alias(target, alias, relation_name, child, namer)?);
            }
            Ok(combine(fragments, " AND "))
        }
        FilterNode::Or(children) => {
            let mut fragments = Vec::new();
            for child in children {
                fragments.push(compile_on_alias(target, alias, relation_name, child, namer)?);
            }
            Ok(combine(fragments, " OR "))
        }
        FilterNode::Not(child) => {
            let inner = compile_on_alias(target, alias, relation_name, child, namer)?;
            let parameters = inner.collect_parameters().into_iter().cloned().collect();
            Ok(SqlFragment::group(
                format!("NOT ( {} )", inner.to_sql()),
                parameters,
            ))
        }
        FilterNode::Relation { relation, .. } => Err(ApiError::validation(
            format!("nested relation filter '{relation}' is not supported"),
            format!("filter.relation.{relation_name}.{relation}"),
        )),
    }
}

/// Collapse fragments into one parenthesized group.
fn combine(fragments: Vec<SqlFragment>, joiner: &str) -> SqlFragment {
    if fragments.is_empty() {
        return SqlFragment::group("TRUE", Vec::new());
    }
    let mut parameters = Vec::new();
    let mut texts = Vec::new();
    for fragment in &fragments {
        parameters.extend(fragment.collect_parameters().into_iter().cloned());
        texts.push(fragment.to_sql());
    }
    SqlFragment::group(format!("( {} )", texts.join(joiner)), parameters)
}

/// Compile one scalar predicate.
///
/// The textual `"null"` token switches `eq`/`ne` into the null-check branch
/// with no bound parameter. `like` wraps its value in `%...%` before
/// binding; `in`/`nin` bind the expanded sequence. No other operator
/// transforms its value.
pub(super) fn scalar_predicate(
    column_ref: &str,
    field_path: &str,
    operator: FilterOperator,
    value: &FilterValue,
    namer: &mut ParamNamer,
    pointer: &str,
) -> ApiResult<SqlFragment> {
    if matches!(operator, FilterOperator::Eq | FilterOperator::Ne) && value.is_null_literal() {
        return Ok(SqlFragment::null_check(
            column_ref,
            operator == FilterOperator::Ne,
        ));
    }

    match operator {
        FilterOperator::In | FilterOperator::Nin => {
            let list = value.to_list();
            if list.is_empty() {
                return Err(ApiError::validation(
                    "in/nin require a non-empty sequence of values",
                    pointer,
                ));
            }
            let name = namer.name(field_path);
            let values = serde_json::Value::Array(list.iter().map(FilterValue::to_json).collect());
            let keyword = if operator == FilterOperator::In {
                "IN"
            } else {
                "NOT IN"
            };
            Ok(SqlFragment::column(
                column_ref,
                format!("{keyword} (:{name})"),
                BoundParam::new(name, values),
            ))
        }
        FilterOperator::Like => {
            let raw = scalar_text(value).ok_or_else(|| {
                ApiError::validation("like requires a scalar value", pointer)
            })?;
            let name = namer.name(field_path);
            Ok(SqlFragment::column(
                column_ref,
                format!("LIKE :{name}"),
                BoundParam::new(name, serde_json::Value::String(format!("%{raw}%"))),
            ))
        }
        _ => {
            let name = namer.name(field_path);
            Ok(SqlFragment::column(
                column_ref,
                format!("{} :{}", operator_sql(operator), name),
                BoundParam::new(name, value.to_json()),
            ))
        }
    }
}

fn scalar_text(value: &FilterValue) -> Option<String> {
    match value {
        FilterValue::String(s) => Some(s.clone()),
        FilterValue::Number(n) => Some(n.to_string()),
        FilterValue::Bool(b) => Some(b.to_string()),
        FilterValue::List(_) => None,
    }
}

fn operator_sql(operator: FilterOperator) -> &'static str {
    match operator {
        FilterOperator::Eq => "=",
        FilterOperator::Ne => "<>",
        FilterOperator::Gt => ">",
        FilterOperator::Gte => ">=",
        FilterOperator::Lt => "<",
        FilterOperator::Lte => "<=",
        FilterOperator::Like => "LIKE",
        FilterOperator::Regexp => "~",
        FilterOperator::In => "IN",
        FilterOperator::Nin => "NOT IN",
        FilterOperator::Overlap => "&&",
        FilterOperator::ArrayContains => "@>",
    }
}
