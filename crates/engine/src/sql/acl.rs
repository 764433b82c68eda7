//! Access-rule compiler.
//!
//! Compiles a boolean rule tree (`$and`/`$or`/`$not` plus `$`-prefixed
//! field operators) into one self-contained bracketed predicate group, so
//! authorization constraints can be conjoined with any user filter without
//! precedence interference.
//!
//! Rule trees come from a policy engine that evolves independently of this
//! compiler: unrecognized operators (and fields) are skipped with a warning
//! rather than failing the whole compile.

use tracing::warn;

use super::filter::scalar_predicate;
use super::naming::ParamNamer;
use super::{BoundParam, BracketedPredicate};
use crate::error::ApiResult;
use crate::metadata::EntityMetadata;
use crate::query::{FilterOperator, FilterValue};

/// Compile an access-rule tree into one bracketed predicate group.
pub fn compile_access_rules(
    meta: &EntityMetadata,
    rules: &serde_json::Value,
    namer: &mut ParamNamer,
) -> ApiResult<BracketedPredicate> {
    let mut parameters = Vec::new();
    let clause = render_conjunction(meta, rules, namer, &mut parameters)?;
    let expression = match clause {
        Some(text) => format!("( {text} )"),
        None => "( TRUE )".to_string(),
    };
    Ok(BracketedPredicate {
        expression,
        parameters,
    })
}

/// Render a rule object as an AND-joined clause. Returns `None` when every
/// entry was skipped.
fn render_conjunction(
    meta: &EntityMetadata,
    rules: &serde_json::Value,
    namer: &mut ParamNamer,
    parameters: &mut Vec<BoundParam>,
) -> ApiResult<Option<String>> {
    let Some(object) = rules.as_object() else {
        warn!("access-rule tree is not an object, skipping");
        return Ok(None);
    };

    let mut clauses = Vec::new();

    for (key, value) in object {
        match key.as_str() {
            "$and" => {
                for child in value.as_array().into_iter().flatten() {
                    if let Some(text) = render_conjunction(meta, child, namer, parameters)? {
                        clauses.push(format!("( {text} )"));
                    }
                }
            }
            "$or" => {
                let mut branches = Vec::new();
                for child in value.as_array().into_iter().flatten() {
                    if let Some(text) = render_conjunction(meta, child, namer, parameters)? {
                        branches.push(text);
                    }
                }
                // One parenthesized OR clause, so conjunction with sibling
                // AND terms keeps correct precedence.
                if !branches.is_empty() {
                    clauses.push(format!("( {} )", branches.join(" OR ")));
                }
            }
            "$not" => {
                if let Some(text) = render_conjunction(meta, value, namer, parameters)? {
                    clauses.push(format!("NOT ( {text} )"));
                }
            }
            field => {
                if let Some(clause) = render_field_rules(meta, field, value, namer, parameters)? {
                    clauses.push(clause);
                }
            }
        }
    }

    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(clauses.join(" AND ")))
    }
}

fn render_field_rules(
    meta: &EntityMetadata,
    field: &str,
    rules: &serde_json::Value,
    namer: &mut ParamNamer,
    parameters: &mut Vec<BoundParam>,
) -> ApiResult<Option<String>> {
    let Some(field_meta) = meta.field(field) else {
        warn!(field = %field, entity = %meta.name, "skipping access rule on unknown field");
        return Ok(None);
    };
    let Some(ops) = rules.as_object() else {
        warn!(field = %field, "access rule for field is not an operator object, skipping");
        return Ok(None);
    };

    let column_ref = format!("{}.{}", meta.query_alias, field_meta.name);
    let mut clauses = Vec::new();

    for (key, raw) in ops {
        let Some(operator) = key.strip_prefix('$').and_then(FilterOperator::from_key) else {
            warn!(operator = %key, field = %field, "skipping unrecognized access-rule operator");
            continue;
        };
        let Some(value) = FilterValue::from_json(raw) else {
            warn!(operator = %key, field = %field, "skipping access rule with unsupported value");
            continue;
        };
        let fragment = scalar_predicate(
            &column_ref,
            &format!("acl_{field}"),
            operator,
            &value,
            namer,
            &format!("acl.{field}"),
        )?;
        parameters.extend(fragment.collect_parameters().into_iter().cloned());
        clauses.push(fragment.to_sql());
    }

    if clauses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(clauses.join(" AND ")))
    }
}
