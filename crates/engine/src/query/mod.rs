//! Query language types.
//!
//! The structured query accepted at the boundary: filters (target and
//! relation branches), sparse fieldsets, sort, include, and pagination.
//! Parsing here is purely structural; semantic checks against entity
//! metadata live in [`validate`].

mod validate;

pub use validate::validate_query;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult, ErrorObject};

/// Field comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Regexp,
    /// Array overlap (`&&`).
    #[serde(rename = "some")]
    Overlap,
    /// Array containment (`@>`).
    #[serde(rename = "contains")]
    ArrayContains,
}

impl FilterOperator {
    /// Parse a `$`-free operator key.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "nin" => Some(Self::Nin),
            "like" => Some(Self::Like),
            "regexp" => Some(Self::Regexp),
            "some" => Some(Self::Overlap),
            "contains" => Some(Self::ArrayContains),
            _ => None,
        }
    }
}

/// A filter value as received at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    /// Whether this is the textual `"null"` token.
    ///
    /// Distinct from SQL NULL: only this exact string switches `eq`/`ne`
    /// into the null-check branch.
    pub fn is_null_literal(&self) -> bool {
        matches!(self, FilterValue::String(s) if s == "null")
    }

    /// Convert to a JSON value for parameter binding.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Bool(b) => serde_json::Value::Bool(*b),
            FilterValue::Number(n) => serde_json::Value::Number(n.clone()),
            FilterValue::String(s) => serde_json::Value::String(s.clone()),
            FilterValue::List(items) => {
                serde_json::Value::Array(items.iter().map(FilterValue::to_json).collect())
            }
        }
    }

    /// Expand into a sequence for `in`/`nin`: lists pass through,
    /// comma-separated strings split, scalars become one-element sequences.
    pub fn to_list(&self) -> Vec<FilterValue> {
        match self {
            FilterValue::List(items) => items.clone(),
            FilterValue::String(s) if s.contains(',') => s
                .split(',')
                .map(|part| FilterValue::String(part.trim().to_string()))
                .collect(),
            other => vec![other.clone()],
        }
    }

    pub(crate) fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(FilterValue::Bool(*b)),
            serde_json::Value::Number(n) => Some(FilterValue::Number(n.clone())),
            serde_json::Value::String(s) => Some(FilterValue::String(s.clone())),
            serde_json::Value::Array(items) => Some(FilterValue::List(
                items.iter().filter_map(FilterValue::from_json).collect(),
            )),
            _ => None,
        }
    }
}

/// A parsed filter tree node.
#[derive(Debug, Clone)]
pub enum FilterNode {
    /// `field <op> value`.
    Field {
        field: String,
        operator: FilterOperator,
        value: FilterValue,
    },

    /// Predicates over a related entity's fields.
    Relation {
        relation: String,
        nested: Vec<FilterNode>,
    },

    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

/// Predicates under one relation name.
#[derive(Debug, Clone)]
pub struct RelationBranch {
    pub relation: String,
    pub nested: Vec<FilterNode>,
}

/// Filter with target and relation branches.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Predicates over the primary entity's own fields (plus the relation
    /// null-check shorthand).
    pub target: Vec<FilterNode>,

    /// Relation-qualified predicates.
    pub relation: Vec<RelationBranch>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.target.is_empty() && self.relation.is_empty()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort term. `path` may be dotted (`relation.field`).
#[derive(Debug, Clone)]
pub struct SortSpec {
    pub path: String,
    pub direction: SortDirection,
}

/// Sparse fieldsets keyed by `target` or a relation name.
#[derive(Debug, Clone, Default)]
pub struct SparseFields(pub HashMap<String, Vec<String>>);

impl SparseFields {
    /// Requested field subset for a key, if any.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pagination (1-based page number).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

/// A complete parsed query.
#[derive(Debug, Clone, Default)]
pub struct ResourceQuery {
    pub filter: Filter,
    pub include: Vec<String>,
    pub fields: SparseFields,
    pub sort: Vec<SortSpec>,
    pub page: Option<Page>,
}

impl ResourceQuery {
    /// Parse a structured query object.
    ///
    /// Structural errors (wrong JSON shapes, unknown operator keys) are
    /// reported here with their query position; name resolution against
    /// metadata happens in [`validate_query`].
    pub fn from_value(value: &serde_json::Value) -> ApiResult<Self> {
        let mut errors = Vec::new();

        let filter = match value.get("filter") {
            Some(v) => parse_filter(v, &mut errors),
            None => Filter::default(),
        };

        let include = match value.get("include") {
            Some(v) => parse_name_list(v, "include", &mut errors),
            None => Vec::new(),
        };

        let fields = match value.get("fields") {
            Some(v) => parse_fields(v, &mut errors),
            None => SparseFields::default(),
        };

        let sort = match value.get("sort") {
            Some(v) => parse_sort(v, &mut errors),
            None => Vec::new(),
        };

        let page = match value.get("page") {
            Some(v) => parse_page(v, &mut errors),
            None => None,
        };

        if errors.is_empty() {
            Ok(Self {
                filter,
                include,
                fields,
                sort,
                page,
            })
        } else {
            Err(ApiError::Validation(errors))
        }
    }
}

fn parse_filter(value: &serde_json::Value, errors: &mut Vec<ErrorObject>) -> Filter {
    let Some(object) = value.as_object() else {
        errors.push(ErrorObject::new("filter must be an object", "filter"));
        return Filter::default();
    };

    let mut filter = Filter::default();

    if let Some(target) = object.get("target") {
        match target.as_object() {
            Some(map) => {
                for (field, spec) in map {
                    filter.target.extend(parse_field_predicates(
                        field,
                        spec,
                        &format!("filter.target.{field}"),
                        errors,
                    ));
                }
            }
            None => errors.push(ErrorObject::new(
                "filter.target must be an object",
                "filter.target",
            )),
        }
    }

    if let Some(relation) = object.get("relation") {
        match relation.as_object() {
            Some(map) => {
                for (name, branch) in map {
                    let pointer = format!("filter.relation.{name}");
                    match branch.as_object() {
                        Some(branch_map) => {
                            let mut nested = Vec::new();
                            for (field, spec) in branch_map {
                                nested.extend(parse_field_predicates(
                                    field,
                                    spec,
                                    &format!("{pointer}.{field}"),
                                    errors,
                                ));
                            }
                            filter.relation.push(RelationBranch {
                                relation: name.clone(),
                                nested,
                            });
                        }
                        None => errors.push(ErrorObject::new(
                            format!("filter.relation.{name} must be an object"),
                            pointer,
                        )),
                    }
                }
            }
            None => errors.push(ErrorObject::new(
                "filter.relation must be an object",
                "filter.relation",
            )),
        }
    }

    filter
}

fn parse_field_predicates(
    field: &str,
    spec: &serde_json::Value,
    pointer: &str,
    errors: &mut Vec<ErrorObject>,
) -> Vec<FilterNode> {
    let Some(ops) = spec.as_object() else {
        errors.push(ErrorObject::new(
            format!("predicate for '{field}' must be an operator object"),
            pointer,
        ));
        return Vec::new();
    };

    let mut nodes = Vec::new();
    for (key, raw) in ops {
        let Some(operator) = FilterOperator::from_key(key) else {
            errors.push(ErrorObject::new(
                format!("unknown operator '{key}'"),
                format!("{pointer}.{key}"),
            ));
            continue;
        };
        let Some(value) = FilterValue::from_json(raw) else {
            errors.push(ErrorObject::new(
                format!("unsupported value for operator '{key}'"),
                format!("{pointer}.{key}"),
            ));
            continue;
        };
        nodes.push(FilterNode::Field {
            field: field.to_string(),
            operator,
            value,
        });
    }
    nodes
}

fn parse_name_list(
    value: &serde_json::Value,
    pointer: &str,
    errors: &mut Vec<ErrorObject>,
) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => s
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => {
            errors.push(ErrorObject::new(
                format!("{pointer} must be a string or array of strings"),
                pointer,
            ));
            Vec::new()
        }
    }
}

fn parse_fields(value: &serde_json::Value, errors: &mut Vec<ErrorObject>) -> SparseFields {
    let Some(map) = value.as_object() else {
        errors.push(ErrorObject::new("fields must be an object", "fields"));
        return SparseFields::default();
    };

    let mut fields = HashMap::new();
    for (key, names) in map {
        let parsed = parse_name_list(names, &format!("fields.{key}"), errors);
        fields.insert(key.clone(), parsed);
    }
    SparseFields(fields)
}

fn parse_sort(value: &serde_json::Value, errors: &mut Vec<ErrorObject>) -> Vec<SortSpec> {
    let names = parse_name_list(value, "sort", errors);
    names
        .into_iter()
        .map(|term| match term.strip_prefix('-') {
            Some(path) => SortSpec {
                path: path.to_string(),
                direction: SortDirection::Desc,
            },
            None => SortSpec {
                path: term,
                direction: SortDirection::Asc,
            },
        })
        .collect()
}

fn parse_page(value: &serde_json::Value, errors: &mut Vec<ErrorObject>) -> Option<Page> {
    let Some(map) = value.as_object() else {
        errors.push(ErrorObject::new("page must be an object", "page"));
        return None;
    };

    let read = |key: &str, default: u32, errors: &mut Vec<ErrorObject>| -> u32 {
        match map.get(key) {
            None => default,
            Some(v) => match v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())) {
                Some(n) if n >= 1 => n as u32,
                _ => {
                    errors.push(ErrorObject::new(
                        format!("page.{key} must be a positive integer"),
                        format!("page.{key}"),
                    ));
                    default
                }
            },
        }
    };

    let number = read("number", 1, errors);
    let size = read("size", 0, errors);
    Some(Page {
        number,
        size, // 0 means "use the configured default"
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_target_and_relation_branches() {
        let query = ResourceQuery::from_value(&json!({
            "filter": {
                "target": { "login": { "eq": "bob" }, "roles": { "ne": "null" } },
                "relation": { "roles": { "key": { "in": "admin,editor" } } }
            }
        }))
        .unwrap();

        assert_eq!(query.filter.target.len(), 2);
        assert_eq!(query.filter.relation.len(), 1);
        assert_eq!(query.filter.relation[0].relation, "roles");
    }

    #[test]
    fn unknown_operator_is_reported_with_position() {
        let err = ResourceQuery::from_value(&json!({
            "filter": { "target": { "login": { "eqq": "bob" } } }
        }))
        .unwrap_err();

        let ApiError::Validation(objects) = err else {
            panic!("expected validation error");
        };
        assert!(objects[0].detail.contains("eqq"));
        assert_eq!(
            objects[0].source.as_ref().unwrap().pointer,
            "filter.target.login.eqq"
        );
    }

    #[test]
    fn sort_prefix_sets_direction() {
        let query = ResourceQuery::from_value(&json!({ "sort": "-created,login" })).unwrap();
        assert_eq!(query.sort.len(), 2);
        assert_eq!(query.sort[0].direction, SortDirection::Desc);
        assert_eq!(query.sort[0].path, "created");
        assert_eq!(query.sort[1].direction, SortDirection::Asc);
    }

    #[test]
    fn comma_separated_values_split_for_in() {
        let value = FilterValue::String("a, b,c".to_string());
        let list = value.to_list();
        assert_eq!(
            list,
            vec![
                FilterValue::String("a".to_string()),
                FilterValue::String("b".to_string()),
                FilterValue::String("c".to_string()),
            ]
        );
    }

    #[test]
    fn null_literal_is_textual() {
        assert!(FilterValue::String("null".to_string()).is_null_literal());
        assert!(!FilterValue::String("NULL".to_string()).is_null_literal());
        assert!(!FilterValue::Bool(false).is_null_literal());
    }

    #[test]
    fn include_and_fields_parse() {
        let query = ResourceQuery::from_value(&json!({
            "include": "roles,manager",
            "fields": { "target": "login,name", "roles": ["key"] }
        }))
        .unwrap();

        assert_eq!(query.include, vec!["roles", "manager"]);
        assert_eq!(
            query.fields.get("target").unwrap(),
            ["login".to_string(), "name".to_string()]
        );
        assert_eq!(query.fields.get("roles").unwrap(), ["key".to_string()]);
    }
}
