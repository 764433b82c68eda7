//! SQL fragment compilation.
//!
//! Turns validated filter trees into composable predicate fragments:
//! - `naming`: deterministic alias and parameter naming
//! - `filter`: target and relation filter compilation
//! - `acl`: access-rule tree compilation
//! - `select`: sort/include/field-selection translation into a select plan
//!
//! Fragments carry expression templates with named `:parameter`
//! placeholders; the storage adapter is responsible for rendering them
//! against a concrete dialect and binding the values.

mod acl;
mod filter;
mod naming;
mod select;

pub use acl::compile_access_rules;
pub use filter::{compile_relation_filter, compile_target_filter};
pub use naming::{alias_for, alias_for_relation, join_table_alias, ParamNamer};
pub use select::{build_select_plan, JoinSpec, OrderClause, SelectColumn, SelectPlan};

/// A named bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub value: serde_json::Value,
}

impl BoundParam {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A correlated subquery with its own parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub sql: String,
    pub parameters: Vec<BoundParam>,
}

/// One compiled predicate fragment.
///
/// Shapes:
/// - column predicate: `alias` holds the column reference, `expression` the
///   operator template (`= :params_login_1`, `IS NULL`), with at most one
///   bound parameter;
/// - subquery predicate: `expression` is `EXISTS`/`NOT EXISTS`/`IN` and the
///   parameters live inside the subquery, never at the top level;
/// - group: `expression` is a complete parenthesized clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    /// Column reference (`alias.column`) the expression applies to.
    pub alias: Option<String>,

    /// Expression template with `:name` placeholders.
    pub expression: String,

    /// Top-level bound parameters.
    pub parameters: Vec<BoundParam>,

    /// Correlated subquery, if any.
    pub subquery: Option<Subquery>,

    /// Relation alias that must be joined for this fragment to resolve.
    pub select_alias: Option<String>,
}

impl SqlFragment {
    /// Column predicate with one bound parameter.
    pub fn column(
        column_ref: impl Into<String>,
        expression: impl Into<String>,
        parameter: BoundParam,
    ) -> Self {
        Self {
            alias: Some(column_ref.into()),
            expression: expression.into(),
            parameters: vec![parameter],
            subquery: None,
            select_alias: None,
        }
    }

    /// Column null-check predicate (no parameters).
    pub fn null_check(column_ref: impl Into<String>, negated: bool) -> Self {
        Self {
            alias: Some(column_ref.into()),
            expression: if negated { "IS NOT NULL" } else { "IS NULL" }.to_string(),
            parameters: Vec::new(),
            subquery: None,
            select_alias: None,
        }
    }

    /// `EXISTS` / `NOT EXISTS` over a correlated subquery.
    pub fn exists(subquery: Subquery, negated: bool) -> Self {
        Self {
            alias: None,
            expression: if negated { "NOT EXISTS" } else { "EXISTS" }.to_string(),
            parameters: Vec::new(),
            subquery: Some(subquery),
            select_alias: None,
        }
    }

    /// `column IN (subquery)`.
    pub fn in_subquery(column_ref: impl Into<String>, subquery: Subquery) -> Self {
        Self {
            alias: Some(column_ref.into()),
            expression: "IN".to_string(),
            parameters: Vec::new(),
            subquery: Some(subquery),
            select_alias: None,
        }
    }

    /// A complete parenthesized clause.
    pub fn group(expression: impl Into<String>, parameters: Vec<BoundParam>) -> Self {
        Self {
            alias: None,
            expression: expression.into(),
            parameters,
            subquery: None,
            select_alias: None,
        }
    }

    /// Mark the relation alias this fragment needs joined.
    pub fn requiring_join(mut self, alias: impl Into<String>) -> Self {
        self.select_alias = Some(alias.into());
        self
    }

    /// Render the fragment as SQL text (placeholders left in place).
    pub fn to_sql(&self) -> String {
        match (&self.alias, &self.subquery) {
            (Some(column), Some(sub)) => format!("{} {} ({})", column, self.expression, sub.sql),
            (None, Some(sub)) => format!("{} ({})", self.expression, sub.sql),
            (Some(column), None) => format!("{} {}", column, self.expression),
            (None, None) => self.expression.clone(),
        }
    }

    /// All bound parameters, subquery parameters included.
    pub fn collect_parameters(&self) -> Vec<&BoundParam> {
        let mut params: Vec<&BoundParam> = self.parameters.iter().collect();
        if let Some(sub) = &self.subquery {
            params.extend(sub.parameters.iter());
        }
        params
    }
}

/// A self-contained bracketed predicate group, safe to conjoin with any
/// other predicate without precedence surprises.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketedPredicate {
    pub expression: String,
    pub parameters: Vec<BoundParam>,
}
