//! Shared test fixtures: a Users/Posts/Roles schema and an in-memory
//! storage connection that interprets the plans the engine produces.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use jsonapi_engine::config::EngineConfig;
use jsonapi_engine::error::{ApiError, ApiResult, ErrorObject};
use jsonapi_engine::metadata::{
    Cardinality, EntityMetadata, EntityMetadataProvider, EntityRegistry, FieldKind, FieldMeta,
    RelationLink, RelationMeta,
};
use jsonapi_engine::query::SortDirection;
use jsonapi_engine::sql::{SelectPlan, SqlFragment};
use jsonapi_engine::storage::{value_to_key, EntityRecord, StorageConnection};

/// Users / Posts / Roles schema exercising every relation linkage.
pub struct SchemaFixture;

fn field(name: &str, kind: FieldKind, nullable: bool) -> FieldMeta {
    FieldMeta {
        name: name.to_string(),
        kind,
        nullable,
    }
}

impl EntityMetadataProvider for SchemaFixture {
    fn entity_names(&self) -> Vec<String> {
        vec![
            "Users".to_string(),
            "Posts".to_string(),
            "Roles".to_string(),
        ]
    }

    fn table(&self, entity: &str) -> anyhow::Result<String> {
        Ok(entity.to_lowercase())
    }

    fn fields(&self, entity: &str) -> anyhow::Result<Vec<FieldMeta>> {
        Ok(match entity {
            "Users" => vec![
                field("id", FieldKind::Number, false),
                field("login", FieldKind::String, false),
                field("created", FieldKind::Date, false),
            ],
            "Posts" => vec![
                field("id", FieldKind::Number, false),
                field("title", FieldKind::String, false),
            ],
            _ => vec![
                field("id", FieldKind::Number, false),
                field("key", FieldKind::String, false),
            ],
        })
    }

    fn primary_key(&self, _entity: &str) -> anyhow::Result<FieldMeta> {
        Ok(field("id", FieldKind::Number, false))
    }

    fn relations(&self, entity: &str) -> anyhow::Result<Vec<RelationMeta>> {
        if entity != "Users" {
            return Ok(vec![]);
        }
        Ok(vec![
            RelationMeta {
                name: "manager".to_string(),
                cardinality: Cardinality::One,
                nullable: true,
                target: "Users".to_string(),
                link: RelationLink::JoinColumn {
                    column: "manager_id".to_string(),
                },
            },
            RelationMeta {
                name: "posts".to_string(),
                cardinality: Cardinality::Many,
                nullable: true,
                target: "Posts".to_string(),
                link: RelationLink::ForeignColumn {
                    column: "author_id".to_string(),
                },
            },
            RelationMeta {
                name: "roles".to_string(),
                cardinality: Cardinality::Many,
                nullable: true,
                target: "Roles".to_string(),
                link: RelationLink::JoinTable {
                    table: "users_have_roles".to_string(),
                    source_column: "user_id".to_string(),
                    target_column: "role_id".to_string(),
                },
            },
        ])
    }
}

pub fn registry() -> Arc<EntityRegistry> {
    Arc::new(EntityRegistry::from_provider(&SchemaFixture).unwrap())
}

pub fn config() -> Arc<EngineConfig> {
    Arc::new(EngineConfig::default())
}

type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    join_tables: HashMap<String, Vec<(String, String)>>,
    next_id: i64,
}

/// In-memory storage. Interprets the fragment shapes the engine's plans
/// actually produce: `IN (...)`, `=`, `<>`, `LIKE`, and null checks on
/// base-table columns.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: State,
    snapshot: Option<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: State {
                next_id: 1,
                ..Default::default()
            },
            snapshot: None,
        }
    }

    /// Insert a row directly, bypassing the engine.
    pub fn seed(&mut self, table: &str, row: serde_json::Value) {
        let row = row.as_object().cloned().unwrap();
        if let Some(id) = row.get("id").and_then(|v| v.as_i64()) {
            self.state.next_id = self.state.next_id.max(id + 1);
        }
        self.state.tables.entry(table.to_string()).or_default().push(row);
    }

    /// Link two rows through a join table, bypassing the engine.
    pub fn seed_join(&mut self, table: &str, source: i64, target: i64) {
        self.state
            .join_tables
            .entry(table.to_string())
            .or_default()
            .push((source.to_string(), target.to_string()));
    }

    /// Rows of a table, for assertions.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.tables.get(table).cloned().unwrap_or_default()
    }

    /// Join-table pairs, for assertions.
    pub fn joins(&self, table: &str) -> Vec<(String, String)> {
        self.state.join_tables.get(table).cloned().unwrap_or_default()
    }

    fn matching_rows(&self, plan: &SelectPlan) -> ApiResult<Vec<Row>> {
        let rows = self
            .state
            .tables
            .get(&plan.table)
            .cloned()
            .unwrap_or_default();
        let mut matched = Vec::new();
        for row in rows {
            let mut keep = true;
            for condition in &plan.conditions {
                if !eval_condition(&row, condition)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                matched.push(row);
            }
        }

        for clause in &plan.order {
            let column = clause.column.clone();
            let descending = clause.direction == SortDirection::Desc;
            matched.sort_by(|a, b| {
                let left = sort_key(a.get(&column));
                let right = sort_key(b.get(&column));
                if descending {
                    right.partial_cmp(&left).unwrap_or(std::cmp::Ordering::Equal)
                } else {
                    left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal)
                }
            });
        }

        let offset = plan.offset.unwrap_or(0) as usize;
        let matched: Vec<Row> = matched.into_iter().skip(offset).collect();
        if let Some(limit) = plan.limit {
            Ok(matched.into_iter().take(limit as usize).collect())
        } else {
            Ok(matched)
        }
    }

    fn row_index(&self, table: &str, pk: &str, id: &serde_json::Value) -> Option<usize> {
        self.state
            .tables
            .get(table)?
            .iter()
            .position(|row| row.get(pk).map(value_to_key) == Some(value_to_key(id)))
    }
}

fn sort_key(value: Option<&serde_json::Value>) -> (f64, String) {
    match value {
        Some(serde_json::Value::Number(n)) => (n.as_f64().unwrap_or(0.0), String::new()),
        Some(serde_json::Value::String(s)) => (f64::MIN, s.clone()),
        _ => (f64::MIN, String::new()),
    }
}

fn eval_condition(row: &Row, fragment: &SqlFragment) -> ApiResult<bool> {
    let Some(column_ref) = &fragment.alias else {
        return Err(ApiError::Internal(anyhow::anyhow!(
            "memory storage cannot evaluate expression '{}'",
            fragment.expression
        )));
    };
    let column = column_ref.split('.').next_back().unwrap_or(column_ref);
    let value = row.get(column).cloned().unwrap_or(serde_json::Value::Null);
    let expression = fragment.expression.as_str();

    if expression == "IS NULL" {
        return Ok(value.is_null());
    }
    if expression == "IS NOT NULL" {
        return Ok(!value.is_null());
    }

    let param = fragment.parameters.first().ok_or_else(|| {
        ApiError::Internal(anyhow::anyhow!(
            "memory storage expected a parameter for '{expression}'"
        ))
    })?;

    if expression.starts_with("IN (") {
        let items = param.value.as_array().cloned().unwrap_or_default();
        return Ok(items.iter().any(|v| value_to_key(v) == value_to_key(&value)));
    }
    if expression.starts_with("NOT IN (") {
        let items = param.value.as_array().cloned().unwrap_or_default();
        return Ok(!items.iter().any(|v| value_to_key(v) == value_to_key(&value)));
    }
    if expression.starts_with("= ") {
        return Ok(value_to_key(&value) == value_to_key(&param.value));
    }
    if expression.starts_with("<> ") {
        return Ok(value_to_key(&value) != value_to_key(&param.value));
    }
    if expression.starts_with("LIKE ") {
        let needle = param
            .value
            .as_str()
            .unwrap_or_default()
            .trim_matches('%')
            .to_string();
        return Ok(value.as_str().unwrap_or_default().contains(&needle));
    }

    Err(ApiError::Internal(anyhow::anyhow!(
        "memory storage cannot evaluate expression '{expression}'"
    )))
}

#[async_trait]
impl StorageConnection for MemoryStorage {
    async fn begin(&mut self) -> ApiResult<()> {
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    async fn commit(&mut self) -> ApiResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> ApiResult<()> {
        let snapshot = self.snapshot.take().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("rollback without an open transaction"))
        })?;
        self.state = snapshot;
        Ok(())
    }

    async fn select(
        &mut self,
        _meta: &EntityMetadata,
        plan: &SelectPlan,
    ) -> ApiResult<Vec<EntityRecord>> {
        Ok(self
            .matching_rows(plan)?
            .into_iter()
            .map(EntityRecord::new)
            .collect())
    }

    async fn count(&mut self, _meta: &EntityMetadata, plan: &SelectPlan) -> ApiResult<u64> {
        let mut unpaged = plan.clone();
        unpaged.limit = None;
        unpaged.offset = None;
        Ok(self.matching_rows(&unpaged)?.len() as u64)
    }

    async fn insert(
        &mut self,
        meta: &EntityMetadata,
        values: &Row,
    ) -> ApiResult<serde_json::Value> {
        let mut row = values.clone();
        let pk = &meta.primary_key.name;
        let id = match row.get(pk) {
            Some(id) => id.clone(),
            None => {
                let id = serde_json::Value::Number(self.state.next_id.into());
                self.state.next_id += 1;
                row.insert(pk.clone(), id.clone());
                id
            }
        };
        if self.row_index(&meta.table, pk, &id).is_some() {
            return Err(ApiError::Conflict(vec![ErrorObject::bare(
                "a resource with these unique values already exists",
            )]));
        }
        self.state
            .tables
            .entry(meta.table.clone())
            .or_default()
            .push(row);
        Ok(id)
    }

    async fn update(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        values: &Row,
    ) -> ApiResult<bool> {
        let pk = meta.primary_key.name.clone();
        let Some(index) = self.row_index(&meta.table, &pk, id) else {
            return Ok(false);
        };
        let table = self.state.tables.get_mut(&meta.table).unwrap();
        for (key, value) in values {
            table[index].insert(key.clone(), value.clone());
        }
        Ok(true)
    }

    async fn delete(&mut self, meta: &EntityMetadata, id: &serde_json::Value) -> ApiResult<bool> {
        let pk = meta.primary_key.name.clone();
        let Some(index) = self.row_index(&meta.table, &pk, id) else {
            return Ok(false);
        };
        self.state.tables.get_mut(&meta.table).unwrap().remove(index);
        Ok(true)
    }

    async fn existing_ids(
        &mut self,
        meta: &EntityMetadata,
        ids: &[String],
    ) -> ApiResult<Vec<String>> {
        let rows = self.state.tables.get(&meta.table).cloned().unwrap_or_default();
        let present: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get(&meta.primary_key.name).map(value_to_key))
            .collect();
        Ok(ids
            .iter()
            .filter(|id| present.contains(*id))
            .cloned()
            .collect())
    }

    async fn join_pairs(
        &mut self,
        _meta: &EntityMetadata,
        relation: &RelationMeta,
        source_ids: &[serde_json::Value],
    ) -> ApiResult<Vec<(String, String)>> {
        let RelationLink::JoinTable { table, .. } = &relation.link else {
            return Err(ApiError::Internal(anyhow::anyhow!("not a join table")));
        };
        let wanted: Vec<String> = source_ids.iter().map(value_to_key).collect();
        Ok(self
            .state
            .join_tables
            .get(table)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|(source, _)| wanted.contains(source))
            .collect())
    }

    async fn set_to_one(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        target: Option<&str>,
    ) -> ApiResult<()> {
        let RelationLink::JoinColumn { column } = &relation.link else {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "memory storage only links to-one through join columns"
            )));
        };
        let pk = meta.primary_key.name.clone();
        let Some(index) = self.row_index(&meta.table, &pk, id) else {
            return Ok(());
        };
        let value = match target {
            Some(t) => t
                .parse::<i64>()
                .map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::String(t.to_string())),
            None => serde_json::Value::Null,
        };
        self.state.tables.get_mut(&meta.table).unwrap()[index].insert(column.clone(), value);
        Ok(())
    }

    async fn replace_to_many(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()> {
        match &relation.link {
            RelationLink::JoinTable { table, .. } => {
                let source = value_to_key(id);
                let pairs = self.state.join_tables.entry(table.clone()).or_default();
                pairs.retain(|(s, _)| s != &source);
                for target in targets {
                    pairs.push((source.clone(), target.clone()));
                }
                Ok(())
            }
            RelationLink::ForeignColumn { .. } => {
                self.detach_foreign(meta, id, relation).await?;
                self.add_to_many(meta, id, relation, targets).await
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation cannot use a join column"
            ))),
        }
    }

    async fn add_to_many(
        &mut self,
        _meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()> {
        match &relation.link {
            RelationLink::JoinTable { table, .. } => {
                let source = value_to_key(id);
                let pairs = self.state.join_tables.entry(table.clone()).or_default();
                for target in targets {
                    if !pairs.iter().any(|(s, t)| s == &source && t == target) {
                        pairs.push((source.clone(), target.clone()));
                    }
                }
                Ok(())
            }
            RelationLink::ForeignColumn { column } => {
                let source = id.clone();
                let table = relation.target.to_lowercase();
                if let Some(rows) = self.state.tables.get_mut(&table) {
                    for row in rows {
                        if let Some(row_id) = row.get("id") {
                            if targets.contains(&value_to_key(row_id)) {
                                row.insert(column.clone(), source.clone());
                            }
                        }
                    }
                }
                Ok(())
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation cannot use a join column"
            ))),
        }
    }

    async fn remove_from_many(
        &mut self,
        _meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()> {
        match &relation.link {
            RelationLink::JoinTable { table, .. } => {
                let source = value_to_key(id);
                if let Some(pairs) = self.state.join_tables.get_mut(table) {
                    pairs.retain(|(s, t)| s != &source || !targets.contains(t));
                }
                Ok(())
            }
            RelationLink::ForeignColumn { column } => {
                let source = value_to_key(id);
                let table = relation.target.to_lowercase();
                if let Some(rows) = self.state.tables.get_mut(&table) {
                    for row in rows {
                        let is_target = row
                            .get("id")
                            .map(|v| targets.contains(&value_to_key(v)))
                            .unwrap_or(false);
                        let owned = row.get(column).map(value_to_key) == Some(source.clone());
                        if is_target && owned {
                            row.insert(column.clone(), serde_json::Value::Null);
                        }
                    }
                }
                Ok(())
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation cannot use a join column"
            ))),
        }
    }
}

impl MemoryStorage {
    async fn detach_foreign(
        &mut self,
        _meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
    ) -> ApiResult<()> {
        let RelationLink::ForeignColumn { column } = &relation.link else {
            return Ok(());
        };
        let source = value_to_key(id);
        let table = relation.target.to_lowercase();
        if let Some(rows) = self.state.tables.get_mut(&table) {
            for row in rows {
                if row.get(column).map(value_to_key) == Some(source.clone()) {
                    row.insert(column.clone(), serde_json::Value::Null);
                }
            }
        }
        Ok(())
    }
}
