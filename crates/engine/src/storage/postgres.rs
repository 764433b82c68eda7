//! PostgreSQL storage adapter using SeaQuery and sqlx.
//!
//! Renders select plans and write operations into PostgreSQL statements.
//! Compiled predicate fragments are injected via `Expr::cust_with_values`,
//! so all client-supplied values go through SeaQuery's escaping.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sea_query::{
    Alias, Asterisk, Expr, JoinType, Order, PostgresQueryBuilder, Query, SimpleExpr,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use super::{coerce_id, value_to_key, EntityRecord, StorageConnection};
use crate::config::EngineConfig;
use crate::error::{ApiError, ApiResult, ErrorObject};
use crate::metadata::{EntityMetadata, EntityRegistry, FieldKind, RelationLink, RelationMeta};
use crate::query::SortDirection;
use crate::sql::{BoundParam, SelectPlan, SqlFragment};

/// PostgreSQL storage connection.
///
/// Holds the pool plus an optional open transaction; statements issued
/// between `begin` and `commit`/`rollback` run inside the transaction.
pub struct PgStorage {
    pool: PgPool,
    registry: Arc<EntityRegistry>,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgStorage {
    /// Connect a pool from configuration.
    pub async fn connect(config: &EngineConfig, registry: Arc<EntityRegistry>) -> ApiResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for the PostgreSQL adapter")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self::new(pool, registry))
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool, registry: Arc<EntityRegistry>) -> Self {
        Self {
            pool,
            registry,
            tx: None,
        }
    }

    async fn fetch_all(&mut self, sql: &str) -> ApiResult<Vec<PgRow>> {
        let result = match &mut self.tx {
            Some(tx) => sqlx::query(sql).fetch_all(&mut **tx).await,
            None => sqlx::query(sql).fetch_all(&self.pool).await,
        };
        result.map_err(map_db_error)
    }

    async fn fetch_optional(&mut self, sql: &str) -> ApiResult<Option<PgRow>> {
        let result = match &mut self.tx {
            Some(tx) => sqlx::query(sql).fetch_optional(&mut **tx).await,
            None => sqlx::query(sql).fetch_optional(&self.pool).await,
        };
        result.map_err(map_db_error)
    }

    async fn execute(&mut self, sql: &str) -> ApiResult<u64> {
        let result = match &mut self.tx {
            Some(tx) => sqlx::query(sql).execute(&mut **tx).await,
            None => sqlx::query(sql).execute(&self.pool).await,
        };
        result.map(|r| r.rows_affected()).map_err(map_db_error)
    }

    fn render_select(&self, plan: &SelectPlan) -> String {
        let mut query = Query::select();

        if plan.distinct {
            query.distinct();
        }

        for column in &plan.columns {
            query.column((Alias::new(&column.alias), Alias::new(&column.column)));
        }
        // SELECT DISTINCT requires ORDER BY expressions in the select list.
        if plan.distinct {
            for clause in &plan.order {
                if clause.alias != plan.base_alias {
                    query.expr_as(
                        Expr::col((Alias::new(&clause.alias), Alias::new(&clause.column))),
                        Alias::new(format!("{}_{}_sort", clause.alias, clause.column)),
                    );
                }
            }
        }

        query.from_as(Alias::new(&plan.table), Alias::new(&plan.base_alias));
        self.apply_joins_and_conditions(&mut query, plan);

        for clause in &plan.order {
            let order = match clause.direction {
                SortDirection::Asc => Order::Asc,
                SortDirection::Desc => Order::Desc,
            };
            query.order_by(
                (Alias::new(&clause.alias), Alias::new(&clause.column)),
                order,
            );
        }

        if let Some(limit) = plan.limit {
            query.limit(limit);
        }
        if let Some(offset) = plan.offset {
            query.offset(offset);
        }

        query.to_string(PostgresQueryBuilder)
    }

    fn render_count(&self, plan: &SelectPlan) -> String {
        let mut query = Query::select();

        if plan.distinct {
            query.expr(Expr::cust(format!(
                "COUNT(DISTINCT {}.{})",
                plan.base_alias,
                plan.columns
                    .first()
                    .map(|c| c.column.as_str())
                    .unwrap_or("id")
            )));
        } else {
            query.expr(Expr::col(Asterisk).count());
        }

        query.from_as(Alias::new(&plan.table), Alias::new(&plan.base_alias));
        self.apply_joins_and_conditions(&mut query, plan);

        query.to_string(PostgresQueryBuilder)
    }

    fn apply_joins_and_conditions(&self, query: &mut sea_query::SelectStatement, plan: &SelectPlan) {
        for join in &plan.joins {
            let (left_alias, left_column) = split_column_ref(&join.left);
            let on = Expr::col((Alias::new(left_alias), Alias::new(left_column))).equals({
                let (right_alias, right_column) = split_column_ref(&join.right);
                (Alias::new(right_alias), Alias::new(right_column))
            });
            query.join_as(
                JoinType::LeftJoin,
                Alias::new(&join.table),
                Alias::new(&join.alias),
                on,
            );
        }

        for fragment in &plan.conditions {
            query.and_where(fragment_expr(fragment));
        }
        if let Some(acl) = &plan.access_rules {
            query.and_where(custom_expr(
                &acl.expression,
                &acl.parameters.iter().collect::<Vec<_>>(),
            ));
        }
    }
}

#[async_trait]
impl StorageConnection for PgStorage {
    async fn begin(&mut self) -> ApiResult<()> {
        if self.tx.is_some() {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "transaction already open on this connection"
            )));
        }
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to start transaction")?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> ApiResult<()> {
        let tx = self
            .tx
            .take()
            .context("commit without an open transaction")?;
        tx.commit().await.context("failed to commit transaction")?;
        Ok(())
    }

    async fn rollback(&mut self) -> ApiResult<()> {
        let tx = self
            .tx
            .take()
            .context("rollback without an open transaction")?;
        tx.rollback()
            .await
            .context("failed to roll back transaction")?;
        Ok(())
    }

    async fn select(
        &mut self,
        meta: &EntityMetadata,
        plan: &SelectPlan,
    ) -> ApiResult<Vec<EntityRecord>> {
        let sql = self.render_select(plan);
        let rows = self.fetch_all(&sql).await?;
        rows.iter().map(|row| decode_record(row, meta, plan)).collect()
    }

    async fn count(&mut self, _meta: &EntityMetadata, plan: &SelectPlan) -> ApiResult<u64> {
        let sql = self.render_count(plan);
        let row = self
            .fetch_optional(&sql)
            .await?
            .context("count query returned no row")?;
        let count: i64 = row.try_get(0).context("failed to decode count")?;
        Ok(count.max(0) as u64)
    }

    async fn insert(
        &mut self,
        meta: &EntityMetadata,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> ApiResult<serde_json::Value> {
        let mut values = values.clone();

        // String primary keys are generated here when absent; numeric keys
        // fall through to the database default.
        if !values.contains_key(&meta.primary_key.name)
            && meta.primary_key.kind == FieldKind::String
        {
            values.insert(
                meta.primary_key.name.clone(),
                serde_json::Value::String(uuid::Uuid::now_v7().to_string()),
            );
        }

        let sql = {
            let mut statement = Query::insert();
            statement.into_table(Alias::new(&meta.table));

            if values.is_empty() {
                statement.or_default_values();
            } else {
                let columns: Vec<Alias> = values.keys().map(Alias::new).collect();
                let row: Vec<SimpleExpr> = values
                    .values()
                    .map(|v| SimpleExpr::from(json_to_sea(v)))
                    .collect();
                statement.columns(columns);
                statement.values(row).map_err(|e| {
                    ApiError::Internal(anyhow::anyhow!("insert shape mismatch: {e}"))
                })?;
            }

            statement.returning(Query::returning().column(Alias::new(&meta.primary_key.name)));

            statement.to_string(PostgresQueryBuilder)
        };
        let row = self
            .fetch_optional(&sql)
            .await?
            .context("insert returned no row")?;
        Ok(decode_column(
            &row,
            &meta.primary_key.name,
            Some(meta.primary_key.kind),
        ))
    }

    async fn update(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> ApiResult<bool> {
        if values.is_empty() {
            return Ok(true);
        }
        let sql = {
            let mut statement = Query::update();
            statement.table(Alias::new(&meta.table));
            for (column, value) in values {
                statement.value(Alias::new(column), json_to_sea(value));
            }
            statement.and_where(Expr::col(Alias::new(&meta.primary_key.name)).eq(json_to_sea(id)));
            statement.to_string(PostgresQueryBuilder)
        };
        Ok(self.execute(&sql).await? > 0)
    }

    async fn delete(&mut self, meta: &EntityMetadata, id: &serde_json::Value) -> ApiResult<bool> {
        let sql = {
            let mut statement = Query::delete();
            statement.from_table(Alias::new(&meta.table));
            statement.and_where(Expr::col(Alias::new(&meta.primary_key.name)).eq(json_to_sea(id)));
            statement.to_string(PostgresQueryBuilder)
        };
        Ok(self.execute(&sql).await? > 0)
    }

    async fn existing_ids(
        &mut self,
        meta: &EntityMetadata,
        ids: &[String],
    ) -> ApiResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<sea_query::Value> = ids
            .iter()
            .map(|id| json_to_sea(&coerce_id(meta, id)))
            .collect();

        let sql = {
            let mut query = Query::select();
            query
                .column(Alias::new(&meta.primary_key.name))
                .from(Alias::new(&meta.table))
                .and_where(Expr::col(Alias::new(&meta.primary_key.name)).is_in(values));
            query.to_string(PostgresQueryBuilder)
        };
        let rows = self.fetch_all(&sql).await?;
        Ok(rows
            .iter()
            .map(|row| {
                value_to_key(&decode_column(
                    row,
                    &meta.primary_key.name,
                    Some(meta.primary_key.kind),
                ))
            })
            .collect())
    }

    async fn join_pairs(
        &mut self,
        _meta: &EntityMetadata,
        relation: &RelationMeta,
        source_ids: &[serde_json::Value],
    ) -> ApiResult<Vec<(String, String)>> {
        let RelationLink::JoinTable {
            table,
            source_column,
            target_column,
        } = &relation.link
        else {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "relation '{}' has no join table",
                relation.name
            )));
        };
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<sea_query::Value> = source_ids.iter().map(json_to_sea).collect();
        let sql = {
            let mut query = Query::select();
            query
                .column(Alias::new(source_column))
                .column(Alias::new(target_column))
                .from(Alias::new(table))
                .and_where(Expr::col(Alias::new(source_column)).is_in(values));
            query.to_string(PostgresQueryBuilder)
        };
        let rows = self.fetch_all(&sql).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    value_to_key(&decode_column(row, source_column, None)),
                    value_to_key(&decode_column(row, target_column, None)),
                )
            })
            .collect())
    }

    async fn set_to_one(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        target: Option<&str>,
    ) -> ApiResult<()> {
        match &relation.link {
            RelationLink::JoinColumn { column } => {
                let target_meta = self.registry.get(&relation.target)?;
                let value = match target {
                    Some(t) => json_to_sea(&coerce_id(&target_meta, t)),
                    None => sea_query::Value::String(None),
                };
                let sql = {
                    let mut statement = Query::update();
                    statement
                        .table(Alias::new(&meta.table))
                        .value(Alias::new(column), value)
                        .and_where(
                            Expr::col(Alias::new(&meta.primary_key.name)).eq(json_to_sea(id)),
                        );
                    statement.to_string(PostgresQueryBuilder)
                };
                self.execute(&sql).await?;
                Ok(())
            }
            RelationLink::ForeignColumn { column } => {
                let target_meta = self.registry.get(&relation.target)?;

                // Detach the current holder, then attach the new one.
                let clear_sql = {
                    let mut clear = Query::update();
                    clear
                        .table(Alias::new(&target_meta.table))
                        .value(Alias::new(column), sea_query::Value::String(None))
                        .and_where(Expr::col(Alias::new(column)).eq(json_to_sea(id)));
                    clear.to_string(PostgresQueryBuilder)
                };
                self.execute(&clear_sql).await?;

                if let Some(t) = target {
                    let attach_sql = {
                        let mut attach = Query::update();
                        attach
                            .table(Alias::new(&target_meta.table))
                            .value(Alias::new(column), json_to_sea(id))
                            .and_where(
                                Expr::col(Alias::new(&target_meta.primary_key.name))
                                    .eq(json_to_sea(&coerce_id(&target_meta, t))),
                            );
                        attach.to_string(PostgresQueryBuilder)
                    };
                    self.execute(&attach_sql).await?;
                }
                Ok(())
            }
            RelationLink::JoinTable { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-one relation '{}' cannot use a join table",
                relation.name
            ))),
        }
    }

    async fn replace_to_many(
        &mut self,
        meta: &EntityMetadata,
        id: &serde_json::Value,
        relation: &RelationMeta,
        targets: &[String],
    ) -> ApiResult<()> {
        match &relation.link {
            RelationLink::ForeignColumn { column } => {
                let target_meta = self.registry.get(&relation.target)?;

                let clear_sql = {
                    let mut clear = Query::update();
                    clear
                        .table(Alias::new(&target_meta.table))
                        .value(Alias::new(column), sea_query::Value::String(None))
                        .and_where(Expr::col(Alias::new(column)).eq(json_to_sea(id)));
                    clear.to_string(PostgresQueryBuilder)
                };
                self.execute(&clear_sql).await?;

                if !targets.is_empty() {
                    self.add_to_many(meta, id, relation, targets).await?;
                }
                Ok(())
            }
            RelationLink::JoinTable {
                table,
                source_column,
                ..
            } => {
                let clear_sql = {
                    let mut clear = Query::delete();
                    clear
                        .from_table(Alias::new(table))
                        .and_where(Expr::col(Alias::new(source_column)).eq(json_to_sea(id)));
                    clear.to_string(PostgresQueryBuilder)
                };
                self.execute(&clear_sql).await?;

                if !targets.is_empty() {
                    self.add_to_many(meta, id, relation, targets).await?;
                }
                Ok(())
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation '{}' cannot use a join column",
                relation.name
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
        if targets.is_empty() {
            return Ok(());
        }
        let target_meta = self.registry.get(&relation.target)?;

        match &relation.link {
            RelationLink::ForeignColumn { column } => {
                let values: Vec<sea_query::Value> = targets
                    .iter()
                    .map(|t| json_to_sea(&coerce_id(&target_meta, t)))
                    .collect();
                let sql = {
                    let mut statement = Query::update();
                    statement
                        .table(Alias::new(&target_meta.table))
                        .value(Alias::new(column), json_to_sea(id))
                        .and_where(
                            Expr::col(Alias::new(&target_meta.primary_key.name)).is_in(values),
                        );
                    statement.to_string(PostgresQueryBuilder)
                };
                self.execute(&sql).await?;
                Ok(())
            }
            RelationLink::JoinTable {
                table,
                source_column,
                target_column,
            } => {
                let sql = {
                    let mut statement = Query::insert();
                    statement.into_table(Alias::new(table)).columns([
                        Alias::new(source_column),
                        Alias::new(target_column),
                    ]);
                    for target in targets {
                        statement
                            .values([
                                SimpleExpr::from(json_to_sea(id)),
                                SimpleExpr::from(json_to_sea(&coerce_id(&target_meta, target))),
                            ])
                            .map_err(|e| {
                                ApiError::Internal(anyhow::anyhow!("insert shape mismatch: {e}"))
                            })?;
                    }
                    statement.on_conflict(
                        sea_query::OnConflict::columns([
                            Alias::new(source_column),
                            Alias::new(target_column),
                        ])
                        .do_nothing()
                        .to_owned(),
                    );
                    statement.to_string(PostgresQueryBuilder)
                };
                self.execute(&sql).await?;
                Ok(())
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation '{}' cannot use a join column",
                relation.name
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
        if targets.is_empty() {
            return Ok(());
        }
        let target_meta = self.registry.get(&relation.target)?;
        let values: Vec<sea_query::Value> = targets
            .iter()
            .map(|t| json_to_sea(&coerce_id(&target_meta, t)))
            .collect();

        match &relation.link {
            RelationLink::ForeignColumn { column } => {
                let sql = {
                    let mut statement = Query::update();
                    statement
                        .table(Alias::new(&target_meta.table))
                        .value(Alias::new(column), sea_query::Value::String(None))
                        .and_where(Expr::col(Alias::new(column)).eq(json_to_sea(id)))
                        .and_where(
                            Expr::col(Alias::new(&target_meta.primary_key.name)).is_in(values),
                        );
                    statement.to_string(PostgresQueryBuilder)
                };
                self.execute(&sql).await?;
                Ok(())
            }
            RelationLink::JoinTable {
                table,
                source_column,
                target_column,
            } => {
                let sql = {
                    let mut statement = Query::delete();
                    statement
                        .from_table(Alias::new(table))
                        .and_where(Expr::col(Alias::new(source_column)).eq(json_to_sea(id)))
                        .and_where(Expr::col(Alias::new(target_column)).is_in(values));
                    statement.to_string(PostgresQueryBuilder)
                };
                self.execute(&sql).await?;
                Ok(())
            }
            RelationLink::JoinColumn { .. } => Err(ApiError::Internal(anyhow::anyhow!(
                "to-many relation '{}' cannot use a join column",
                relation.name
            ))),
        }
    }
}

/// Convert a predicate fragment into a SeaQuery expression with escaped
/// values.
fn fragment_expr(fragment: &SqlFragment) -> SimpleExpr {
    let params = fragment.collect_parameters();
    custom_expr(&fragment.to_sql(), &params)
}

/// Replace `:name` placeholders with `?` markers in appearance order and
/// hand the text to `Expr::cust_with_values`.
///
/// Array values expand to a marker list: inside an existing `IN (...)`
/// they stay bare; elsewhere they render as an `ARRAY[...]` constructor.
fn custom_expr(text: &str, params: &[&BoundParam]) -> SimpleExpr {
    let mut occurrences: Vec<(usize, &BoundParam)> = params
        .iter()
        .filter_map(|p| find_marker(text, &p.name).map(|pos| (pos, *p)))
        .collect();
    occurrences.sort_by_key(|(pos, _)| *pos);

    let mut sql = String::with_capacity(text.len());
    let mut values: Vec<sea_query::Value> = Vec::new();
    let mut cursor = 0;

    for (pos, param) in occurrences {
        sql.push_str(&text[cursor..pos]);
        let marker_len = param.name.len() + 1;

        match &param.value {
            serde_json::Value::Array(items) => {
                let markers = vec!["?"; items.len().max(1)].join(", ");
                for item in items {
                    values.push(json_to_sea(item));
                }
                if sql.trim_end().ends_with("IN (") || sql.trim_end().ends_with("in (") {
                    sql.push_str(&markers);
                } else {
                    sql.push_str("ARRAY[");
                    sql.push_str(&markers);
                    sql.push(']');
                }
            }
            other => {
                values.push(json_to_sea(other));
                sql.push('?');
            }
        }
        cursor = pos + marker_len;
    }
    sql.push_str(&text[cursor..]);

    if values.is_empty() {
        Expr::cust(sql)
    } else {
        Expr::cust_with_values(sql, values)
    }
}

/// Find `:name` in `text`, requiring a non-identifier boundary after it so
/// `:params_f_1` never matches inside `:params_f_12`.
fn find_marker(text: &str, name: &str) -> Option<usize> {
    let marker = format!(":{name}");
    let mut start = 0;
    while let Some(offset) = text[start..].find(&marker) {
        let pos = start + offset;
        let end = pos + marker.len();
        let boundary = text[end..]
            .chars()
            .next()
            .map(|c| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(true);
        if boundary {
            return Some(pos);
        }
        start = end;
    }
    None
}

fn json_to_sea(value: &serde_json::Value) -> sea_query::Value {
    match value {
        serde_json::Value::String(s) => s.clone().into(),
        serde_json::Value::Number(n) if n.is_i64() => n.as_i64().unwrap_or_default().into(),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or_default().into(),
        serde_json::Value::Bool(b) => (*b).into(),
        serde_json::Value::Null => Option::<String>::None.into(),
        other => other.to_string().into(),
    }
}

fn split_column_ref(column_ref: &str) -> (&str, &str) {
    column_ref
        .split_once('.')
        .unwrap_or(("", column_ref))
}

fn decode_record(
    row: &PgRow,
    meta: &EntityMetadata,
    plan: &SelectPlan,
) -> ApiResult<EntityRecord> {
    let mut values = serde_json::Map::new();
    for column in &plan.columns {
        if column.alias != plan.base_alias {
            continue;
        }
        let kind = meta.field(&column.column).map(|f| f.kind);
        values.insert(column.column.clone(), decode_column(row, &column.column, kind));
    }
    Ok(EntityRecord::new(values))
}

/// Decode one column into a JSON value.
///
/// Columns without metadata (join columns) are decoded by probing the
/// common key types.
fn decode_column(row: &PgRow, name: &str, kind: Option<FieldKind>) -> serde_json::Value {
    use serde_json::Value;

    match kind {
        Some(FieldKind::String) => match row.try_get::<Option<String>, _>(name) {
            Ok(v) => v.map(Value::String).unwrap_or(Value::Null),
            Err(_) => decode_any(row, name),
        },
        Some(FieldKind::Number) => {
            if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
                return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
            }
            if let Ok(v) = row.try_get::<Option<i32>, _>(name) {
                return v
                    .map(|n| Value::Number(i64::from(n).into()))
                    .unwrap_or(Value::Null);
            }
            match row.try_get::<Option<f64>, _>(name) {
                Ok(Some(f)) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            }
        }
        Some(FieldKind::Boolean) => match row.try_get::<Option<bool>, _>(name) {
            Ok(v) => v.map(Value::Bool).unwrap_or(Value::Null),
            Err(_) => Value::Null,
        },
        Some(FieldKind::Date) => {
            if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
                return v.map(|d| Value::String(d.to_rfc3339())).unwrap_or(Value::Null);
            }
            if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
                return v
                    .map(|d| Value::String(d.to_string()))
                    .unwrap_or(Value::Null);
            }
            match row.try_get::<Option<chrono::NaiveDate>, _>(name) {
                Ok(v) => v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null),
                Err(_) => Value::Null,
            }
        }
        Some(FieldKind::Array) => {
            if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(name) {
                return v
                    .map(|items| Value::Array(items.into_iter().map(Value::String).collect()))
                    .unwrap_or(Value::Null);
            }
            match row.try_get::<Option<serde_json::Value>, _>(name) {
                Ok(v) => v.unwrap_or(Value::Null),
                Err(_) => Value::Null,
            }
        }
        Some(FieldKind::Object) => match row.try_get::<Option<serde_json::Value>, _>(name) {
            Ok(v) => v.unwrap_or(Value::Null),
            Err(_) => Value::Null,
        },
        None => decode_any(row, name),
    }
}

fn decode_any(row: &PgRow, name: &str) -> serde_json::Value {
    use serde_json::Value;

    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(v);
    }
    Value::Null
}

/// Map a driver error into the engine taxonomy.
///
/// Unique violations (23505) surface as conflicts; foreign-key violations
/// (23503) as validation errors. Everything else is internal.
fn map_db_error(error: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db) = &error {
        match db.code().as_deref() {
            Some("23505") => {
                return ApiError::Conflict(vec![ErrorObject::bare(
                    "a resource with these unique values already exists",
                )]);
            }
            Some("23503") => {
                return ApiError::Validation(vec![ErrorObject::bare(
                    "a referenced resource does not exist",
                )]);
            }
            _ => {}
        }
    }
    ApiError::Internal(anyhow::Error::new(error).context("database query failed"))
}
