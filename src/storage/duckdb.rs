//! Embedded row store backed by DuckDB.
//!
//! Tuples live in a single table with attributes and values serialised as
//! JSON text. Only the time range and the timestamp ordering are pushed into
//! SQL; attribute equality, value comparisons, other orderings and
//! aggregation run in-process over the time-bounded candidate set. `LIMIT`
//! is pushed down only when nothing is left to filter in-process.

use crate::error::{Error, Result};
use crate::metrics::{Attributes, MetricTuple, MetricUpdate, Values};
use crate::query::{
    eval, AggregateRow, AggregationQuery, BareName, DatabaseQuery, FieldRef, QueryFilter,
    QueryOperation,
};
use crate::storage::arrow_utils::record_batches_to_rows;
use crate::storage::native::{parse_sql_payload, SqlDialect};
use crate::storage::{
    ensure_bounded_delete, ensure_writable, execute_generic, BackendKind, FieldInfo, IndexInfo,
    MetricsAdapter, MetricsQueryAdapter, QueryPlan, Row, SchemaInfo,
};
use crate::utils::micros_to_datetime;
use crate::utils::validation::validate_target_name;
use async_trait::async_trait;
use chrono::Utc;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::types::Value as DuckValue;
use duckdb::{params, params_from_iter, AccessMode, Config, Connection};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_TABLE: &str = "metrics";

/// Rows sampled when discovering attribute and value keys.
const SCHEMA_SAMPLE_ROWS: i64 = 1000;

/// Time-bounded scan pushed into SQL, plus what is left to do in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedScan {
    pub sql: String,
    pub params: Vec<i64>,
    /// Attribute or value predicates still to be evaluated in-process.
    pub residual: bool,
    pub sort: FieldRef,
    pub limit_pushed: bool,
}

/// Builds the SQL phase of a query. With `ordered` unset the scan ignores
/// ordering and limit (counts, deletes, aggregation input).
pub fn build_scan(table: &str, filter: &QueryFilter, ordered: bool) -> Result<EmbeddedScan> {
    filter.validate()?;
    let sort = filter.sort_field()?;
    let residual = filter.has_field_predicates();

    let mut sql = format!(
        r#"SELECT id, attributes, "values", "timestamp" FROM {}"#,
        table
    );
    let mut params = Vec::new();
    if let Some(range) = &filter.time_range {
        sql.push_str(r#" WHERE "timestamp" >= ? AND "timestamp" <= ?"#);
        let (start, end) = range.stored_bounds();
        params.push(start.timestamp_micros());
        params.push(end.timestamp_micros());
    }

    let mut limit_pushed = false;
    if ordered {
        let direction = match sort {
            FieldRef::Timestamp => filter.sort_order.sql(),
            _ => "DESC",
        };
        sql.push_str(&format!(r#" ORDER BY "timestamp" {}"#, direction));
        if let (Some(limit), false, FieldRef::Timestamp) = (filter.limit_i64(), residual, &sort) {
            sql.push_str(" LIMIT ?");
            params.push(limit);
            limit_pushed = true;
        }
    }

    Ok(EmbeddedScan {
        sql,
        params,
        residual,
        sort,
        limit_pushed,
    })
}

/// Replaces positional `?` markers with the bound integers, for EXPLAIN.
fn inline_params(sql: &str, params: &[i64]) -> String {
    let mut out = String::with_capacity(sql.len() + params.len() * 16);
    let mut values = params.iter();
    for ch in sql.chars() {
        match (ch, values.as_slice().is_empty()) {
            ('?', false) => {
                if let Some(v) = values.next() {
                    out.push_str(&v.to_string());
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

fn json_to_duck(value: &JsonValue) -> DuckValue {
    match value {
        JsonValue::Null => DuckValue::Null,
        JsonValue::Bool(b) => DuckValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => DuckValue::BigInt(i),
            None => DuckValue::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

fn decode_tuple(id: String, attributes: &str, values: &str, ts: i64) -> Result<MetricTuple> {
    let attributes: Attributes = serde_json::from_str(attributes)?;
    let values: Values = serde_json::from_str(values)?;
    let timestamp = micros_to_datetime(ts)
        .ok_or_else(|| Error::InvalidData(format!("timestamp {} out of range", ts)))?;
    Ok(MetricTuple {
        id: Some(id),
        attributes,
        values,
        timestamp,
    })
}

fn run_scan(conn: &Connection, scan: &EmbeddedScan) -> Result<Vec<MetricTuple>> {
    let mut stmt = conn.prepare(&scan.sql)?;
    let rows = stmt.query_map(params_from_iter(scan.params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut tuples = Vec::new();
    for row in rows {
        let (id, attributes, values, ts) = row?;
        tuples.push(decode_tuple(id, &attributes, &values, ts)?);
    }
    Ok(tuples)
}

/// Full two-phase evaluation of a filter on an open connection.
fn select_matching(
    conn: &Connection,
    table: &str,
    filter: &QueryFilter,
    ordered: bool,
) -> Result<Vec<MetricTuple>> {
    let scan = build_scan(table, filter, ordered)?;
    let candidates = run_scan(conn, &scan)?;
    let fetched = candidates.len();
    let matched = if ordered {
        eval::apply_filter(candidates, filter, &scan.sort)
    } else {
        candidates
            .into_iter()
            .filter(|t| eval::matches(filter, t))
            .collect()
    };
    debug!(
        fetched,
        matched = matched.len(),
        residual = scan.residual,
        "Embedded scan complete"
    );
    Ok(matched)
}

fn index_columns(definition: &str) -> Vec<String> {
    match (definition.find('('), definition.rfind(')')) {
        (Some(open), Some(close)) if close > open => definition[open + 1..close]
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// DuckDB-backed adapter.
#[derive(Clone)]
pub struct DuckDbAdapter {
    path: String,
    table: String,
    read_only: bool,
    conn: Arc<Mutex<Option<Connection>>>,
    connected: Arc<AtomicBool>,
}

impl DuckDbAdapter {
    pub fn new(path: &str, read_only: bool) -> Self {
        Self {
            path: path.to_owned(),
            table: DEFAULT_TABLE.to_owned(),
            read_only,
            conn: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new_in_memory() -> Self {
        Self::new(":memory:", false)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Same connection, different table.
    pub fn with_table(&self, table: &str) -> Result<Self> {
        validate_target_name(table)?;
        let mut adapter = self.clone();
        adapter.table = table.to_owned();
        Ok(adapter)
    }

    fn retarget(&self, target: Option<&str>) -> Result<Self> {
        match target {
            Some(name) if name != self.table => self.with_table(name),
            _ => Ok(self.clone()),
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        if self.path == ":memory:" {
            return Ok(Connection::open_in_memory()?);
        }
        let config = if self.read_only {
            Config::default().access_mode(AccessMode::ReadOnly)?
        } else {
            Config::default()
        };
        Ok(Connection::open_with_flags(&self.path, config)?)
    }

    fn create_schema_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id VARCHAR PRIMARY KEY,
                attributes VARCHAR NOT NULL,
                "values" VARCHAR NOT NULL,
                "timestamp" BIGINT NOT NULL,
                created_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{t}_timestamp ON {t}("timestamp");
            CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t}(created_at);
            "#,
            t = self.table
        )
    }

    async fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(Error::NotConnected)?;
        f(conn)
    }

    async fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;
        f(conn)
    }

    fn explain_sql(conn: &Connection, sql: &str) -> Result<JsonValue> {
        let mut stmt = conn.prepare(&format!("EXPLAIN {}", sql))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut plan = serde_json::Map::new();
        for row in rows {
            let (key, value) = row?;
            plan.insert(key, JsonValue::String(value));
        }
        Ok(JsonValue::Object(plan))
    }

    fn explain_generic(&self, conn: &Connection, query: &DatabaseQuery) -> Result<QueryPlan> {
        let (filter, ordered) = match query.operation {
            QueryOperation::Find => (query.filter_or_default(), true),
            QueryOperation::Count | QueryOperation::Distinct => (query.filter_or_default(), false),
            QueryOperation::Aggregate => {
                let mut aggregation = query.aggregation_or_reject()?.clone();
                if aggregation.filters.is_none() {
                    aggregation.filters = query.filters.clone();
                }
                (aggregation.plan()?.filter, false)
            }
        };
        let scan = build_scan(&self.table, &filter, ordered)?;
        let sql = inline_params(&scan.sql, &scan.params);
        let sql_plan = Self::explain_sql(conn, &sql)?;

        let mut steps = vec![json!({"stage": "sql", "statement": sql, "plan": sql_plan})];
        if scan.residual {
            steps.push(json!({
                "stage": "in_process_filter",
                "attributes": filter.attribute_filters().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
                "value_filters": filter.value_conditions()
                    .map(|(k, op, v)| json!({"field": k, "op": op.token(), "value": v}))
                    .collect::<Vec<_>>(),
            }));
        }
        match query.operation {
            QueryOperation::Find => {
                if scan.sort != FieldRef::Timestamp {
                    steps.push(json!({
                        "stage": "in_process_sort",
                        "field": filter.sort_by,
                        "order": filter.sort_order.sql(),
                    }));
                }
                if let (Some(limit), false) = (filter.limit, scan.limit_pushed) {
                    steps.push(json!({"stage": "in_process_limit", "limit": limit}));
                }
            }
            QueryOperation::Aggregate => steps.push(json!({"stage": "in_process_aggregate"})),
            QueryOperation::Count => steps.push(json!({"stage": "in_process_count"})),
            QueryOperation::Distinct => steps.push(json!({"stage": "in_process_distinct"})),
        }

        Ok(QueryPlan {
            database_type: BackendKind::Embedded,
            query: json!({"sql": sql}),
            plan: json!({"steps": steps}),
        })
    }
}

#[async_trait]
impl MetricsQueryAdapter for DuckDbAdapter {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let conn = self.open_connection()?;
        if !self.read_only {
            conn.execute_batch(&self.create_schema_sql())?;
        }
        *guard = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        info!(path = %self.path, table = %self.table, read_only = self.read_only, "Connected to DuckDB");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            info!(path = %self.path, "Disconnected from DuckDB");
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>> {
        let table = self.table.clone();
        self.with_conn(|conn| select_matching(conn, &table, filter, true))
            .await
    }

    async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>> {
        let plan = query.plan()?;
        let table = self.table.clone();
        let tuples = self
            .with_conn(|conn| select_matching(conn, &table, &plan.filter, false))
            .await?;
        let rows = eval::aggregate(&plan, &tuples);
        debug!(groups = rows.len(), "Embedded aggregation complete");
        Ok(rows)
    }

    async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        let scan = build_scan(&self.table, filter, false)?;
        if !scan.residual {
            let sql = scan.sql.replacen(
                r#"SELECT id, attributes, "values", "timestamp""#,
                "SELECT COUNT(*)",
                1,
            );
            return self
                .with_conn(|conn| {
                    let count: i64 =
                        conn.query_row(&sql, params_from_iter(scan.params.iter()), |row| row.get(0))?;
                    Ok(count.max(0) as u64)
                })
                .await;
        }
        let table = self.table.clone();
        let matched = self
            .with_conn(|conn| select_matching(conn, &table, filter, false))
            .await?;
        Ok(matched.len() as u64)
    }

    async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>> {
        let field = FieldRef::parse(field, BareName::Attribute)?;
        let filter = filter.cloned().unwrap_or_default();
        let table = self.table.clone();
        let tuples = self
            .with_conn(|conn| select_matching(conn, &table, &filter, false))
            .await?;
        Ok(eval::distinct(&field, &tuples))
    }

    async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>> {
        let Some(payload) = &query.native_query else {
            let target = self.retarget(query.collection_table.as_deref())?;
            return execute_generic(&target, query).await;
        };
        let native = parse_sql_payload(payload, SqlDialect::DuckDb)?;
        let params: Vec<DuckValue> = native.params.iter().map(json_to_duck).collect();
        let batches = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&native.sql)?;
                let batches: Vec<RecordBatch> = stmt.query_arrow(params_from_iter(params))?.collect();
                Ok(batches)
            })
            .await?;
        let rows = record_batches_to_rows(&batches)?;
        debug!(rows = rows.len(), "Native DuckDB query complete");
        Ok(rows)
    }

    async fn get_schema_info(&self) -> Result<SchemaInfo> {
        let table = self.table.clone();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info('{}')", table))?;
            let fields = stmt
                .query_map([], |row| {
                    Ok(FieldInfo {
                        name: row.get(1)?,
                        data_type: row.get(2)?,
                        nullable: !row.get::<_, bool>(3)?,
                        primary_key: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT index_name, is_unique, sql FROM duckdb_indexes() WHERE table_name = ?",
            )?;
            let indexes = stmt
                .query_map(params![table], |row| {
                    let definition: Option<String> = row.get(2)?;
                    Ok(IndexInfo {
                        name: row.get(0)?,
                        columns: definition.as_deref().map(index_columns).unwrap_or_default(),
                        unique: row.get(1)?,
                        definition,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let row_count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;

            let mut dimensions = BTreeSet::new();
            let mut measures = BTreeSet::new();
            let mut stmt = conn.prepare(&format!(
                r#"SELECT attributes, "values" FROM {} LIMIT ?"#,
                table
            ))?;
            let samples = stmt.query_map(params![SCHEMA_SAMPLE_ROWS], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for sample in samples {
                let (attributes, values) = sample?;
                let attributes: Attributes = serde_json::from_str(&attributes)?;
                let values: Values = serde_json::from_str(&values)?;
                dimensions.extend(attributes.into_keys());
                measures.extend(values.into_keys());
            }

            Ok(SchemaInfo {
                database_type: BackendKind::Embedded,
                target: table,
                fields,
                indexes,
                row_count: Some(row_count.max(0) as u64),
                dimensions: dimensions.into_iter().collect(),
                measures: measures.into_iter().collect(),
            })
        })
        .await
    }

    async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan> {
        match &query.native_query {
            Some(payload) => {
                let native = parse_sql_payload(payload, SqlDialect::DuckDb)?;
                if !native.params.is_empty() {
                    return Err(Error::rejected(
                        "explain of a parameterised native statement is not supported",
                    ));
                }
                let plan = self.with_conn(|conn| Self::explain_sql(conn, &native.sql)).await?;
                Ok(QueryPlan {
                    database_type: BackendKind::Embedded,
                    query: json!({"sql": native.sql}),
                    plan,
                })
            }
            None => {
                let target = self.retarget(query.collection_table.as_deref())?;
                self.with_conn(|conn| target.explain_generic(conn, query)).await
            }
        }
    }

    async fn health_check(&self) -> bool {
        let result = self
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?))
            .await;
        match result {
            Ok(_) => true,
            Err(Error::NotConnected) => false,
            Err(e) => {
                warn!(error = %e, "DuckDB health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl MetricsAdapter for DuckDbAdapter {
    async fn insert_metric(&self, metric: &MetricTuple) -> Result<String> {
        let mut ids = self.insert_metrics_batch(std::slice::from_ref(metric)).await?;
        ids.pop()
            .ok_or_else(|| Error::InvalidData("insert returned no id".to_string()))
    }

    async fn insert_metrics_batch(&self, metrics: &[MetricTuple]) -> Result<Vec<String>> {
        ensure_writable(self.read_only, "insert")?;
        for metric in metrics {
            metric.validate()?;
        }
        let sql = format!(
            r#"INSERT INTO {} (id, attributes, "values", "timestamp", created_at) VALUES (?, ?, ?, ?, ?)"#,
            self.table
        );
        let ids = self
            .with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(metrics.len());
                {
                    let mut stmt = tx.prepare(&sql)?;
                    let created_at = Utc::now().timestamp_micros();
                    for metric in metrics {
                        let id = uuid::Uuid::new_v4().to_string();
                        stmt.execute(params![
                            id,
                            serde_json::to_string(&metric.attributes)?,
                            serde_json::to_string(&metric.values)?,
                            metric.stored_timestamp().timestamp_micros(),
                            created_at,
                        ])?;
                        ids.push(id);
                    }
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        debug!(inserted = ids.len(), table = %self.table, "Inserted metrics");
        Ok(ids)
    }

    async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool> {
        ensure_writable(self.read_only, "update")?;
        update.validate()?;
        let table = self.table.clone();
        let updated = self
            .with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                let current = {
                    let mut stmt =
                        tx.prepare(&format!(r#"SELECT attributes, "values" FROM {} WHERE id = ?"#, table))?;
                    let mut rows = stmt.query(params![id])?;
                    match rows.next()? {
                        Some(row) => Some((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                        None => None,
                    }
                };
                let Some((attributes, values)) = current else {
                    return Ok(false);
                };
                let mut attributes: Attributes = serde_json::from_str(&attributes)?;
                let mut values: Values = serde_json::from_str(&values)?;
                update.apply_to(&mut attributes, &mut values);
                tx.execute(
                    &format!(r#"UPDATE {} SET attributes = ?, "values" = ? WHERE id = ?"#, table),
                    params![
                        serde_json::to_string(&attributes)?,
                        serde_json::to_string(&values)?,
                        id
                    ],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if !updated {
            warn!(id, "Metric not found for update");
        }
        Ok(updated)
    }

    async fn delete_metric(&self, id: &str) -> Result<bool> {
        ensure_writable(self.read_only, "delete")?;
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        let deleted = self
            .with_conn(|conn| Ok(conn.execute(&sql, params![id])?))
            .await?;
        if deleted == 0 {
            warn!(id, "Metric not found for delete");
        }
        Ok(deleted > 0)
    }

    async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        ensure_writable(self.read_only, "delete")?;
        ensure_bounded_delete(filter)?;
        let table = self.table.clone();
        let deleted = self
            .with_conn_mut(|conn| {
                let matched = select_matching(conn, &table, filter, false)?;
                let tx = conn.transaction()?;
                let mut deleted = 0u64;
                {
                    let mut stmt = tx.prepare(&format!("DELETE FROM {} WHERE id = ?", table))?;
                    for tuple in &matched {
                        if let Some(id) = &tuple.id {
                            deleted += stmt.execute(params![id])? as u64;
                        }
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        debug!(deleted, table = %self.table, "Deleted metrics by filter");
        Ok(deleted)
    }
}
