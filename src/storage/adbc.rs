//! Relational adapter: PostgreSQL through an ADBC driver.
//!
//! Connections come from a small pool bounded by a semaphore. Statements are
//! generated by [`crate::storage::sql`]; parameters are bound as a one-row
//! Arrow record batch, bulk inserts as one row per tuple.

use crate::config::RelationalConfig;
use crate::error::{Error, Result};
use crate::metrics::{create_insert_batch, Attributes, MetricTuple, MetricUpdate, Values};
use crate::query::{
    AggregateRow, AggregationQuery, BareName, DatabaseQuery, FieldRef, QueryFilter, QueryOperation,
};
use crate::storage::arrow_utils::{record_batches_to_rows, string_at, RecordBatchExt};
use crate::storage::native::{parse_sql_payload, SqlDialect};
use crate::storage::sql::{self, SqlParam, SqlQuery};
use crate::storage::{
    ensure_bounded_delete, ensure_writable, execute_generic, BackendKind, Credentials, FieldInfo,
    IndexInfo, MetricsAdapter, MetricsQueryAdapter, QueryPlan, Row, SchemaInfo,
};
use crate::query::eval::sort_distinct;
use crate::utils::validation::validate_target_name;
use crate::utils::{f64_to_json, micros_to_datetime, timestamp_to_json};
use adbc_core::driver_manager::{ManagedConnection, ManagedDatabase, ManagedDriver};
use adbc_core::options::{AdbcVersion, OptionConnection, OptionDatabase, OptionValue};
use adbc_core::{Connection, Database, Driver, Optionable, Statement};
use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

const SCHEMA_SAMPLE_ROWS: i64 = 1000;

/// Builds the one-row parameter batch for a statement, `None` without params.
pub fn params_batch(params: &[SqlParam]) -> Result<Option<RecordBatch>> {
    if params.is_empty() {
        return Ok(None);
    }
    let mut fields = Vec::with_capacity(params.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let name = format!("p{}", i + 1);
        let (data_type, column): (DataType, ArrayRef) = match param {
            SqlParam::Text(s) => (DataType::Utf8, Arc::new(StringArray::from(vec![s.as_str()]))),
            SqlParam::Float(v) => (DataType::Float64, Arc::new(Float64Array::from(vec![*v]))),
            SqlParam::Int(v) => (DataType::Int64, Arc::new(Int64Array::from(vec![*v]))),
            SqlParam::Bool(v) => (DataType::Boolean, Arc::new(BooleanArray::from(vec![*v]))),
            SqlParam::Timestamp(ts) => (
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                Arc::new(
                    TimestampMicrosecondArray::from(vec![ts.timestamp_micros()]).with_timezone("UTC"),
                ),
            ),
            SqlParam::Null => (DataType::Utf8, Arc::new(StringArray::from(vec![None::<&str>]))),
        };
        fields.push(Field::new(name, data_type, true));
        columns.push(column);
    }
    Ok(Some(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?))
}

fn json_to_param(value: &JsonValue) -> SqlParam {
    match value {
        JsonValue::Null => SqlParam::Null,
        JsonValue::Bool(b) => SqlParam::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlParam::Int(i),
            None => SqlParam::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => SqlParam::Text(s.clone()),
        other => SqlParam::Text(other.to_string()),
    }
}

fn param_to_json(param: &SqlParam) -> JsonValue {
    match param {
        SqlParam::Text(s) => JsonValue::String(s.clone()),
        SqlParam::Float(v) => f64_to_json(*v),
        SqlParam::Int(v) => JsonValue::from(*v),
        SqlParam::Bool(v) => JsonValue::Bool(*v),
        SqlParam::Timestamp(ts) => timestamp_to_json(ts),
        SqlParam::Null => JsonValue::Null,
    }
}

fn decode_tuples(batches: &[RecordBatch]) -> Result<Vec<MetricTuple>> {
    let mut tuples = Vec::new();
    for batch in batches {
        let ids = batch.string_column("id")?;
        let attributes = batch.string_column("attributes")?;
        let values = batch.string_column("values")?;
        let timestamps = batch.i64_column("ts_micros")?;
        for row in 0..batch.num_rows() {
            let attrs: Attributes = match string_at(&attributes, row) {
                Some(text) => serde_json::from_str(text)?,
                None => Attributes::new(),
            };
            let vals: Values = match string_at(&values, row) {
                Some(text) => serde_json::from_str(text)?,
                None => Values::new(),
            };
            let micros = timestamps.value(row);
            let timestamp = micros_to_datetime(micros)
                .ok_or_else(|| Error::InvalidData(format!("timestamp {} out of range", micros)))?;
            tuples.push(MetricTuple {
                id: string_at(&ids, row).map(str::to_owned),
                attributes: attrs,
                values: vals,
                timestamp,
            });
        }
    }
    Ok(tuples)
}

fn count_rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

fn index_columns(definition: &str) -> Vec<String> {
    match (definition.rfind('('), definition.rfind(')')) {
        (Some(open), Some(close)) if close > open => definition[open + 1..close]
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Connection pool over one ADBC database handle.
struct AdbcPool {
    _driver: ManagedDriver,
    database: Mutex<ManagedDatabase>,
    idle: Mutex<Vec<ManagedConnection>>,
    permits: Semaphore,
    read_only: bool,
}

impl AdbcPool {
    fn open(
        settings: &RelationalConfig,
        credentials: Option<&Credentials>,
        read_only: bool,
        size: u32,
    ) -> Result<Self> {
        let mut driver = ManagedDriver::load_dynamic_from_filename(
            &settings.driver_path,
            None,
            AdbcVersion::V100,
        )?;
        let mut database = Driver::new_database(&mut driver)?;
        database.set_option(OptionDatabase::Uri, OptionValue::String(settings.uri.clone()))?;
        if let Some(creds) = credentials {
            if let Some(username) = &creds.username {
                database.set_option(OptionDatabase::Username, OptionValue::String(username.clone()))?;
            }
            if let Some(password) = &creds.password {
                database.set_option(OptionDatabase::Password, OptionValue::String(password.clone()))?;
            }
        }

        Ok(Self {
            _driver: driver,
            database: Mutex::new(database),
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(size.max(1) as usize),
            read_only,
        })
    }

    fn new_connection(&self) -> Result<ManagedConnection> {
        let mut conn = {
            let mut database = self.database.lock();
            database.new_connection()?
        };
        if self.read_only {
            let mut stmt = conn.new_statement()?;
            stmt.set_sql_query("SET default_transaction_read_only = on")?;
            stmt.execute_update()?;
        }
        Ok(conn)
    }

    async fn acquire(&self) -> Result<PooledConnection<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::NotConnected)?;
        let idle = self.idle.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.new_connection()?,
        };
        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
            _permit: permit,
        })
    }

    fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }
}

/// A checked-out connection; returned to the pool on drop unless a driver
/// error marked it broken.
struct PooledConnection<'a> {
    pool: &'a AdbcPool,
    conn: Option<ManagedConnection>,
    broken: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledConnection<'_> {
    fn guard<T>(&mut self, f: impl FnOnce(&mut ManagedConnection) -> Result<T>) -> Result<T> {
        let conn = self.conn.as_mut().ok_or(Error::NotConnected)?;
        let result = f(conn);
        if matches!(result, Err(Error::Adbc(_))) {
            self.broken = true;
        }
        result
    }

    fn query(&mut self, query: &SqlQuery) -> Result<Vec<RecordBatch>> {
        let params = params_batch(&query.params)?;
        self.guard(|conn| {
            let mut stmt = conn.new_statement()?;
            stmt.set_sql_query(&query.sql)?;
            if let Some(batch) = params {
                stmt.bind(batch)?;
            }
            let reader = stmt.execute()?;
            let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(batches)
        })
    }

    fn execute(&mut self, sql: &str) -> Result<Option<i64>> {
        self.guard(|conn| {
            let mut stmt = conn.new_statement()?;
            stmt.set_sql_query(sql)?;
            Ok(stmt.execute_update()?)
        })
    }

    fn execute_bound(&mut self, sql: &str, batch: RecordBatch) -> Result<Option<i64>> {
        self.guard(|conn| {
            let mut stmt = conn.new_statement()?;
            stmt.set_sql_query(sql)?;
            stmt.bind(batch)?;
            Ok(stmt.execute_update()?)
        })
    }

    /// Runs `f` with autocommit disabled, committing on success.
    fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.guard(|conn| {
            conn.set_option(OptionConnection::AutoCommit, OptionValue::String("false".into()))?;
            Ok(())
        })?;
        let result = f(self);
        let finish = self.guard(|conn| {
            match &result {
                Ok(_) => conn.commit()?,
                Err(_) => conn.rollback()?,
            }
            conn.set_option(OptionConnection::AutoCommit, OptionValue::String("true".into()))?;
            Ok(())
        });
        let value = result?;
        finish?;
        Ok(value)
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken && !self.pool.permits.is_closed() {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}

/// PostgreSQL adapter over ADBC.
#[derive(Clone)]
pub struct AdbcAdapter {
    settings: Arc<RelationalConfig>,
    credentials: Option<Credentials>,
    read_only: bool,
    pool_size: u32,
    table: String,
    pool: Arc<RwLock<Option<Arc<AdbcPool>>>>,
    /// Serializes connect and disconnect across every clone.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl AdbcAdapter {
    pub fn new(
        settings: RelationalConfig,
        credentials: Option<Credentials>,
        read_only: bool,
        pool_size: u32,
    ) -> Result<Self> {
        validate_target_name(&settings.table)?;
        Ok(Self {
            table: settings.table.clone(),
            settings: Arc::new(settings),
            credentials,
            read_only,
            pool_size,
            pool: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Same pool, different table.
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

    fn pool(&self) -> Result<Arc<AdbcPool>> {
        self.pool.read().clone().ok_or(Error::NotConnected)
    }

    async fn run_query(&self, query: &SqlQuery) -> Result<Vec<RecordBatch>> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        let batches = conn.query(query)?;
        debug!(rows = count_rows(&batches), "Relational query complete");
        Ok(batches)
    }

    fn generic_sql(&self, query: &DatabaseQuery) -> Result<SqlQuery> {
        let filter = query.filter_or_default();
        match query.operation {
            QueryOperation::Find => sql::select_metrics(&self.table, &filter),
            QueryOperation::Count => sql::count_metrics(&self.table, &filter),
            QueryOperation::Distinct => {
                let field = FieldRef::parse(query.distinct_field()?, BareName::Attribute)?;
                sql::distinct_values(&self.table, &field, &filter)
            }
            QueryOperation::Aggregate => {
                let mut aggregation = query.aggregation_or_reject()?.clone();
                if aggregation.filters.is_none() {
                    aggregation.filters = query.filters.clone();
                }
                sql::aggregate(&self.table, &aggregation.plan()?)
            }
        }
    }
}

#[async_trait]
impl MetricsQueryAdapter for AdbcAdapter {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_connected(&self) -> bool {
        self.pool.read().is_some()
    }

    async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let pool = AdbcPool::open(
            &self.settings,
            self.credentials.as_ref(),
            self.read_only,
            self.pool_size,
        )
        .map_err(|e| {
            error!(error = %e, driver = %self.settings.driver_path, "Failed to open ADBC database");
            e
        })?;

        {
            let mut conn = pool.acquire().await?;
            conn.query(&SqlQuery::new("SELECT 1", Vec::new()))?;
            if !self.read_only {
                for statement in sql::create_schema(&self.table) {
                    if let Err(e) = conn.execute(&statement) {
                        if e.to_string().contains("already exists") {
                            debug!(error = %e, "Schema object already exists");
                        } else {
                            return Err(e);
                        }
                    }
                }
            }
        }

        *self.pool.write() = Some(Arc::new(pool));
        info!(table = %self.table, read_only = self.read_only, "Connected to relational store via ADBC");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(pool) = self.pool.write().take() {
            pool.close();
            info!(table = %self.table, "Disconnected from relational store");
        }
        Ok(())
    }

    async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>> {
        let query = sql::select_metrics(&self.table, filter)?;
        let batches = self.run_query(&query).await?;
        decode_tuples(&batches)
    }

    async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>> {
        let plan = query.plan()?;
        let query = sql::aggregate(&self.table, &plan)?;
        let batches = self.run_query(&query).await?;
        record_batches_to_rows(&batches)
    }

    async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        let query = sql::count_metrics(&self.table, filter)?;
        let batches = self.run_query(&query).await?;
        let count = match batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => batch.i64_column("count")?.value(0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>> {
        let field = FieldRef::parse(field, BareName::Attribute)?;
        let filter = filter.cloned().unwrap_or_default();
        let query = sql::distinct_values(&self.table, &field, &filter)?;
        let batches = self.run_query(&query).await?;

        let mut values = Vec::new();
        for batch in &batches {
            match field {
                FieldRef::Timestamp => {
                    let col = batch.i64_column("value")?;
                    for row in 0..batch.num_rows() {
                        if let Some(ts) = micros_to_datetime(col.value(row)) {
                            values.push(timestamp_to_json(&ts));
                        }
                    }
                }
                FieldRef::Attribute(_) | FieldRef::Value(_) => {
                    let col = batch.string_column("value")?;
                    for row in 0..batch.num_rows() {
                        let Some(text) = string_at(&col, row) else { continue };
                        let value: JsonValue = serde_json::from_str(text)?;
                        let value = match (&field, value.as_f64()) {
                            (FieldRef::Value(_), Some(v)) => f64_to_json(v),
                            _ => value,
                        };
                        values.push(value);
                    }
                }
            }
        }
        sort_distinct(&mut values);
        Ok(values)
    }

    async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>> {
        let Some(payload) = &query.native_query else {
            let target = self.retarget(query.collection_table.as_deref())?;
            return execute_generic(&target, query).await;
        };
        let native = parse_sql_payload(payload, SqlDialect::Postgres)?;
        let query = SqlQuery::new(native.sql, native.params.iter().map(json_to_param).collect());
        let batches = self.run_query(&query).await?;
        record_batches_to_rows(&batches)
    }

    async fn get_schema_info(&self) -> Result<SchemaInfo> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;

        let primary: HashSet<String> = {
            let batches = conn.query(&sql::schema_primary_key(&self.table))?;
            let mut names = HashSet::new();
            for batch in &batches {
                let col = batch.string_column("column_name")?;
                for row in 0..batch.num_rows() {
                    if let Some(name) = string_at(&col, row) {
                        names.insert(name.to_owned());
                    }
                }
            }
            names
        };

        let mut fields = Vec::new();
        for batch in conn.query(&sql::schema_columns(&self.table))? {
            let names = batch.string_column("column_name")?;
            let types = batch.string_column("data_type")?;
            let nullable = batch.string_column("is_nullable")?;
            for row in 0..batch.num_rows() {
                let name = string_at(&names, row).unwrap_or_default().to_owned();
                fields.push(FieldInfo {
                    primary_key: primary.contains(&name),
                    name,
                    data_type: string_at(&types, row).unwrap_or_default().to_owned(),
                    nullable: string_at(&nullable, row) == Some("YES"),
                });
            }
        }

        let mut indexes = Vec::new();
        for batch in conn.query(&sql::schema_indexes(&self.table))? {
            let names = batch.string_column("indexname")?;
            let defs = batch.string_column("indexdef")?;
            for row in 0..batch.num_rows() {
                let definition = string_at(&defs, row).map(str::to_owned);
                indexes.push(IndexInfo {
                    name: string_at(&names, row).unwrap_or_default().to_owned(),
                    columns: definition.as_deref().map(index_columns).unwrap_or_default(),
                    unique: definition
                        .as_deref()
                        .map(|d| d.contains("UNIQUE INDEX"))
                        .unwrap_or(false),
                    definition,
                });
            }
        }

        let row_count = conn
            .query(&SqlQuery::new(sql::row_count(&self.table), Vec::new()))?
            .iter()
            .find(|b| b.num_rows() > 0)
            .map(|b| b.i64_column("count").map(|c| c.value(0)))
            .transpose()?;

        let mut keys = |column: &str| -> Result<Vec<String>> {
            let mut out = Vec::new();
            for batch in conn.query(&sql::schema_keys(&self.table, column, SCHEMA_SAMPLE_ROWS))? {
                let col = batch.string_column("key")?;
                for row in 0..batch.num_rows() {
                    if let Some(key) = string_at(&col, row) {
                        out.push(key.to_owned());
                    }
                }
            }
            Ok(out)
        };
        let dimensions = keys("attributes")?;
        let measures = keys("values")?;

        Ok(SchemaInfo {
            database_type: BackendKind::Relational,
            target: self.table.clone(),
            fields,
            indexes,
            row_count: row_count.map(|c| c.max(0) as u64),
            dimensions,
            measures,
        })
    }

    async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan> {
        let target = match &query.native_query {
            Some(payload) => {
                let native = parse_sql_payload(payload, SqlDialect::Postgres)?;
                SqlQuery::new(native.sql, native.params.iter().map(json_to_param).collect())
            }
            None => self.retarget(query.collection_table.as_deref())?.generic_sql(query)?,
        };
        let explain = SqlQuery::new(format!("EXPLAIN (FORMAT JSON) {}", target.sql), target.params.clone());
        let batches = self.run_query(&explain).await?;

        let text = match batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => {
                let col = batch.string_column("QUERY PLAN")?;
                string_at(&col, 0).map(str::to_owned)
            }
            None => None,
        };
        let plan = match text {
            Some(text) => serde_json::from_str(&text)?,
            None => JsonValue::Null,
        };

        Ok(QueryPlan {
            database_type: BackendKind::Relational,
            query: json!({
                "sql": target.sql,
                "params": target.params.iter().map(param_to_json).collect::<Vec<_>>(),
            }),
            plan,
        })
    }

    async fn health_check(&self) -> bool {
        let Ok(pool) = self.pool() else {
            return false;
        };
        let result = async {
            let mut conn = pool.acquire().await?;
            conn.query(&SqlQuery::new("SELECT 1", Vec::new()))
        }
        .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Relational health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl MetricsAdapter for AdbcAdapter {
    async fn insert_metric(&self, metric: &MetricTuple) -> Result<String> {
        let mut ids = self.insert_metrics_batch(std::slice::from_ref(metric)).await?;
        ids.pop()
            .ok_or_else(|| Error::InvalidData("insert returned no id".to_string()))
    }

    async fn insert_metrics_batch(&self, metrics: &[MetricTuple]) -> Result<Vec<String>> {
        ensure_writable(self.read_only, "insert")?;
        if metrics.is_empty() {
            return Ok(Vec::new());
        }
        for metric in metrics {
            metric.validate()?;
        }
        let rows: Vec<(String, &MetricTuple)> = metrics
            .iter()
            .map(|m| (uuid::Uuid::new_v4().to_string(), m))
            .collect();
        let batch = create_insert_batch(&rows)?;
        let insert = sql::insert_metric(&self.table);

        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        conn.transaction(|conn| conn.execute_bound(&insert, batch))?;
        debug!(inserted = rows.len(), table = %self.table, "Inserted metrics");
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool> {
        ensure_writable(self.read_only, "update")?;
        update.validate()?;
        let query = sql::update_metric(
            &self.table,
            serde_json::to_string(&update.attributes)?,
            serde_json::to_string(&update.values)?,
            id,
        );
        let updated = count_rows(&self.run_query(&query).await?) > 0;
        if !updated {
            warn!(id, "Metric not found for update");
        }
        Ok(updated)
    }

    async fn delete_metric(&self, id: &str) -> Result<bool> {
        ensure_writable(self.read_only, "delete")?;
        let deleted = count_rows(&self.run_query(&sql::delete_metric(&self.table, id)).await?) > 0;
        if !deleted {
            warn!(id, "Metric not found for delete");
        }
        Ok(deleted)
    }

    async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        ensure_writable(self.read_only, "delete")?;
        ensure_bounded_delete(filter)?;
        let query = sql::delete_metrics(&self.table, filter)?;
        let deleted = count_rows(&self.run_query(&query).await?) as u64;
        debug!(deleted, table = %self.table, "Deleted metrics by filter");
        Ok(deleted)
    }
}
