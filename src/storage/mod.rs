//! Storage adapters translating the generic query model into native queries.
//!
//! This module provides three adapter implementations:
//! - `duckdb`: embedded row store; time range in SQL, remaining predicates in-process
//! - `mongo`: document store; filters and aggregation pipelines
//! - `adbc`: relational store (PostgreSQL through ADBC); parameterised SQL over JSONB columns
//!
//! Each adapter implements [`MetricsQueryAdapter`] (reads) and
//! [`MetricsAdapter`] (writes). [`StorageBackendType`] dispatches to the
//! configured adapter.

pub mod adbc;
pub mod arrow_utils;
pub mod collections;
pub mod duckdb;
pub mod mongo;
pub mod mongo_filter;
pub mod native;
pub mod sql;

use self::{adbc::AdbcAdapter, duckdb::DuckDbAdapter, mongo::MongoAdapter};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricTuple, MetricUpdate};
use crate::query::{AggregateRow, AggregationQuery, DatabaseQuery, QueryFilter, QueryOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// A result row of a native or generic `DatabaseQuery`.
pub type Row = Map<String, JsonValue>;

/// Credentials for database authentication
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[serde(alias = "duckdb", alias = "sqlite")]
    Embedded,
    #[serde(alias = "mongodb", alias = "mongo")]
    Document,
    #[serde(alias = "postgresql", alias = "postgres", alias = "adbc")]
    Relational,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Embedded => "embedded",
            BackendKind::Document => "document",
            BackendKind::Relational => "relational",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" | "duckdb" | "sqlite" => Ok(BackendKind::Embedded),
            "document" | "mongodb" | "mongo" => Ok(BackendKind::Document),
            "relational" | "postgresql" | "postgres" | "adbc" => Ok(BackendKind::Relational),
            other => Err(Error::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

/// Description of the storage target, enough to discover what can be queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub database_type: BackendKind,
    /// Table or collection name.
    pub target: String,
    pub fields: Vec<FieldInfo>,
    pub indexes: Vec<IndexInfo>,
    pub row_count: Option<u64>,
    /// Attribute keys usable in filters and `group_by`.
    pub dimensions: Vec<String>,
    /// Value keys usable in comparisons and aggregations.
    pub measures: Vec<String>,
}

/// Engine execution plan returned by `explain_query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub database_type: BackendKind,
    /// The native query that was explained.
    pub query: JsonValue,
    pub plan: JsonValue,
}

/// Read surface shared by every adapter.
#[async_trait]
pub trait MetricsQueryAdapter: Send + Sync + 'static {
    fn backend_kind(&self) -> BackendKind;

    fn is_read_only(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Open the connection and, in read-write mode, ensure tables/indexes exist.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. Safe to call when not connected.
    async fn disconnect(&self) -> Result<()>;

    async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>>;

    async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>>;

    async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64>;

    /// Distinct non-null values of `field`, ascending.
    async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>>;

    /// Runs a native payload after the read-only check, or a generic
    /// operation when no payload is present.
    async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>>;

    async fn get_schema_info(&self) -> Result<SchemaInfo>;

    /// Engine plan for the query; never executes it.
    async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan>;

    /// `false` when not connected or the engine does not answer.
    async fn health_check(&self) -> bool;
}

/// Write surface.
#[async_trait]
pub trait MetricsAdapter: MetricsQueryAdapter {
    /// Stores one tuple and returns its new ID.
    async fn insert_metric(&self, metric: &MetricTuple) -> Result<String>;

    /// Stores tuples atomically; IDs are returned in input order.
    async fn insert_metrics_batch(&self, metrics: &[MetricTuple]) -> Result<Vec<String>>;

    /// Merges the update into the stored tuple; `false` if the ID is unknown.
    async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool>;

    async fn delete_metric(&self, id: &str) -> Result<bool>;

    /// Deletes every tuple matching a non-empty filter.
    async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64>;
}

/// Runs a generic (non-native) `DatabaseQuery` through the adapter's own
/// generic operations.
pub(crate) async fn execute_generic<A>(adapter: &A, query: &DatabaseQuery) -> Result<Vec<Row>>
where
    A: MetricsQueryAdapter + ?Sized,
{
    let filter = query.filter_or_default();
    let rows = match query.operation {
        QueryOperation::Find => adapter
            .query_metrics(&filter)
            .await?
            .iter()
            .map(MetricTuple::to_row)
            .collect(),
        QueryOperation::Aggregate => {
            let mut aggregation = query.aggregation_or_reject()?.clone();
            if aggregation.filters.is_none() {
                aggregation.filters = query.filters.clone();
            }
            adapter.aggregate_metrics(&aggregation).await?
        }
        QueryOperation::Count => {
            let count = adapter.count_metrics(&filter).await?;
            vec![single_row("count", JsonValue::from(count))]
        }
        QueryOperation::Distinct => {
            let field = query.distinct_field()?;
            let values = adapter.distinct_values(field, query.filters.as_ref()).await?;
            vec![single_row("distinct_values", JsonValue::Array(values))]
        }
    };
    Ok(rows)
}

pub(crate) fn single_row(key: &str, value: JsonValue) -> Row {
    let mut row = Row::new();
    row.insert(key.to_string(), value);
    row
}

/// Guard used by every write entry point.
pub(crate) fn ensure_writable(read_only: bool, operation: &'static str) -> Result<()> {
    if read_only {
        Err(Error::ReadOnly(operation))
    } else {
        Ok(())
    }
}

/// Bulk deletes must name at least one clause.
pub(crate) fn ensure_bounded_delete(filter: &QueryFilter) -> Result<()> {
    filter.validate()?;
    if filter.is_unconstrained() {
        return Err(Error::rejected(
            "refusing to delete with an empty filter",
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub enum StorageBackendType {
    Embedded(DuckDbAdapter),
    Document(MongoAdapter),
    Relational(AdbcAdapter),
}

impl StorageBackendType {
    /// Builds the configured adapter without connecting.
    pub fn from_config(config: &DatabaseConfig, credentials: Option<Credentials>) -> Result<Self> {
        Ok(match config.backend {
            BackendKind::Embedded => StorageBackendType::Embedded(
                DuckDbAdapter::new(&config.embedded.path, config.read_only)
                    .with_table(&config.embedded.table)?,
            ),
            BackendKind::Document => StorageBackendType::Document(MongoAdapter::new(
                config.document.clone(),
                credentials,
                config.read_only,
                config.pool_size,
                config.connect_timeout_secs,
            )?),
            BackendKind::Relational => StorageBackendType::Relational(AdbcAdapter::new(
                config.relational.clone(),
                credentials,
                config.read_only,
                config.pool_size,
            )?),
        })
    }
}

impl AsRef<dyn MetricsAdapter> for StorageBackendType {
    fn as_ref(&self) -> &(dyn MetricsAdapter + 'static) {
        match self {
            StorageBackendType::Embedded(backend) => backend,
            StorageBackendType::Document(backend) => backend,
            StorageBackendType::Relational(backend) => backend,
        }
    }
}

#[async_trait]
impl MetricsQueryAdapter for StorageBackendType {
    fn backend_kind(&self) -> BackendKind {
        self.as_ref().backend_kind()
    }

    fn is_read_only(&self) -> bool {
        self.as_ref().is_read_only()
    }

    fn is_connected(&self) -> bool {
        self.as_ref().is_connected()
    }

    async fn connect(&self) -> Result<()> {
        self.as_ref().connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.as_ref().disconnect().await
    }

    async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>> {
        self.as_ref().query_metrics(filter).await
    }

    async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>> {
        self.as_ref().aggregate_metrics(query).await
    }

    async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        self.as_ref().count_metrics(filter).await
    }

    async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>> {
        self.as_ref().distinct_values(field, filter).await
    }

    async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>> {
        self.as_ref().execute_native_query(query).await
    }

    async fn get_schema_info(&self) -> Result<SchemaInfo> {
        self.as_ref().get_schema_info().await
    }

    async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan> {
        self.as_ref().explain_query(query).await
    }

    async fn health_check(&self) -> bool {
        self.as_ref().health_check().await
    }
}

#[async_trait]
impl MetricsAdapter for StorageBackendType {
    async fn insert_metric(&self, metric: &MetricTuple) -> Result<String> {
        self.as_ref().insert_metric(metric).await
    }

    async fn insert_metrics_batch(&self, metrics: &[MetricTuple]) -> Result<Vec<String>> {
        self.as_ref().insert_metrics_batch(metrics).await
    }

    async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool> {
        self.as_ref().update_metric(id, update).await
    }

    async fn delete_metric(&self, id: &str) -> Result<bool> {
        self.as_ref().delete_metric(id).await
    }

    async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        self.as_ref().delete_metrics(filter).await
    }
}
