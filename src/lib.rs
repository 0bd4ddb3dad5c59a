//! Backend-agnostic metrics storage.
//!
//! Metric tuples (attributes, numeric values, a timestamp) are stored and
//! queried through one generic filter and aggregation model. Three adapters
//! translate it: DuckDB (embedded), MongoDB (document) and PostgreSQL over
//! ADBC (relational). [`MetricsDatabase`] holds the configured adapter.

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod metrics;
pub mod query;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{DatabaseConfig, Settings};
pub use database::MetricsDatabase;
pub use error::{Error, Result};
pub use metrics::{MetricTuple, MetricUpdate};
pub use query::{
    AggregateOp, AggregationQuery, ComparisonOp, DatabaseQuery, QueryFilter, QueryOperation,
    SortOrder,
};
pub use storage::{
    BackendKind, MetricsAdapter, MetricsQueryAdapter, QueryPlan, SchemaInfo, StorageBackendType,
};
