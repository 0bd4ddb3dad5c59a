//! The single entry point callers use.
//!
//! [`MetricsDatabase`] owns the adapter selected by configuration, refuses
//! every operation until [`MetricsDatabase::initialize`] has succeeded, and
//! refuses writes when configured read-only.

use crate::config::{get_credentials, DatabaseConfig};
use crate::error::{Error, Result};
use crate::metrics::{MetricTuple, MetricUpdate};
use crate::query::{AggregateRow, AggregationQuery, DatabaseQuery, QueryFilter};
use crate::storage::{
    ensure_writable, BackendKind, Credentials, MetricsAdapter, MetricsQueryAdapter, QueryPlan, Row,
    SchemaInfo, StorageBackendType,
};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct MetricsDatabase {
    config: DatabaseConfig,
    adapter: StorageBackendType,
    initialized: AtomicBool,
}

impl std::fmt::Debug for MetricsDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsDatabase")
            .field("backend", &self.backend_kind())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl MetricsDatabase {
    /// Builds the configured adapter without connecting. Credentials come
    /// from the environment.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        Self::with_credentials(config, get_credentials())
    }

    pub fn with_credentials(config: DatabaseConfig, credentials: Option<Credentials>) -> Result<Self> {
        let adapter = StorageBackendType::from_config(&config, credentials)?;
        Ok(Self {
            config,
            adapter,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.adapter.backend_kind()
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Connects the adapter. Calling it again is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.adapter.connect().await?;
        self.initialized.store(true, Ordering::Release);
        info!(
            backend = %self.backend_kind(),
            read_only = self.is_read_only(),
            "Metrics database initialized"
        );
        Ok(())
    }

    /// Disconnects the adapter; safe before or after a failed initialize.
    pub async fn close(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        self.adapter.disconnect().await?;
        info!(backend = %self.backend_kind(), "Metrics database closed");
        Ok(())
    }

    fn adapter(&self) -> Result<&StorageBackendType> {
        if self.is_initialized() {
            Ok(&self.adapter)
        } else {
            Err(Error::NotConnected)
        }
    }

    fn writer(&self, operation: &'static str) -> Result<&StorageBackendType> {
        let adapter = self.adapter()?;
        ensure_writable(self.is_read_only(), operation)?;
        Ok(adapter)
    }

    pub async fn health_check(&self) -> bool {
        match self.adapter() {
            Ok(adapter) => adapter.health_check().await,
            Err(_) => false,
        }
    }

    pub async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>> {
        self.adapter()?.query_metrics(filter).await
    }

    pub async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>> {
        self.adapter()?.aggregate_metrics(query).await
    }

    pub async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        self.adapter()?.count_metrics(filter).await
    }

    pub async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>> {
        self.adapter()?.distinct_values(field, filter).await
    }

    pub async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>> {
        self.adapter()?.execute_native_query(query).await
    }

    pub async fn get_schema_info(&self) -> Result<SchemaInfo> {
        self.adapter()?.get_schema_info().await
    }

    pub async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan> {
        self.adapter()?.explain_query(query).await
    }

    pub async fn insert_metric(&self, metric: &MetricTuple) -> Result<String> {
        self.writer("insert")?.insert_metric(metric).await
    }

    pub async fn insert_metrics_batch(&self, metrics: &[MetricTuple]) -> Result<Vec<String>> {
        self.writer("insert")?.insert_metrics_batch(metrics).await
    }

    pub async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool> {
        self.writer("update")?.update_metric(id, update).await
    }

    pub async fn delete_metric(&self, id: &str) -> Result<bool> {
        self.writer("delete")?.delete_metric(id).await
    }

    pub async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        self.writer("delete")?.delete_metrics(filter).await
    }

    /// A facade bound to another collection of the document backend, sharing
    /// this one's connection. Calls on the returned value target `name` only.
    pub async fn switch_collection(&self, name: &str) -> Result<MetricsDatabase> {
        match self.adapter()? {
            StorageBackendType::Document(adapter) => {
                let switched = adapter.switch_collection(name).await?;
                let mut config = self.config.clone();
                config.document.collection = name.to_string();
                Ok(MetricsDatabase {
                    config,
                    adapter: StorageBackendType::Document(switched),
                    initialized: AtomicBool::new(true),
                })
            }
            other => {
                warn!(backend = %other.backend_kind(), "Collection switching requested on a non-document backend");
                Err(Error::Unsupported {
                    backend: other.backend_kind(),
                    operation: "switch_collection",
                })
            }
        }
    }

    /// Collections of the document database.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        match self.adapter()? {
            StorageBackendType::Document(adapter) => adapter.list_collections().await,
            other => Err(Error::Unsupported {
                backend: other.backend_kind(),
                operation: "list_collections",
            }),
        }
    }

    /// Name of the bound collection or table.
    pub fn target(&self) -> &str {
        match &self.adapter {
            StorageBackendType::Embedded(adapter) => adapter.table(),
            StorageBackendType::Document(adapter) => adapter.collection_name(),
            StorageBackendType::Relational(adapter) => adapter.table(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_before_initialize_fail() {
        let db = MetricsDatabase::new(DatabaseConfig::embedded(":memory:")).unwrap();
        assert!(!db.is_initialized());
        assert!(!db.health_check().await);
        let err = db.query_metrics(&QueryFilter::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        let err = db.delete_metric("x").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = MetricsDatabase::new(DatabaseConfig::embedded(":memory:")).unwrap();
        db.initialize().await.unwrap();
        db.initialize().await.unwrap();
        assert!(db.health_check().await);
        assert_eq!(db.backend_kind(), BackendKind::Embedded);
        assert_eq!(db.target(), "metrics");
        db.close().await.unwrap();
        assert!(!db.health_check().await);
    }

    #[tokio::test]
    async fn test_switch_collection_requires_document_backend() {
        let db = MetricsDatabase::new(DatabaseConfig::embedded(":memory:")).unwrap();
        db.initialize().await.unwrap();
        let err = db.switch_collection("other").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                backend: BackendKind::Embedded,
                ..
            }
        ));
        assert!(db.list_collections().await.is_err());
    }
}
