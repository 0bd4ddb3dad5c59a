mod common;

use metricsdb_core::config::{DocumentConfig, RelationalConfig};
use metricsdb_core::storage::{adbc::AdbcAdapter, mongo::MongoAdapter, MetricsAdapter};
use metricsdb_core::{
    DatabaseConfig, DatabaseQuery, Error, MetricUpdate, MetricsDatabase, MetricsQueryAdapter,
    QueryFilter,
};
use serde_json::json;

fn drop_table() -> DatabaseQuery {
    DatabaseQuery::native(json!("DROP TABLE metrics"))
}

fn delete_documents() -> DatabaseQuery {
    DatabaseQuery::native(json!({"operation": "delete", "filter": {}}))
}

#[tokio::test]
async fn test_embedded_read_only_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.duckdb");

    let writer = MetricsDatabase::new(DatabaseConfig::embedded(path.to_string_lossy())).unwrap();
    writer.initialize().await.unwrap();
    writer.insert_metric(&common::tuple("R", Some(1.0), 0)).await.unwrap();
    writer.close().await.unwrap();

    let mut config = DatabaseConfig::embedded(path.to_string_lossy());
    config.read_only = true;
    let reader = MetricsDatabase::new(config).unwrap();
    reader.initialize().await.unwrap();
    assert!(reader.is_read_only());

    assert_eq!(reader.count_metrics(&QueryFilter::new()).await.unwrap(), 1);
    let err = reader.execute_native_query(&drop_table()).await.unwrap_err();
    assert!(matches!(err, Error::UnsafeNativeQuery(_)), "{err}");

    let err = reader
        .insert_metric(&common::tuple("R", Some(2.0), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly("insert")));
    let err = reader
        .update_metric("any", &MetricUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly("update")));
    let err = reader
        .delete_metrics(&QueryFilter::new().with_attribute("category", "R"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly("delete")));

    assert_eq!(reader.count_metrics(&QueryFilter::new()).await.unwrap(), 1);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_document_read_only_rejects_before_io() {
    let adapter = MongoAdapter::new(DocumentConfig::default(), None, true, 4, 1).unwrap();
    let err = adapter.execute_native_query(&delete_documents()).await.unwrap_err();
    assert!(matches!(err, Error::UnsafeNativeQuery(_)), "{err}");
    let err = adapter.execute_native_query(&drop_table()).await.unwrap_err();
    assert!(matches!(err, Error::UnsafeNativeQuery(_)), "{err}");
    let err = adapter
        .insert_metric(&common::tuple("R", Some(1.0), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
}

#[tokio::test]
async fn test_relational_read_only_rejects_before_io() {
    let adapter = AdbcAdapter::new(RelationalConfig::default(), None, true, 4).unwrap();
    let err = adapter.execute_native_query(&drop_table()).await.unwrap_err();
    assert!(matches!(err, Error::UnsafeNativeQuery(_)), "{err}");
    let err = adapter
        .execute_native_query(&DatabaseQuery::native(json!({"sql": "  delete from metrics"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsafeNativeQuery(_)));
    let err = adapter
        .delete_metric("any")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
}
