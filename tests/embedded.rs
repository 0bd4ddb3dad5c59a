mod common;

use metricsdb_core::{DatabaseConfig, DatabaseQuery, MetricsDatabase, QueryFilter};
use serde_json::json;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> MetricsDatabase {
    let path = dir.path().join("metrics.duckdb");
    let db = MetricsDatabase::new(DatabaseConfig::embedded(path.to_string_lossy())).unwrap();
    db.initialize().await.unwrap();
    db
}

#[tokio::test]
async fn test_embedded_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    common::run_all(&db).await;
    assert_eq!(db.count_metrics(&QueryFilter::new()).await.unwrap(), 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    let id = db.insert_metric(&common::tuple("P", Some(7.0), 0)).await.unwrap();
    db.close().await.unwrap();

    let db = open(&dir).await;
    let found = db
        .query_metrics(&QueryFilter::new().with_attribute("category", "P"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.as_deref(), Some(id.as_str()));
    assert_eq!(found[0].timestamp, common::base_time());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_native_select_with_params() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    db.insert_metrics_batch(&[
        common::tuple("Q", Some(1.0), 0),
        common::tuple("Q", Some(2.0), 1),
    ])
    .await
    .unwrap();

    let rows = db
        .execute_native_query(&DatabaseQuery::native(json!({
            "sql": "SELECT count(*) AS n FROM metrics WHERE \"timestamp\" >= ?",
            "params": [0]
        })))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"].as_i64(), Some(2));

    let err = db
        .execute_native_query(&DatabaseQuery::native(json!({"sql": "DELETE FROM metrics"})))
        .await
        .unwrap_err();
    assert!(matches!(err, metricsdb_core::Error::UnsafeNativeQuery(_)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_table_layout() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    let schema = db.get_schema_info().await.unwrap();
    let columns: Vec<_> = schema.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "attributes", "values", "timestamp", "created_at"]);
    assert!(schema.fields.iter().any(|f| f.name == "id" && f.primary_key));
    let indexed: Vec<_> = schema.indexes.iter().flat_map(|i| i.columns.clone()).collect();
    assert!(indexed.iter().any(|c| c.contains("timestamp")));
    assert!(indexed.iter().any(|c| c.contains("created_at")));
    db.close().await.unwrap();
}
