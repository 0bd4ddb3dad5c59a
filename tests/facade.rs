mod common;

use metricsdb_core::config::ConfigArgs;
use metricsdb_core::{
    AggregateOp, AggregationQuery, BackendKind, DatabaseQuery, Error, MetricsDatabase,
    QueryFilter, QueryOperation, Settings,
};
use serde_json::json;

fn settings_for(dir: &tempfile::TempDir, table: Option<&str>) -> Settings {
    let config_path = dir.path().join("config.toml");
    let db_path = dir.path().join("facade.duckdb");
    std::fs::write(
        &config_path,
        format!(
            "[database]\nbackend = \"embedded\"\n\n[database.embedded]\npath = \"{}\"\n",
            db_path.display()
        ),
    )
    .unwrap();
    let args = ConfigArgs {
        config: Some(config_path),
        collection: table.map(str::to_string),
        ..Default::default()
    };
    Settings::load(&args).unwrap()
}

#[tokio::test]
async fn test_facade_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_for(&dir, Some("events"));
    assert_eq!(settings.database.backend, BackendKind::Embedded);

    let db = MetricsDatabase::new(settings.database).unwrap();
    let err = db.count_metrics(&QueryFilter::new()).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    db.initialize().await.unwrap();
    assert_eq!(db.target(), "events");
    db.insert_metric(&common::tuple("A", Some(5.0), 0)).await.unwrap();
    let schema = db.get_schema_info().await.unwrap();
    assert_eq!(schema.target, "events");
    assert_eq!(schema.row_count, Some(1));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_generic_operations_through_native_entry_point() {
    let dir = tempfile::tempdir().unwrap();
    let db = MetricsDatabase::new(settings_for(&dir, None).database).unwrap();
    db.initialize().await.unwrap();
    db.insert_metrics_batch(&[
        common::tuple("A", Some(1.0), 0),
        common::tuple("A", Some(3.0), 1),
        common::tuple("B", Some(10.0), 2),
    ])
    .await
    .unwrap();

    let aggregation = AggregationQuery::new()
        .group_by("category")
        .aggregate("metric", AggregateOp::Max)
        .having("max_metric", metricsdb_core::ComparisonOp::Gt, 5.0);
    let rows = db
        .execute_native_query(&DatabaseQuery::aggregate(aggregation))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["category"], json!("B"));
    assert_eq!(rows[0]["max_metric"].as_f64(), Some(10.0));

    let rows = db
        .execute_native_query(&DatabaseQuery::distinct("category", None))
        .await
        .unwrap();
    assert_eq!(rows[0]["distinct_values"], json!(["A", "B"]));

    let found = db
        .execute_native_query(&DatabaseQuery::find(QueryFilter::new().with_limit(1)))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["attributes"]["category"], json!("B"));

    let query = DatabaseQuery {
        operation: QueryOperation::Aggregate,
        ..Default::default()
    };
    let err = db.execute_native_query(&query).await.unwrap_err();
    assert!(matches!(err, Error::TranslationRejected(_)));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_collection_switching_is_document_only() {
    let dir = tempfile::tempdir().unwrap();
    let db = MetricsDatabase::new(settings_for(&dir, None).database).unwrap();
    db.initialize().await.unwrap();
    assert!(matches!(
        db.switch_collection("other").await,
        Err(Error::Unsupported { .. })
    ));
    assert!(matches!(
        db.list_collections().await,
        Err(Error::Unsupported { .. })
    ));
    db.close().await.unwrap();
}
