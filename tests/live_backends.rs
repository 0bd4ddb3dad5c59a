//! Runs the shared scenarios against live servers.
//!
//! Skipped unless the environment names a server:
//! - `METRICSDB_TEST_MONGODB_URI` for the document backend
//! - `METRICSDB_TEST_POSTGRES_URI` and `METRICSDB_TEST_ADBC_DRIVER` for the
//!   relational backend

mod common;

use metricsdb_core::{BackendKind, DatabaseConfig, MetricsDatabase, QueryFilter};
use std::env;

fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

fn document_config() -> Option<DatabaseConfig> {
    let uri = env::var("METRICSDB_TEST_MONGODB_URI").ok()?;
    let mut config = DatabaseConfig {
        backend: BackendKind::Document,
        connect_timeout_secs: 5,
        ..Default::default()
    };
    config.document.uri = uri;
    config.document.database = "metricsdb_test".to_string();
    config.document.collection = unique_name("metrics");
    Some(config)
}

fn relational_config() -> Option<DatabaseConfig> {
    let uri = env::var("METRICSDB_TEST_POSTGRES_URI").ok()?;
    let driver = env::var("METRICSDB_TEST_ADBC_DRIVER").ok()?;
    let mut config = DatabaseConfig {
        backend: BackendKind::Relational,
        pool_size: 2,
        ..Default::default()
    };
    config.relational.uri = uri;
    config.relational.driver_path = driver;
    config.relational.table = unique_name("metrics");
    Some(config)
}

#[tokio::test]
async fn test_document_scenarios() {
    let Some(config) = document_config() else {
        eprintln!("METRICSDB_TEST_MONGODB_URI not set; skipping");
        return;
    };
    let db = MetricsDatabase::with_credentials(config, None).unwrap();
    let (first, second) = tokio::join!(db.initialize(), db.initialize());
    first.unwrap();
    second.unwrap();
    assert!(db.health_check().await);
    common::run_all(&db).await;

    let other = db.switch_collection(&unique_name("switched")).await.unwrap();
    other.insert_metric(&common::tuple("W", Some(1.0), 0)).await.unwrap();
    let only_w = QueryFilter::new().with_attribute("category", "W");
    assert_eq!(other.count_metrics(&only_w).await.unwrap(), 1);
    assert_eq!(db.count_metrics(&only_w).await.unwrap(), 0);
    common::clear(&other, &["W"]).await;

    db.close().await.unwrap();
    assert!(!db.health_check().await);
}

#[tokio::test]
async fn test_relational_scenarios() {
    let Some(config) = relational_config() else {
        eprintln!("METRICSDB_TEST_POSTGRES_URI or METRICSDB_TEST_ADBC_DRIVER not set; skipping");
        return;
    };
    let db = MetricsDatabase::with_credentials(config, None).unwrap();
    let (first, second) = tokio::join!(db.initialize(), db.initialize());
    first.unwrap();
    second.unwrap();
    assert!(db.health_check().await);
    common::run_all(&db).await;
    db.close().await.unwrap();
    assert!(!db.health_check().await);
}
