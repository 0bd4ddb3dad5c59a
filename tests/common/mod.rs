//! Scenarios shared by every backend's integration tests.
//!
//! Each function seeds data through the facade, checks one behaviour and
//! leaves the store empty for the next scenario.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use metricsdb_core::{
    AggregateOp, AggregationQuery, ComparisonOp, DatabaseQuery, Error, MetricTuple,
    MetricsDatabase, QueryFilter,
};
use serde_json::json;
use std::collections::HashSet;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn tuple(category: &str, metric: Option<f64>, offset_minutes: i64) -> MetricTuple {
    let mut t = MetricTuple::new(
        Default::default(),
        Default::default(),
        base_time() + Duration::minutes(offset_minutes),
    )
    .with_attribute("category", category);
    if let Some(v) = metric {
        t = t.with_value("metric", v);
    }
    t
}

/// Removes everything seeded under the given categories.
pub async fn clear(db: &MetricsDatabase, categories: &[&str]) {
    for category in categories {
        db.delete_metrics(&QueryFilter::new().with_attribute("category", *category))
            .await
            .unwrap();
    }
}

pub async fn round_trip(db: &MetricsDatabase) {
    let metric = MetricTuple::new(Default::default(), Default::default(), Utc::now())
        .with_attribute("category", "engagement")
        .with_value("daily_users", 120.0);
    let id = db.insert_metric(&metric).await.unwrap();
    assert!(!id.is_empty());

    let found = db
        .query_metrics(&QueryFilter::new().with_attribute("category", "engagement"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].values["daily_users"], 120.0);
    assert_eq!(found[0].id.as_deref(), Some(id.as_str()));

    assert!(db.delete_metric(&id).await.unwrap());
    assert!(!db.delete_metric(&id).await.unwrap());
}

pub async fn average_by_category(db: &MetricsDatabase) {
    let batch = vec![
        tuple("A", Some(10.0), 0),
        tuple("A", Some(20.0), 1),
        tuple("B", Some(30.0), 2),
    ];
    let ids = db.insert_metrics_batch(&batch).await.unwrap();
    assert_eq!(ids.len(), 3);

    let query = AggregationQuery::new()
        .group_by("category")
        .aggregate("metric", AggregateOp::Avg);
    let rows = db.aggregate_metrics(&query).await.unwrap();
    assert_eq!(rows.len(), 2);
    let a = rows.iter().find(|r| r["category"] == json!("A")).unwrap();
    let b = rows.iter().find(|r| r["category"] == json!("B")).unwrap();
    assert_eq!(a["avg_metric"].as_f64(), Some(15.0));
    assert_eq!(b["avg_metric"].as_f64(), Some(30.0));

    clear(db, &["A", "B"]).await;
}

pub async fn null_aggregate_for_missing_values(db: &MetricsDatabase) {
    let mut without = tuple("N2", None, 1);
    without = without.with_value("other", 1.0);
    db.insert_metrics_batch(&[tuple("N1", Some(4.0), 0), without])
        .await
        .unwrap();

    let query = AggregationQuery::new()
        .group_by("category")
        .aggregate("metric", AggregateOp::Sum)
        .filtered(QueryFilter::new().with_time_range(base_time(), base_time() + Duration::minutes(1)));
    let rows = db.aggregate_metrics(&query).await.unwrap();
    let present = rows.iter().find(|r| r["category"] == json!("N1")).unwrap();
    let missing = rows.iter().find(|r| r["category"] == json!("N2")).unwrap();
    assert_eq!(present["sum_metric"].as_f64(), Some(4.0));
    assert!(missing.contains_key("sum_metric"));
    assert!(missing["sum_metric"].is_null());

    clear(db, &["N1", "N2"]).await;
}

pub async fn default_sort_is_timestamp_descending(db: &MetricsDatabase) {
    let batch: Vec<_> = [3, 0, 2, 1].iter().map(|m| tuple("S", Some(*m as f64), *m)).collect();
    db.insert_metrics_batch(&batch).await.unwrap();

    let found = db
        .query_metrics(&QueryFilter::new().with_attribute("category", "S"))
        .await
        .unwrap();
    let stamps: Vec<_> = found.iter().map(|t| t.timestamp).collect();
    let mut expected = stamps.clone();
    expected.sort_by(|a, b| b.cmp(a));
    assert_eq!(stamps, expected);
    assert_eq!(found.len(), 4);

    let limited = db
        .query_metrics(&QueryFilter::new().with_attribute("category", "S").with_limit(2))
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].timestamp, base_time() + Duration::minutes(3));

    clear(db, &["S"]).await;
}

pub async fn limit_zero_returns_nothing(db: &MetricsDatabase) {
    db.insert_metrics_batch(&[tuple("Z", Some(1.0), 0), tuple("Z", Some(2.0), 1)])
        .await
        .unwrap();
    let only_z = QueryFilter::new().with_attribute("category", "Z");

    let found = db.query_metrics(&only_z.clone().with_limit(0)).await.unwrap();
    assert!(found.is_empty());
    let rows = db
        .execute_native_query(&DatabaseQuery::find(only_z.clone().with_limit(0)))
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(db.query_metrics(&only_z.clone().with_limit(usize::MAX)).await.unwrap().len(), 2);
    assert_eq!(db.count_metrics(&only_z.with_limit(0)).await.unwrap(), 2);

    clear(db, &["Z"]).await;
}

pub async fn sub_millisecond_timestamps(db: &MetricsDatabase) {
    let mut precise = tuple("M", Some(1.0), 0);
    precise.timestamp = base_time() + Duration::microseconds(500);
    db.insert_metric(&precise).await.unwrap();

    let only_m = QueryFilter::new().with_attribute("category", "M");
    let found = db.query_metrics(&only_m).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].timestamp, base_time());

    let same_millisecond = only_m.clone().with_time_range(
        base_time() + Duration::microseconds(700),
        base_time() + Duration::microseconds(900),
    );
    assert_eq!(db.count_metrics(&same_millisecond).await.unwrap(), 1);
    let before = only_m.with_time_range(
        base_time() - Duration::milliseconds(5),
        base_time() - Duration::microseconds(1),
    );
    assert_eq!(db.count_metrics(&before).await.unwrap(), 0);

    clear(db, &["M"]).await;
}

pub async fn time_range_and_value_filters(db: &MetricsDatabase) {
    let batch: Vec<_> = (0..5).map(|m| tuple("F", Some(m as f64 * 10.0), m)).collect();
    db.insert_metrics_batch(&batch).await.unwrap();

    let window = QueryFilter::new()
        .with_attribute("category", "F")
        .with_time_range(base_time() + Duration::minutes(1), base_time() + Duration::minutes(3));
    let found = db.query_metrics(&window).await.unwrap();
    let metrics: HashSet<i64> = found.iter().map(|t| t.values["metric"] as i64).collect();
    assert_eq!(metrics, HashSet::from([10, 20, 30]));

    let bounded = window.clone().with_value_filter("metric", ComparisonOp::Gt, 15.0);
    assert_eq!(db.count_metrics(&bounded).await.unwrap(), 2);

    let ascending = QueryFilter::new()
        .with_attribute("category", "F")
        .sorted_by("metric", metricsdb_core::SortOrder::Asc);
    let found = db.query_metrics(&ascending).await.unwrap();
    let ordered: Vec<i64> = found.iter().map(|t| t.values["metric"] as i64).collect();
    assert_eq!(ordered, vec![0, 10, 20, 30, 40]);

    clear(db, &["F"]).await;
}

pub async fn update_merges_maps(db: &MetricsDatabase) {
    let id = db
        .insert_metric(&tuple("U", Some(1.0), 0).with_attribute("region", "eu"))
        .await
        .unwrap();
    let update = serde_json::from_value(json!({
        "attributes": {"region": "us"},
        "values": {"extra": 2.5}
    }))
    .unwrap();
    assert!(db.update_metric(&id, &update).await.unwrap());
    assert!(!db.update_metric("no-such-id", &update).await.unwrap());

    let found = db
        .query_metrics(&QueryFilter::new().with_attribute("category", "U"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].attributes["region"], json!("us"));
    assert_eq!(found[0].values["metric"], 1.0);
    assert_eq!(found[0].values["extra"], 2.5);

    clear(db, &["U"]).await;
}

pub async fn distinct_and_count(db: &MetricsDatabase) {
    db.insert_metrics_batch(&[
        tuple("D1", Some(1.0), 0),
        tuple("D2", Some(2.0), 1),
        tuple("D1", Some(3.0), 2),
    ])
    .await
    .unwrap();
    let window = QueryFilter::new().with_time_range(base_time(), base_time() + Duration::minutes(2));

    let values = db.distinct_values("category", Some(&window)).await.unwrap();
    assert_eq!(values, vec![json!("D1"), json!("D2")]);
    assert_eq!(db.count_metrics(&window).await.unwrap(), 3);

    let rows = db
        .execute_native_query(&DatabaseQuery::count(
            QueryFilter::new().with_attribute("category", "D1"),
        ))
        .await
        .unwrap();
    assert_eq!(rows[0]["count"].as_u64(), Some(2));

    assert!(db.delete_metrics(&QueryFilter::new()).await.is_err());
    let removed = db
        .delete_metrics(&QueryFilter::new().with_attribute("category", "D1"))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    clear(db, &["D2"]).await;
}

pub async fn schema_and_explain(db: &MetricsDatabase) {
    db.insert_metric(&tuple("X", Some(1.0), 0)).await.unwrap();
    let schema = db.get_schema_info().await.unwrap();
    assert_eq!(schema.database_type, db.backend_kind());
    assert!(!schema.fields.is_empty());
    assert!(schema.dimensions.contains(&"category".to_string()));
    assert!(schema.measures.contains(&"metric".to_string()));

    let plan = db
        .explain_query(&DatabaseQuery::find(
            QueryFilter::new().with_attribute("category", "X"),
        ))
        .await
        .unwrap();
    assert_eq!(plan.database_type, db.backend_kind());
    assert!(!plan.plan.is_null());

    clear(db, &["X"]).await;
}

pub async fn rejects_bad_translation(db: &MetricsDatabase) {
    let filter = QueryFilter::new().with_attribute("bad key; drop", "x");
    let err = db.query_metrics(&filter).await.unwrap_err();
    assert!(matches!(err, Error::TranslationRejected(_)), "{err}");
}

/// Runs every scenario in sequence against a connected, writable facade.
pub async fn run_all(db: &MetricsDatabase) {
    round_trip(db).await;
    average_by_category(db).await;
    null_aggregate_for_missing_values(db).await;
    default_sort_is_timestamp_descending(db).await;
    limit_zero_returns_nothing(db).await;
    sub_millisecond_timestamps(db).await;
    time_range_and_value_filters(db).await;
    update_merges_maps(db).await;
    distinct_and_count(db).await;
    schema_and_explain(db).await;
    rejects_bad_translation(db).await;
}
