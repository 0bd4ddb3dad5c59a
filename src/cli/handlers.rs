use crate::cli::commands::Commands;
use crate::config::Settings;
use crate::database::MetricsDatabase;
use crate::metrics::{MetricTuple, MetricUpdate};
use crate::query::{AggregationQuery, DatabaseQuery, QueryFilter};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

/// Reads a JSON argument, either inline or from `@path`.
async fn read_json(arg: &str, what: &str) -> Result<JsonValue> {
    let text = match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {} from {}", what, path))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid {} JSON", what))
}

async fn read_filter(arg: Option<&str>) -> Result<QueryFilter> {
    match arg {
        Some(arg) => Ok(QueryFilter::from_json(read_json(arg, "filter").await?)?),
        None => Ok(QueryFilter::new()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Connects, runs one command and disconnects.
pub async fn run_command(command: Commands, settings: Settings) -> Result<()> {
    let db = MetricsDatabase::new(settings.database).context("Failed to create database")?;
    db.initialize()
        .await
        .with_context(|| format!("Failed to connect to the {} backend", db.backend_kind()))?;

    let result = dispatch(&db, command).await;
    if let Err(e) = db.close().await {
        tracing::warn!(error = %e, "Failed to close database");
    }
    result
}

async fn dispatch(db: &MetricsDatabase, command: Commands) -> Result<()> {
    match command {
        Commands::Health => {
            let healthy = db.health_check().await;
            print_json(&json!({
                "backend": db.backend_kind(),
                "target": db.target(),
                "healthy": healthy,
            }))?;
            if !healthy {
                anyhow::bail!("Health check failed");
            }
        }
        Commands::Schema => print_json(&db.get_schema_info().await?)?,
        Commands::Query { filter } => {
            let filter = read_filter(filter.as_deref()).await?;
            let rows: Vec<_> = db
                .query_metrics(&filter)
                .await?
                .iter()
                .map(MetricTuple::to_row)
                .collect();
            print_json(&rows)?;
        }
        Commands::Count { filter } => {
            let filter = read_filter(filter.as_deref()).await?;
            print_json(&json!({ "count": db.count_metrics(&filter).await? }))?;
        }
        Commands::Distinct { field, filter } => {
            let filter = match filter {
                Some(arg) => Some(read_filter(Some(&arg)).await?),
                None => None,
            };
            print_json(&db.distinct_values(&field, filter.as_ref()).await?)?;
        }
        Commands::Aggregate { aggregation } => {
            let query = AggregationQuery::from_json(read_json(&aggregation, "aggregation").await?)?;
            print_json(&db.aggregate_metrics(&query).await?)?;
        }
        Commands::Native { payload, target } => {
            let mut query = DatabaseQuery::native(read_json(&payload, "payload").await?);
            if let Some(target) = target {
                query = query.on(target);
            }
            print_json(&db.execute_native_query(&query).await?)?;
        }
        Commands::Explain { query } => {
            let query = DatabaseQuery::from_json(read_json(&query, "query").await?)?;
            print_json(&db.explain_query(&query).await?)?;
        }
        Commands::Insert { metrics } => {
            let value = read_json(&metrics, "metrics").await?;
            let ids = if value.is_array() {
                let batch: Vec<MetricTuple> =
                    serde_json::from_value(value).context("Invalid metric batch")?;
                db.insert_metrics_batch(&batch).await?
            } else {
                let metric: MetricTuple = serde_json::from_value(value).context("Invalid metric")?;
                vec![db.insert_metric(&metric).await?]
            };
            print_json(&json!({ "ids": ids }))?;
        }
        Commands::Update { id, update } => {
            let update: MetricUpdate = serde_json::from_value(read_json(&update, "update").await?)
                .context("Invalid update")?;
            print_json(&json!({ "id": id, "updated": db.update_metric(&id, &update).await? }))?;
        }
        Commands::Delete { id } => {
            print_json(&json!({ "id": id, "deleted": db.delete_metric(&id).await? }))?;
        }
        Commands::DeleteWhere { filter } => {
            let filter = read_filter(Some(&filter)).await?;
            print_json(&json!({ "deleted": db.delete_metrics(&filter).await? }))?;
        }
        Commands::Collections => print_json(&db.list_collections().await?)?,
    }
    Ok(())
}
