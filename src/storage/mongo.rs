//! Document adapter: MongoDB.
//!
//! One client is shared by every clone of the adapter. Each adapter value is
//! bound to one collection; switching yields a new bound adapter carrying the
//! collection mapping used by the translator and the converter.

use crate::config::DocumentConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricTuple, MetricUpdate};
use crate::query::eval::sort_distinct;
use crate::query::{
    AggregateRow, AggregationQuery, BareName, DatabaseQuery, FieldRef, QueryFilter, QueryOperation,
};
use crate::storage::collections::{CollectionMapping, CollectionRegistry};
use crate::storage::mongo_filter::{
    aggregate_row, aggregation_pipeline, bson_number, bson_to_json, document_to_json, field_path,
    filter_document, sort_document,
};
use crate::storage::native::{parse_document_payload, NativeDocumentQuery};
use crate::storage::{
    ensure_bounded_delete, ensure_writable, execute_generic, single_row, BackendKind, Credentials,
    FieldInfo, IndexInfo, MetricsAdapter, MetricsQueryAdapter, QueryPlan, Row, SchemaInfo,
};
use crate::utils::{f64_to_json, timestamp_to_json};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential};
use mongodb::{Client, Collection, Database};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SCHEMA_SAMPLE_DOCUMENTS: i64 = 1000;

/// Command codes MongoDB reports for an index that already exists in some
/// form (`IndexAlreadyExists`, `IndexOptionsConflict`, `IndexKeySpecsConflict`).
const INDEX_EXISTS_CODES: &[i32] = &[68, 85, 86];

fn is_index_exists(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => INDEX_EXISTS_CODES.contains(&command.code),
        _ => false,
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('$') || name.contains('\0') || name.starts_with("system.") {
        return Err(Error::rejected(format!("invalid collection name '{}'", name)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct MongoAdapter {
    settings: Arc<DocumentConfig>,
    credentials: Option<Credentials>,
    read_only: bool,
    pool_size: u32,
    connect_timeout: Duration,
    registry: Arc<CollectionRegistry>,
    mapping: Arc<CollectionMapping>,
    client: Arc<RwLock<Option<Client>>>,
    /// Serializes connect and disconnect across every clone.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl MongoAdapter {
    pub fn new(
        settings: DocumentConfig,
        credentials: Option<Credentials>,
        read_only: bool,
        pool_size: u32,
        connect_timeout_secs: u64,
    ) -> Result<Self> {
        validate_collection_name(&settings.collection)?;
        let registry = CollectionRegistry::from_config(&settings.collections);
        let mapping = registry.resolve(&settings.collection);
        Ok(Self {
            settings: Arc::new(settings),
            credentials,
            read_only,
            pool_size,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            registry: Arc::new(registry),
            mapping: Arc::new(mapping),
            client: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.mapping.name
    }

    pub fn mapping(&self) -> &CollectionMapping {
        &self.mapping
    }

    fn database(&self) -> Result<Database> {
        let client = self.client.read().clone().ok_or(Error::NotConnected)?;
        Ok(client.database(&self.settings.database))
    }

    fn collection(&self) -> Result<Collection<Document>> {
        Ok(self.database()?.collection::<Document>(&self.mapping.name))
    }

    /// A second adapter bound to `name`, sharing this one's client.
    pub fn with_collection(&self, name: &str) -> Result<Self> {
        validate_collection_name(name)?;
        let mut adapter = self.clone();
        adapter.mapping = Arc::new(self.registry.resolve(name));
        Ok(adapter)
    }

    fn retarget(&self, target: Option<&str>) -> Result<Self> {
        match target {
            Some(name) if name != self.mapping.name => self.with_collection(name),
            _ => Ok(self.clone()),
        }
    }

    /// An adapter bound to `name`, sharing this one's client. In read-write
    /// mode the collection's recommended indexes are created when connected.
    /// `self` stays bound to its own collection.
    pub async fn switch_collection(&self, name: &str) -> Result<MongoAdapter> {
        let switched = self.with_collection(name)?;
        if switched.is_connected() && !switched.read_only {
            switched.ensure_indexes().await?;
        }
        info!(
            collection = %switched.mapping.name,
            structured = switched.mapping.is_structured(),
            "Switched document collection"
        );
        Ok(switched)
    }

    /// Collection names in the configured database, sorted.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self.database()?.list_collection_names().await?;
        names.sort();
        Ok(names)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let collection = self.collection()?;
        for model in self.mapping.index_models() {
            match collection.create_index(model).await {
                Ok(_) => {}
                Err(e) if is_index_exists(&e) => {
                    debug!(error = %e, collection = %self.mapping.name, "Index already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(collection = %self.mapping.name, "Indexes ensured");
        Ok(())
    }

    async fn find_documents(
        &self,
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>> {
        let collection = self.collection()?;
        let mut find = collection.find(filter);
        if let Some(sort) = sort {
            find = find.sort(sort);
        }
        if let Some(limit) = limit {
            find = find.limit(limit);
        }
        let documents: Vec<Document> = find.await?.try_collect().await?;
        Ok(documents)
    }

    async fn run_pipeline(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let documents: Vec<Document> = self.collection()?.aggregate(pipeline).await?.try_collect().await?;
        Ok(documents)
    }

    /// The command `explain` wraps for a generic query.
    fn generic_command(&self, query: &DatabaseQuery) -> Result<Document> {
        let filter = query.filter_or_default();
        let name = self.mapping.name.as_str();
        let command = match query.operation {
            QueryOperation::Find => {
                let mut find = doc! {
                    "find": name,
                    "filter": filter_document(&self.mapping, &filter)?,
                    "sort": sort_document(&self.mapping, &filter)?,
                };
                if let Some(limit) = filter.limit_i64() {
                    find.insert("limit", limit);
                }
                find
            }
            QueryOperation::Count => doc! {
                "count": name,
                "query": filter_document(&self.mapping, &filter)?,
            },
            QueryOperation::Distinct => {
                let field = FieldRef::parse(query.distinct_field()?, BareName::Attribute)?;
                doc! {
                    "distinct": name,
                    "key": field_path(&self.mapping, &field),
                    "query": filter_document(&self.mapping, &filter)?,
                }
            }
            QueryOperation::Aggregate => {
                let mut aggregation = query.aggregation_or_reject()?.clone();
                if aggregation.filters.is_none() {
                    aggregation.filters = query.filters.clone();
                }
                let pipeline = aggregation_pipeline(&self.mapping, &aggregation.plan()?)?;
                doc! { "aggregate": name, "pipeline": pipeline, "cursor": {} }
            }
        };
        Ok(command)
    }

    fn native_command(&self, native: &NativeDocumentQuery) -> Document {
        let name = self.mapping.name.as_str();
        match native {
            NativeDocumentQuery::Find { filter, sort, limit } => {
                let mut find = doc! { "find": name, "filter": filter.clone() };
                if let Some(sort) = sort {
                    find.insert("sort", sort.clone());
                }
                if let Some(limit) = limit {
                    find.insert("limit", *limit);
                }
                find
            }
            NativeDocumentQuery::Aggregate { pipeline } => {
                doc! { "aggregate": name, "pipeline": pipeline.clone(), "cursor": {} }
            }
            NativeDocumentQuery::Count { filter } => doc! { "count": name, "query": filter.clone() },
            NativeDocumentQuery::Distinct { field, filter } => {
                doc! { "distinct": name, "key": field.as_str(), "query": filter.clone() }
            }
        }
    }
}

#[async_trait]
impl MetricsQueryAdapter for MongoAdapter {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let mut options = ClientOptions::parse(&self.settings.uri).await.map_err(|e| {
            error!(error = %e, "Invalid document store URI");
            e
        })?;
        options.max_pool_size = Some(self.pool_size.max(1));
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.connect_timeout);
        if let Some(creds) = &self.credentials {
            let mut credential = Credential::default();
            credential.username = creds.username.clone();
            credential.password = creds.password.clone();
            options.credential = Some(credential);
        }

        let client = Client::with_options(options)?;
        if let Err(e) = client.database("admin").run_command(doc! { "ping": 1 }).await {
            error!(error = %e, "Failed to reach document store");
            return Err(e.into());
        }
        *self.client.write() = Some(client);

        if !self.read_only {
            if let Err(e) = self.ensure_indexes().await {
                error!(error = %e, collection = %self.mapping.name, "Index setup failed");
                self.client.write().take();
                return Err(e);
            }
        }

        match self.list_collections().await {
            Ok(collections) if !collections.contains(&self.mapping.name) => {
                warn!(collection = %self.mapping.name, "Collection does not exist yet");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, collection = %self.mapping.name, "Could not list collections");
            }
        }
        info!(
            database = %self.settings.database,
            collection = %self.mapping.name,
            read_only = self.read_only,
            "Connected to document store"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let client = self.client.write().take();
        if let Some(client) = client {
            client.shutdown().await;
            info!(database = %self.settings.database, "Disconnected from document store");
        }
        Ok(())
    }

    async fn query_metrics(&self, filter: &QueryFilter) -> Result<Vec<MetricTuple>> {
        // The driver reads a limit of 0 as "no limit".
        if filter.selects_nothing() {
            filter.validate()?;
            self.collection()?;
            return Ok(Vec::new());
        }
        let documents = self
            .find_documents(
                filter_document(&self.mapping, filter)?,
                Some(sort_document(&self.mapping, filter)?),
                filter.limit_i64(),
            )
            .await?;
        let fetched = documents.len();
        let tuples: Vec<MetricTuple> = documents
            .iter()
            .filter_map(|d| self.mapping.from_document(d))
            .collect();
        debug!(fetched, returned = tuples.len(), collection = %self.mapping.name, "Document query complete");
        Ok(tuples)
    }

    async fn aggregate_metrics(&self, query: &AggregationQuery) -> Result<Vec<AggregateRow>> {
        let plan = query.plan()?;
        let pipeline = aggregation_pipeline(&self.mapping, &plan)?;
        let documents = self.run_pipeline(pipeline).await?;
        debug!(groups = documents.len(), collection = %self.mapping.name, "Document aggregation complete");
        Ok(documents.iter().map(|d| aggregate_row(&plan, d)).collect())
    }

    async fn count_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        let filter = filter_document(&self.mapping, filter)?;
        Ok(self.collection()?.count_documents(filter).await?)
    }

    async fn distinct_values(
        &self,
        field: &str,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<JsonValue>> {
        let field = FieldRef::parse(field, BareName::Attribute)?;
        let filter = filter.cloned().unwrap_or_default();
        let raw = self
            .collection()?
            .distinct(field_path(&self.mapping, &field), filter_document(&self.mapping, &filter)?)
            .await?;

        let mut values: Vec<JsonValue> = raw
            .iter()
            .filter_map(|value| match (&field, value) {
                (FieldRef::Value(_), v) => bson_number(v).map(f64_to_json),
                (FieldRef::Timestamp, Bson::DateTime(ts)) => Some(timestamp_to_json(&ts.to_chrono())),
                (FieldRef::Timestamp, _) => None,
                (FieldRef::Attribute(_), v) => match bson_to_json(v) {
                    JsonValue::Array(_) | JsonValue::Object(_) | JsonValue::Null => None,
                    scalar => Some(scalar),
                },
            })
            .collect();
        sort_distinct(&mut values);
        Ok(values)
    }

    async fn execute_native_query(&self, query: &DatabaseQuery) -> Result<Vec<Row>> {
        let target = self.retarget(query.collection_table.as_deref())?;
        let Some(payload) = &query.native_query else {
            return execute_generic(&target, query).await;
        };

        let rows = match parse_document_payload(payload)? {
            NativeDocumentQuery::Find { filter, sort, limit } => target
                .find_documents(filter, sort, limit)
                .await?
                .iter()
                .map(document_to_json)
                .collect(),
            NativeDocumentQuery::Aggregate { pipeline } => target
                .run_pipeline(pipeline)
                .await?
                .iter()
                .map(document_to_json)
                .collect(),
            NativeDocumentQuery::Count { filter } => {
                let count = target.collection()?.count_documents(filter).await?;
                vec![single_row("count", JsonValue::from(count))]
            }
            NativeDocumentQuery::Distinct { field, filter } => {
                let values = target.collection()?.distinct(field, filter).await?;
                let values = values.iter().map(bson_to_json).collect();
                vec![single_row("distinct_values", JsonValue::Array(values))]
            }
        };
        debug!(rows = rows.len(), collection = %target.mapping.name, "Native document query complete");
        Ok(rows)
    }

    async fn get_schema_info(&self) -> Result<SchemaInfo> {
        let collection = self.collection()?;
        let row_count = collection.estimated_document_count().await?;

        let mut indexes = Vec::new();
        let models: Vec<mongodb::IndexModel> = collection.list_indexes().await?.try_collect().await?;
        for model in models {
            let options = model.options.as_ref();
            indexes.push(IndexInfo {
                name: options
                    .and_then(|o| o.name.clone())
                    .unwrap_or_else(|| model.keys.keys().cloned().collect::<Vec<_>>().join("_")),
                columns: model.keys.keys().cloned().collect(),
                unique: options.and_then(|o| o.unique).unwrap_or(false),
                definition: Some(serde_json::Value::Object(document_to_json(&model.keys)).to_string()),
            });
        }

        let sample = self
            .run_pipeline(vec![doc! { "$sample": { "size": SCHEMA_SAMPLE_DOCUMENTS } }])
            .await?;
        let mut observed: BTreeMap<String, (String, bool)> = BTreeMap::new();
        for document in &sample {
            for (key, value) in document {
                let entry = observed
                    .entry(key.clone())
                    .or_insert_with(|| (format!("{:?}", value.element_type()), false));
                if matches!(value, Bson::Null) {
                    entry.1 = true;
                }
            }
        }
        // Fields absent from some sampled documents are nullable too.
        let fields = observed
            .into_iter()
            .map(|(name, (data_type, saw_null))| {
                let present = sample.iter().filter(|d| d.contains_key(&name)).count();
                FieldInfo {
                    primary_key: name == "_id",
                    nullable: saw_null || present < sample.len(),
                    name,
                    data_type,
                }
            })
            .collect();

        let (dimensions, measures) = if self.mapping.is_structured() {
            let tuples: Vec<MetricTuple> = sample.iter().filter_map(|d| self.mapping.from_document(d)).collect();
            let mut dims: Vec<String> = tuples.iter().flat_map(|t| t.attributes.keys().cloned()).collect();
            let mut meas: Vec<String> = tuples.iter().flat_map(|t| t.values.keys().cloned()).collect();
            dims.sort();
            dims.dedup();
            meas.sort();
            meas.dedup();
            (dims, meas)
        } else {
            let keys_of = |sub: &str| {
                let mut keys: Vec<String> = sample
                    .iter()
                    .filter_map(|d| d.get_document(sub).ok())
                    .flat_map(|d| d.keys().cloned())
                    .collect();
                keys.sort();
                keys.dedup();
                keys
            };
            (keys_of("attributes"), keys_of("values"))
        };

        Ok(SchemaInfo {
            database_type: BackendKind::Document,
            target: self.mapping.name.clone(),
            fields,
            indexes,
            row_count: Some(row_count),
            dimensions,
            measures,
        })
    }

    async fn explain_query(&self, query: &DatabaseQuery) -> Result<QueryPlan> {
        let target = self.retarget(query.collection_table.as_deref())?;
        let command = match &query.native_query {
            Some(payload) => target.native_command(&parse_document_payload(payload)?),
            None => target.generic_command(query)?,
        };
        if query.native_query.is_none()
            && query.operation == QueryOperation::Find
            && query.filter_or_default().selects_nothing()
        {
            target.database()?;
            return Ok(QueryPlan {
                database_type: BackendKind::Document,
                query: JsonValue::Object(document_to_json(&command)),
                plan: serde_json::json!({ "stage": "EMPTY_RESULT", "reason": "limit is 0" }),
            });
        }
        let plan = target
            .database()?
            .run_command(doc! { "explain": command.clone(), "verbosity": "queryPlanner" })
            .await?;
        Ok(QueryPlan {
            database_type: BackendKind::Document,
            query: JsonValue::Object(document_to_json(&command)),
            plan: JsonValue::Object(document_to_json(&plan)),
        })
    }

    async fn health_check(&self) -> bool {
        let Ok(database) = self.database() else {
            return false;
        };
        match database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Document store health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl MetricsAdapter for MongoAdapter {
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
        let mut ids = Vec::with_capacity(metrics.len());
        let mut documents = Vec::with_capacity(metrics.len());
        for metric in metrics {
            metric.validate()?;
            let id = uuid::Uuid::new_v4().to_string();
            documents.push(self.mapping.to_document(&id, metric)?);
            ids.push(id);
        }

        let collection = self.collection()?;
        if let Err(e) = collection.insert_many(documents).await {
            // Ordered inserts stop at the first failure; remove what landed.
            let landed = ids.iter().map(|id| Bson::String(id.clone())).collect::<Vec<_>>();
            if let Err(cleanup) = collection.delete_many(doc! { "_id": { "$in": landed } }).await {
                warn!(error = %cleanup, "Failed to roll back partial batch insert");
            }
            return Err(e.into());
        }
        debug!(inserted = ids.len(), collection = %self.mapping.name, "Inserted metrics");
        Ok(ids)
    }

    async fn update_metric(&self, id: &str, update: &MetricUpdate) -> Result<bool> {
        ensure_writable(self.read_only, "update")?;
        update.validate()?;
        let result = self
            .collection()?
            .update_one(doc! { "_id": id }, self.mapping.update_document(update)?)
            .await?;
        if result.matched_count == 0 {
            warn!(id, collection = %self.mapping.name, "Metric not found for update");
        }
        Ok(result.matched_count > 0)
    }

    async fn delete_metric(&self, id: &str) -> Result<bool> {
        ensure_writable(self.read_only, "delete")?;
        let result = self.collection()?.delete_one(doc! { "_id": id }).await?;
        if result.deleted_count == 0 {
            warn!(id, collection = %self.mapping.name, "Metric not found for delete");
        }
        Ok(result.deleted_count > 0)
    }

    async fn delete_metrics(&self, filter: &QueryFilter) -> Result<u64> {
        ensure_writable(self.read_only, "delete")?;
        ensure_bounded_delete(filter)?;
        let result = self
            .collection()?
            .delete_many(filter_document(&self.mapping, filter)?)
            .await?;
        debug!(deleted = result.deleted_count, collection = %self.mapping.name, "Deleted metrics by filter");
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(read_only: bool) -> MongoAdapter {
        MongoAdapter::new(DocumentConfig::default(), None, read_only, 4, 1).unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let adapter = adapter(false);
        assert!(!adapter.health_check().await);
        let err = adapter.count_metrics(&QueryFilter::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_returns_bound_adapter() {
        let adapter = adapter(false);
        assert_eq!(adapter.collection_name(), "metrics");
        let switched = adapter.switch_collection("employee_tree_archived").await.unwrap();
        assert_eq!(switched.collection_name(), "employee_tree_archived");
        assert!(switched.mapping().is_structured());
        assert_eq!(adapter.collection_name(), "metrics");
        assert!(adapter.switch_collection("bad$name").await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_waits_for_other_clones() {
        use futures::FutureExt;
        let adapter = adapter(false);
        let switched = adapter.switch_collection("other_metrics").await.unwrap();
        let held = adapter.lifecycle.lock().await;
        assert!(switched.disconnect().now_or_never().is_none());
        assert!(switched.connect().now_or_never().is_none());
        drop(held);
        switched.disconnect().await.unwrap();
        assert!(!switched.is_connected());
    }

    #[tokio::test]
    async fn test_zero_limit_still_requires_connection() {
        let adapter = adapter(false);
        let filter = QueryFilter::new().with_limit(0);
        assert!(matches!(adapter.query_metrics(&filter).await, Err(Error::NotConnected)));
        let bad = QueryFilter::new().with_attribute("bad key", "x").with_limit(0);
        assert!(matches!(
            adapter.query_metrics(&bad).await,
            Err(Error::TranslationRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes_before_io() {
        let adapter = adapter(true);
        let metric = MetricTuple::new(Default::default(), Default::default(), chrono::Utc::now())
            .with_value("metric", 1.0);
        let err = adapter.insert_metric(&metric).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_unsafe_native_payload_rejected_before_io() {
        let adapter = adapter(true);
        let query = DatabaseQuery::native(json!({"operation": "drop"}));
        let err = adapter.execute_native_query(&query).await.unwrap_err();
        assert!(matches!(err, Error::UnsafeNativeQuery(_)));
    }

    #[test]
    fn test_explain_commands() {
        let adapter = adapter(true);
        let command = adapter
            .generic_command(&DatabaseQuery::count(QueryFilter::new().with_attribute("category", "A")))
            .unwrap();
        assert_eq!(command.get_str("count").unwrap(), "metrics");
        assert!(command.get_document("query").unwrap().contains_key("attributes.category"));

        let native = parse_document_payload(&json!({"pipeline": [{"$match": {}}]})).unwrap();
        let command = adapter.native_command(&native);
        assert_eq!(command.get_str("aggregate").unwrap(), "metrics");
    }
}
