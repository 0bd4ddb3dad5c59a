//! Collection mappings for the document store.
//!
//! A collection either uses the generic layout (`attributes` and `values`
//! sub-documents, `timestamp`, `created_at`) or a structured layout where each
//! attribute and value key lives at its own document path. The mapping drives
//! the filter translator, the document converter and index creation.

use crate::error::Result;
use crate::metrics::{Attributes, MetricTuple, MetricUpdate, Values};
use crate::storage::mongo_filter::{bson_number, bson_to_json};
use bson::{doc, Bson, Document};
use chrono::Utc;
use lazy_static::lazy_static;
use mongodb::IndexModel;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::debug;

pub const GENERIC_TIMESTAMP_FIELD: &str = "timestamp";
pub const GENERIC_CREATED_FIELD: &str = "created_at";

fn default_timestamp_field() -> String {
    "createdAt".to_string()
}

/// Where tuple fields live inside a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DocumentLayout {
    #[default]
    Generic,
    Structured {
        /// Attribute key to document path.
        #[serde(default)]
        attributes: BTreeMap<String, String>,
        /// Value key to document path.
        #[serde(default)]
        values: BTreeMap<String, String>,
        #[serde(default = "default_timestamp_field")]
        timestamp_field: String,
    },
}

/// A registered collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub name: String,
    #[serde(default)]
    pub layout: DocumentLayout,
    /// Recommended indexes, each a list of ascending key paths.
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
}

lazy_static! {
    static ref BUILTIN_COLLECTIONS: Vec<CollectionMapping> = vec![employee_tree_archived()];
}

fn employee_tree_archived() -> CollectionMapping {
    let keys = |names: &[&str]| -> BTreeMap<String, String> {
        names.iter().map(|n| (n.to_string(), n.to_string())).collect()
    };
    let index = |paths: &[&str]| paths.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    CollectionMapping {
        name: "employee_tree_archived".to_string(),
        layout: DocumentLayout::Structured {
            attributes: keys(&["soeId", "year", "month", "hierarchy"]),
            values: keys(&["employeeNum", "engineerNum", "totalNum"]),
            timestamp_field: default_timestamp_field(),
        },
        indexes: vec![
            index(&["soeId"]),
            index(&["year", "month"]),
            index(&["hierarchy"]),
            index(&["archivedKey"]),
            index(&["parentSoeId"]),
        ],
    }
}

impl CollectionMapping {
    /// A generic-layout mapping for an unregistered collection.
    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: DocumentLayout::Generic,
            indexes: vec![
                vec![GENERIC_TIMESTAMP_FIELD.to_string()],
                vec![GENERIC_CREATED_FIELD.to_string()],
            ],
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self.layout, DocumentLayout::Structured { .. })
    }

    /// Document path of an attribute key. Unmapped keys of a structured
    /// collection are looked up at the top level.
    pub fn attribute_path(&self, key: &str) -> String {
        match &self.layout {
            DocumentLayout::Generic => format!("attributes.{}", key),
            DocumentLayout::Structured { attributes, .. } => {
                attributes.get(key).cloned().unwrap_or_else(|| key.to_string())
            }
        }
    }

    pub fn value_path(&self, key: &str) -> String {
        match &self.layout {
            DocumentLayout::Generic => format!("values.{}", key),
            DocumentLayout::Structured { values, .. } => {
                values.get(key).cloned().unwrap_or_else(|| key.to_string())
            }
        }
    }

    pub fn timestamp_path(&self) -> &str {
        match &self.layout {
            DocumentLayout::Generic => GENERIC_TIMESTAMP_FIELD,
            DocumentLayout::Structured { timestamp_field, .. } => timestamp_field,
        }
    }

    /// Builds the stored document for a tuple.
    pub fn to_document(&self, id: &str, metric: &MetricTuple) -> Result<Document> {
        let timestamp = bson::DateTime::from_chrono(metric.stored_timestamp());
        let created = bson::DateTime::from_chrono(Utc::now());
        match &self.layout {
            DocumentLayout::Generic => {
                let mut attributes = Document::new();
                for (key, value) in &metric.attributes {
                    attributes.insert(key.clone(), Bson::try_from(value.clone())?);
                }
                let values: Document = metric
                    .values
                    .iter()
                    .map(|(k, v)| (k.clone(), Bson::Double(*v)))
                    .collect();
                Ok(doc! {
                    "_id": id,
                    "attributes": attributes,
                    "values": values,
                    GENERIC_TIMESTAMP_FIELD: timestamp,
                    GENERIC_CREATED_FIELD: created,
                })
            }
            DocumentLayout::Structured { timestamp_field, .. } => {
                let mut document = doc! { "_id": id };
                for (key, value) in &metric.attributes {
                    set_path(&mut document, &self.attribute_path(key), Bson::try_from(value.clone())?);
                }
                for (key, value) in &metric.values {
                    set_path(&mut document, &self.value_path(key), Bson::Double(*value));
                }
                set_path(&mut document, timestamp_field, Bson::DateTime(timestamp));
                document.insert("updatedAt", created);
                Ok(document)
            }
        }
    }

    /// Converts a stored document back into a tuple.
    ///
    /// Returns `None` for documents with no numeric value or no timestamp.
    pub fn from_document(&self, document: &Document) -> Option<MetricTuple> {
        let id = document.get("_id").map(|id| match id {
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        });

        let mut attributes = Attributes::new();
        let mut values = Values::new();
        match &self.layout {
            DocumentLayout::Generic => {
                if let Ok(attrs) = document.get_document("attributes") {
                    for (key, value) in attrs {
                        push_scalar(&mut attributes, key, value);
                    }
                }
                if let Ok(vals) = document.get_document("values") {
                    for (key, value) in vals {
                        if let Some(v) = bson_number(value) {
                            values.insert(key.clone(), v);
                        }
                    }
                }
            }
            DocumentLayout::Structured {
                attributes: attribute_paths,
                values: value_paths,
                ..
            } => {
                for (key, path) in attribute_paths {
                    if let Some(value) = get_path(document, path) {
                        push_scalar(&mut attributes, key, value);
                    }
                }
                for (key, path) in value_paths {
                    if let Some(v) = get_path(document, path).and_then(bson_number) {
                        values.insert(key.clone(), v);
                    }
                }
            }
        }

        if values.is_empty() {
            debug!(collection = %self.name, id = ?id, "Skipping document without numeric values");
            return None;
        }
        let timestamp = match get_path(document, self.timestamp_path()) {
            Some(Bson::DateTime(ts)) => ts.to_chrono(),
            _ => {
                debug!(collection = %self.name, id = ?id, "Skipping document without timestamp");
                return None;
            }
        };

        Some(MetricTuple {
            id,
            attributes,
            values,
            timestamp,
        })
    }

    /// `$set` update for a partial tuple update.
    pub fn update_document(&self, update: &MetricUpdate) -> Result<Document> {
        let mut set = Document::new();
        for (key, value) in &update.attributes {
            set.insert(self.attribute_path(key), Bson::try_from(value.clone())?);
        }
        for (key, value) in &update.values {
            set.insert(self.value_path(key), Bson::Double(*value));
        }
        Ok(doc! { "$set": set })
    }

    pub fn index_models(&self) -> Vec<IndexModel> {
        self.indexes
            .iter()
            .filter(|keys| !keys.is_empty())
            .map(|keys| {
                let keys: Document = keys.iter().map(|k| (k.clone(), Bson::Int32(1))).collect();
                IndexModel::builder().keys(keys).build()
            })
            .collect()
    }
}

fn push_scalar(attributes: &mut Attributes, key: &str, value: &Bson) {
    match bson_to_json(value) {
        JsonValue::Array(_) | JsonValue::Object(_) | JsonValue::Null => {}
        scalar => {
            attributes.insert(key.to_string(), scalar);
        }
    }
}

/// Value at a dotted path.
pub fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate sub-documents.
pub fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = document.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Registered mappings by collection name.
#[derive(Debug, Clone)]
pub struct CollectionRegistry {
    mappings: BTreeMap<String, CollectionMapping>,
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CollectionRegistry {
    pub fn with_builtins() -> Self {
        Self {
            mappings: BUILTIN_COLLECTIONS
                .iter()
                .map(|m| (m.name.clone(), m.clone()))
                .collect(),
        }
    }

    /// Built-ins plus configured mappings; configured names win.
    pub fn from_config(configured: &[CollectionMapping]) -> Self {
        let mut registry = Self::with_builtins();
        for mapping in configured {
            registry.register(mapping.clone());
        }
        registry
    }

    pub fn register(&mut self, mapping: CollectionMapping) {
        self.mappings.insert(mapping.name.clone(), mapping);
    }

    /// Mapping for `name`, falling back to the generic layout.
    pub fn resolve(&self, name: &str) -> CollectionMapping {
        self.mappings
            .get(name)
            .cloned()
            .unwrap_or_else(|| CollectionMapping::generic(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }
}
