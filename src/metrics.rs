//! The generic metric record shared by every backend.
//!
//! A [`MetricTuple`] carries descriptive dimensions (`attributes`), numeric
//! measurements (`values`) and an event timestamp. Backends assign the ID on
//! insert. [`MetricUpdate`] describes a partial change that is merged into the
//! stored maps rather than replacing them.

use crate::error::{Error, Result};
use crate::utils::{f64_to_json, timestamp_to_json, truncate_to_millis, validation::validate_field_name};
use arrow::array::{RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Dimension name to scalar value.
pub type Attributes = BTreeMap<String, JsonValue>;

/// Measure name to number.
pub type Values = BTreeMap<String, f64>;

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTuple {
    /// Backend-assigned identity; `None` until stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    pub values: Values,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MetricTuple {
    pub fn new(attributes: Attributes, values: Values, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            attributes,
            values,
            timestamp,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// The timestamp as persisted: truncated to milliseconds.
    pub fn stored_timestamp(&self) -> DateTime<Utc> {
        truncate_to_millis(&self.timestamp)
    }

    /// Checks the tuple can be stored: at least one value, scalar attributes,
    /// finite numbers and safe key names.
    pub fn validate(&self) -> Result<()> {
        if self.values.is_empty() {
            return Err(Error::InvalidMetric(
                "a metric must carry at least one value".to_string(),
            ));
        }
        validate_attributes(&self.attributes)?;
        validate_values(&self.values)
    }

    /// JSON row used by generic `find` queries.
    pub fn to_row(&self) -> Map<String, JsonValue> {
        let mut row = Map::new();
        row.insert(
            "id".to_string(),
            self.id.clone().map(JsonValue::String).unwrap_or(JsonValue::Null),
        );
        row.insert(
            "attributes".to_string(),
            JsonValue::Object(self.attributes.clone().into_iter().collect()),
        );
        row.insert(
            "values".to_string(),
            JsonValue::Object(
                self.values
                    .iter()
                    .map(|(k, v)| (k.clone(), f64_to_json(*v)))
                    .collect(),
            ),
        );
        row.insert("timestamp".to_string(), timestamp_to_json(&self.timestamp));
        row
    }
}

/// Partial update merged into an existing tuple.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricUpdate {
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub values: Values,
}

impl MetricUpdate {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.values.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidMetric("update carries no changes".to_string()));
        }
        validate_attributes(&self.attributes)?;
        validate_values(&self.values)
    }

    /// Applies the update in place; keys not named by the update are kept.
    pub fn apply_to(&self, attributes: &mut Attributes, values: &mut Values) {
        for (k, v) in &self.attributes {
            attributes.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.values {
            values.insert(k.clone(), *v);
        }
    }
}

fn validate_attributes(attributes: &Attributes) -> Result<()> {
    for (key, value) in attributes {
        validate_field_name(key).map_err(|_| {
            Error::InvalidMetric(format!("attribute key '{}' is not a safe field name", key))
        })?;
        if value.is_array() || value.is_object() {
            return Err(Error::InvalidMetric(format!(
                "attribute '{}' must be a scalar",
                key
            )));
        }
    }
    Ok(())
}

fn validate_values(values: &Values) -> Result<()> {
    for (key, value) in values {
        validate_field_name(key).map_err(|_| {
            Error::InvalidMetric(format!("value key '{}' is not a safe field name", key))
        })?;
        if !value.is_finite() {
            return Err(Error::InvalidMetric(format!("value '{}' is not finite", key)));
        }
    }
    Ok(())
}

lazy_static! {
    /// Parameter layout for bulk inserts through ADBC: one row per tuple,
    /// attribute and value maps as JSON text.
    pub static ref METRICS_INSERT_SCHEMA: Schema = Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("attributes", DataType::Utf8, false),
        Field::new("values", DataType::Utf8, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false
        ),
    ]);
}

/// Builds the insert parameter batch for `(id, tuple)` pairs.
pub fn create_insert_batch(rows: &[(String, &MetricTuple)]) -> Result<RecordBatch> {
    let mut ids = Vec::with_capacity(rows.len());
    let mut attributes = Vec::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len());
    let mut timestamps = Vec::with_capacity(rows.len());

    for (id, tuple) in rows {
        ids.push(id.clone());
        attributes.push(serde_json::to_string(&tuple.attributes)?);
        values.push(serde_json::to_string(&tuple.values)?);
        timestamps.push(tuple.stored_timestamp().timestamp_micros());
    }

    let batch = RecordBatch::try_new(
        Arc::new(METRICS_INSERT_SCHEMA.clone()),
        vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(attributes)),
            Arc::new(StringArray::from(values)),
            Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone("UTC")),
        ],
    )?;
    Ok(batch)
}
