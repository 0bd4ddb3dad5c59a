use crate::error::{Error, Result};
use crate::query::aggregation::AggregationQuery;
use crate::query::filter::QueryFilter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOperation {
    #[default]
    Find,
    Aggregate,
    Count,
    Distinct,
}

/// Envelope for `execute_native_query` and `explain_query`.
///
/// When `native_query` is set it is passed to the backend after the
/// read-only check; otherwise `operation` selects one of the generic
/// operations and the remaining fields parameterise it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseQuery {
    #[serde(default)]
    pub operation: QueryOperation,
    /// Table or collection to run against instead of the adapter's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<QueryFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationQuery>,
    /// For `distinct`, the first entry names the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_query: Option<JsonValue>,
}

impl DatabaseQuery {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::rejected(format!("invalid query: {}", e)))
    }

    pub fn native(payload: JsonValue) -> Self {
        Self {
            native_query: Some(payload),
            ..Default::default()
        }
    }

    pub fn find(filter: QueryFilter) -> Self {
        Self {
            operation: QueryOperation::Find,
            filters: Some(filter),
            ..Default::default()
        }
    }

    pub fn count(filter: QueryFilter) -> Self {
        Self {
            operation: QueryOperation::Count,
            filters: Some(filter),
            ..Default::default()
        }
    }

    pub fn aggregate(query: AggregationQuery) -> Self {
        Self {
            operation: QueryOperation::Aggregate,
            aggregation: Some(query),
            ..Default::default()
        }
    }

    pub fn distinct(field: impl Into<String>, filter: Option<QueryFilter>) -> Self {
        Self {
            operation: QueryOperation::Distinct,
            projection: Some(vec![field.into()]),
            filters: filter,
            ..Default::default()
        }
    }

    pub fn on(mut self, target: impl Into<String>) -> Self {
        self.collection_table = Some(target.into());
        self
    }

    pub fn filter_or_default(&self) -> QueryFilter {
        self.filters.clone().unwrap_or_default()
    }

    pub fn aggregation_or_reject(&self) -> Result<&AggregationQuery> {
        self.aggregation
            .as_ref()
            .ok_or_else(|| Error::rejected("aggregate operation requires an aggregation"))
    }

    pub fn distinct_field(&self) -> Result<&str> {
        self.projection
            .as_ref()
            .and_then(|p| p.first())
            .map(String::as_str)
            .ok_or_else(|| Error::rejected("distinct operation requires a projection field"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_generic_query() {
        let query = DatabaseQuery::from_json(json!({
            "operation": "distinct",
            "projection": ["attributes.category"],
            "filters": {"limit": 3}
        }))
        .unwrap();
        assert_eq!(query.operation, QueryOperation::Distinct);
        assert_eq!(query.distinct_field().unwrap(), "attributes.category");
        assert!(query.native_query.is_none());
    }

    #[test]
    fn test_missing_parts_are_rejected() {
        let query = DatabaseQuery {
            operation: QueryOperation::Aggregate,
            ..Default::default()
        };
        assert!(matches!(query.aggregation_or_reject(), Err(Error::TranslationRejected(_))));
        assert!(query.distinct_field().is_err());
        assert!(DatabaseQuery::from_json(json!({"operation": "drop"})).is_err());
    }
}
