//! Filter model: attribute equality, value comparisons, time range, ordering
//! and limit. Every translator consumes the same [`QueryFilter`].

use crate::error::{Error, Result};
use crate::metrics::Attributes;
use crate::utils::{truncate_to_millis, validation::validate_field_name};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of comparison operators accepted in value filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "$gte")]
    Gte,
    #[serde(rename = "$lte")]
    Lte,
    #[serde(rename = "$gt")]
    Gt,
    #[serde(rename = "$lt")]
    Lt,
    #[serde(rename = "$eq")]
    Eq,
    #[serde(rename = "$ne")]
    Ne,
}

impl ComparisonOp {
    pub const ALL: [ComparisonOp; 6] = [
        ComparisonOp::Gte,
        ComparisonOp::Lte,
        ComparisonOp::Gt,
        ComparisonOp::Lt,
        ComparisonOp::Eq,
        ComparisonOp::Ne,
    ];

    /// Wire token, also the document-store operator.
    pub fn token(&self) -> &'static str {
        match self {
            ComparisonOp::Gte => "$gte",
            ComparisonOp::Lte => "$lte",
            ComparisonOp::Gt => "$gt",
            ComparisonOp::Lt => "$lt",
            ComparisonOp::Eq => "$eq",
            ComparisonOp::Ne => "$ne",
        }
    }

    pub fn sql_operator(&self) -> &'static str {
        match self {
            ComparisonOp::Gte => ">=",
            ComparisonOp::Lte => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Lt => "<",
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
        }
    }

    pub fn evaluate(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            ComparisonOp::Gte => lhs >= rhs,
            ComparisonOp::Lte => lhs <= rhs,
            ComparisonOp::Gt => lhs > rhs,
            ComparisonOp::Lt => lhs < rhs,
            ComparisonOp::Eq => lhs == rhs,
            ComparisonOp::Ne => lhs != rhs,
        }
    }
}

impl FromStr for ComparisonOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ComparisonOp::ALL
            .into_iter()
            .find(|op| op.token() == s)
            .ok_or_else(|| Error::rejected(format!("unknown comparison operator '{}'", s)))
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Operator to threshold; all entries must hold.
pub type ValueConditions = BTreeMap<ComparisonOp, f64>;

/// Inclusive time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Bounds as every backend compares them, at millisecond precision.
    pub fn stored_bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (truncate_to_millis(&self.start), truncate_to_millis(&self.end))
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        let (start, end) = self.stored_bounds();
        let ts = truncate_to_millis(ts);
        ts >= start && ts <= end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[serde(alias = "ASC", alias = "ascending")]
    Asc,
    #[default]
    #[serde(alias = "DESC", alias = "descending")]
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    pub fn document_direction(&self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

/// A reference to one field of a [`crate::MetricTuple`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    Attribute(String),
    Value(String),
    Timestamp,
}

/// How a name without an `attributes.`/`values.` prefix is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BareName {
    Attribute,
    Value,
}

impl FieldRef {
    pub fn parse(name: &str, bare: BareName) -> Result<FieldRef> {
        let field = if name == "timestamp" {
            FieldRef::Timestamp
        } else if let Some(key) = name.strip_prefix("attributes.") {
            FieldRef::Attribute(key.to_string())
        } else if let Some(key) = name.strip_prefix("values.") {
            FieldRef::Value(key.to_string())
        } else {
            match bare {
                BareName::Attribute => FieldRef::Attribute(name.to_string()),
                BareName::Value => FieldRef::Value(name.to_string()),
            }
        };
        match &field {
            FieldRef::Attribute(key) | FieldRef::Value(key) => validate_field_name(key)?,
            FieldRef::Timestamp => {}
        }
        Ok(field)
    }
}

/// Generic filter shared by every query, count and delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Exact match per attribute key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    /// Comparisons per value key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_filters: Option<BTreeMap<String, ValueConditions>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a filter from JSON; malformed input is a rejected translation.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let filter: QueryFilter = serde_json::from_value(value)
            .map_err(|e| Error::rejected(format!("invalid filter: {}", e)))?;
        filter.validate()?;
        Ok(filter)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes
            .get_or_insert_with(Attributes::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_value_filter(mut self, key: impl Into<String>, op: ComparisonOp, threshold: f64) -> Self {
        self.value_filters
            .get_or_insert_with(BTreeMap::new)
            .entry(key.into())
            .or_default()
            .insert(op, threshold);
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some(TimeRange::new(start, end));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit as a driver integer, saturating at `i64::MAX`.
    pub fn limit_i64(&self) -> Option<i64> {
        self.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
    }

    /// True when the limit admits no rows at all.
    pub fn selects_nothing(&self) -> bool {
        self.limit == Some(0)
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(field.into());
        self.sort_order = order;
        self
    }

    /// Rejects unsafe keys, non-scalar attribute values and non-finite thresholds.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.attribute_filters() {
            validate_field_name(key)?;
            if value.is_array() || value.is_object() {
                return Err(Error::rejected(format!(
                    "attribute filter '{}' must be a scalar",
                    key
                )));
            }
        }
        for (key, _, threshold) in self.value_conditions() {
            validate_field_name(key)?;
            if !threshold.is_finite() {
                return Err(Error::rejected(format!(
                    "value filter '{}' has a non-finite threshold",
                    key
                )));
            }
        }
        self.sort_field()?;
        Ok(())
    }

    pub fn attribute_filters(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.attributes.iter().flat_map(|m| m.iter())
    }

    /// Flattened `(key, operator, threshold)` triples in key order.
    pub fn value_conditions(&self) -> impl Iterator<Item = (&String, ComparisonOp, f64)> {
        self.value_filters
            .iter()
            .flat_map(|m| m.iter())
            .flat_map(|(key, conds)| conds.iter().map(move |(op, v)| (key, *op, *v)))
    }

    /// True if attribute or value predicates are present.
    pub fn has_field_predicates(&self) -> bool {
        self.attribute_filters().next().is_some() || self.value_conditions().next().is_some()
    }

    /// True if the filter selects every stored tuple.
    pub fn is_unconstrained(&self) -> bool {
        !self.has_field_predicates() && self.time_range.is_none()
    }

    /// Sort key; defaults to the timestamp. Bare names refer to values.
    pub fn sort_field(&self) -> Result<FieldRef> {
        match &self.sort_by {
            None => Ok(FieldRef::Timestamp),
            Some(name) => FieldRef::parse(name, BareName::Value),
        }
    }
}
