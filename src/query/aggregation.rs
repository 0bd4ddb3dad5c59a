//! Grouped aggregation requests.
//!
//! Translators never work on [`AggregationQuery`] directly; they call
//! [`AggregationQuery::plan`] which normalises field names, derives output
//! aliases (`{op}_{field}`) and resolves `having` clauses to measures.

use crate::error::{Error, Result};
use crate::query::filter::{BareName, ComparisonOp, FieldRef, QueryFilter, ValueConditions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// One output row: dimension names and `{op}_{field}` aliases to values.
pub type AggregateRow = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Max,
    Min,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Count => "count",
            AggregateOp::Max => "max",
            AggregateOp::Min => "min",
        }
    }
}

impl FromStr for AggregateOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(AggregateOp::Sum),
            "avg" => Ok(AggregateOp::Avg),
            "count" => Ok(AggregateOp::Count),
            "max" => Ok(AggregateOp::Max),
            "min" => Ok(AggregateOp::Min),
            other => Err(Error::rejected(format!("unknown aggregate function '{}'", other))),
        }
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Grouped aggregation over a filtered set of tuples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationQuery {
    /// Attribute keys to group by.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Value key to aggregate function.
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggregateOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<QueryFilter>,
    /// Post-aggregation conditions keyed by output alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<BTreeMap<String, ValueConditions>>,
}

/// A single aggregate column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasureSpec {
    pub field: String,
    pub op: AggregateOp,
    pub alias: String,
}

/// A `having` condition bound to a measure by index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HavingClause {
    pub measure: usize,
    pub op: ComparisonOp,
    pub threshold: f64,
}

/// Normalised aggregation handed to the translators.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan {
    pub dimensions: Vec<String>,
    pub measures: Vec<MeasureSpec>,
    pub having: Vec<HavingClause>,
    pub filter: QueryFilter,
}

impl AggregationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        let query: AggregationQuery = serde_json::from_value(value)
            .map_err(|e| Error::rejected(format!("invalid aggregation: {}", e)))?;
        query.plan()?;
        Ok(query)
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn aggregate(mut self, field: impl Into<String>, op: AggregateOp) -> Self {
        self.aggregations.insert(field.into(), op);
        self
    }

    pub fn filtered(mut self, filter: QueryFilter) -> Self {
        self.filters = Some(filter);
        self
    }

    pub fn having(mut self, alias: impl Into<String>, op: ComparisonOp, threshold: f64) -> Self {
        self.having
            .get_or_insert_with(BTreeMap::new)
            .entry(alias.into())
            .or_default()
            .insert(op, threshold);
        self
    }

    /// Output alias for an aggregate column.
    pub fn output_alias(op: AggregateOp, field: &str) -> String {
        format!("{}_{}", op.name(), field)
    }

    /// Validates and normalises the request.
    pub fn plan(&self) -> Result<AggregationPlan> {
        let mut dimensions = Vec::with_capacity(self.group_by.len());
        for name in &self.group_by {
            match FieldRef::parse(name, BareName::Attribute)? {
                FieldRef::Attribute(key) => {
                    if dimensions.contains(&key) {
                        return Err(Error::rejected(format!("duplicate group_by field '{}'", key)));
                    }
                    dimensions.push(key);
                }
                _ => {
                    return Err(Error::rejected(format!(
                        "group_by field '{}' must be an attribute",
                        name
                    )))
                }
            }
        }

        let mut measures = Vec::with_capacity(self.aggregations.len());
        let mut aliases: HashSet<String> = dimensions.iter().cloned().collect();
        for (name, op) in &self.aggregations {
            let field = match FieldRef::parse(name, BareName::Value)? {
                FieldRef::Value(key) => key,
                _ => {
                    return Err(Error::rejected(format!(
                        "aggregation field '{}' must be a value",
                        name
                    )))
                }
            };
            let alias = Self::output_alias(*op, &field);
            if !aliases.insert(alias.clone()) {
                return Err(Error::rejected(format!("duplicate output column '{}'", alias)));
            }
            measures.push(MeasureSpec {
                field,
                op: *op,
                alias,
            });
        }

        if dimensions.is_empty() && measures.is_empty() {
            return Err(Error::rejected(
                "aggregation needs at least one group_by field or aggregation",
            ));
        }

        let mut having = Vec::new();
        for (alias, conditions) in self.having.iter().flat_map(|h| h.iter()) {
            let measure = measures
                .iter()
                .position(|m| &m.alias == alias)
                .ok_or_else(|| {
                    Error::rejected(format!("having refers to unknown aggregate '{}'", alias))
                })?;
            for (op, threshold) in conditions {
                if !threshold.is_finite() {
                    return Err(Error::rejected(format!(
                        "having '{}' has a non-finite threshold",
                        alias
                    )));
                }
                having.push(HavingClause {
                    measure,
                    op: *op,
                    threshold: *threshold,
                });
            }
        }

        let filter = self.filters.clone().unwrap_or_default();
        filter.validate()?;

        Ok(AggregationPlan {
            dimensions,
            measures,
            having,
            filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_normalises_names() {
        let query = AggregationQuery::new()
            .group_by("attributes.category")
            .aggregate("values.metric", AggregateOp::Avg)
            .aggregate("other", AggregateOp::Count)
            .having("avg_metric", ComparisonOp::Gt, 20.0);
        let plan = query.plan().unwrap();
        assert_eq!(plan.dimensions, vec!["category".to_string()]);
        let aliases: Vec<_> = plan.measures.iter().map(|m| m.alias.as_str()).collect();
        assert_eq!(aliases, vec!["count_other", "avg_metric"]);
        assert_eq!(plan.having.len(), 1);
        assert_eq!(plan.measures[plan.having[0].measure].alias, "avg_metric");
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        let err = AggregationQuery::from_json(json!({
            "group_by": ["category"],
            "aggregations": {"metric": "median"}
        }))
        .unwrap_err();
        assert!(matches!(err, Error::TranslationRejected(_)));
        assert!("median".parse::<AggregateOp>().is_err());
    }

    #[test]
    fn test_having_on_unknown_alias_is_rejected() {
        let query = AggregationQuery::new()
            .aggregate("metric", AggregateOp::Sum)
            .having("avg_metric", ComparisonOp::Gt, 1.0);
        assert!(matches!(query.plan(), Err(Error::TranslationRejected(_))));
    }

    #[test]
    fn test_grouping_on_values_is_rejected() {
        let query = AggregationQuery::new()
            .group_by("values.metric")
            .aggregate("metric", AggregateOp::Sum);
        assert!(query.plan().is_err());
    }

    #[test]
    fn test_duplicate_alias_is_rejected() {
        let query = AggregationQuery::new()
            .aggregate("metric", AggregateOp::Sum)
            .aggregate("values.metric", AggregateOp::Sum);
        assert!(query.plan().is_err());
    }
}
