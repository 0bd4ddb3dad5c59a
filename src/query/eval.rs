//! In-process evaluation of the generic model.
//!
//! The embedded backend pushes only the time range into SQL; attribute and
//! value predicates, non-timestamp ordering and aggregation run here. The
//! same functions define the reference semantics the other translators
//! reproduce in their native dialects.

use crate::metrics::MetricTuple;
use crate::query::aggregation::{AggregateOp, AggregateRow, AggregationPlan};
use crate::query::filter::{FieldRef, QueryFilter, SortOrder};
use crate::utils::{compare_json, dimension_text, f64_to_json, json_scalar_eq, timestamp_to_json};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// True if the tuple satisfies every clause of the filter.
pub fn matches(filter: &QueryFilter, tuple: &MetricTuple) -> bool {
    if let Some(range) = &filter.time_range {
        if !range.contains(&tuple.timestamp) {
            return false;
        }
    }
    for (key, expected) in filter.attribute_filters() {
        match tuple.attributes.get(key) {
            Some(actual) if json_scalar_eq(actual, expected) => {}
            _ => return false,
        }
    }
    // A missing value key never satisfies a comparison, `$ne` included.
    filter.value_conditions().all(|(key, op, threshold)| {
        tuple
            .values
            .get(key)
            .map(|v| op.evaluate(*v, threshold))
            .unwrap_or(false)
    })
}

/// Orders tuples by `field`; missing keys sort lowest and ties fall back to
/// newest-first.
pub fn sort_tuples(tuples: &mut [MetricTuple], field: &FieldRef, order: SortOrder) {
    tuples.sort_by(|a, b| {
        let primary = match field {
            FieldRef::Timestamp => a.timestamp.cmp(&b.timestamp),
            FieldRef::Attribute(key) => compare_json(
                a.attributes.get(key).unwrap_or(&JsonValue::Null),
                b.attributes.get(key).unwrap_or(&JsonValue::Null),
            ),
            FieldRef::Value(key) => match (a.values.get(key), b.values.get(key)) {
                (Some(x), Some(y)) => x.total_cmp(y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        let primary = match order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        primary.then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

/// Filters, orders and truncates a candidate set.
pub fn apply_filter(
    candidates: impl IntoIterator<Item = MetricTuple>,
    filter: &QueryFilter,
    field: &FieldRef,
) -> Vec<MetricTuple> {
    let mut matched: Vec<MetricTuple> = candidates
        .into_iter()
        .filter(|t| matches(filter, t))
        .collect();
    sort_tuples(&mut matched, field, filter.sort_order);
    if let Some(limit) = filter.limit {
        matched.truncate(limit);
    }
    matched
}

#[derive(Debug, Clone, Default)]
struct Accumulator {
    present: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Accumulator {
    fn push(&mut self, v: f64) {
        self.present += 1;
        self.sum += v;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    fn finish(&self, op: AggregateOp, rows: u64) -> JsonValue {
        if self.present == 0 {
            return JsonValue::Null;
        }
        match op {
            AggregateOp::Count => JsonValue::from(rows),
            AggregateOp::Sum => f64_to_json(self.sum),
            AggregateOp::Avg => f64_to_json(self.sum / self.present as f64),
            AggregateOp::Max => self.max.map(f64_to_json).unwrap_or(JsonValue::Null),
            AggregateOp::Min => self.min.map(f64_to_json).unwrap_or(JsonValue::Null),
        }
    }
}

struct Group {
    rows: u64,
    measures: Vec<Accumulator>,
}

/// Groups already-filtered tuples and reduces them per the plan.
///
/// Group keys are the stringified attribute values with missing keys as the
/// empty string; the empty string is reported as `null`. Rows come back in
/// ascending key order.
pub fn aggregate<'a>(
    plan: &AggregationPlan,
    tuples: impl IntoIterator<Item = &'a MetricTuple>,
) -> Vec<AggregateRow> {
    let mut groups: BTreeMap<Vec<String>, Group> = BTreeMap::new();
    for tuple in tuples {
        let key: Vec<String> = plan
            .dimensions
            .iter()
            .map(|d| tuple.attributes.get(d).map(dimension_text).unwrap_or_default())
            .collect();
        let group = groups.entry(key).or_insert_with(|| Group {
            rows: 0,
            measures: vec![Accumulator::default(); plan.measures.len()],
        });
        group.rows += 1;
        for (acc, spec) in group.measures.iter_mut().zip(&plan.measures) {
            if let Some(v) = tuple.values.get(&spec.field) {
                acc.push(*v);
            }
        }
    }

    let mut rows = Vec::with_capacity(groups.len());
    'groups: for (key, group) in groups {
        let outputs: Vec<JsonValue> = group
            .measures
            .iter()
            .zip(&plan.measures)
            .map(|(acc, spec)| acc.finish(spec.op, group.rows))
            .collect();

        for clause in &plan.having {
            let passes = outputs[clause.measure]
                .as_f64()
                .map(|v| clause.op.evaluate(v, clause.threshold))
                .unwrap_or(false);
            if !passes {
                continue 'groups;
            }
        }

        let mut row = AggregateRow::new();
        for (name, value) in plan.dimensions.iter().zip(key) {
            let value = if value.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(value)
            };
            row.insert(name.clone(), value);
        }
        for (spec, value) in plan.measures.iter().zip(outputs) {
            row.insert(spec.alias.clone(), value);
        }
        rows.push(row);
    }
    rows
}

/// Distinct non-null values of a field, in ascending order.
pub fn distinct<'a>(field: &FieldRef, tuples: impl IntoIterator<Item = &'a MetricTuple>) -> Vec<JsonValue> {
    let mut values: Vec<JsonValue> = Vec::new();
    for tuple in tuples {
        let value = match field {
            FieldRef::Timestamp => Some(timestamp_to_json(&tuple.timestamp)),
            FieldRef::Attribute(key) => tuple.attributes.get(key).cloned(),
            FieldRef::Value(key) => tuple.values.get(key).map(|v| f64_to_json(*v)),
        };
        if let Some(value) = value.filter(|v| !v.is_null()) {
            if !values.iter().any(|seen| json_scalar_eq(seen, &value)) {
                values.push(value);
            }
        }
    }
    sort_distinct(&mut values);
    values
}

pub fn sort_distinct(values: &mut Vec<JsonValue>) {
    values.retain(|v| !v.is_null());
    values.sort_by(compare_json);
    values.dedup_by(|a, b| json_scalar_eq(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Attributes, Values};
    use crate::query::aggregation::AggregationQuery;
    use crate::query::filter::ComparisonOp;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn tuple(category: Option<&str>, metric: Option<f64>, minutes: i64) -> MetricTuple {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut t = MetricTuple::new(Attributes::new(), Values::new(), base + Duration::minutes(minutes));
        if let Some(c) = category {
            t.attributes.insert("category".into(), json!(c));
        }
        if let Some(m) = metric {
            t.values.insert("metric".into(), m);
        } else {
            t.values.insert("other".into(), 1.0);
        }
        t
    }

    #[test]
    fn test_matches_and_ne_on_missing_key() {
        let t = tuple(Some("A"), None, 0);
        let filter = QueryFilter::new().with_value_filter("metric", ComparisonOp::Ne, 5.0);
        assert!(!matches(&filter, &t));
        let filter = QueryFilter::new().with_attribute("category", "A");
        assert!(matches(&filter, &t));
        let filter = QueryFilter::new().with_attribute("category", "B");
        assert!(!matches(&filter, &t));
    }

    #[test]
    fn test_default_ordering_newest_first() {
        let tuples = vec![tuple(Some("A"), Some(1.0), 0), tuple(Some("A"), Some(2.0), 5), tuple(Some("A"), Some(3.0), 2)];
        let filter = QueryFilter::new().with_limit(2);
        let out = apply_filter(tuples, &filter, &FieldRef::Timestamp);
        let metrics: Vec<f64> = out.iter().map(|t| t.values["metric"]).collect();
        assert_eq!(metrics, vec![2.0, 3.0]);
    }

    #[test]
    fn test_missing_sort_key_sorts_lowest() {
        let tuples = vec![tuple(Some("A"), Some(1.0), 0), tuple(Some("A"), None, 1)];
        let field = FieldRef::Value("metric".into());
        let asc = apply_filter(tuples.clone(), &QueryFilter::new().sorted_by("metric", SortOrder::Asc), &field);
        assert!(!asc[0].values.contains_key("metric"));
        let desc = apply_filter(tuples, &QueryFilter::new(), &field);
        assert!(!desc[1].values.contains_key("metric"));
    }

    #[test]
    fn test_aggregate_groups_and_averages() {
        let tuples = vec![
            tuple(Some("A"), Some(10.0), 0),
            tuple(Some("A"), Some(20.0), 1),
            tuple(Some("B"), Some(30.0), 2),
        ];
        let plan = AggregationQuery::new()
            .group_by("category")
            .aggregate("metric", AggregateOp::Avg)
            .plan()
            .unwrap();
        let rows = aggregate(&plan, &tuples);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["category"], json!("A"));
        assert_eq!(rows[0]["avg_metric"], json!(15.0));
        assert_eq!(rows[1]["category"], json!("B"));
        assert_eq!(rows[1]["avg_metric"], json!(30.0));
    }

    #[test]
    fn test_aggregate_null_policy() {
        let tuples = vec![tuple(None, None, 0), tuple(Some("B"), Some(4.0), 1), tuple(Some("B"), None, 2)];
        let plan = AggregationQuery::new()
            .group_by("category")
            .aggregate("metric", AggregateOp::Count)
            .plan()
            .unwrap();
        let rows = aggregate(&plan, &tuples);
        assert_eq!(rows.len(), 2);
        // missing dimension groups under null, and no tuple there has the key
        assert_eq!(rows[0]["category"], JsonValue::Null);
        assert_eq!(rows[0]["count_metric"], JsonValue::Null);
        // count counts the whole group once any tuple has the key
        assert_eq!(rows[1]["count_metric"], json!(2));
    }

    #[test]
    fn test_having_filters_groups() {
        let tuples = vec![tuple(Some("A"), Some(10.0), 0), tuple(Some("B"), Some(30.0), 1)];
        let plan = AggregationQuery::new()
            .group_by("category")
            .aggregate("metric", AggregateOp::Sum)
            .having("sum_metric", ComparisonOp::Gte, 20.0)
            .plan()
            .unwrap();
        let rows = aggregate(&plan, &tuples);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["category"], json!("B"));
    }

    #[test]
    fn test_global_aggregate_on_empty_input() {
        let plan = AggregationQuery::new().aggregate("metric", AggregateOp::Sum).plan().unwrap();
        assert!(aggregate(&plan, &[]).is_empty());
    }

    #[test]
    fn test_distinct_sorted_without_nulls() {
        let tuples = vec![tuple(Some("B"), Some(1.0), 0), tuple(None, Some(1.0), 1), tuple(Some("A"), Some(2.0), 2)];
        let values = distinct(&FieldRef::Attribute("category".into()), &tuples);
        assert_eq!(values, vec![json!("A"), json!("B")]);
        let values = distinct(&FieldRef::Value("metric".into()), &tuples);
        assert_eq!(values, vec![json!(1.0), json!(2.0)]);
    }
}
