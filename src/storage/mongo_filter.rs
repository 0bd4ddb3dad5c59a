//! Query filters and aggregations translated into MongoDB documents.
//!
//! All field paths come from the collection mapping; keys have already been
//! validated by [`QueryFilter::validate`], so no caller text reaches an
//! operator position.

use crate::error::Result;
use crate::query::{
    AggregateOp, AggregateRow, AggregationPlan, ComparisonOp, FieldRef, QueryFilter,
};
use crate::storage::collections::CollectionMapping;
use crate::utils::{f64_to_json, timestamp_to_json};
use bson::{doc, Bson, Document};
use serde_json::{Map, Value as JsonValue};

/// Numeric content of a BSON value.
pub fn bson_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// Plain JSON for a BSON value; dates become RFC 3339 strings.
pub fn bson_to_json(value: &Bson) -> JsonValue {
    match value {
        Bson::Null | Bson::Undefined => JsonValue::Null,
        Bson::Boolean(b) => JsonValue::Bool(*b),
        Bson::Int32(v) => JsonValue::from(*v),
        Bson::Int64(v) => JsonValue::from(*v),
        Bson::Double(v) => f64_to_json(*v),
        Bson::String(s) => JsonValue::String(s.clone()),
        Bson::DateTime(ts) => timestamp_to_json(&ts.to_chrono()),
        Bson::ObjectId(oid) => JsonValue::String(oid.to_hex()),
        Bson::Array(items) => JsonValue::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(document) => JsonValue::Object(document_to_json(document)),
        other => other.clone().into_relaxed_extjson(),
    }
}

pub fn document_to_json(document: &Document) -> Map<String, JsonValue> {
    document
        .iter()
        .map(|(k, v)| (k.clone(), bson_to_json(v)))
        .collect()
}

fn bson_time(ts: &chrono::DateTime<chrono::Utc>) -> Bson {
    Bson::DateTime(bson::DateTime::from_chrono(*ts))
}

/// `find`/`$match` filter for a query filter.
pub fn filter_document(mapping: &CollectionMapping, filter: &QueryFilter) -> Result<Document> {
    filter.validate()?;
    let mut document = Document::new();

    for (key, value) in filter.attribute_filters() {
        document.insert(mapping.attribute_path(key), Bson::try_from(value.clone())?);
    }

    let mut conditions: Vec<(String, Document)> = Vec::new();
    for (key, op, threshold) in filter.value_conditions() {
        let path = mapping.value_path(key);
        let index = match conditions.iter().position(|(p, _)| *p == path) {
            Some(index) => index,
            None => {
                conditions.push((path, Document::new()));
                conditions.len() - 1
            }
        };
        let condition = &mut conditions[index].1;
        condition.insert(op.token(), threshold);
        if op == ComparisonOp::Ne {
            condition.insert("$exists", true);
        }
    }
    for (path, condition) in conditions {
        document.insert(path, condition);
    }

    if let Some(range) = &filter.time_range {
        let (start, end) = range.stored_bounds();
        document.insert(
            mapping.timestamp_path(),
            doc! { "$gte": bson_time(&start), "$lte": bson_time(&end) },
        );
    }
    Ok(document)
}

/// Sort document; non-timestamp keys get a secondary newest-first order.
pub fn sort_document(mapping: &CollectionMapping, filter: &QueryFilter) -> Result<Document> {
    let field = filter.sort_field()?;
    let direction = filter.sort_order.document_direction();
    let mut sort = Document::new();
    match field {
        FieldRef::Timestamp => {
            sort.insert(mapping.timestamp_path(), direction);
        }
        FieldRef::Attribute(key) => {
            sort.insert(mapping.attribute_path(&key), direction);
            sort.insert(mapping.timestamp_path(), -1);
        }
        FieldRef::Value(key) => {
            sort.insert(mapping.value_path(&key), direction);
            sort.insert(mapping.timestamp_path(), -1);
        }
    }
    Ok(sort)
}

/// Document path for a field reference.
pub fn field_path(mapping: &CollectionMapping, field: &FieldRef) -> String {
    match field {
        FieldRef::Attribute(key) => mapping.attribute_path(key),
        FieldRef::Value(key) => mapping.value_path(key),
        FieldRef::Timestamp => mapping.timestamp_path().to_string(),
    }
}

const ROWS_FIELD: &str = "__rows";

fn present_field(index: usize) -> String {
    format!("__n{}", index)
}

/// Aggregation pipeline producing one document per group.
///
/// Groups are keyed by the string form of each dimension (missing → `""`),
/// each measure tracks how many numeric inputs it saw so that a group with
/// none reports `null`, and output is sorted by the dimension strings.
pub fn aggregation_pipeline(mapping: &CollectionMapping, plan: &AggregationPlan) -> Result<Vec<Document>> {
    let mut pipeline = Vec::new();

    let filter = filter_document(mapping, &plan.filter)?;
    if !filter.is_empty() {
        pipeline.push(doc! { "$match": filter });
    }

    let group_id = if plan.dimensions.is_empty() {
        Bson::Null
    } else {
        let keys: Document = plan
            .dimensions
            .iter()
            .map(|d| {
                let path = format!("${}", mapping.attribute_path(d));
                (
                    d.clone(),
                    Bson::Document(doc! { "$ifNull": [ { "$toString": path }, "" ] }),
                )
            })
            .collect();
        Bson::Document(keys)
    };

    let mut group = doc! { "_id": group_id, ROWS_FIELD: { "$sum": 1 } };
    for (index, measure) in plan.measures.iter().enumerate() {
        let path = format!("${}", mapping.value_path(&measure.field));
        group.insert(
            present_field(index),
            doc! { "$sum": { "$cond": [ { "$isNumber": path.as_str() }, 1, 0 ] } },
        );
        let accumulator = match measure.op {
            AggregateOp::Sum => doc! { "$sum": path.as_str() },
            AggregateOp::Avg => doc! { "$avg": path.as_str() },
            AggregateOp::Max => doc! { "$max": path.as_str() },
            AggregateOp::Min => doc! { "$min": path.as_str() },
            AggregateOp::Count => continue,
        };
        group.insert(measure.alias.clone(), accumulator);
    }
    pipeline.push(doc! { "$group": group });

    let mut project = doc! { "_id": 0 };
    for dimension in &plan.dimensions {
        project.insert(dimension.clone(), format!("$_id.{}", dimension));
    }
    for (index, measure) in plan.measures.iter().enumerate() {
        let source = match measure.op {
            AggregateOp::Count => format!("${}", ROWS_FIELD),
            _ => format!("${}", measure.alias),
        };
        project.insert(
            measure.alias.clone(),
            doc! { "$cond": [ { "$gt": [ format!("${}", present_field(index)), 0 ] }, source, Bson::Null ] },
        );
    }
    pipeline.push(doc! { "$project": project });

    if !plan.having.is_empty() {
        let mut clauses = Vec::new();
        for clause in &plan.having {
            let alias = &plan.measures[clause.measure].alias;
            clauses.push(Bson::Document(doc! { alias.clone(): { "$ne": Bson::Null } }));
            clauses.push(Bson::Document(doc! { alias.clone(): { clause.op.token(): clause.threshold } }));
        }
        pipeline.push(doc! { "$match": { "$and": clauses } });
    }

    let sort: Document = if plan.dimensions.is_empty() {
        Document::new()
    } else {
        plan.dimensions.iter().map(|d| (d.clone(), Bson::Int32(1))).collect()
    };
    if !sort.is_empty() {
        pipeline.push(doc! { "$sort": sort });
    }
    Ok(pipeline)
}

/// Maps one pipeline output document onto the uniform row shape.
pub fn aggregate_row(plan: &AggregationPlan, document: &Document) -> AggregateRow {
    let mut row = AggregateRow::new();
    for dimension in &plan.dimensions {
        let value = match document.get(dimension) {
            Some(Bson::String(s)) if !s.is_empty() => JsonValue::String(s.clone()),
            _ => JsonValue::Null,
        };
        row.insert(dimension.clone(), value);
    }
    for measure in &plan.measures {
        let value = document.get(&measure.alias).and_then(bson_number);
        let value = match (measure.op, value) {
            (_, None) => JsonValue::Null,
            (AggregateOp::Count, Some(v)) => JsonValue::from(v as i64),
            (_, Some(v)) => f64_to_json(v),
        };
        row.insert(measure.alias.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregationQuery, SortOrder};
    use crate::storage::collections::CollectionRegistry;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn generic() -> CollectionMapping {
        CollectionMapping::generic("metrics")
    }

    #[test]
    fn test_filter_document() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let filter = QueryFilter::new()
            .with_attribute("category", "A")
            .with_value_filter("metric", ComparisonOp::Gte, 10.0)
            .with_value_filter("metric", ComparisonOp::Ne, 12.0)
            .with_time_range(start, end);
        let document = filter_document(&generic(), &filter).unwrap();

        assert_eq!(document.get_str("attributes.category").unwrap(), "A");
        let metric = document.get_document("values.metric").unwrap();
        assert_eq!(metric.get_f64("$gte").unwrap(), 10.0);
        assert_eq!(metric.get_f64("$ne").unwrap(), 12.0);
        assert!(metric.get_bool("$exists").unwrap());
        let ts = document.get_document("timestamp").unwrap();
        assert!(ts.get_datetime("$gte").is_ok());
    }

    #[test]
    fn test_structured_paths_are_used() {
        let mapping = CollectionRegistry::default().resolve("employee_tree_archived");
        let filter = QueryFilter::new()
            .with_attribute("soeId", "E1")
            .with_value_filter("totalNum", ComparisonOp::Gt, 3.0)
            .sorted_by("totalNum", SortOrder::Asc);
        let document = filter_document(&mapping, &filter).unwrap();
        assert!(document.contains_key("soeId"));
        assert!(document.contains_key("totalNum"));

        let sort = sort_document(&mapping, &filter).unwrap();
        let keys: Vec<_> = sort.keys().cloned().collect();
        assert_eq!(keys, vec!["totalNum".to_string(), "createdAt".to_string()]);
        assert_eq!(sort.get_i32("totalNum").unwrap(), 1);
    }

    #[test]
    fn test_pipeline_shape() {
        let plan = AggregationQuery::new()
            .group_by("category")
            .aggregate("metric", crate::query::AggregateOp::Avg)
            .having("avg_metric", ComparisonOp::Gt, 20.0)
            .filtered(QueryFilter::new().with_attribute("region", "eu"))
            .plan()
            .unwrap();
        let pipeline = aggregation_pipeline(&generic(), &plan).unwrap();
        let stages: Vec<_> = pipeline
            .iter()
            .map(|s| s.keys().next().cloned().unwrap())
            .collect();
        assert_eq!(stages, vec!["$match", "$group", "$project", "$match", "$sort"]);

        let group = pipeline[1].get_document("$group").unwrap();
        assert!(group.contains_key("avg_metric"));
        assert!(group.contains_key("__n0"));
    }

    #[test]
    fn test_aggregate_row_mapping() {
        let plan = AggregationQuery::new()
            .group_by("category")
            .aggregate("metric", crate::query::AggregateOp::Count)
            .aggregate("other", crate::query::AggregateOp::Sum)
            .plan()
            .unwrap();
        let row = aggregate_row(
            &plan,
            &doc! { "category": "", "count_metric": 3_i64, "sum_other": Bson::Null },
        );
        assert_eq!(row.get("category"), Some(&JsonValue::Null));
        assert_eq!(row.get("count_metric"), Some(&json!(3)));
        assert_eq!(row.get("sum_other"), Some(&JsonValue::Null));
    }

    #[test]
    fn test_bson_to_json() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(bson_to_json(&Bson::Int32(3)), json!(3));
        assert_eq!(
            bson_to_json(&Bson::DateTime(bson::DateTime::from_chrono(ts))),
            timestamp_to_json(&ts)
        );
        assert_eq!(bson_number(&Bson::String("3".into())), None);
    }
}
