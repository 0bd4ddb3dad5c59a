//! SQL generation for the relational (PostgreSQL) backend.
//!
//! Tuples are stored with `attributes` and `values` as JSONB. Field keys are
//! validated and interpolated as JSON path literals; every caller-supplied
//! value is bound as a positional `$n` parameter.

use crate::error::Result;
use crate::query::{AggregateOp, AggregationPlan, FieldRef, QueryFilter, SortOrder};
use crate::utils::validation::validate_field_name;
use chrono::{DateTime, Utc};

/// Bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Null,
}

/// Statement text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl SqlQuery {
    pub fn new(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Default)]
struct Binder {
    params: Vec<SqlParam>,
}

impl Binder {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }
}

/// Expression selecting the read columns of a tuple.
pub const TUPLE_COLUMNS: &str = r#"id::text AS id, attributes::text AS attributes, "values"::text AS "values", (EXTRACT(EPOCH FROM "timestamp") * 1000000)::bigint AS ts_micros"#;

fn attribute_json(key: &str) -> String {
    format!("(attributes -> '{}')", key)
}

fn attribute_text(key: &str) -> String {
    format!("(attributes ->> '{}')", key)
}

fn value_number(key: &str) -> String {
    format!(r#"("values" ->> '{}')::double precision"#, key)
}

fn value_json(key: &str) -> String {
    format!(r#"("values" -> '{}')"#, key)
}

fn where_clause(binder: &mut Binder, filter: &QueryFilter) -> Result<String> {
    filter.validate()?;
    let mut conditions = Vec::new();

    for (key, value) in filter.attribute_filters() {
        validate_field_name(key)?;
        let placeholder = binder.bind(SqlParam::Text(value.to_string()));
        conditions.push(format!("{} = {}::jsonb", attribute_json(key), placeholder));
    }

    for (key, op, threshold) in filter.value_conditions() {
        validate_field_name(key)?;
        let placeholder = binder.bind(SqlParam::Float(threshold));
        conditions.push(format!("{} {} {}", value_number(key), op.sql_operator(), placeholder));
    }

    if let Some(range) = &filter.time_range {
        let (start, end) = range.stored_bounds();
        let start = binder.bind(SqlParam::Timestamp(start));
        let end = binder.bind(SqlParam::Timestamp(end));
        conditions.push(format!(r#""timestamp" >= {} AND "timestamp" <= {}"#, start, end));
    }

    Ok(if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    })
}

fn order_clause(filter: &QueryFilter) -> Result<String> {
    let direction = filter.sort_order.sql();
    // Missing keys sort lowest in both directions.
    let nulls = match filter.sort_order {
        SortOrder::Asc => "NULLS FIRST",
        SortOrder::Desc => "NULLS LAST",
    };
    Ok(match filter.sort_field()? {
        FieldRef::Timestamp => format!(r#" ORDER BY "timestamp" {}"#, direction),
        FieldRef::Attribute(key) => format!(
            r#" ORDER BY {} {} {}, "timestamp" DESC"#,
            attribute_json(&key),
            direction,
            nulls
        ),
        FieldRef::Value(key) => format!(
            r#" ORDER BY {} {} {}, "timestamp" DESC"#,
            value_number(&key),
            direction,
            nulls
        ),
    })
}

pub fn select_metrics(table: &str, filter: &QueryFilter) -> Result<SqlQuery> {
    let mut binder = Binder::default();
    let mut sql = format!("SELECT {} FROM {}", TUPLE_COLUMNS, table);
    sql.push_str(&where_clause(&mut binder, filter)?);
    sql.push_str(&order_clause(filter)?);
    if let Some(limit) = filter.limit_i64() {
        let placeholder = binder.bind(SqlParam::Int(limit));
        sql.push_str(&format!(" LIMIT {}", placeholder));
    }
    Ok(SqlQuery::new(sql, binder.params))
}

pub fn count_metrics(table: &str, filter: &QueryFilter) -> Result<SqlQuery> {
    let mut binder = Binder::default();
    let sql = format!(
        "SELECT COUNT(*) AS count FROM {}{}",
        table,
        where_clause(&mut binder, filter)?
    );
    Ok(SqlQuery::new(sql, binder.params))
}

pub fn delete_metrics(table: &str, filter: &QueryFilter) -> Result<SqlQuery> {
    let mut binder = Binder::default();
    let sql = format!(
        "DELETE FROM {}{} RETURNING id",
        table,
        where_clause(&mut binder, filter)?
    );
    Ok(SqlQuery::new(sql, binder.params))
}

/// `SELECT DISTINCT` over one field; the `value` column carries JSON text
/// for attributes and values, epoch microseconds for the timestamp.
pub fn distinct_values(table: &str, field: &FieldRef, filter: &QueryFilter) -> Result<SqlQuery> {
    let mut binder = Binder::default();
    let expr = match field {
        FieldRef::Attribute(key) => format!("{}::text", attribute_json(key)),
        FieldRef::Value(key) => format!("{}::text", value_json(key)),
        FieldRef::Timestamp => r#"(EXTRACT(EPOCH FROM "timestamp") * 1000000)::bigint"#.to_string(),
    };
    let where_sql = where_clause(&mut binder, filter)?;
    let not_null = if where_sql.is_empty() {
        format!(" WHERE {} IS NOT NULL", expr)
    } else {
        format!(" AND {} IS NOT NULL", expr)
    };
    let sql = format!(
        "SELECT DISTINCT {} AS value FROM {}{}{}",
        expr, table, where_sql, not_null
    );
    Ok(SqlQuery::new(sql, binder.params))
}

fn aggregate_expr(op: AggregateOp, field: &str) -> String {
    let value = value_number(field);
    match op {
        AggregateOp::Sum => format!("SUM({})", value),
        AggregateOp::Avg => format!("AVG({})", value),
        AggregateOp::Max => format!("MAX({})", value),
        AggregateOp::Min => format!("MIN({})", value),
        // Row count of the group, null when no tuple in it has the key.
        AggregateOp::Count => format!(
            "CASE WHEN COUNT({}) = 0 THEN NULL ELSE COUNT(*) END",
            value_json(field)
        ),
    }
}

fn group_expr(key: &str) -> String {
    format!("COALESCE({}, '')", attribute_text(key))
}

/// `SELECT ... GROUP BY ... HAVING ... ORDER BY` for an aggregation plan.
pub fn aggregate(table: &str, plan: &AggregationPlan) -> Result<SqlQuery> {
    let mut binder = Binder::default();

    let mut select = Vec::with_capacity(plan.dimensions.len() + plan.measures.len());
    for key in &plan.dimensions {
        select.push(format!(r#"NULLIF({}, '') AS "{}""#, group_expr(key), key));
    }
    for measure in &plan.measures {
        select.push(format!(
            r#"{} AS "{}""#,
            aggregate_expr(measure.op, &measure.field),
            measure.alias
        ));
    }

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), table);
    sql.push_str(&where_clause(&mut binder, &plan.filter)?);

    let groups: Vec<String> = plan.dimensions.iter().map(|k| group_expr(k)).collect();
    if !groups.is_empty() {
        sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
    }

    let mut having = Vec::new();
    if groups.is_empty() {
        // No global row for an empty input.
        having.push("COUNT(*) > 0".to_string());
    }
    for clause in &plan.having {
        let measure = &plan.measures[clause.measure];
        let placeholder = binder.bind(SqlParam::Float(clause.threshold));
        having.push(format!(
            "{} {} {}",
            aggregate_expr(measure.op, &measure.field),
            clause.op.sql_operator(),
            placeholder
        ));
    }
    if !having.is_empty() {
        sql.push_str(&format!(" HAVING {}", having.join(" AND ")));
    }

    if !groups.is_empty() {
        let order: Vec<String> = groups.iter().map(|g| format!(r#"{} COLLATE "C""#, g)).collect();
        sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }

    Ok(SqlQuery::new(sql, binder.params))
}

pub fn insert_metric(table: &str) -> String {
    format!(
        r#"INSERT INTO {} (id, attributes, "values", "timestamp") VALUES ($1, $2::jsonb, $3::jsonb, $4)"#,
        table
    )
}

/// Merges the update into the stored maps with JSONB concatenation.
pub fn update_metric(table: &str, attributes_json: String, values_json: String, id: &str) -> SqlQuery {
    SqlQuery::new(
        format!(
            r#"UPDATE {} SET attributes = attributes || $1::jsonb, "values" = "values" || $2::jsonb WHERE id = $3 RETURNING id"#,
            table
        ),
        vec![
            SqlParam::Text(attributes_json),
            SqlParam::Text(values_json),
            SqlParam::Text(id.to_string()),
        ],
    )
}

pub fn delete_metric(table: &str, id: &str) -> SqlQuery {
    SqlQuery::new(
        format!("DELETE FROM {} WHERE id = $1 RETURNING id", table),
        vec![SqlParam::Text(id.to_string())],
    )
}

pub fn create_schema(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                attributes JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                "values" JSONB NOT NULL,
                "timestamp" TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            t = table
        ),
        format!(r#"CREATE INDEX IF NOT EXISTS idx_{t}_timestamp ON {t} ("timestamp")"#, t = table),
        format!("CREATE INDEX IF NOT EXISTS idx_{t}_created_at ON {t} (created_at)", t = table),
        format!("CREATE INDEX IF NOT EXISTS idx_{t}_attributes ON {t} USING GIN (attributes)", t = table),
    ]
}

pub fn schema_columns(table: &str) -> SqlQuery {
    SqlQuery::new(
        "SELECT column_name::text AS column_name, data_type::text AS data_type, is_nullable::text AS is_nullable \
         FROM information_schema.columns WHERE table_name = $1 ORDER BY ordinal_position",
        vec![SqlParam::Text(table.to_string())],
    )
}

pub fn schema_primary_key(table: &str) -> SqlQuery {
    SqlQuery::new(
        "SELECT a.attname::text AS column_name FROM pg_index i \
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
         WHERE i.indrelid = $1::regclass AND i.indisprimary",
        vec![SqlParam::Text(table.to_string())],
    )
}

pub fn schema_indexes(table: &str) -> SqlQuery {
    SqlQuery::new(
        "SELECT indexname::text AS indexname, indexdef::text AS indexdef FROM pg_indexes WHERE tablename = $1 ORDER BY indexname",
        vec![SqlParam::Text(table.to_string())],
    )
}

/// Keys observed in a sample of rows for the given JSONB column.
pub fn schema_keys(table: &str, column: &str, sample: i64) -> SqlQuery {
    SqlQuery::new(
        format!(
            r#"SELECT DISTINCT k AS key FROM (SELECT "{c}" FROM {t} LIMIT $1) s, jsonb_object_keys(s."{c}") k ORDER BY key"#,
            c = column,
            t = table
        ),
        vec![SqlParam::Int(sample)],
    )
}

pub fn row_count(table: &str) -> String {
    format!("SELECT COUNT(*) AS count FROM {}", table)
}
