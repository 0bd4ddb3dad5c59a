//! Read-only checks for native query payloads.
//!
//! SQL payloads look like `{"sql": "...", "params": [...]}` or a bare SQL
//! string, and must be a single plain `SELECT`. Document payloads are either
//! `{"pipeline": [...]}` or `{"operation": "...", ...}` naming a read
//! operation; write operations and pipeline stages that write are refused.

use crate::error::{Error, Result};
use bson::Document;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{Dialect, DuckDbDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

/// SQL dialect used when parsing a native statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    DuckDb,
    Postgres,
}

/// A validated native SQL payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSql {
    pub sql: String,
    pub params: Vec<JsonValue>,
}

#[derive(Deserialize)]
struct SqlPayload {
    sql: String,
    #[serde(default)]
    params: Vec<JsonValue>,
}

/// Parses `{"sql", "params"}` or a bare string and applies [`ensure_select`].
pub fn parse_sql_payload(payload: &JsonValue, dialect: SqlDialect) -> Result<NativeSql> {
    let parsed: SqlPayload = match payload {
        JsonValue::String(sql) => SqlPayload {
            sql: sql.clone(),
            params: Vec::new(),
        },
        _ => serde_json::from_value(payload.clone())
            .map_err(|e| Error::rejected(format!("invalid native SQL payload: {}", e)))?,
    };
    ensure_select(&parsed.sql, dialect)?;
    for param in &parsed.params {
        if param.is_array() || param.is_object() {
            return Err(Error::rejected("native SQL parameters must be scalars"));
        }
    }
    Ok(NativeSql {
        sql: parsed.sql.trim().to_string(),
        params: parsed.params,
    })
}

/// Accepts only a single `SELECT` statement.
///
/// The statement must start with `SELECT` once trimmed (any case), parse as
/// exactly one query, and must not be `SELECT ... INTO`.
pub fn ensure_select(sql: &str, dialect: SqlDialect) -> Result<()> {
    let trimmed = sql.trim();
    if !trimmed.to_uppercase().starts_with("SELECT") {
        return Err(Error::unsafe_native(
            "only SELECT statements are allowed in read-only mode",
        ));
    }

    let dialect: &dyn Dialect = match dialect {
        SqlDialect::DuckDb => &DuckDbDialect {},
        SqlDialect::Postgres => &PostgreSqlDialect {},
    };
    let statements = Parser::parse_sql(dialect, trimmed)
        .map_err(|e| Error::unsafe_native(format!("statement could not be verified: {}", e)))?;

    match statements.as_slice() {
        [Statement::Query(query)] => {
            if let SetExpr::Select(select) = query.body.as_ref() {
                if select.into.is_some() {
                    return Err(Error::unsafe_native("SELECT ... INTO writes a table"));
                }
            }
            Ok(())
        }
        [_] => Err(Error::unsafe_native("only SELECT statements are allowed")),
        _ => Err(Error::unsafe_native("exactly one statement is allowed")),
    }
}

/// Operation tags accepted in a document payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentReadOp {
    Find,
    Aggregate,
    Count,
    Distinct,
}

const DOCUMENT_WRITE_OPS: &[&str] = &[
    "insert",
    "insert_one",
    "insert_many",
    "update",
    "update_one",
    "update_many",
    "replace",
    "replace_one",
    "delete",
    "delete_one",
    "delete_many",
    "find_one_and_update",
    "find_one_and_replace",
    "find_one_and_delete",
    "bulk_write",
    "drop",
    "create_index",
    "drop_index",
    "rename",
];

const DOCUMENT_WRITE_STAGES: &[&str] = &["$out", "$merge"];

/// A validated native document payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeDocumentQuery {
    Find {
        filter: Document,
        sort: Option<Document>,
        limit: Option<i64>,
    },
    Aggregate {
        pipeline: Vec<Document>,
    },
    Count {
        filter: Document,
    },
    Distinct {
        field: String,
        filter: Document,
    },
}

/// Parses and checks a document payload.
pub fn parse_document_payload(payload: &JsonValue) -> Result<NativeDocumentQuery> {
    let obj = match payload {
        JsonValue::Object(obj) => obj,
        JsonValue::String(_) => {
            return Err(Error::unsafe_native(
                "statement text is not a document read operation",
            ))
        }
        _ => return Err(Error::rejected("native document payload must be an object")),
    };

    let op = match obj.get("operation") {
        None if obj.contains_key("pipeline") => DocumentReadOp::Aggregate,
        None => DocumentReadOp::Find,
        Some(JsonValue::String(tag)) => document_op(tag)?,
        Some(other) => {
            return Err(Error::rejected(format!(
                "operation must be a string, got {}",
                other
            )))
        }
    };

    let filter = match obj.get("filter") {
        Some(value) => to_document(value)?,
        None => Document::new(),
    };

    match op {
        DocumentReadOp::Aggregate => {
            let stages = obj
                .get("pipeline")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| Error::rejected("aggregate requires a pipeline array"))?;
            let mut pipeline = Vec::with_capacity(stages.len());
            for stage in stages {
                let stage = to_document(stage)?;
                if let Some(name) = stage.keys().find(|k| DOCUMENT_WRITE_STAGES.contains(&k.as_str())) {
                    return Err(Error::unsafe_native(format!(
                        "pipeline stage {} writes data",
                        name
                    )));
                }
                pipeline.push(stage);
            }
            Ok(NativeDocumentQuery::Aggregate { pipeline })
        }
        DocumentReadOp::Find => {
            let sort = obj.get("sort").map(to_document).transpose()?;
            let limit = match obj.get("limit") {
                None | Some(JsonValue::Null) => None,
                Some(v) => Some(
                    v.as_i64()
                        .filter(|n| *n >= 0)
                        .ok_or_else(|| Error::rejected("limit must be a non-negative integer"))?,
                ),
            };
            Ok(NativeDocumentQuery::Find { filter, sort, limit })
        }
        DocumentReadOp::Count => Ok(NativeDocumentQuery::Count { filter }),
        DocumentReadOp::Distinct => {
            let field = obj
                .get("field")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| Error::rejected("distinct requires a field"))?
                .to_string();
            Ok(NativeDocumentQuery::Distinct { field, filter })
        }
    }
}

fn document_op(tag: &str) -> Result<DocumentReadOp> {
    let normalized = tag.to_ascii_lowercase();
    match normalized.as_str() {
        "find" => Ok(DocumentReadOp::Find),
        "aggregate" => Ok(DocumentReadOp::Aggregate),
        "count" | "count_documents" => Ok(DocumentReadOp::Count),
        "distinct" => Ok(DocumentReadOp::Distinct),
        op if DOCUMENT_WRITE_OPS.contains(&op) => Err(Error::unsafe_native(format!(
            "operation '{}' writes data",
            tag
        ))),
        _ => Err(Error::rejected(format!("unknown document operation '{}'", tag))),
    }
}

fn to_document(value: &JsonValue) -> Result<Document> {
    match bson::Bson::try_from(value.clone())? {
        bson::Bson::Document(doc) => Ok(doc),
        other => Err(Error::rejected(format!("expected a document, got {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_is_accepted() {
        assert!(ensure_select("  select * from metrics where 1 = 1  ", SqlDialect::DuckDb).is_ok());
        assert!(ensure_select("SELECT COUNT(*) FROM metrics", SqlDialect::Postgres).is_ok());
    }

    #[test]
    fn test_non_select_is_rejected() {
        for sql in [
            "DROP TABLE metrics",
            "delete from metrics",
            "INSERT INTO metrics VALUES (1)",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "",
        ] {
            let err = ensure_select(sql, SqlDialect::Postgres).unwrap_err();
            assert!(matches!(err, Error::UnsafeNativeQuery(_)), "{sql}");
        }
    }

    #[test]
    fn test_stacked_and_into_statements_are_rejected() {
        assert!(ensure_select("SELECT 1; DROP TABLE metrics", SqlDialect::Postgres).is_err());
        assert!(ensure_select("SELECT * INTO copy FROM metrics", SqlDialect::Postgres).is_err());
    }

    #[test]
    fn test_sql_payload() {
        let native = parse_sql_payload(
            &json!({"sql": "SELECT * FROM metrics WHERE id = $1", "params": ["abc"]}),
            SqlDialect::Postgres,
        )
        .unwrap();
        assert_eq!(native.params, vec![json!("abc")]);
        assert!(parse_sql_payload(&json!({"query": "SELECT 1"}), SqlDialect::DuckDb).is_err());
    }

    #[test]
    fn test_bare_string_payload() {
        let native = parse_sql_payload(&json!("SELECT 1"), SqlDialect::DuckDb).unwrap();
        assert!(native.params.is_empty());
        let err = parse_sql_payload(&json!("DROP TABLE metrics"), SqlDialect::DuckDb).unwrap_err();
        assert!(matches!(err, Error::UnsafeNativeQuery(_)));
    }

    #[test]
    fn test_document_payloads() {
        let q = parse_document_payload(&json!({"pipeline": [{"$match": {"attributes.category": "A"}}]})).unwrap();
        assert!(matches!(q, NativeDocumentQuery::Aggregate { ref pipeline } if pipeline.len() == 1));

        let q = parse_document_payload(&json!({"filter": {"values.metric": {"$gt": 1}}, "limit": 5})).unwrap();
        assert!(matches!(q, NativeDocumentQuery::Find { limit: Some(5), .. }));
    }

    #[test]
    fn test_document_writes_are_rejected() {
        let err = parse_document_payload(&json!({"operation": "delete_many", "filter": {}})).unwrap_err();
        assert!(matches!(err, Error::UnsafeNativeQuery(_)));
        let err = parse_document_payload(&json!({"pipeline": [{"$match": {}}, {"$out": "copy"}]})).unwrap_err();
        assert!(matches!(err, Error::UnsafeNativeQuery(_)));
        let err = parse_document_payload(&json!({"operation": "mapReduce"})).unwrap_err();
        assert!(matches!(err, Error::TranslationRejected(_)));
        let err = parse_document_payload(&json!("DROP TABLE metrics")).unwrap_err();
        assert!(matches!(err, Error::UnsafeNativeQuery(_)));
    }
}
