//! Helpers for reading Arrow record batches returned by DuckDB and ADBC.

use crate::error::{Error, Result};
use crate::storage::Row;
use arrow::array::{Array, ArrayRef, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow_json::writer::JsonArray;
use arrow_json::WriterBuilder;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Helper functions for working with RecordBatches
pub trait RecordBatchExt {
    /// Get a column by name with proper error handling
    fn get_column(&self, name: &str) -> Result<&ArrayRef>;

    /// Column cast to Utf8.
    fn string_column(&self, name: &str) -> Result<StringArray>;

    /// Column cast to Int64.
    fn i64_column(&self, name: &str) -> Result<Int64Array>;
}

impl RecordBatchExt for RecordBatch {
    fn get_column(&self, name: &str) -> Result<&ArrayRef> {
        self.column_by_name(name)
            .ok_or_else(|| Error::InvalidData(format!("Column {} not found", name)))
    }

    fn string_column(&self, name: &str) -> Result<StringArray> {
        let col = cast_column(self.get_column(name)?, &DataType::Utf8)?;
        col.as_any()
            .downcast_ref::<StringArray>()
            .cloned()
            .ok_or_else(|| Error::InvalidData(format!("Column {} is not a string column", name)))
    }

    fn i64_column(&self, name: &str) -> Result<Int64Array> {
        let col = cast_column(self.get_column(name)?, &DataType::Int64)?;
        col.as_any()
            .downcast_ref::<Int64Array>()
            .cloned()
            .ok_or_else(|| Error::InvalidData(format!("Column {} is not an integer column", name)))
    }
}

fn cast_column(col: &ArrayRef, to: &DataType) -> Result<ArrayRef> {
    if col.data_type() == to {
        Ok(Arc::clone(col))
    } else {
        Ok(cast(col.as_ref(), to)?)
    }
}

/// Convert Arrow record batches to JSON objects, one per row, keeping nulls.
pub fn record_batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let non_empty: Vec<&RecordBatch> = batches.iter().filter(|b| b.num_rows() > 0).collect();
    if non_empty.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = WriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, JsonArray>(Vec::new());
    writer.write_batches(&non_empty)?;
    writer.finish()?;
    let buf = writer.into_inner();

    let parsed: Vec<JsonValue> = serde_json::from_slice(&buf)?;
    parsed
        .into_iter()
        .map(|v| match v {
            JsonValue::Object(map) => Ok(map),
            other => Err(Error::InvalidData(format!(
                "expected a JSON object per row, got {}",
                other
            ))),
        })
        .collect()
}

/// Text value at `row`, `None` when null.
pub fn string_at(col: &StringArray, row: usize) -> Option<&str> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float64Array;
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("category", DataType::Utf8, true),
            Field::new("count_metric", DataType::Int64, true),
            Field::new("avg_metric", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), None])),
                Arc::new(Int64Array::from(vec![Some(2), None])),
                Arc::new(Float64Array::from(vec![Some(15.0), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rows_keep_nulls() {
        let rows = record_batches_to_rows(&[batch()]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["category"], json!("A"));
        assert_eq!(rows[0]["count_metric"], json!(2));
        assert_eq!(rows[0]["avg_metric"], json!(15.0));
        assert_eq!(rows[1]["category"], JsonValue::Null);
        assert_eq!(rows[1]["avg_metric"], JsonValue::Null);
    }

    #[test]
    fn test_empty_input() {
        assert!(record_batches_to_rows(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_typed_columns() {
        let b = batch();
        assert!(b.get_column("missing").is_err());
        let counts = b.i64_column("count_metric").unwrap();
        assert_eq!(counts.value(0), 2);
        let categories = b.string_column("category").unwrap();
        assert_eq!(string_at(&categories, 0), Some("A"));
        assert_eq!(string_at(&categories, 1), None);
    }
}
