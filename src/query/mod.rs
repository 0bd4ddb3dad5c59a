//! Backend-agnostic query model.
//!
//! - [`QueryFilter`] selects tuples by attribute equality, value comparisons
//!   and time range, with ordering and a limit
//! - [`AggregationQuery`] groups filtered tuples and reduces their values
//! - [`DatabaseQuery`] wraps either a generic operation or a native payload
//!
//! [`eval`] holds the in-process evaluator that defines the reference
//! semantics of the model.

mod aggregation;
pub mod eval;
mod filter;
mod request;

pub use aggregation::{
    AggregateOp, AggregateRow, AggregationPlan, AggregationQuery, HavingClause, MeasureSpec,
};
pub use filter::{BareName, ComparisonOp, FieldRef, QueryFilter, SortOrder, TimeRange, ValueConditions};
pub use request::{DatabaseQuery, QueryOperation};
