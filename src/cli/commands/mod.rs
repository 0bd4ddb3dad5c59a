pub mod config;

pub use config::LoggingConfig;

use clap::Subcommand;

/// JSON arguments accept inline text or `@path` to read a file.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Check that the backend answers
    Health,
    /// Describe the bound table or collection
    Schema,
    /// Find tuples matching a filter
    Query {
        /// QueryFilter JSON
        #[arg(value_name = "FILTER")]
        filter: Option<String>,
    },
    /// Count tuples matching a filter
    Count {
        #[arg(value_name = "FILTER")]
        filter: Option<String>,
    },
    /// Distinct values of a field
    Distinct {
        /// attributes.<key>, values.<key>, timestamp, or a bare attribute key
        field: String,
        #[arg(value_name = "FILTER")]
        filter: Option<String>,
    },
    /// Grouped aggregation
    Aggregate {
        /// AggregationQuery JSON
        #[arg(value_name = "AGGREGATION")]
        aggregation: String,
    },
    /// Run a read-only native payload
    Native {
        /// {"sql": ..., "params": [...]} or a document payload
        #[arg(value_name = "PAYLOAD")]
        payload: String,
        /// Table or collection to run against
        #[arg(long)]
        target: Option<String>,
    },
    /// Show the backend plan for a DatabaseQuery without running it
    Explain {
        /// DatabaseQuery JSON
        #[arg(value_name = "QUERY")]
        query: String,
    },
    /// Insert one tuple (object) or a batch (array)
    Insert {
        #[arg(value_name = "METRICS")]
        metrics: String,
    },
    /// Merge attributes/values into a stored tuple
    Update {
        id: String,
        #[arg(value_name = "UPDATE")]
        update: String,
    },
    /// Delete one tuple by ID
    Delete { id: String },
    /// Delete every tuple matching a non-empty filter
    DeleteWhere {
        #[arg(value_name = "FILTER")]
        filter: String,
    },
    /// List collections of the document database
    Collections,
}
