//! Configuration management for metricsdb.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/metricsdb/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `METRICSDB_`, `__` between sections)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! Backend credentials are only read from the environment:
//! - `METRICSDB_ENGINE_USERNAME` - document/relational backend username
//! - `METRICSDB_ENGINE_PASSWORD` - document/relational backend password

use crate::error::Result;
use crate::storage::collections::CollectionMapping;
use crate::storage::{BackendKind, Credentials};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Command-line overrides shared by every subcommand.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend: embedded, document or relational
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Database path (embedded) or URI (document, relational)
    #[arg(long, global = true)]
    pub connection: Option<String>,

    /// Open the backend read-only
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Collection (document) or table (embedded, relational) to bind
    #[arg(long, global = true)]
    pub collection: Option<String>,
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Backend selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default)]
    pub read_only: bool,
    /// Maximum pooled connections (document, relational)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Connect and server-selection timeout (document)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub embedded: EmbeddedConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            read_only: false,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            embedded: EmbeddedConfig::default(),
            document: DocumentConfig::default(),
            relational: RelationalConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// An embedded configuration for the given DuckDB path.
    pub fn embedded(path: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded: EmbeddedConfig {
                path: path.into(),
                ..EmbeddedConfig::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// DuckDB file, or `:memory:`
    #[serde(default = "default_embedded_path")]
    pub path: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: default_embedded_path(),
            table: default_table(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_document_uri")]
    pub uri: String,
    #[serde(default = "default_document_database")]
    pub database: String,
    #[serde(default = "default_table")]
    pub collection: String,
    /// Structured collection layouts, in addition to the built-ins.
    #[serde(default)]
    pub collections: Vec<CollectionMapping>,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            uri: default_document_uri(),
            database: default_document_database(),
            collection: default_table(),
            collections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    #[serde(default = "default_relational_uri")]
    pub uri: String,
    /// Path of the PostgreSQL ADBC driver library
    #[serde(default = "default_driver_path")]
    pub driver_path: String,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            uri: default_relational_uri(),
            driver_path: default_driver_path(),
            table: default_table(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/metricsdb/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("METRICSDB")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_overrides(args)?;
        Ok(settings)
    }

    /// Command-line overrides; `--connection` and `--collection` apply to the
    /// selected backend.
    pub fn apply_overrides(&mut self, args: &ConfigArgs) -> Result<()> {
        let database = &mut self.database;
        if let Some(backend) = &args.backend {
            database.backend = backend.parse()?;
        }
        if args.read_only {
            database.read_only = true;
        }
        if let Some(connection) = &args.connection {
            match database.backend {
                BackendKind::Embedded => database.embedded.path = connection.clone(),
                BackendKind::Document => database.document.uri = connection.clone(),
                BackendKind::Relational => database.relational.uri = connection.clone(),
            }
        }
        if let Some(collection) = &args.collection {
            match database.backend {
                BackendKind::Embedded => database.embedded.table = collection.clone(),
                BackendKind::Document => database.document.collection = collection.clone(),
                BackendKind::Relational => database.relational.table = collection.clone(),
            }
        }
        Ok(())
    }
}

/// Get backend credentials from the environment
pub fn get_credentials() -> Option<Credentials> {
    let username = env::var("METRICSDB_ENGINE_USERNAME").ok();
    let password = env::var("METRICSDB_ENGINE_PASSWORD").ok();
    if username.is_none() && password.is_none() {
        return None;
    }
    Some(Credentials { username, password })
}

fn default_backend() -> BackendKind {
    BackendKind::Embedded
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_embedded_path() -> String {
    "./metrics.duckdb".to_string()
}

fn default_table() -> String {
    "metrics".to_string()
}

fn default_document_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_document_database() -> String {
    "metrics_db".to_string()
}

fn default_relational_uri() -> String {
    "postgresql://localhost:5432/metrics".to_string()
}

fn default_driver_path() -> String {
    "libadbc_driver_postgresql.so".to_string()
}
