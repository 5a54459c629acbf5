//! Downstream relational store: the tables that uploads are written into.
//!
//! The pipeline only sees the `RelationalStore` trait; `SqliteStore` is the
//! implementation used by the server, the CLI and the tests.

pub mod cache;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::ingest::RawValue;

pub use cache::StoreCache;
pub use sqlite::SqliteStore;

/// Role a column plays in the table's primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    Primary,
    None,
}

/// Live structure of one target column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
    pub key: KeyRole,
}

impl ColumnDescriptor {
    pub fn is_primary_key(&self) -> bool {
        self.key == KeyRole::Primary
    }
}

/// What a multi-row insert does when a row collides with a uniqueness constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
    /// Leave the existing row alone and drop the incoming one
    Ignore,
    /// Overwrite every column except `key_columns` with the incoming values.
    /// Non-empty `key_columns` must match a unique key of the table; empty
    /// means whichever constraint the row collides with.
    Update { key_columns: Vec<String> },
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Columns of `table` in declaration order. Unknown table is `NotFound`.
    async fn describe_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Column sets backed by the primary key or a full (non-partial) unique index
    async fn unique_keys(&self, table: &str) -> Result<Vec<Vec<String>>>;

    /// Insert `rows` (values ordered as `columns`) in one atomic unit.
    ///
    /// Returns the affected-row count in the conflict-aware convention:
    /// a fresh insert counts 1, an overwritten row counts 2, an ignored row 0.
    async fn execute_batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<RawValue>>,
        conflict: ConflictAction,
    ) -> Result<u64>;

    /// Run a read query with positional parameters
    async fn query(&self, sql: &str, params: Vec<RawValue>) -> Result<Vec<Vec<RawValue>>>;
}

/// Quote an identifier for SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
