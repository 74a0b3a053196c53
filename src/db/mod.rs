//! Header-indexed table store.
//!
//! Every table has a header row (ordered column names) and rows addressed by
//! a key column. Rows carry a store-managed `version` used for optimistic
//! concurrency: writers that derived their fields from an earlier read pass
//! `Precondition::Version(n)` and get `StoreError::Conflict` if someone else
//! wrote the row in between.

pub mod memory;
pub mod postgres;
pub mod schema;

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

pub use memory::MemoryTableStore;
pub use postgres::PgTableStore;

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run the store migrations embedded in ./migrations/
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Column name → cell value. Cells are always text; empty means unset.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("write conflict on {table} key '{key}'")]
    Conflict { table: String, key: String },

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How a key value is compared against the key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// trim + lowercase
    Email,
    /// trim + uppercase
    Slug,
    /// trim only
    Plain,
}

impl KeyKind {
    pub fn normalize(self, value: &str) -> String {
        let trimmed = value.trim();
        match self {
            KeyKind::Email => trimmed.to_lowercase(),
            KeyKind::Slug => trimmed.to_uppercase(),
            KeyKind::Plain => trimmed.to_string(),
        }
    }
}

/// A key column plus the value to look up in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub column: String,
    pub value: String,
    pub kind: KeyKind,
}

impl Key {
    pub fn email(column: &str, value: &str) -> Self {
        Self::new(column, value, KeyKind::Email)
    }

    pub fn slug(column: &str, value: &str) -> Self {
        Self::new(column, value, KeyKind::Slug)
    }

    pub fn plain(column: &str, value: &str) -> Self {
        Self::new(column, value, KeyKind::Plain)
    }

    fn new(column: &str, value: &str, kind: KeyKind) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
            kind,
        }
    }

    pub fn normalized(&self) -> String {
        self.kind.normalize(&self.value)
    }

    /// Same column and comparison, different value.
    pub fn with_value(&self, value: &str) -> Self {
        Self::new(&self.column, value, self.kind)
    }

    /// Whether a stored cell matches this key.
    pub fn matches(&self, cell: &str) -> bool {
        self.kind.normalize(cell) == self.normalized()
    }
}

/// Write precondition checked atomically with the write itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Merge blindly (or insert when missing).
    Any,
    /// Insert only; fails if a row with this key exists.
    Absent,
    /// The existing row must still be at this version.
    Version(i64),
}

/// One stored row, materialized against the current header.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub version: i64,
    pub fields: Fields,
}

impl Row {
    /// Cell value, or "" when the column is unset or unknown.
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }
}

/// Storage contract shared by every backend.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Append `column` to the table header if absent. Creates the table when
    /// it does not exist yet.
    async fn ensure_column(&self, table: &str, column: &str) -> StoreResult<()>;

    /// Header row, in column order. Empty for unknown tables.
    async fn columns(&self, table: &str) -> StoreResult<Vec<String>>;

    /// First row (insertion order) whose key column matches `key`.
    async fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Row>>;

    /// Merge `fields` into the row matching `key`, or append a new row with
    /// every known column defaulted to empty.
    async fn upsert(
        &self,
        table: &str,
        key: &Key,
        fields: &Fields,
        precondition: Precondition,
    ) -> StoreResult<Row>;

    /// Move the row at `key`, which must still be at `version`, to
    /// `new_value` in the key column and merge `fields`. Both keys are held
    /// for the duration of the write. The returned `Conflict` names the key
    /// that clashed: the old one when the row changed, the new one when
    /// another row already holds it.
    async fn rekey(
        &self,
        table: &str,
        key: &Key,
        new_value: &str,
        fields: &Fields,
        version: i64,
    ) -> StoreResult<Row>;

    /// Unconditional append, for log-style tables.
    async fn append(&self, table: &str, fields: &Fields) -> StoreResult<Row>;

    /// All rows in insertion order.
    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Row>>;

    async fn ping(&self) -> StoreResult<()>;
}

/// Build a `Fields` map from `(column, value)` pairs.
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
