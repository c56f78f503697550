mod postgres;
mod sqlite;

pub use self::postgres::PgStore;
pub use self::sqlite::SqliteStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("unexpected row shape: {0}")]
    Decode(String),
}

/// A single bound SQL parameter. Statements are written with `?`
/// placeholders; each backend maps them to its native syntax and types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        v.map_or(SqlValue::Null, SqlValue::Int)
    }
}

/// One fetched row, decoded into backend-neutral values in column order.
#[derive(Debug, Clone)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn i64(&self, idx: usize) -> Result<i64, StoreError> {
        match self.0.get(idx) {
            Some(SqlValue::Int(v)) => Ok(*v),
            other => Err(StoreError::Decode(format!(
                "column {} is not an integer: {:?}",
                idx, other
            ))),
        }
    }

    pub fn opt_i64(&self, idx: usize) -> Result<Option<i64>, StoreError> {
        match self.0.get(idx) {
            Some(SqlValue::Null) => Ok(None),
            Some(SqlValue::Int(v)) => Ok(Some(*v)),
            other => Err(StoreError::Decode(format!(
                "column {} is not a nullable integer: {:?}",
                idx, other
            ))),
        }
    }

    pub fn blob(&self, idx: usize) -> Result<&[u8], StoreError> {
        match self.0.get(idx) {
            Some(SqlValue::Blob(v)) => Ok(v),
            other => Err(StoreError::Decode(format!(
                "column {} is not a blob: {:?}",
                idx, other
            ))),
        }
    }

    pub fn text(&self, idx: usize) -> Result<&str, StoreError> {
        match self.0.get(idx) {
            Some(SqlValue::Text(v)) => Ok(v),
            other => Err(StoreError::Decode(format!(
                "column {} is not text: {:?}",
                idx, other
            ))),
        }
    }
}

/// Statement execution shared by connections and open transactions.
pub trait Queries {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError>;

    /// Runs an `INSERT` against a table with a generated `id` column and
    /// reports the new id. PostgreSQL appends `RETURNING id`; SQLite reads
    /// the last inserted rowid. `None` means the backend could not report
    /// one, in which case the caller re-selects by natural key.
    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError>;
}

pub trait Transaction: Queries {
    /// Dropping an uncommitted transaction rolls it back.
    fn commit(self) -> Result<(), StoreError>;
}

pub trait Connection: Queries + Send {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn transaction(&mut self) -> Result<Self::Txn<'_>, StoreError>;
}

/// A handle to one database. Opening is cheap; every caller that needs to
/// read or write asks for its own connection, which keeps the single writer
/// (the indexer) and any number of collectors isolated from each other.
pub trait Store: Clone + Send + Sync + 'static {
    type Conn: Connection + 'static;

    fn connection(&self) -> Result<Self::Conn, StoreError>;

    /// Creates the schema when it does not exist yet. Idempotent.
    fn init(&self) -> Result<(), StoreError>;
}

/// `(?, ?, …)` value tuples for a multi-row insert.
pub(crate) fn value_tuples(columns: usize, rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; columns].join(", "));
    vec![tuple; rows].join(", ")
}
