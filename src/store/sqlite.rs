use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;

use super::{Connection, Queries, Row, SqlValue, Store, StoreError, Transaction};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS block_digests (
    block_number INTEGER PRIMARY KEY,
    block_hash BLOB NOT NULL,
    epoch BLOB NOT NULL,
    dao BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS transaction_digests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_hash BLOB NOT NULL,
    tx_index INTEGER NOT NULL,
    output_count INTEGER NOT NULL,
    block_number INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS transaction_digests_position
    ON transaction_digests (block_number, tx_index);
CREATE UNIQUE INDEX IF NOT EXISTS transaction_digests_tx_hash
    ON transaction_digests (tx_hash);
CREATE TABLE IF NOT EXISTS transaction_inputs (
    transaction_digest_id INTEGER NOT NULL,
    previous_tx_hash BLOB NOT NULL,
    previous_index INTEGER NOT NULL,
    input_index INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS transaction_inputs_digest
    ON transaction_inputs (transaction_digest_id);
CREATE INDEX IF NOT EXISTS transaction_inputs_previous
    ON transaction_inputs (previous_tx_hash, previous_index);
CREATE TABLE IF NOT EXISTS scripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code_hash BLOB NOT NULL,
    hash_type INTEGER NOT NULL,
    args BLOB NOT NULL,
    script_hash BLOB NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS scripts_natural_key
    ON scripts (code_hash, hash_type, args);
CREATE TABLE IF NOT EXISTS cells (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    consumed INTEGER NOT NULL DEFAULT 0,
    tx_hash BLOB NOT NULL,
    output_index INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    tx_index INTEGER NOT NULL,
    capacity INTEGER NOT NULL,
    data BLOB NOT NULL,
    udt_amount TEXT NOT NULL,
    lock_script_id INTEGER NOT NULL,
    type_script_id INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS cells_out_point ON cells (tx_hash, output_index);
CREATE INDEX IF NOT EXISTS cells_live_scan
    ON cells (consumed, block_number, tx_index, output_index);
CREATE INDEX IF NOT EXISTS cells_lock_script ON cells (lock_script_id);
CREATE INDEX IF NOT EXISTS cells_type_script ON cells (type_script_id);
CREATE TABLE IF NOT EXISTS transactions_scripts (
    transaction_digest_id INTEGER NOT NULL,
    script_type INTEGER NOT NULL,
    io_type INTEGER NOT NULL,
    io_index INTEGER NOT NULL,
    script_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_scripts_script
    ON transactions_scripts (script_id, script_type, io_type);
"#;

/// SQLite-backed store. WAL journaling lets collectors read while the
/// indexer's write transaction is open.
#[derive(Clone)]
pub struct SqliteStore {
    path: Arc<PathBuf>,
}

impl SqliteStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }
}

impl Store for SqliteStore {
    type Conn = SqliteConnection;

    fn connection(&self) -> Result<SqliteConnection, StoreError> {
        let conn = rusqlite::Connection::open(self.path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        Ok(SqliteConnection { conn })
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

fn run_execute(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StoreError> {
    let affected = conn.execute(sql, rusqlite::params_from_iter(params))?;
    Ok(affected as u64)
}

fn run_insert(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Option<i64>, StoreError> {
    conn.execute(sql, rusqlite::params_from_iter(params))?;
    Ok(Some(conn.last_insert_rowid()))
}

fn run_query(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for idx in 0..columns {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(v) => SqlValue::Int(v),
                ValueRef::Text(v) => SqlValue::Text(
                    std::str::from_utf8(v)
                        .map_err(|e| StoreError::Decode(e.to_string()))?
                        .to_string(),
                ),
                ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
                ValueRef::Real(v) => {
                    return Err(StoreError::Decode(format!(
                        "unexpected real column value {}",
                        v
                    )))
                }
            };
            values.push(value);
        }
        out.push(Row(values));
    }
    Ok(out)
}

impl Queries for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        run_execute(&self.conn, sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError> {
        run_insert(&self.conn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        run_query(&self.conn, sql, params)
    }
}

impl Connection for SqliteConnection {
    type Txn<'a>
        = SqliteTransaction<'a>
    where
        Self: 'a;

    fn transaction(&mut self) -> Result<SqliteTransaction<'_>, StoreError> {
        Ok(SqliteTransaction {
            txn: self.conn.transaction()?,
        })
    }
}

pub struct SqliteTransaction<'a> {
    txn: rusqlite::Transaction<'a>,
}

impl Queries for SqliteTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        run_execute(&self.txn, sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError> {
        run_insert(&self.txn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        run_query(&self.txn, sql, params)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn commit(self) -> Result<(), StoreError> {
        self.txn.commit()?;
        Ok(())
    }
}
