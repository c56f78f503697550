use postgres::types::{ToSql, Type};
use postgres::{GenericClient, NoTls};

use super::{Connection, Queries, Row, SqlValue, Store, StoreError, Transaction};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS block_digests (
    block_number BIGINT PRIMARY KEY,
    block_hash BYTEA NOT NULL,
    epoch BYTEA NOT NULL,
    dao BYTEA NOT NULL,
    timestamp BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS transaction_digests (
    id BIGSERIAL PRIMARY KEY,
    tx_hash BYTEA NOT NULL,
    tx_index INTEGER NOT NULL,
    output_count INTEGER NOT NULL,
    block_number BIGINT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS transaction_digests_position
    ON transaction_digests (block_number, tx_index);
CREATE UNIQUE INDEX IF NOT EXISTS transaction_digests_tx_hash
    ON transaction_digests (tx_hash);
CREATE TABLE IF NOT EXISTS transaction_inputs (
    transaction_digest_id BIGINT NOT NULL,
    previous_tx_hash BYTEA NOT NULL,
    previous_index BIGINT NOT NULL,
    input_index BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS transaction_inputs_digest
    ON transaction_inputs (transaction_digest_id);
CREATE INDEX IF NOT EXISTS transaction_inputs_previous
    ON transaction_inputs (previous_tx_hash, previous_index);
CREATE TABLE IF NOT EXISTS scripts (
    id BIGSERIAL PRIMARY KEY,
    code_hash BYTEA NOT NULL,
    hash_type SMALLINT NOT NULL,
    args BYTEA NOT NULL,
    script_hash BYTEA NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS scripts_natural_key
    ON scripts (code_hash, hash_type, args);
CREATE TABLE IF NOT EXISTS cells (
    id BIGSERIAL PRIMARY KEY,
    consumed SMALLINT NOT NULL DEFAULT 0,
    tx_hash BYTEA NOT NULL,
    output_index BIGINT NOT NULL,
    block_number BIGINT NOT NULL,
    tx_index INTEGER NOT NULL,
    capacity BIGINT NOT NULL,
    data BYTEA NOT NULL,
    udt_amount TEXT NOT NULL,
    lock_script_id BIGINT NOT NULL,
    type_script_id BIGINT
);
CREATE UNIQUE INDEX IF NOT EXISTS cells_out_point ON cells (tx_hash, output_index);
CREATE INDEX IF NOT EXISTS cells_live_scan
    ON cells (consumed, block_number, tx_index, output_index);
CREATE INDEX IF NOT EXISTS cells_lock_script ON cells (lock_script_id);
CREATE INDEX IF NOT EXISTS cells_type_script ON cells (type_script_id);
CREATE TABLE IF NOT EXISTS transactions_scripts (
    transaction_digest_id BIGINT NOT NULL,
    script_type SMALLINT NOT NULL,
    io_type SMALLINT NOT NULL,
    io_index INTEGER NOT NULL,
    script_id BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_scripts_script
    ON transactions_scripts (script_id, script_type, io_type);
"#;

/// PostgreSQL-backed store. Connections are opened per caller from the
/// configured URL, e.g. `postgres://user@host:5432/indexer`.
#[derive(Clone)]
pub struct PgStore {
    url: String,
}

impl PgStore {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }
}

impl Store for PgStore {
    type Conn = PgConnection;

    fn connection(&self) -> Result<PgConnection, StoreError> {
        let client = postgres::Client::connect(&self.url, NoTls)?;
        Ok(PgConnection { client })
    }

    fn init(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        conn.client.batch_execute(SCHEMA)?;
        Ok(())
    }
}

pub struct PgConnection {
    client: postgres::Client,
}

/// Statements are written with `?` placeholders; PostgreSQL wants `$1…$n`.
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0u32;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Binds neutral values against the parameter types the server inferred for
/// the prepared statement, so integer widths line up.
fn bind_params(params: &[SqlValue], types: &[Type]) -> Vec<Box<dyn ToSql + Sync>> {
    let mut bound: Vec<Box<dyn ToSql + Sync>> = Vec::with_capacity(params.len());
    for (idx, value) in params.iter().enumerate() {
        let ty = types.get(idx).unwrap_or(&Type::INT8);
        let boxed: Box<dyn ToSql + Sync> = match value {
            SqlValue::Int(v) => {
                if *ty == Type::INT2 {
                    Box::new(*v as i16)
                } else if *ty == Type::INT4 {
                    Box::new(*v as i32)
                } else {
                    Box::new(*v)
                }
            }
            SqlValue::Text(v) => Box::new(v.clone()),
            SqlValue::Blob(v) => Box::new(v.clone()),
            SqlValue::Null => {
                if *ty == Type::INT2 {
                    Box::new(None::<i16>)
                } else if *ty == Type::INT4 {
                    Box::new(None::<i32>)
                } else if *ty == Type::BYTEA {
                    Box::new(None::<Vec<u8>>)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    Box::new(None::<String>)
                } else {
                    Box::new(None::<i64>)
                }
            }
        };
        bound.push(boxed);
    }
    bound
}

fn decode_rows(rows: Vec<postgres::Row>) -> Result<Vec<Row>, StoreError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.columns().len());
        for (idx, column) in row.columns().iter().enumerate() {
            let ty = column.type_();
            let value = if *ty == Type::INT2 {
                row.get::<_, Option<i16>>(idx)
                    .map_or(SqlValue::Null, |v| SqlValue::Int(v as i64))
            } else if *ty == Type::INT4 {
                row.get::<_, Option<i32>>(idx)
                    .map_or(SqlValue::Null, |v| SqlValue::Int(v as i64))
            } else if *ty == Type::INT8 {
                row.get::<_, Option<i64>>(idx)
                    .map_or(SqlValue::Null, SqlValue::Int)
            } else if *ty == Type::BYTEA {
                row.get::<_, Option<Vec<u8>>>(idx)
                    .map_or(SqlValue::Null, SqlValue::Blob)
            } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                row.get::<_, Option<String>>(idx)
                    .map_or(SqlValue::Null, SqlValue::Text)
            } else {
                return Err(StoreError::Decode(format!(
                    "unsupported column type {}",
                    ty
                )));
            };
            values.push(value);
        }
        out.push(Row(values));
    }
    Ok(out)
}

fn run_execute(
    client: &mut impl GenericClient,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, StoreError> {
    let stmt = client.prepare(&numbered_placeholders(sql))?;
    let bound = bind_params(params, stmt.params());
    let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
    Ok(client.execute(&stmt, &refs)?)
}

fn run_insert(
    client: &mut impl GenericClient,
    sql: &str,
    params: &[SqlValue],
) -> Result<Option<i64>, StoreError> {
    let sql = format!("{} RETURNING id", numbered_placeholders(sql));
    let stmt = client.prepare(&sql)?;
    let bound = bind_params(params, stmt.params());
    let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
    let rows = client.query(&stmt, &refs)?;
    Ok(rows.first().map(|row| row.get::<_, i64>(0)))
}

fn run_query(
    client: &mut impl GenericClient,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StoreError> {
    let stmt = client.prepare(&numbered_placeholders(sql))?;
    let bound = bind_params(params, stmt.params());
    let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|b| b.as_ref()).collect();
    decode_rows(client.query(&stmt, &refs)?)
}

impl Queries for PgConnection {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        run_execute(&mut self.client, sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError> {
        run_insert(&mut self.client, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        run_query(&mut self.client, sql, params)
    }
}

impl Connection for PgConnection {
    type Txn<'a>
        = PgTransaction<'a>
    where
        Self: 'a;

    fn transaction(&mut self) -> Result<PgTransaction<'_>, StoreError> {
        Ok(PgTransaction {
            txn: self.client.transaction()?,
        })
    }
}

pub struct PgTransaction<'a> {
    txn: postgres::Transaction<'a>,
}

impl Queries for PgTransaction<'_> {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        run_execute(&mut self.txn, sql, params)
    }

    fn insert(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<i64>, StoreError> {
        run_insert(&mut self.txn, sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        run_query(&mut self.txn, sql, params)
    }
}

impl Transaction for PgTransaction<'_> {
    fn commit(self) -> Result<(), StoreError> {
        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_numbering() {
        assert_eq!(numbered_placeholders("SELECT 1"), "SELECT 1");
        assert_eq!(
            numbered_placeholders("INSERT INTO t (a, b) VALUES (?, ?)"),
            "INSERT INTO t (a, b) VALUES ($1, $2)"
        );
        assert_eq!(
            numbered_placeholders("a = ? AND b IN (?, ?, ?)"),
            "a = $1 AND b IN ($2, $3, $4)"
        );
    }
}
