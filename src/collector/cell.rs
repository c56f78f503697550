use std::collections::{HashMap, VecDeque};

use ckb_jsonrpc_types::{BlockNumber, CellOutput, JsonBytes, OutPoint};
use ckb_types::packed;
use ckb_types::prelude::*;
use ckb_types::{bytes::Bytes, H256};
use serde::Serialize;

use super::{script_id_subquery, validate_args_len, CollectorError, ValidationError};
use crate::indexer::byte32;
use crate::store::{Connection, Row, SqlValue, StoreError};

const DEFAULT_PAGE_SIZE: usize = 1000;

/// The `type` side of a cell query.
#[derive(Debug, Clone, Default)]
pub enum TypeFilter {
    /// No constraint on the type script.
    #[default]
    Any,
    /// Only cells without a type script.
    Empty,
    /// Only cells whose type script matches the filter.
    Script(packed::Script),
}

/// Matching against the cell's data bytes.
#[derive(Debug, Clone)]
pub enum DataFilter {
    Any,
    Exact(Bytes),
}

impl Default for DataFilter {
    /// The conventional default matches cells carrying no data; pass
    /// [`DataFilter::Any`] to disable data matching.
    fn default() -> Self {
        DataFilter::Exact(Bytes::new())
    }
}

#[derive(Debug, Clone)]
pub struct CellQuery {
    pub lock: Option<packed::Script>,
    pub type_: TypeFilter,
    pub args_len: i32,
    pub data: DataFilter,
}

impl Default for CellQuery {
    fn default() -> Self {
        Self {
            lock: None,
            type_: TypeFilter::Any,
            args_len: -1,
            data: DataFilter::default(),
        }
    }
}

/// A live cell materialized for callers, hex-encoded throughout.
#[derive(Debug, Clone, Serialize)]
pub struct LiveCell {
    pub cell_output: CellOutput,
    pub out_point: OutPoint,
    pub block_hash: H256,
    pub block_number: BlockNumber,
    pub data: JsonBytes,
}

/// Compiles a cell filter into one ordered scan over live cells.
pub struct CellCollector<C> {
    conn: C,
    query: CellQuery,
    page_size: usize,
}

impl<C: Connection> CellCollector<C> {
    pub fn new(conn: C, query: CellQuery) -> Result<Self, ValidationError> {
        let mut filters: Vec<&packed::Script> = Vec::new();
        if let Some(lock) = &query.lock {
            filters.push(lock);
        }
        match &query.type_ {
            TypeFilter::Script(script) => filters.push(script),
            TypeFilter::Empty => {}
            TypeFilter::Any => {
                if query.lock.is_none() {
                    return Err(ValidationError::MissingFilter);
                }
            }
        }
        validate_args_len(query.args_len, &filters)?;
        Ok(Self {
            conn,
            query,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Rows fetched per round trip while iterating.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The number of matching live cells, without ordering.
    pub fn count(&mut self) -> Result<u64, CollectorError> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT count(*) FROM cells c WHERE c.consumed = 0{}",
            filter_clauses(&self.query, &mut params)
        );
        let rows = self.conn.query(&sql, &params)?;
        match rows.first() {
            Some(row) => Ok(row.i64(0)? as u64),
            None => Ok(0),
        }
    }

    /// A lazy, non-restartable sequence of matching live cells in
    /// `(block_number, tx_index, output_index)` order.
    pub fn cells(self) -> LiveCellIter<C> {
        LiveCellIter {
            conn: self.conn,
            query: self.query,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            scripts: HashMap::new(),
        }
    }
}

fn filter_clauses(query: &CellQuery, params: &mut Vec<SqlValue>) -> String {
    let mut sql = String::new();
    if let Some(lock) = &query.lock {
        sql.push_str(" AND c.lock_script_id IN (");
        sql.push_str(&script_id_subquery(lock, query.args_len, params));
        sql.push(')');
    }
    match &query.type_ {
        TypeFilter::Any => {}
        TypeFilter::Empty => sql.push_str(" AND c.type_script_id IS NULL"),
        TypeFilter::Script(script) => {
            sql.push_str(" AND c.type_script_id IN (");
            sql.push_str(&script_id_subquery(script, query.args_len, params));
            sql.push(')');
        }
    }
    if let DataFilter::Exact(bytes) = &query.data {
        params.push(bytes.as_ref().into());
        sql.push_str(" AND c.data = ?");
    }
    sql
}

pub struct LiveCellIter<C> {
    conn: C,
    query: CellQuery,
    page_size: usize,
    buffer: VecDeque<Row>,
    cursor: Option<(i64, i64, i64)>,
    exhausted: bool,
    scripts: HashMap<i64, packed::Script>,
}

impl<C: Connection> LiveCellIter<C> {
    fn fetch_page(&mut self) -> Result<(), CollectorError> {
        let mut params = Vec::new();
        let filters = filter_clauses(&self.query, &mut params);
        let mut sql = format!(
            "SELECT c.tx_hash, c.output_index, c.block_number, c.tx_index, c.capacity, \
             c.data, c.lock_script_id, c.type_script_id, b.block_hash \
             FROM cells c JOIN block_digests b ON b.block_number = c.block_number \
             WHERE c.consumed = 0{}",
            filters
        );
        if let Some((block_number, tx_index, output_index)) = self.cursor {
            sql.push_str(" AND (c.block_number, c.tx_index, c.output_index) > (?, ?, ?)");
            params.push(block_number.into());
            params.push(tx_index.into());
            params.push(output_index.into());
        }
        sql.push_str(&format!(
            " ORDER BY c.block_number ASC, c.tx_index ASC, c.output_index ASC LIMIT {}",
            self.page_size
        ));
        let rows = self.conn.query(&sql, &params)?;
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = Some((last.i64(2)?, last.i64(3)?, last.i64(1)?));
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

impl<C: Connection> Iterator for LiveCellIter<C> {
    type Item = Result<LiveCell, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(error) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(error));
            }
        }
        let row = self.buffer.pop_front()?;
        Some(materialize_row(&mut self.conn, &mut self.scripts, &row))
    }
}

fn materialize_row<C: Connection>(
    conn: &mut C,
    cache: &mut HashMap<i64, packed::Script>,
    row: &Row,
) -> Result<LiveCell, CollectorError> {
    let tx_hash = byte32(row.blob(0)?)?;
    let output_index = row.i64(1)? as u32;
    let block_number = row.i64(2)? as u64;
    let capacity = row.i64(4)? as u64;
    let data = row.blob(5)?.to_vec();
    let lock = load_script(conn, cache, row.i64(6)?)?;
    let type_ = match row.opt_i64(7)? {
        Some(id) => Some(load_script(conn, cache, id)?),
        None => None,
    };
    let block_hash: H256 = byte32(row.blob(8)?)?.unpack();
    let cell_output = packed::CellOutput::new_builder()
        .capacity(capacity.pack())
        .lock(lock)
        .type_(type_.pack())
        .build();
    Ok(LiveCell {
        cell_output: cell_output.into(),
        out_point: packed::OutPoint::new(tx_hash, output_index).into(),
        block_hash,
        block_number: block_number.into(),
        data: JsonBytes::from_vec(data),
    })
}

fn load_script<C: Connection>(
    conn: &mut C,
    cache: &mut HashMap<i64, packed::Script>,
    id: i64,
) -> Result<packed::Script, CollectorError> {
    if let Some(script) = cache.get(&id) {
        return Ok(script.clone());
    }
    let rows = conn.query(
        "SELECT code_hash, hash_type, args FROM scripts WHERE id = ?",
        &[id.into()],
    )?;
    let row = rows
        .first()
        .ok_or_else(|| StoreError::Decode(format!("script {} is referenced but missing", id)))?;
    let script = packed::Script::new_builder()
        .code_hash(byte32(row.blob(0)?)?)
        .hash_type(packed::Byte::new(row.i64(1)? as u8))
        .args(row.blob(2)?.pack())
        .build();
    cache.insert(id, script.clone());
    Ok(script)
}

/// Looks up one live cell by out-point, materialized the same way the
/// iterator does.
pub fn cell_by_out_point<C: Connection>(
    conn: &mut C,
    out_point: &packed::OutPoint,
) -> Result<Option<LiveCell>, CollectorError> {
    let previous_index: u32 = out_point.index().unpack();
    let rows = conn.query(
        "SELECT c.tx_hash, c.output_index, c.block_number, c.tx_index, c.capacity, \
         c.data, c.lock_script_id, c.type_script_id, b.block_hash \
         FROM cells c JOIN block_digests b ON b.block_number = c.block_number \
         WHERE c.consumed = 0 AND c.tx_hash = ? AND c.output_index = ?",
        &[
            out_point.tx_hash().as_slice().into(),
            previous_index.into(),
        ],
    )?;
    let row = match rows.first() {
        Some(row) => row.clone(),
        None => return Ok(None),
    };
    let mut cache = HashMap::new();
    materialize_row(conn, &mut cache, &row).map(Some)
}
