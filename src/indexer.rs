use ckb_types::core::{BlockNumber, BlockView};
use ckb_types::packed::{Byte32, OutPoint, Script};
use ckb_types::prelude::*;
use log::warn;
use thiserror::Error;

use crate::codec;
use crate::store::{value_tuples, Connection, Queries, SqlValue, StoreError, Transaction};

pub type TxIndex = u32;
pub type OutputIndex = u32;
pub type IOIndex = u32;

/// Classification stored in `transactions_scripts.script_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Lock = 0,
    Type = 1,
}

/// Classification stored in `transactions_scripts.io_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOType {
    Input = 0,
    Output = 1,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("insert into {0} did not yield an id")]
    IdMissing(&'static str),
}

const INSERT_TX_SCRIPT: &str = "INSERT INTO transactions_scripts \
     (transaction_digest_id, script_type, io_type, io_index, script_id) \
     VALUES (?, ?, ?, ?, ?)";

const INPUT_INSERT_CHUNK: usize = 500;

/// The chain follower's write half. Owns the single write connection;
/// every mutating operation runs inside one store transaction, so either a
/// whole block is visible or none of it is.
pub struct Indexer<C> {
    conn: C,
    keep_num: u64,
    prune_interval: u64,
}

impl<C> Indexer<C> {
    pub fn new(conn: C, keep_num: u64, prune_interval: u64) -> Self {
        Self {
            conn,
            keep_num,
            prune_interval,
        }
    }
}

impl<C> Indexer<C>
where
    C: Connection,
{
    /// The highest retained block, or `None` for an empty store.
    pub fn tip(&mut self) -> Result<Option<(BlockNumber, Byte32)>, Error> {
        let rows = self.conn.query(
            "SELECT block_number, block_hash FROM block_digests \
             ORDER BY block_number DESC LIMIT 1",
            &[],
        )?;
        match rows.first() {
            None => Ok(None),
            Some(row) => {
                let number = row.i64(0)? as u64;
                let hash = byte32(row.blob(1)?)?;
                Ok(Some((number, hash)))
            }
        }
    }

    pub fn append(&mut self, block: &BlockView) -> Result<(), Error> {
        let block_number = block.number();
        // the epoch triple packs into the low 7 bytes, stored big-endian
        let epoch_full = block.epoch().full_value().to_be_bytes();
        let epoch = &epoch_full[1..];
        let mut txn = self.conn.transaction()?;
        txn.execute(
            "INSERT INTO block_digests (block_number, block_hash, epoch, dao, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
            &[
                block_number.into(),
                block.hash().as_slice().into(),
                epoch.into(),
                block.header().dao().as_slice().into(),
                block.timestamp().into(),
            ],
        )?;

        for (tx_index, tx) in block.transactions().iter().enumerate() {
            let tx_index = tx_index as TxIndex;
            let tx_hash = tx.hash();
            let digest_id = insert_digest(
                &mut txn,
                &tx_hash,
                tx_index,
                tx.outputs().len() as u32,
                block_number,
            )?;

            let previous: Vec<OutPoint> = tx
                .inputs()
                .into_iter()
                .map(|input| input.previous_output())
                .collect();

            // Cellbase inputs are synthetic and consume nothing, but their
            // rows are still recorded below for rollback bookkeeping.
            if tx_index > 0 {
                for (input_index, out_point) in previous.iter().enumerate() {
                    consume_cell(&mut txn, digest_id, input_index as IOIndex, out_point)?;
                }
            }

            insert_inputs(&mut txn, digest_id, &previous)?;

            for (output_index, output) in tx.outputs().into_iter().enumerate() {
                let output_data = tx
                    .outputs_data()
                    .get(output_index)
                    .expect("outputs_data len should equals outputs len")
                    .raw_data();
                let output_index = output_index as OutputIndex;
                let lock_script_id = ensure_script(&mut txn, &output.lock())?;
                let type_script_id = match output.type_().to_opt() {
                    Some(script) => Some(ensure_script(&mut txn, &script)?),
                    None => None,
                };
                let capacity: u64 = output.capacity().unpack();
                txn.execute(
                    "INSERT INTO cells (consumed, tx_hash, output_index, block_number, \
                     tx_index, capacity, data, udt_amount, lock_script_id, type_script_id) \
                     VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        tx_hash.as_slice().into(),
                        output_index.into(),
                        block_number.into(),
                        tx_index.into(),
                        capacity.into(),
                        output_data.as_ref().into(),
                        codec::data_le_to_decimal(&output_data).into(),
                        lock_script_id.into(),
                        type_script_id.into(),
                    ],
                )?;
                txn.execute(
                    INSERT_TX_SCRIPT,
                    &[
                        digest_id.into(),
                        (ScriptType::Lock as i64).into(),
                        (IOType::Output as i64).into(),
                        output_index.into(),
                        lock_script_id.into(),
                    ],
                )?;
                if let Some(type_script_id) = type_script_id {
                    txn.execute(
                        INSERT_TX_SCRIPT,
                        &[
                            digest_id.into(),
                            (ScriptType::Type as i64).into(),
                            (IOType::Output as i64).into(),
                            output_index.into(),
                            type_script_id.into(),
                        ],
                    )?;
                }
            }
        }
        txn.commit()?;

        if block_number % self.prune_interval == 0 {
            self.prune()?;
        }
        Ok(())
    }

    /// Undoes exactly the current tip block. Deeper reorganizations unwind
    /// one block per poll cycle.
    pub fn rollback(&mut self) -> Result<(), Error> {
        if let Some((block_number, _block_hash)) = self.tip()? {
            let mut txn = self.conn.transaction()?;
            let digests = txn.query(
                "SELECT id, tx_index FROM transaction_digests \
                 WHERE block_number = ? ORDER BY tx_index DESC",
                &[block_number.into()],
            )?;
            for digest in &digests {
                let digest_id = digest.i64(0)?;
                if digest.i64(1)? > 0 {
                    let inputs = txn.query(
                        "SELECT previous_tx_hash, previous_index FROM transaction_inputs \
                         WHERE transaction_digest_id = ? ORDER BY input_index",
                        &[digest_id.into()],
                    )?;
                    for input in &inputs {
                        txn.execute(
                            "UPDATE cells SET consumed = 0 \
                             WHERE tx_hash = ? AND output_index = ?",
                            &[input.blob(0)?.into(), input.i64(1)?.into()],
                        )?;
                    }
                }
            }
            txn.execute(
                "DELETE FROM transaction_inputs WHERE transaction_digest_id IN \
                 (SELECT id FROM transaction_digests WHERE block_number = ?)",
                &[block_number.into()],
            )?;
            txn.execute(
                "DELETE FROM transactions_scripts WHERE transaction_digest_id IN \
                 (SELECT id FROM transaction_digests WHERE block_number = ?)",
                &[block_number.into()],
            )?;
            txn.execute(
                "DELETE FROM cells WHERE block_number = ?",
                &[block_number.into()],
            )?;
            txn.execute(
                "DELETE FROM transaction_digests WHERE block_number = ?",
                &[block_number.into()],
            )?;
            txn.execute(
                "DELETE FROM block_digests WHERE block_number = ?",
                &[block_number.into()],
            )?;
            txn.commit()?;
        }
        Ok(())
    }

    /// Drops consumed cells and input rows from blocks below
    /// `tip - keep_num`. Block and transaction digests and the
    /// script associations stay queryable.
    pub fn prune(&mut self) -> Result<(), Error> {
        let tip_number = match self.tip()? {
            Some((number, _)) => number,
            None => return Ok(()),
        };
        if tip_number > self.keep_num {
            let prune_below = tip_number - self.keep_num;
            let mut txn = self.conn.transaction()?;
            txn.execute(
                "DELETE FROM cells WHERE consumed = 1 AND block_number < ?",
                &[prune_below.into()],
            )?;
            txn.execute(
                "DELETE FROM transaction_inputs WHERE transaction_digest_id IN \
                 (SELECT id FROM transaction_digests WHERE block_number < ?)",
                &[prune_below.into()],
            )?;
            txn.commit()?;
        }
        Ok(())
    }
}

pub(crate) fn byte32(bytes: &[u8]) -> Result<Byte32, StoreError> {
    Byte32::from_slice(bytes)
        .map_err(|_| StoreError::Decode(format!("expected 32-byte hash, got {} bytes", bytes.len())))
}

fn insert_digest<Q: Queries>(
    txn: &mut Q,
    tx_hash: &Byte32,
    tx_index: TxIndex,
    output_count: u32,
    block_number: BlockNumber,
) -> Result<i64, Error> {
    let inserted = txn.insert(
        "INSERT INTO transaction_digests (tx_hash, tx_index, output_count, block_number) \
         VALUES (?, ?, ?, ?)",
        &[
            tx_hash.as_slice().into(),
            tx_index.into(),
            output_count.into(),
            block_number.into(),
        ],
    )?;
    if let Some(id) = inserted {
        return Ok(id);
    }
    let rows = txn.query(
        "SELECT id FROM transaction_digests WHERE block_number = ? AND tx_index = ?",
        &[block_number.into(), tx_index.into()],
    )?;
    match rows.first() {
        Some(row) => Ok(row.i64(0)?),
        None => Err(Error::IdMissing("transaction_digests")),
    }
}

fn consume_cell<Q: Queries>(
    txn: &mut Q,
    digest_id: i64,
    input_index: IOIndex,
    out_point: &OutPoint,
) -> Result<(), Error> {
    let previous_index: u32 = out_point.index().unpack();
    let rows = txn.query(
        "SELECT id, lock_script_id, type_script_id FROM cells \
         WHERE tx_hash = ? AND output_index = ?",
        &[
            out_point.tx_hash().as_slice().into(),
            previous_index.into(),
        ],
    )?;
    let row = match rows.first() {
        Some(row) => row,
        None => {
            // Legal only when pruning already removed the cell; a live
            // append hitting this is an upstream inconsistency.
            warn!(
                "input references unknown cell {}:{}",
                out_point.tx_hash(),
                previous_index
            );
            return Ok(());
        }
    };
    txn.execute(
        "UPDATE cells SET consumed = 1 WHERE id = ?",
        &[row.i64(0)?.into()],
    )?;
    txn.execute(
        INSERT_TX_SCRIPT,
        &[
            digest_id.into(),
            (ScriptType::Lock as i64).into(),
            (IOType::Input as i64).into(),
            input_index.into(),
            row.i64(1)?.into(),
        ],
    )?;
    if let Some(type_script_id) = row.opt_i64(2)? {
        txn.execute(
            INSERT_TX_SCRIPT,
            &[
                digest_id.into(),
                (ScriptType::Type as i64).into(),
                (IOType::Input as i64).into(),
                input_index.into(),
                type_script_id.into(),
            ],
        )?;
    }
    Ok(())
}

fn insert_inputs<Q: Queries>(
    txn: &mut Q,
    digest_id: i64,
    previous: &[OutPoint],
) -> Result<(), Error> {
    if previous.is_empty() {
        return Ok(());
    }
    let indexed: Vec<(u64, &OutPoint)> = previous
        .iter()
        .enumerate()
        .map(|(idx, out_point)| (idx as u64, out_point))
        .collect();
    for chunk in indexed.chunks(INPUT_INSERT_CHUNK) {
        let sql = format!(
            "INSERT INTO transaction_inputs \
             (transaction_digest_id, previous_tx_hash, previous_index, input_index) VALUES {}",
            value_tuples(4, chunk.len())
        );
        let mut params = Vec::with_capacity(chunk.len() * 4);
        for (input_index, out_point) in chunk {
            let previous_index: u32 = out_point.index().unpack();
            params.push(digest_id.into());
            params.push(out_point.tx_hash().as_slice().into());
            params.push(previous_index.into());
            params.push((*input_index).into());
        }
        txn.execute(&sql, &params)?;
    }
    Ok(())
}

/// Interns a script row by its natural key and returns the stable id.
/// The script hash is derived once on first insertion and cached in the row.
pub(crate) fn ensure_script<Q: Queries>(txn: &mut Q, script: &Script) -> Result<i64, Error> {
    let code_hash = script.code_hash();
    let hash_type = i64::from(script.hash_type().as_slice()[0]);
    let args = script.args().raw_data();
    let key_params = [
        SqlValue::from(code_hash.as_slice()),
        SqlValue::Int(hash_type),
        SqlValue::from(args.as_ref()),
    ];
    let rows = txn.query(
        "SELECT id FROM scripts WHERE code_hash = ? AND hash_type = ? AND args = ?",
        &key_params,
    )?;
    if let Some(row) = rows.first() {
        return Ok(row.i64(0)?);
    }
    let script_hash = script.calc_script_hash();
    let inserted = txn.insert(
        "INSERT INTO scripts (code_hash, hash_type, args, script_hash) VALUES (?, ?, ?, ?)",
        &[
            code_hash.as_slice().into(),
            SqlValue::Int(hash_type),
            args.as_ref().into(),
            script_hash.as_slice().into(),
        ],
    )?;
    if let Some(id) = inserted {
        return Ok(id);
    }
    let rows = txn.query(
        "SELECT id FROM scripts WHERE code_hash = ? AND hash_type = ? AND args = ?",
        &key_params,
    )?;
    match rows.first() {
        Some(row) => Ok(row.i64(0)?),
        None => Err(Error::IdMissing("scripts")),
    }
}
