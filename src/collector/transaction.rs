use std::collections::{HashSet, VecDeque};

use ckb_jsonrpc_types::TransactionView;
use ckb_types::packed::Script;
use ckb_types::prelude::*;
use ckb_types::H256;
use serde::Serialize;

use super::{script_id_subquery, validate_args_len, CollectorError, ValidationError};
use crate::client::{ChainRpc, TxStatus};
use crate::indexer::{byte32, IOType, ScriptType};
use crate::store::{Connection, SqlValue};

#[derive(Debug, Clone)]
pub struct TxQuery {
    pub input_lock: Option<Script>,
    pub output_lock: Option<Script>,
    pub input_type: Option<Script>,
    pub output_type: Option<Script>,
    pub args_len: i32,
    /// Drop hashes the node no longer returns instead of failing.
    pub skip_missing: bool,
    /// Attach the node's `tx_status` envelope to each yielded record.
    pub include_status: bool,
}

impl Default for TxQuery {
    fn default() -> Self {
        Self {
            input_lock: None,
            output_lock: None,
            input_type: None,
            output_type: None,
            args_len: -1,
            skip_missing: false,
            include_status: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TxRecord {
    pub transaction: TransactionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_status: Option<TxStatus>,
}

/// Intersects per-filter transaction sets from the `transactions_scripts`
/// index and fetches the surviving bodies over RPC.
pub struct TransactionCollector<C, R> {
    conn: C,
    rpc: R,
    query: TxQuery,
}

impl<C, R> TransactionCollector<C, R>
where
    C: Connection,
    R: ChainRpc,
{
    pub fn new(conn: C, rpc: R, query: TxQuery) -> Result<Self, ValidationError> {
        let filters: Vec<&Script> = [
            &query.input_lock,
            &query.output_lock,
            &query.input_type,
            &query.output_type,
        ]
        .into_iter()
        .flatten()
        .collect();
        if filters.is_empty() {
            return Err(ValidationError::MissingFilter);
        }
        validate_args_len(query.args_len, &filters)?;
        Ok(Self { conn, rpc, query })
    }

    /// The ordered intersection of all supplied filter sets. The first
    /// supplied filter seeds the accumulator and fixes the output order.
    pub fn hashes(&mut self) -> Result<Vec<H256>, CollectorError> {
        let filters = [
            (self.query.input_lock.clone(), ScriptType::Lock, IOType::Input),
            (self.query.output_lock.clone(), ScriptType::Lock, IOType::Output),
            (self.query.input_type.clone(), ScriptType::Type, IOType::Input),
            (self.query.output_type.clone(), ScriptType::Type, IOType::Output),
        ];
        let mut accumulator: Option<Vec<H256>> = None;
        for (script, script_type, io_type) in filters {
            let script = match script {
                Some(script) => script,
                None => continue,
            };
            let matched =
                self.hashes_for_filter(&script, script_type, io_type, self.query.args_len)?;
            accumulator = Some(match accumulator {
                None => matched,
                Some(previous) => {
                    let keep: HashSet<H256> = matched.into_iter().collect();
                    previous.into_iter().filter(|h| keep.contains(h)).collect()
                }
            });
        }
        // construction guarantees at least one filter
        Ok(accumulator.unwrap_or_default())
    }

    pub fn count(&mut self) -> Result<u64, CollectorError> {
        Ok(self.hashes()?.len() as u64)
    }

    /// A lazy sequence of transaction bodies fetched from the node in the
    /// intersection order.
    pub fn transactions(mut self) -> Result<TxIter<R>, CollectorError> {
        let hashes = self.hashes()?;
        Ok(TxIter {
            rpc: self.rpc,
            hashes: hashes.into(),
            skip_missing: self.query.skip_missing,
            include_status: self.query.include_status,
        })
    }

    fn hashes_for_filter(
        &mut self,
        script: &Script,
        script_type: ScriptType,
        io_type: IOType,
        args_len: i32,
    ) -> Result<Vec<H256>, CollectorError> {
        let mut params: Vec<SqlValue> = vec![
            (script_type as i64).into(),
            (io_type as i64).into(),
        ];
        let subquery = script_id_subquery(script, args_len, &mut params);
        let sql = format!(
            "SELECT DISTINCT td.tx_hash, td.block_number, td.tx_index \
             FROM transactions_scripts ts \
             JOIN transaction_digests td ON td.id = ts.transaction_digest_id \
             WHERE ts.script_type = ? AND ts.io_type = ? AND ts.script_id IN ({}) \
             ORDER BY td.block_number ASC, td.tx_index ASC",
            subquery
        );
        let rows = self.conn.query(&sql, &params)?;
        let mut hashes = Vec::with_capacity(rows.len());
        for row in &rows {
            hashes.push(byte32(row.blob(0)?)?.unpack());
        }
        Ok(hashes)
    }
}

pub struct TxIter<R> {
    rpc: R,
    hashes: VecDeque<H256>,
    skip_missing: bool,
    include_status: bool,
}

impl<R: ChainRpc> Iterator for TxIter<R> {
    type Item = Result<TxRecord, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let hash = self.hashes.pop_front()?;
            let fetched = match self.rpc.get_transaction(&hash) {
                Ok(fetched) => fetched,
                Err(error) => return Some(Err(error.into())),
            };
            let transaction = fetched.and_then(|envelope| {
                let status = envelope.tx_status;
                envelope.transaction.map(|tx| (tx, status))
            });
            match transaction {
                Some((transaction, tx_status)) => {
                    return Some(Ok(TxRecord {
                        transaction,
                        tx_status: self.include_status.then_some(tx_status),
                    }))
                }
                None if self.skip_missing => continue,
                None => return Some(Err(CollectorError::MissingTransaction(hash))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::Indexer;
    use crate::store::Store;
    use crate::test_util::*;
    use ckb_types::bytes::Bytes;
    use ckb_types::core::{BlockView, ScriptHashType};
    use ckb_types::packed::{Byte32, CellOutput};

    fn out(lock: &Script, type_: Option<&Script>, capacity: u64) -> CellOutput {
        CellOutput::new_builder()
            .capacity(capacity.pack())
            .lock(lock.clone())
            .type_(type_.cloned().pack())
            .build()
    }

    /// Three blocks: genesis locked by L0; tx1 spends it into (L1, T1);
    /// tx2 spends that back into L0.
    fn fixture() -> (
        tempfile::TempDir,
        crate::store::SqliteStore,
        FakeRpc,
        Vec<BlockView>,
    ) {
        let (dir, store) = temp_store();
        let mut indexer = Indexer::new(store.connection().unwrap(), 10_000, 2_000);

        let l0 = script(0x01, ScriptHashType::Data, &[]);
        let l1 = script(0x02, ScriptHashType::Data, &[0x11]);
        let t1 = script(0x03, ScriptHashType::Type, &[0xaa, 0xbb]);
        let cb_lock = script(0x0f, ScriptHashType::Data, &[0xcc]);

        let block0 = block(0, Byte32::default(), 1, vec![cellbase(0, &l0, 0x1000, &[])]);
        let tx0_hash = block0.transactions()[0].hash();
        let tx1 = transfer(&[(tx0_hash, 0)], vec![(out(&l1, Some(&t1), 0x800), Bytes::new())]);
        let block1 = block(
            1,
            block0.hash(),
            2,
            vec![cellbase(1, &cb_lock, 0x100, &[]), tx1.clone()],
        );
        let tx2 = transfer(&[(tx1.hash(), 0)], vec![(out(&l0, None, 0x700), Bytes::new())]);
        let block2 = block(
            2,
            block1.hash(),
            3,
            vec![cellbase(2, &cb_lock, 0x100, &[]), tx2],
        );

        let chain = vec![block0, block1, block2];
        for b in &chain {
            indexer.append(b).unwrap();
        }
        let rpc = FakeRpc::new(chain.clone());
        (dir, store, rpc, chain)
    }

    #[test]
    fn single_filter_orders_by_chain_position() {
        let (_dir, store, rpc, chain) = fixture();
        let l0 = script(0x01, ScriptHashType::Data, &[]);
        let mut collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_lock: Some(l0),
                ..Default::default()
            },
        )
        .unwrap();
        // L0 outputs: the genesis cellbase and tx2's re-emission
        let hashes = collector.hashes().unwrap();
        assert_eq!(
            hashes,
            vec![
                chain[0].transactions()[0].hash().unpack(),
                chain[2].transactions()[1].hash().unpack(),
            ]
        );
    }

    #[test]
    fn intersection_keeps_first_filter_order() {
        let (_dir, store, rpc, chain) = fixture();
        let l0 = script(0x01, ScriptHashType::Data, &[]);
        let t1 = script(0x03, ScriptHashType::Type, &[0xaa, 0xbb]);
        // input_lock L0 selects tx1; output_type T1 selects tx1 as well
        let mut collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                input_lock: Some(l0.clone()),
                output_type: Some(t1.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let expected: Vec<H256> = vec![chain[1].transactions()[1].hash().unpack()];
        assert_eq!(collector.hashes().unwrap(), expected);

        // the intersection is commutative: intersecting the two
        // single-filter sets in either direction gives the same result
        let single = |query: TxQuery| {
            TransactionCollector::new(store.connection().unwrap(), &rpc, query)
                .unwrap()
                .hashes()
                .unwrap()
        };
        let by_lock = single(TxQuery {
            input_lock: Some(l0),
            ..Default::default()
        });
        let by_type = single(TxQuery {
            output_type: Some(t1),
            ..Default::default()
        });
        let keep: std::collections::HashSet<&H256> = by_type.iter().collect();
        let forward: Vec<&H256> = by_lock.iter().filter(|h| keep.contains(h)).collect();
        let keep: std::collections::HashSet<&H256> = by_lock.iter().collect();
        let backward: Vec<&H256> = by_type.iter().filter(|h| keep.contains(h)).collect();
        assert_eq!(forward, backward);
        assert_eq!(forward, expected.iter().collect::<Vec<_>>());
    }

    #[test]
    fn disjoint_filters_intersect_to_nothing() {
        let (_dir, store, rpc, _chain) = fixture();
        let l1 = script(0x02, ScriptHashType::Data, &[0x11]);
        let cb_lock = script(0x0f, ScriptHashType::Data, &[0xcc]);
        let mut collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_lock: Some(l1),
                input_lock: Some(cb_lock),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(collector.hashes().unwrap().is_empty());
    }

    #[test]
    fn bodies_come_from_rpc_with_status() {
        let (_dir, store, rpc, chain) = fixture();
        let t1 = script(0x03, ScriptHashType::Type, &[0xaa, 0xbb]);
        let collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_type: Some(t1),
                ..Default::default()
            },
        )
        .unwrap();
        let records: Vec<TxRecord> = collector
            .transactions()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        let expected: H256 = chain[1].transactions()[1].hash().unpack();
        assert_eq!(records[0].transaction.hash, expected);
        assert_eq!(
            records[0].tx_status.as_ref().unwrap().status,
            "committed"
        );
    }

    #[test]
    fn missing_bodies_raise_or_skip() {
        let (_dir, store, rpc, chain) = fixture();
        let t1 = script(0x03, ScriptHashType::Type, &[0xaa, 0xbb]);
        // the node forgets everything past genesis
        rpc.set_chain(vec![chain[0].clone()]);

        let collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_type: Some(t1.clone()),
                ..Default::default()
            },
        )
        .unwrap();
        let result: Result<Vec<TxRecord>, _> = collector.transactions().unwrap().collect();
        assert!(matches!(result, Err(CollectorError::MissingTransaction(_))));

        let collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_type: Some(t1),
                skip_missing: true,
                ..Default::default()
            },
        )
        .unwrap();
        let records: Vec<TxRecord> = collector
            .transactions()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn status_can_be_omitted() {
        let (_dir, store, rpc, _chain) = fixture();
        let t1 = script(0x03, ScriptHashType::Type, &[0xaa, 0xbb]);
        let collector = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery {
                output_type: Some(t1),
                include_status: false,
                ..Default::default()
            },
        )
        .unwrap();
        let records: Vec<TxRecord> = collector
            .transactions()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(records[0].tx_status.is_none());
    }

    #[test]
    fn at_least_one_filter_is_required() {
        let (_dir, store, rpc, _chain) = fixture();
        let result = TransactionCollector::new(
            store.connection().unwrap(),
            &rpc,
            TxQuery::default(),
        );
        assert!(matches!(result, Err(ValidationError::MissingFilter)));
    }
}
