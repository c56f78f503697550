//! Shared fixtures: a throwaway SQLite store, hand-built chain objects, and
//! a scripted in-memory node behind the `ChainRpc` seam.

use std::sync::Mutex;

use ckb_types::bytes::Bytes;
use ckb_types::core::{
    BlockBuilder, BlockView, EpochNumberWithFraction, HeaderBuilder, ScriptHashType,
    TransactionBuilder, TransactionView,
};
use ckb_types::packed::{Byte32, CellInput, CellOutput, OutPoint, Script};
use ckb_types::prelude::*;
use ckb_types::H256;

use crate::client::{ChainRpc, RpcError, TransactionWithStatus, TxStatus};
use crate::store::{SqliteStore, Store};

pub(crate) fn temp_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("indexer.db"));
    store.init().unwrap();
    (dir, store)
}

pub(crate) fn script(code_byte: u8, hash_type: ScriptHashType, args: &[u8]) -> Script {
    Script::new_builder()
        .code_hash(Byte32::from_slice(&[code_byte; 32]).unwrap())
        .hash_type(hash_type.into())
        .args(Bytes::from(args.to_vec()).pack())
        .build()
}

pub(crate) fn cellbase(number: u64, lock: &Script, capacity: u64, data: &[u8]) -> TransactionView {
    TransactionBuilder::default()
        .input(CellInput::new(OutPoint::null(), number))
        .output(
            CellOutput::new_builder()
                .capacity(capacity.pack())
                .lock(lock.clone())
                .build(),
        )
        .output_data(Bytes::from(data.to_vec()).pack())
        .build()
}

pub(crate) fn transfer(
    spends: &[(Byte32, u32)],
    outputs: Vec<(CellOutput, Bytes)>,
) -> TransactionView {
    let mut builder = TransactionBuilder::default();
    for (tx_hash, index) in spends {
        builder = builder.input(CellInput::new(OutPoint::new(tx_hash.clone(), *index), 0));
    }
    for (output, data) in outputs {
        builder = builder.output(output).output_data(data.pack());
    }
    builder.build()
}

/// Varying the timestamp is enough to give same-height blocks distinct
/// hashes when building reorg fixtures.
pub(crate) fn block(
    number: u64,
    parent_hash: Byte32,
    timestamp: u64,
    transactions: Vec<TransactionView>,
) -> BlockView {
    let header = HeaderBuilder::default()
        .number(number.pack())
        .parent_hash(parent_hash)
        .timestamp(timestamp.pack())
        .epoch(
            EpochNumberWithFraction::new(number / 1800, number % 1800, 1800)
                .full_value()
                .pack(),
        )
        .build();
    let mut builder = BlockBuilder::default().header(header);
    for tx in transactions {
        builder = builder.transaction(tx);
    }
    builder.build()
}

/// A scripted node: serves `get_block_by_number` from a mutable canonical
/// chain (swap it to simulate a reorg) and `get_transaction` by scanning
/// that chain.
pub(crate) struct FakeRpc {
    chain: Mutex<Vec<BlockView>>,
    failing: Mutex<bool>,
}

impl FakeRpc {
    pub(crate) fn new(chain: Vec<BlockView>) -> Self {
        Self {
            chain: Mutex::new(chain),
            failing: Mutex::new(false),
        }
    }

    pub(crate) fn set_chain(&self, chain: Vec<BlockView>) {
        *self.chain.lock().unwrap() = chain;
    }

    pub(crate) fn fail_requests(&self) {
        *self.failing.lock().unwrap() = true;
    }

    fn check(&self) -> Result<(), RpcError> {
        if *self.failing.lock().unwrap() {
            Err(RpcError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn committed(&self, tx_hash: &H256) -> Option<(TransactionView, Byte32)> {
        let chain = self.chain.lock().unwrap();
        for block in chain.iter() {
            for tx in block.transactions() {
                let hash: H256 = tx.hash().unpack();
                if hash == *tx_hash {
                    return Some((tx, block.hash()));
                }
            }
        }
        None
    }
}

impl ChainRpc for FakeRpc {
    fn get_block_by_number(
        &self,
        number: u64,
    ) -> Result<Option<BlockView>, RpcError> {
        self.check()?;
        Ok(self.chain.lock().unwrap().get(number as usize).cloned())
    }

    fn get_transaction(
        &self,
        tx_hash: &H256,
    ) -> Result<Option<TransactionWithStatus>, RpcError> {
        self.check()?;
        Ok(self.committed(tx_hash).map(|(tx, block_hash)| {
            TransactionWithStatus {
                transaction: Some(tx.into()),
                tx_status: TxStatus {
                    status: "committed".to_string(),
                    block_hash: Some(block_hash.unpack()),
                },
            }
        }))
    }
}
