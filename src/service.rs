use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ckb_types::core::BlockView;
use log::{error, info};
use thiserror::Error;

use crate::client::{ChainRpc, RpcError};
use crate::indexer::{self, Indexer};
use crate::store::{Connection, Store, StoreError};

/// Invoked after each block commits, in block order, never concurrently.
pub type BlockListener = Arc<dyn Fn(&BlockView) + Send + Sync>;

#[derive(Clone)]
pub struct Config {
    /// Delay before retrying when the node has no next block yet.
    pub poll_interval: Duration,
    /// Supervisor tick.
    pub liveness_check_interval: Duration,
    /// Blocks retained below tip before pruning eligibility.
    pub keep_num: u64,
    /// Append-triggered prune cadence in block-number units.
    pub prune_interval: u64,
    pub new_block_listener: Option<BlockListener>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            liveness_check_interval: Duration::from_secs(5),
            keep_num: 10_000,
            prune_interval: 2_000,
            new_block_listener: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Running,
    Failed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("indexer error: {0}")]
    Indexer(#[from] indexer::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

pub(crate) enum Tick {
    /// Appended or rolled back a block; reschedule immediately.
    Advanced,
    /// The node has no next block; back off for `poll_interval`.
    Idle,
}

/// One poll cycle: read the local tip, fetch the successor, then append or
/// roll back. The store transaction never spans the RPC fetch.
pub(crate) fn poll_cycle<C, R>(
    indexer: &mut Indexer<C>,
    rpc: &R,
    listener: Option<&(dyn Fn(&BlockView) + Send + Sync)>,
) -> Result<Tick, Error>
where
    C: Connection,
    R: ChainRpc + ?Sized,
{
    match indexer.tip()? {
        None => match rpc.get_block_by_number(0)? {
            Some(block) => {
                info!("append {}, {}", block.number(), block.hash());
                indexer.append(&block)?;
                if let Some(listener) = listener {
                    listener(&block);
                }
                Ok(Tick::Advanced)
            }
            None => Ok(Tick::Idle),
        },
        Some((tip_number, tip_hash)) => match rpc.get_block_by_number(tip_number + 1)? {
            None => Ok(Tick::Idle),
            Some(block) => {
                if block.parent_hash() == tip_hash {
                    info!("append {}, {}", block.number(), block.hash());
                    indexer.append(&block)?;
                    if let Some(listener) = listener {
                        listener(&block);
                    }
                } else {
                    info!("rollback {}, {}", tip_number, tip_hash);
                    indexer.rollback()?;
                }
                Ok(Tick::Advanced)
            }
        },
    }
}

/// The chain follower. `start` spawns the poll loop on its own thread;
/// `start_forever` adds the liveness watchdog that restarts it on failure.
pub struct Service<S, R> {
    store: S,
    rpc: Arc<R>,
    config: Config,
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<S, R> Service<S, R>
where
    S: Store,
    R: ChainRpc + 'static,
{
    pub fn new(store: S, rpc: R, config: Config) -> Self {
        Self {
            store,
            rpc: Arc::new(rpc),
            config,
            state: Arc::new(Mutex::new(State::Stopped)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn running(&self) -> bool {
        self.state() == State::Running
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.running() {
            return Ok(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let conn = self.store.connection()?;
        let mut indexer = Indexer::new(conn, self.config.keep_num, self.config.prune_interval);

        self.stop.store(false, Ordering::SeqCst);
        *self.state.lock().expect("state lock poisoned") = State::Running;

        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop);
        let rpc = Arc::clone(&self.rpc);
        let poll_interval = self.config.poll_interval;
        let listener = self.config.new_block_listener.clone();
        self.handle = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match poll_cycle(&mut indexer, rpc.as_ref(), listener.as_deref()) {
                    Ok(Tick::Advanced) => thread::sleep(Duration::from_millis(1)),
                    Ok(Tick::Idle) => thread::sleep(poll_interval),
                    Err(error) => {
                        error!("poll cycle failed: {}", error);
                        *state.lock().expect("state lock poisoned") = State::Failed;
                        return;
                    }
                }
            }
            *state.lock().expect("state lock poisoned") = State::Stopped;
        }));
        Ok(())
    }

    /// Requests a stop and waits for the in-flight cycle to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        *self.state.lock().expect("state lock poisoned") = State::Stopped;
    }

    /// Runs the follower under a liveness watchdog: every tick either logs
    /// the current tip or restarts a dead follower.
    pub fn start_forever(mut self) -> Result<(), Error> {
        self.start()?;
        let mut probe = Indexer::new(
            self.store.connection()?,
            self.config.keep_num,
            self.config.prune_interval,
        );
        loop {
            thread::sleep(self.config.liveness_check_interval);
            if !self.running() {
                error!("indexer is not running, restarting");
                if let Err(restart_error) = self.start() {
                    error!("restart failed: {}", restart_error);
                }
            } else {
                match probe.tip() {
                    Ok(Some((number, hash))) => info!("tip {}, {}", number, hash),
                    Ok(None) => info!("tip is empty"),
                    Err(probe_error) => error!("tip probe failed: {}", probe_error),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CellCollector, CellQuery, DataFilter, LiveCell};
    use crate::test_util::*;
    use ckb_types::bytes::Bytes;
    use ckb_types::core::ScriptHashType;
    use ckb_types::packed::{Byte32, CellOutput};
    use ckb_types::prelude::*;

    fn out(lock: &ckb_types::packed::Script, capacity: u64) -> CellOutput {
        CellOutput::new_builder()
            .capacity(capacity.pack())
            .lock(lock.clone())
            .build()
    }

    #[test]
    fn catches_up_and_idles() {
        let (_dir, store) = temp_store();
        let mut indexer = Indexer::new(store.connection().unwrap(), 10_000, 2_000);
        let lock = script(0x01, ScriptHashType::Data, &[]);
        let block0 = block(0, Byte32::default(), 1, vec![cellbase(0, &lock, 0x1000, &[])]);
        let block1 = block(1, block0.hash(), 2, vec![cellbase(1, &lock, 0x200, &[])]);
        let rpc = FakeRpc::new(vec![block0, block1.clone()]);

        assert!(matches!(
            poll_cycle(&mut indexer, &rpc, None).unwrap(),
            Tick::Advanced
        ));
        assert!(matches!(
            poll_cycle(&mut indexer, &rpc, None).unwrap(),
            Tick::Advanced
        ));
        assert!(matches!(
            poll_cycle(&mut indexer, &rpc, None).unwrap(),
            Tick::Idle
        ));
        let (number, hash) = indexer.tip().unwrap().unwrap();
        assert_eq!(number, 1);
        assert_eq!(hash, block1.hash());
    }

    #[test]
    fn reorg_of_depth_one_rolls_back_then_reapplies() {
        let (_dir, store) = temp_store();
        let mut indexer = Indexer::new(store.connection().unwrap(), 10_000, 2_000);
        let lock = script(0x01, ScriptHashType::Data, &[]);

        let block0 = block(0, Byte32::default(), 1, vec![cellbase(0, &lock, 0x1000, &[])]);
        let tx0_hash = block0.transactions()[0].hash();
        let cb_lock = script(0x0f, ScriptHashType::Data, &[0xcc]);

        let tx1 = transfer(&[(tx0_hash.clone(), 0)], vec![(out(&lock, 0x0fff), Bytes::new())]);
        let block1 = block(
            1,
            block0.hash(),
            2,
            vec![cellbase(1, &cb_lock, 0x100, &[]), tx1],
        );
        let rpc = FakeRpc::new(vec![block0.clone(), block1.clone()]);

        poll_cycle(&mut indexer, &rpc, None).unwrap();
        poll_cycle(&mut indexer, &rpc, None).unwrap();
        assert_eq!(indexer.tip().unwrap().unwrap().0, 1);

        // the canonical chain replaces block 1 and extends past it
        let tx1_prime = transfer(&[(tx0_hash, 0)], vec![(out(&lock, 0x0fee), Bytes::new())]);
        let block1_prime = block(
            1,
            block0.hash(),
            3,
            vec![cellbase(1, &cb_lock, 0x100, &[]), tx1_prime],
        );
        let block2_prime = block(
            2,
            block1_prime.hash(),
            4,
            vec![cellbase(2, &cb_lock, 0x100, &[])],
        );
        rpc.set_chain(vec![block0, block1_prime.clone(), block2_prime.clone()]);

        // mismatched parent on block 2 triggers a single-block rollback
        poll_cycle(&mut indexer, &rpc, None).unwrap();
        assert_eq!(indexer.tip().unwrap().unwrap().0, 0);
        poll_cycle(&mut indexer, &rpc, None).unwrap();
        assert_eq!(indexer.tip().unwrap().unwrap().1, block1_prime.hash());
        poll_cycle(&mut indexer, &rpc, None).unwrap();
        assert_eq!(indexer.tip().unwrap().unwrap().1, block2_prime.hash());

        let collector = CellCollector::new(
            store.connection().unwrap(),
            CellQuery {
                lock: Some(lock),
                data: DataFilter::Any,
                ..Default::default()
            },
        )
        .unwrap();
        let cells: Vec<LiveCell> = collector.cells().collect::<Result<_, _>>().unwrap();
        assert_eq!(cells.len(), 1);
        let capacity: u64 = cells[0].cell_output.capacity.into();
        assert_eq!(capacity, 0x0fee);
    }

    #[test]
    fn rpc_failure_propagates_out_of_the_cycle() {
        let (_dir, store) = temp_store();
        let mut indexer = Indexer::new(store.connection().unwrap(), 10_000, 2_000);
        let rpc = FakeRpc::new(vec![]);
        rpc.fail_requests();
        assert!(poll_cycle(&mut indexer, &rpc, None).is_err());
    }

    #[test]
    fn service_runs_in_background_and_stops() {
        let (_dir, store) = temp_store();
        let lock = script(0x01, ScriptHashType::Data, &[]);
        let block0 = block(0, Byte32::default(), 1, vec![cellbase(0, &lock, 0x1000, &[])]);
        let block1 = block(1, block0.hash(), 2, vec![cellbase(1, &lock, 0x200, &[])]);
        let rpc = FakeRpc::new(vec![block0, block1]);

        let appended = Arc::new(Mutex::new(Vec::new()));
        let listener: BlockListener = {
            let appended = Arc::clone(&appended);
            Arc::new(move |block: &BlockView| {
                appended.lock().unwrap().push(block.number());
            })
        };
        let mut service = Service::new(
            store.clone(),
            rpc,
            Config {
                poll_interval: Duration::from_millis(10),
                new_block_listener: Some(listener),
                ..Default::default()
            },
        );
        service.start().unwrap();
        assert!(service.running());

        let mut probe = Indexer::new(store.connection().unwrap(), 10_000, 2_000);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((1, _)) = probe.tip().unwrap() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "follower never caught up");
            thread::sleep(Duration::from_millis(10));
        }
        service.stop();
        assert_eq!(service.state(), State::Stopped);
        assert_eq!(*appended.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn rpc_failure_fails_the_service() {
        let (_dir, store) = temp_store();
        let rpc = FakeRpc::new(vec![]);
        rpc.fail_requests();
        let mut service = Service::new(
            store,
            rpc,
            Config {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        service.start().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while service.running() {
            assert!(std::time::Instant::now() < deadline, "service never failed");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service.state(), State::Failed);
    }
}
