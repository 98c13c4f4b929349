//! Request pipeline: turns a host read/write into range-locked,
//! engine-placed device I/O, and runs the completion bookkeeping every
//! request needs regardless of which engine served it (spec §5).

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tracing::debug;

use crate::append_point::AppendPoint;
use crate::block::BlockState;
use crate::constants::EXPOSED_PAGE_SIZE;
use crate::device::{DeviceRequest, Device, Direction, HostRequest, HostResponse};
use crate::engine::{Engine, EngineContext};
use crate::error::{FtlError, RequestOutcome, Result};
use crate::gc::GarbageCollector;
use crate::hint::HintStore;
use crate::map::{AddressMap, BlockTable, MapTarget, RangeLock};
use crate::pool::{Pool, QueuedRequest};

/// Everything the pipeline needs to serve one request; assembled by
/// the top-level `Ftl` and passed down rather than stored in a
/// thread-local or a global (REDESIGN FLAGS item 1).
pub struct RequestPipeline {
    pub pools: Vec<Arc<Pool>>,
    pub aps: Vec<Arc<AppendPoint>>,
    pub map: Arc<AddressMap>,
    pub blocks: Arc<BlockTable>,
    pub engine: Arc<dyn Engine>,
    pub device: Arc<dyn Device>,
    pub hints: Arc<HintStore>,
    pub range_lock: Arc<RangeLock>,
    pub rr_counter: Arc<AtomicU32>,
    pub pool_serialize: bool,
    pub gc: Arc<GarbageCollector>,
}

/// Outcome of attempting every page of a write; `OutOfSpace` tells
/// `submit` to drop the range lock and kick GC before answering `Busy`
/// (spec §4.5, §7).
enum WriteAttempt {
    Done,
    OutOfSpace,
}

impl RequestPipeline {
    fn ctx(&self) -> EngineContext<'_> {
        EngineContext {
            pools: &self.pools,
            aps: &self.aps,
            map: &self.map,
            blocks: &self.blocks,
            hints: &self.hints,
            rr_counter: &self.rr_counter,
        }
    }

    /// Serves one host request end to end: acquires the range lock for
    /// every logical page it touches, dispatches each page to a read
    /// or a mapped write, and releases the lock before returning.
    pub fn submit(&self, request: &HostRequest) -> Result<HostResponse> {
        let sectors_per_page = (EXPOSED_PAGE_SIZE as u64 / 512).max(1);
        let first_l = request.sector / sectors_per_page;
        let n = ((request.len_sectors as u64) / sectors_per_page).max(1);

        if self.pool_serialize {
            if let Some(pool) = self.owning_pool_for(first_l) {
                if !pool.try_begin(true) {
                    let (tx, rx) = crossbeam::channel::bounded(1);
                    pool.queue_waiting(QueuedRequest {
                        request: request.clone(),
                        responder: tx,
                    });
                    return rx.recv().map_err(|_| FtlError::Invariant("waiting request dropped".into()))?;
                }
            }
        }

        let range = self.range_lock.acquire(first_l, n);

        match request.direction {
            Direction::Read => {
                let payload = self.do_read(first_l, n)?;
                Ok(HostResponse { outcome: RequestOutcome::Ok, payload })
            }
            Direction::Write => match self.do_write(first_l, n, &request.payload)? {
                WriteAttempt::Done => Ok(HostResponse {
                    outcome: RequestOutcome::Ok,
                    payload: Vec::new(),
                }),
                WriteAttempt::OutOfSpace => {
                    // Release the range lock before kicking GC: a
                    // relocation GC picks may need this same logical
                    // range, and this thread must not be the one
                    // holding it (spec §4.5).
                    drop(range);
                    self.kick_gc();
                    Ok(HostResponse {
                        outcome: RequestOutcome::Busy,
                        payload: Vec::new(),
                    })
                }
            },
        }
    }

    fn kick_gc(&self) {
        for pool in &self.pools {
            self.gc.collect_now(pool);
        }
    }

    fn owning_pool_for(&self, l: u64) -> Option<&Arc<Pool>> {
        self.pools.first().map(|_| &self.pools[(l as usize) % self.pools.len()])
    }

    fn do_read(&self, first_l: u64, n: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((n as usize) * EXPOSED_PAGE_SIZE);
        for l in first_l..first_l + n {
            let entry = self.lookup_stable(l);
            let page = match entry.block {
                None => vec![0u8; EXPOSED_PAGE_SIZE],
                Some(_) => self.device.submit(DeviceRequest {
                    direction: Direction::Read,
                    phys_page: entry.addr as u64,
                    payload: Vec::new(),
                })?,
            };
            out.extend(page);
        }
        Ok(out)
    }

    /// Reads the forward entry for `l`, retrying while the owning
    /// block is mid-relocation by GC (spec §4.3).
    fn lookup_stable(&self, l: u64) -> crate::map::ForwardEntry {
        loop {
            let entry = self.map.lookup_ltop(l);
            if let Some(bid) = entry.block {
                if self.blocks.get(bid).gc_running() {
                    std::thread::yield_now();
                    continue;
                }
            }
            return entry;
        }
    }

    fn do_write(&self, first_l: u64, n: u64, payload: &[u8]) -> Result<WriteAttempt> {
        for (i, l) in (first_l..first_l + n).enumerate() {
            let chunk_start = i * EXPOSED_PAGE_SIZE;
            let chunk = payload.get(chunk_start..chunk_start + EXPOSED_PAGE_SIZE).unwrap_or(&[]);

            let decisions = match self.engine.map_page(&self.ctx(), l, false) {
                Ok(decisions) => decisions,
                Err(FtlError::OutOfSpace) => return Ok(WriteAttempt::OutOfSpace),
                Err(e) => return Err(e),
            };
            for decision in &decisions {
                self.device.submit(DeviceRequest {
                    direction: Direction::Write,
                    phys_page: decision.addr,
                    payload: chunk.to_vec(),
                })?;
                self.map.update_map(l, decision.addr, decision.block.id, decision.target, &self.blocks)?;
                self.endio(&decision.block);
            }
            // A write that only touched the primary map (no shadow
            // among this call's decisions) supersedes whatever shadow
            // copy a previous hinted write may have left behind (spec
            // §4.4: "when the primary is updated, the old shadow entry
            // is trimmed").
            if decisions.len() == 1 && decisions[0].target == MapTarget::Primary {
                self.map.trim_shadow(l, &self.blocks);
            }
            self.engine.on_write_complete(&self.ctx(), l, &decisions);
        }
        Ok(WriteAttempt::Done)
    }

    /// Post-write bookkeeping for one physical page: bumps the
    /// block's committed-data counter and flips it to `Full` once its
    /// cursor has reached capacity, at which point it is dropped from
    /// active writing (spec §5).
    fn endio(&self, block: &Arc<crate::block::Block>) {
        block.incr_data_cmnt_size();
        if block.is_full() && block.state() != BlockState::Full {
            debug!(block_id = block.id, "block filled, marking Full");
            block.set_state(BlockState::Full);
        }
    }
}
