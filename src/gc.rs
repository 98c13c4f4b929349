//! Garbage collector: one worker per pool, woken on a timer, that
//! picks a victim block, relocates its valid pages, erases it, and
//! returns it to the free list (spec §4.6). Kernel work items become
//! `crossbeam` channel messages and a plain `std::thread` replaces the
//! original workqueue (REDESIGN FLAGS item 5).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::append_point::AppendPoint;
use crate::block::Block;
use crate::device::{DeviceRequest, Device, Direction};
use crate::engine::{Engine, EngineContext};
use crate::error::Result;
use crate::hint::HintStore;
use crate::map::{AddressMap, BlockTable, RangeLock};
use crate::pool::Pool;

/// Messages exchanged between GC workers and whoever wants to observe
/// their progress. A kernel driver would post these as workqueue
/// items; here they travel on an unbounded `crossbeam` channel.
#[derive(Debug, Clone)]
pub enum GcMessage {
    StartCollect(u32),
    RecycleBlock(u32),
    ReleaseBlock(u32),
    GcRoundComplete { pool_id: u32, blocks_reclaimed: u32 },
}

/// Shared state a GC worker thread needs; cloned (as `Arc`s) into each
/// per-pool thread rather than reached through a back-pointer to a
/// parent struct.
pub struct GcShared {
    pub pools: Vec<Arc<Pool>>,
    pub aps: Vec<Arc<AppendPoint>>,
    pub map: Arc<AddressMap>,
    pub blocks: Arc<BlockTable>,
    pub engine: Arc<dyn Engine>,
    pub device: Arc<dyn Device>,
    pub hints: Arc<HintStore>,
    pub range_lock: Arc<RangeLock>,
    pub rr_counter: Arc<AtomicU32>,
}

/// Drives per-pool GC workers. Construction does not start them;
/// `start` spawns one thread per pool, `stop` signals and joins them.
pub struct GarbageCollector {
    shared: Arc<GcShared>,
    gc_period: Duration,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    sender: Sender<GcMessage>,
    receiver: Receiver<GcMessage>,
}

impl GarbageCollector {
    pub fn new(shared: Arc<GcShared>, gc_period: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared,
            gc_period,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            sender,
            receiver,
        }
    }

    pub fn events(&self) -> Receiver<GcMessage> {
        self.receiver.clone()
    }

    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for pool in self.shared.pools.iter().cloned() {
            let shared = self.shared.clone();
            let stop = self.stop.clone();
            let sender = self.sender.clone();
            let period = self.gc_period;
            let pool_id = pool.id;

            let handle = std::thread::Builder::new()
                .name(format!("ftl-gc-pool-{pool_id}"))
                .spawn(move || {
                    const TICK: Duration = Duration::from_millis(50);
                    while !stop.load(Ordering::Acquire) {
                        let mut waited = Duration::ZERO;
                        while waited < period {
                            if stop.load(Ordering::Acquire) {
                                return;
                            }
                            let step = TICK.min(period - waited);
                            std::thread::sleep(step);
                            waited += step;
                        }
                        let _ = sender.send(GcMessage::StartCollect(pool_id));
                        run_round(&shared, &pool, &sender);
                    }
                })
                .expect("failed to spawn GC worker thread");
            handles.push(handle);
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let mut handles = self.handles.lock();
        for h in handles.drain(..) {
            let _ = h.join();
        }
    }

    /// Runs one GC round against `pool` synchronously, useful for
    /// tests and for forcing collection when a pool is exhausted.
    pub fn collect_now(&self, pool: &Arc<Pool>) -> u32 {
        run_round(&self.shared, pool, &self.sender)
    }
}

fn run_round(shared: &Arc<GcShared>, pool: &Arc<Pool>, sender: &Sender<GcMessage>) -> u32 {
    let mut reclaimed = 0u32;

    while !pool.gc_target_met() {
        let victim = match pool.select_gc_victim() {
            Some(v) => v,
            None => break,
        };
        victim.set_gc_running(true);
        debug!(pool_id = pool.id, block_id = victim.id, "GC selected victim");

        if let Err(e) = move_valid_pages(shared, pool, &victim) {
            error!(pool_id = pool.id, block_id = victim.id, error = %e, "failed to relocate valid pages");
            victim.set_gc_running(false);
            pool.remove_from_prio(victim.id);
            continue;
        }

        let mut spins = 0;
        while victim.ref_count() > 0 {
            std::thread::yield_now();
            spins += 1;
            if spins > 1_000_000 {
                warn!(block_id = victim.id, "GC waited an unreasonably long time for readers to drain");
                break;
            }
        }

        if let Err(e) = shared.device.erase_block(victim.id) {
            error!(block_id = victim.id, error = %e, "erase failed");
            victim.set_gc_running(false);
            continue;
        }

        pool.put_block(&victim);
        victim.set_gc_running(false);
        let _ = sender.send(GcMessage::RecycleBlock(victim.id));
        reclaimed += 1;
    }

    let _ = sender.send(GcMessage::GcRoundComplete {
        pool_id: pool.id,
        blocks_reclaimed: reclaimed,
    });
    if reclaimed > 0 {
        info!(pool_id = pool.id, reclaimed, "GC round complete");
    }
    reclaimed
}

/// Relocates every still-valid page in `victim` to a fresh location
/// chosen by the active engine, holding the logical range lock for
/// each page so a racing host write loses to GC's re-check rather
/// than clobbering a move in flight (spec §4.6 step 2).
fn move_valid_pages(shared: &Arc<GcShared>, pool: &Pool, victim: &Arc<Block>) -> Result<()> {
    let high_water = victim.high_water();

    for local in 0..high_water {
        if victim.is_invalid_local(local) {
            continue;
        }

        let phys_addr = victim.base_addr() + local as u64;
        let logical = shared.map.lookup_ptol(phys_addr);
        if logical < 0 {
            continue;
        }
        let logical = logical as u64;

        let _range_guard = shared.range_lock.acquire(logical, 1);

        // A page can still be live via the primary map or, for the
        // latency engine, the shadow map; check both before deciding
        // this copy was already relocated or overwritten by a host
        // write that won the race before GC took the range lock.
        let primary = shared.map.lookup_ltop(logical);
        let shadow = shared.map.lookup_ltop_shadow(logical);
        let still_live = (primary.block == Some(victim.id) && primary.addr as u64 == phys_addr)
            || shadow
                .map(|e| e.block == Some(victim.id) && e.addr as u64 == phys_addr)
                .unwrap_or(false);
        if !still_live {
            continue;
        }

        let data = shared.device.submit(DeviceRequest {
            direction: Direction::Read,
            phys_page: phys_addr,
            payload: Vec::new(),
        })?;

        let ctx = EngineContext {
            pools: &shared.pools,
            aps: &shared.aps,
            map: &shared.map,
            blocks: &shared.blocks,
            hints: &shared.hints,
            rr_counter: &shared.rr_counter,
        };
        let decisions = shared.engine.relocate(&ctx, logical, phys_addr)?;

        for decision in &decisions {
            shared.device.submit(DeviceRequest {
                direction: Direction::Write,
                phys_page: decision.addr,
                payload: data.clone(),
            })?;
            shared.map.update_map(logical, decision.addr, decision.block.id, decision.target, &shared.blocks)?;
        }
        shared.engine.on_write_complete(&ctx, logical, &decisions);
    }

    let _ = pool;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockGeometry;
    use crate::engine::RoundRobinEngine;
    use crate::map::MapTarget;
    use std::sync::atomic::AtomicU32;

    struct MemDevice {
        pages: Mutex<Vec<Vec<u8>>>,
    }

    impl MemDevice {
        fn new(n: usize) -> Self {
            Self {
                pages: Mutex::new(vec![vec![0u8; 16]; n]),
            }
        }
    }

    impl Device for MemDevice {
        fn identify(&self) -> Result<()> {
            Ok(())
        }

        fn identify_channel(&self, _idx: u32) -> Result<crate::device::ChannelDescriptor> {
            unimplemented!()
        }

        fn submit(&self, request: DeviceRequest) -> Result<Vec<u8>> {
            let mut pages = self.pages.lock();
            match request.direction {
                Direction::Read => Ok(pages[request.phys_page as usize].clone()),
                Direction::Write => {
                    pages[request.phys_page as usize] = request.payload;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn geom() -> BlockGeometry {
        BlockGeometry {
            pages_per_block: 4,
            host_pages_per_flash_page: 1,
        }
    }

    #[test]
    fn gc_relocates_valid_pages_and_frees_the_victim() {
        let pool = Arc::new(Pool::new(0, 3, geom()));
        let ap = Arc::new(AppendPoint::new(0, 0, 25, 500, 1500));
        let pools = vec![pool.clone()];
        let aps = vec![ap.clone()];
        let map = Arc::new(AddressMap::new(64, 4, false));
        let blocks = Arc::new(BlockTable::new(pool.blocks.clone()));
        let device: Arc<dyn Device> = Arc::new(MemDevice::new(12));
        let hints = Arc::new(HintStore::new());
        let range_lock = Arc::new(RangeLock::new());
        let rr_counter = Arc::new(AtomicU32::new(0));

        let shared = Arc::new(GcShared {
            pools: pools.clone(),
            aps: aps.clone(),
            map: map.clone(),
            blocks: blocks.clone(),
            engine: Arc::new(RoundRobinEngine::new()),
            device: device.clone(),
            hints,
            range_lock,
            rr_counter,
        });

        // Fill the first block with 4 live logical pages.
        let first = pool.get_block(false).unwrap();
        ap.set_cur(first.clone());
        for l in 0..4u64 {
            let local = first.alloc_local(false).unwrap();
            let addr = first.base_addr() + local as u64;
            device
                .submit(DeviceRequest {
                    direction: Direction::Write,
                    phys_page: addr,
                    payload: vec![l as u8; 16],
                })
                .unwrap();
            map.update_map(l, addr, first.id, MapTarget::Primary, &blocks).unwrap();
        }
        // Invalidate two of the four pages so the block becomes a
        // worthwhile GC victim, and move the AP off of it so it is
        // selectable.
        ap.set_cur(pool.get_block(false).unwrap());
        first.invalidate_local(0);
        first.invalidate_local(1);

        let gc = GarbageCollector::new(shared, Duration::from_secs(3600));
        let reclaimed = gc.collect_now(&pool);
        assert_eq!(reclaimed, 1);
        assert_eq!(first.state(), crate::block::BlockState::Free);

        // The two still-valid logical pages must now point somewhere
        // other than the reclaimed block.
        assert_ne!(map.lookup_ltop(2).block, Some(first.id));
        assert_ne!(map.lookup_ltop(3).block, Some(first.id));
    }
}
