//! Pool: the per-channel container of blocks (spec §3, §4.1).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::block::{Block, BlockGeometry, BlockState};
use crate::device::{HostRequest, HostResponse};
use crate::error::{FtlError, Result};

/// Blocks held back from ordinary allocation so GC can always make
/// progress even when the pool looks exhausted to regular writers.
const GC_RESERVE_BLOCKS: u32 = 1;

/// Divisor applied to `nr_blocks` for the GC round's stopping
/// threshold: once free blocks reach `nr_blocks / GC_LIMIT`, a round
/// stops even if more reclaimable blocks remain (spec §4.6 step 1).
const GC_LIMIT: u32 = 2;

struct PoolLists {
    free_list: VecDeque<u32>,
    used_list: Vec<u32>,
    prio_list: Vec<u32>,
    nr_free_blocks: u32,
    /// Rotating cursor for victim tie-breaking (spec §4.6: "ties
    /// broken toward the current scan position").
    scan_pos: usize,
}

/// A queued host request waiting for the pool's serial-access gate to
/// open (spec §5's optional pool-serialize mode).
pub struct QueuedRequest {
    pub request: HostRequest,
    pub responder: crossbeam::channel::Sender<Result<HostResponse>>,
}

pub struct Pool {
    pub id: u32,
    pub blocks: Vec<Arc<Block>>,
    lists: Mutex<PoolLists>,
    nr_blocks: u32,
    /// Serial-access gate: while set, new submissions queue instead of
    /// going straight to the device.
    pub is_active: AtomicBool,
    waiting: Mutex<VecDeque<QueuedRequest>>,
}

impl Pool {
    pub fn new(id: u32, nr_blocks: u32, geometry: BlockGeometry) -> Self {
        let blocks: Vec<Arc<Block>> = (0..nr_blocks)
            .map(|local| {
                let global_id = id * nr_blocks + local;
                Arc::new(Block::new(global_id, id, geometry))
            })
            .collect();

        let free_list: VecDeque<u32> = blocks.iter().map(|b| b.id).collect();

        Self {
            id,
            blocks,
            lists: Mutex::new(PoolLists {
                free_list,
                used_list: Vec::new(),
                prio_list: Vec::new(),
                nr_free_blocks: nr_blocks,
                scan_pos: 0,
            }),
            nr_blocks,
            is_active: AtomicBool::new(false),
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn nr_free_blocks(&self) -> u32 {
        self.lists.lock().nr_free_blocks
    }

    /// True once a GC round against this pool can stop: enough blocks
    /// have been reclaimed that free blocks meet the `GC_LIMIT`
    /// threshold (spec §4.6 step 1).
    pub fn gc_target_met(&self) -> bool {
        self.lists.lock().nr_free_blocks >= self.nr_blocks / GC_LIMIT
    }

    fn block(&self, global_id: u32) -> &Arc<Block> {
        &self.blocks[(global_id - self.id * self.nr_blocks) as usize]
    }

    /// Removes the head of the free list, moves it to used+prio,
    /// resets it, and returns it. `is_gc` permits dipping into the
    /// small reserve kept for GC even when the pool otherwise looks
    /// exhausted; non-GC callers must not set it (spec §4.1).
    pub fn get_block(&self, is_gc: bool) -> Result<Arc<Block>> {
        let mut g = self.lists.lock();

        if g.free_list.is_empty() {
            return Err(FtlError::Exhausted(self.id));
        }
        if !is_gc && g.nr_free_blocks <= GC_RESERVE_BLOCKS {
            return Err(FtlError::Exhausted(self.id));
        }

        let id = g.free_list.pop_front().unwrap();
        g.used_list.push(id);
        g.prio_list.push(id);
        g.nr_free_blocks -= 1;
        drop(g);

        let block = self.block(id).clone();
        block.reset();
        block.set_state(BlockState::Open);
        Ok(block)
    }

    /// Moves a block from used back to the tail of free (round-robin
    /// wear-leveling). Caller ensures the bitmap is fully invalidated
    /// first.
    pub fn put_block(&self, block: &Block) {
        debug_assert!(block.bitmap_full(), "returning a block with live pages");
        let mut g = self.lists.lock();
        if let Some(pos) = g.used_list.iter().position(|&id| id == block.id) {
            g.used_list.remove(pos);
        }
        g.free_list.push_back(block.id);
        g.nr_free_blocks += 1;
        drop(g);
        block.set_state(BlockState::Free);
    }

    pub fn remove_from_prio(&self, block_id: u32) {
        let mut g = self.lists.lock();
        if let Some(pos) = g.prio_list.iter().position(|&id| id == block_id) {
            g.prio_list.remove(pos);
        }
    }

    /// Selects the block in `prio_list` with the highest invalid-page
    /// count; ties are broken toward the current scan position.
    /// Blocks still owned by an append point are skipped, since they
    /// are still being actively written. Returns `None` if no
    /// eligible block exists or the max is zero (spec §4.6 step 1).
    pub fn select_gc_victim(&self) -> Option<Arc<Block>> {
        let mut g = self.lists.lock();
        if g.prio_list.is_empty() {
            return None;
        }

        let len = g.prio_list.len();
        let start = g.scan_pos % len;
        let mut best_idx = None;
        let mut best_count = 0;

        for step in 0..len {
            let idx = (start + step) % len;
            let block = self.block(g.prio_list[idx]);
            if block.ap().is_some() {
                continue;
            }
            let count = block.nr_invalid_pages();
            if best_idx.is_none() || count > best_count {
                best_count = count;
                best_idx = Some(idx);
            }
        }

        let best_idx = best_idx?;
        if best_count == 0 {
            return None;
        }

        g.scan_pos = (best_idx + 1) % len;
        let id = g.prio_list.remove(best_idx);
        drop(g);

        Some(self.block(id).clone())
    }

    pub fn queue_waiting(&self, job: QueuedRequest) {
        self.waiting.lock().push_back(job);
    }

    /// Dequeues the next waiting request, if any, for the endio path
    /// to resubmit. Sets `is_active` to false when the queue drains.
    pub fn pop_waiting(&self) -> Option<QueuedRequest> {
        let mut w = self.waiting.lock();
        let job = w.pop_front();
        if job.is_none() {
            self.is_active.store(false, Ordering::Release);
        }
        job
    }

    pub fn try_begin(&self, serialize: bool) -> bool {
        if !serialize {
            return true;
        }
        !self.is_active.swap(true, Ordering::AcqRel)
    }

    /// Drains the waiting queue at teardown without submitting
    /// anything further (spec §5 "Cancellation").
    pub fn flush_waiting(&self) {
        let mut w = self.waiting.lock();
        if !w.is_empty() {
            warn!(pool_id = self.id, dropped = w.len(), "flushing waiting queue at teardown");
        }
        w.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geom() -> BlockGeometry {
        BlockGeometry {
            pages_per_block: 4,
            host_pages_per_flash_page: 1,
        }
    }

    #[test]
    fn get_and_put_block_round_trips_through_free_list() {
        let pool = Pool::new(0, 4, geom());
        assert_eq!(pool.nr_free_blocks(), 4);

        let b = pool.get_block(false).unwrap();
        assert_eq!(pool.nr_free_blocks(), 3);

        for i in 0..b.host_pages_per_block() {
            b.invalidate_local(i);
        }
        pool.put_block(&b);
        assert_eq!(pool.nr_free_blocks(), 4);
    }

    #[test]
    fn non_gc_caller_cannot_drain_past_reserve() {
        let pool = Pool::new(0, 2, geom());
        let _first = pool.get_block(false).unwrap();
        // One block left, which is the GC reserve: ordinary callers
        // must not get it.
        assert!(matches!(pool.get_block(false), Err(FtlError::Exhausted(_))));
        assert!(pool.get_block(true).is_ok());
    }

    #[test]
    fn victim_selection_prefers_highest_invalid_count() {
        let pool = Pool::new(0, 3, geom());
        let a = pool.get_block(false).unwrap();
        let b = pool.get_block(false).unwrap();
        let _c = pool.get_block(false).unwrap();

        a.invalidate_local(0);
        b.invalidate_local(0);
        b.invalidate_local(1);

        let victim = pool.select_gc_victim().unwrap();
        assert_eq!(victim.id, b.id);
    }

    #[test]
    fn victim_selection_returns_none_when_all_invalid_counts_are_zero() {
        let pool = Pool::new(0, 2, geom());
        let _a = pool.get_block(false).unwrap();
        assert!(pool.select_gc_victim().is_none());
    }
}
