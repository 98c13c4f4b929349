//! The logical-to-physical address map, its reverse map, the shadow
//! map used by the latency engine, and the per-range lock every
//! reader/writer acquires before touching a logical address (spec
//! §3, §4.3, §5).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::error;

use crate::block::Block;
use crate::constants::LTOP_EMPTY;
use crate::error::{FtlError, Result};

/// Flat, dense table of every block across every pool, indexed by
/// `block.id`. Shared by the map (to flip invalid bits on the owning
/// block) and the rest of the core.
pub struct BlockTable(Vec<Arc<Block>>);

impl BlockTable {
    pub fn new(blocks: Vec<Arc<Block>>) -> Self {
        Self(blocks)
    }

    pub fn get(&self, id: u32) -> &Arc<Block> {
        &self.0[id as usize]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardEntry {
    pub addr: i64,
    pub block: Option<u32>,
}

impl Default for ForwardEntry {
    fn default() -> Self {
        Self {
            addr: LTOP_EMPTY,
            block: None,
        }
    }
}

/// Which map a write targets. Engines without a shadow map only ever
/// use `Primary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapTarget {
    Primary,
    Shadow,
}

struct MapState {
    forward: Vec<ForwardEntry>,
    reverse: Vec<i64>,
    shadow: Vec<ForwardEntry>,
}

/// Forward/reverse/shadow maps guarded by one `RwLock`. This doubles
/// as "the reverse-map lock" from spec §4.3: `update_map` takes the
/// write side so the invalidate-old + write-new sequence is atomic;
/// plain lookups take the read side, so unrelated logical addresses
/// still make progress concurrently (the dominant serialization
/// discipline is the per-L range lock below, not this one).
pub struct AddressMap {
    state: RwLock<MapState>,
    host_pages_per_block: u32,
    has_shadow: bool,
}

impl AddressMap {
    pub fn new(nr_pages: u64, host_pages_per_block: u32, has_shadow: bool) -> Self {
        let n = nr_pages as usize;
        Self {
            state: RwLock::new(MapState {
                forward: vec![ForwardEntry::default(); n],
                reverse: vec![LTOP_EMPTY; n],
                shadow: if has_shadow {
                    vec![ForwardEntry::default(); n]
                } else {
                    Vec::new()
                },
            }),
            host_pages_per_block,
            has_shadow,
        }
    }

    pub fn has_shadow(&self) -> bool {
        self.has_shadow
    }

    fn owning_block_and_local(&self, phys_addr: u64) -> (u32, u32) {
        let block_id = (phys_addr / self.host_pages_per_block as u64) as u32;
        let local = (phys_addr % self.host_pages_per_block as u64) as u32;
        (block_id, local)
    }

    /// Snapshot of the primary forward entry for `l`. Callers that
    /// need to respect an in-flight GC relocation should check
    /// `entry.block`'s `gc_running` flag against the block table and
    /// retry (spec §4.3); this method only takes the snapshot.
    pub fn lookup_ltop(&self, l: u64) -> ForwardEntry {
        self.state.read().forward[l as usize]
    }

    pub fn lookup_ltop_shadow(&self, l: u64) -> Option<ForwardEntry> {
        if !self.has_shadow {
            return None;
        }
        Some(self.state.read().shadow[l as usize])
    }

    /// Recovers the logical address that currently owns physical page
    /// `p`, or the poison value if it has been invalidated.
    pub fn lookup_ptol(&self, p: u64) -> i64 {
        self.state.read().reverse[p as usize]
    }

    /// Overwrites `forward[l]` (or `shadow[l]`) with a fresh mapping
    /// to `new_addr`/`new_block`. If the slot already pointed
    /// somewhere, that old physical page is marked invalid on its
    /// owning block and its reverse entry is poisoned, atomically
    /// with the remap (spec §4.3).
    pub fn update_map(
        &self,
        l: u64,
        new_addr: u64,
        new_block: u32,
        target: MapTarget,
        blocks: &BlockTable,
    ) -> Result<()> {
        if l as usize >= self.forward_len() {
            return Err(FtlError::AddressOutOfRange(l));
        }

        let mut g = self.state.write();
        let slot = match target {
            MapTarget::Primary => &mut g.forward[l as usize],
            MapTarget::Shadow => &mut g.shadow[l as usize],
        };

        if let Some(old_block) = slot.block {
            let old_addr = slot.addr as u64;
            let (owning_block, local) = self.owning_block_and_local(old_addr);
            if owning_block != old_block {
                error!(l, old_block, owning_block, "stale block back-reference in forward entry");
            }
            blocks.get(owning_block).invalidate_local(local);
            g.reverse[old_addr as usize] = LTOP_EMPTY;
        }

        let slot = match target {
            MapTarget::Primary => &mut g.forward[l as usize],
            MapTarget::Shadow => &mut g.shadow[l as usize],
        };
        slot.addr = new_addr as i64;
        slot.block = Some(new_block);
        g.reverse[new_addr as usize] = l as i64;

        Ok(())
    }

    /// Drops the shadow entry for `l` without touching the primary
    /// (spec §4.4: "when the primary is updated, the old shadow entry
    /// is trimmed").
    pub fn trim_shadow(&self, l: u64, blocks: &BlockTable) {
        if !self.has_shadow {
            return;
        }
        let mut g = self.state.write();
        let slot = g.shadow[l as usize];
        if let Some(old_block) = slot.block {
            let old_addr = slot.addr as u64;
            let (owning_block, local) = self.owning_block_and_local(old_addr);
            if owning_block == old_block {
                blocks.get(owning_block).invalidate_local(local);
            }
            g.reverse[old_addr as usize] = LTOP_EMPTY;
            g.shadow[l as usize] = ForwardEntry::default();
        }
    }

    fn forward_len(&self) -> usize {
        self.state.read().forward.len()
    }
}

/// One lock-order-free region currently held by a reader or writer.
type Span = (u64, u64);

fn overlaps(a: Span, b: Span) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

struct RangeLockState {
    held: Vec<Span>,
}

/// Per-logical-address range lock: every read, write, GC-read, and
/// GC-write acquires `[L, len]` before touching the map or issuing
/// I/O; overlapping acquisitions block until release (spec §4.3,
/// §5). This is the ordering primitive — at most one write per L is
/// in flight, and GC of a page waits behind host writes to it.
pub struct RangeLock {
    inner: Mutex<RangeLockState>,
    cvar: Condvar,
}

impl RangeLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RangeLockState { held: Vec::new() }),
            cvar: Condvar::new(),
        }
    }

    pub fn acquire(&self, start: u64, len: u64) -> RangeGuard<'_> {
        let span = (start, len);
        let mut g = self.inner.lock();
        while g.held.iter().any(|&h| overlaps(h, span)) {
            // parking_lot's Condvar takes a MutexGuard from its own
            // Mutex type; wait_for with a small timeout keeps this
            // responsive to spurious wakeups without a raw spin.
            self.cvar.wait_for(&mut g, std::time::Duration::from_millis(5));
        }
        g.held.push(span);
        drop(g);
        RangeGuard { lock: self, span }
    }
}

impl Default for RangeLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RangeGuard<'a> {
    lock: &'a RangeLock,
    span: Span,
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        let mut g = self.lock.inner.lock();
        if let Some(pos) = g.held.iter().position(|&h| h == self.span) {
            g.held.remove(pos);
        }
        drop(g);
        self.lock.cvar.notify_all();
    }
}
