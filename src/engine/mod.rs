//! Write-placement engines: pluggable policy for which append point
//! (and, for the latency engine, which pools) serve a given logical
//! write (spec §4.4). Replaces the original driver's table of nullable
//! function pointers with a trait object plus an explicit capability
//! bitset (REDESIGN FLAGS item 4).

mod latency;
mod pack;
mod round_robin;
mod swap;

pub use latency::LatencyEngine;
pub use pack::PackEngine;
pub use round_robin::RoundRobinEngine;
pub use swap::SwapEngine;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::append_point::AppendPoint;
use crate::block::Block;
use crate::config::EngineKind;
use crate::constants::EngineCapabilities;
use crate::error::Result;
use crate::hint::HintStore;
use crate::map::{AddressMap, BlockTable, MapTarget};
use crate::pool::Pool;

/// Everything an engine needs to place a page, threaded through as
/// explicit borrows rather than back-pointers stored on the engine
/// itself (REDESIGN FLAGS item 1).
pub struct EngineContext<'a> {
    pub pools: &'a [Arc<Pool>],
    pub aps: &'a [Arc<AppendPoint>],
    pub map: &'a AddressMap,
    pub blocks: &'a BlockTable,
    pub hints: &'a HintStore,
    pub rr_counter: &'a AtomicU32,
}

/// One physical page reserved for a logical write, and which map
/// (primary or shadow) it should land in.
#[derive(Clone)]
pub struct PlacementDecision {
    pub ap_id: u32,
    pub block: Arc<Block>,
    pub addr: u64,
    pub target: MapTarget,
}

/// A write-placement policy. Exactly one engine is active per device
/// (spec §4.4); [`EngineKind::None`] installs [`RoundRobinEngine`].
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::empty()
    }

    /// Reserves the physical page(s) backing a write to logical
    /// address `l`. Most engines return exactly one decision; the
    /// latency engine returns two (primary + shadow).
    fn map_page(&self, ctx: &EngineContext<'_>, l: u64, is_gc: bool) -> Result<Vec<PlacementDecision>>;

    /// Reserves the replacement page(s) for a GC relocation of the
    /// page currently at `old_addr`. Engines with a single mapping per
    /// logical address can ignore `old_addr` and defer to `map_page`;
    /// the latency engine overrides this to identify which copy
    /// (primary or shadow) it is reclaiming by comparing `old_addr`
    /// against both entries (spec §4.4).
    fn relocate(&self, ctx: &EngineContext<'_>, l: u64, old_addr: u64) -> Result<Vec<PlacementDecision>> {
        let _ = old_addr;
        self.map_page(ctx, l, true)
    }

    /// Lets an engine react after a write has landed (the pack engine
    /// uses this to bind an append point to an inode).
    fn on_write_complete(&self, _ctx: &EngineContext<'_>, _l: u64, _decisions: &[PlacementDecision]) {}

    fn init(&self, _ctx: &EngineContext<'_>) -> Result<()> {
        Ok(())
    }

    fn exit(&self, _ctx: &EngineContext<'_>) {}
}

pub fn build(kind: EngineKind) -> Box<dyn Engine> {
    match kind {
        EngineKind::None => Box::new(RoundRobinEngine::new()),
        EngineKind::Swap => Box::new(SwapEngine::new()),
        EngineKind::Latency => Box::new(LatencyEngine::new()),
        EngineKind::Pack => Box::new(PackEngine::new()),
    }
}
