//! Swap-aware placement: pages hinted as swap traffic are steered
//! toward the flash device's fast pages via the round-robin-fastest
//! allocator; everything else falls back to plain round robin (spec
//! §4.4).

use std::sync::atomic::Ordering;

use crate::append_point::{alloc_addr_from_ap, alloc_phys_fastest};
use crate::constants::{EngineCapabilities, HintFlags};
use crate::map::MapTarget;

use super::{Engine, EngineContext, PlacementDecision};

pub struct SwapEngine;

impl SwapEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for SwapEngine {
    fn name(&self) -> &'static str {
        "swap"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::ALLOC_PHYS_HOOK
    }

    fn map_page(&self, ctx: &EngineContext<'_>, l: u64, is_gc: bool) -> crate::error::Result<Vec<PlacementDecision>> {
        if ctx.hints.find_hint(l, HintFlags::SWAP).is_some() {
            let (addr, block) = alloc_phys_fastest(ctx.aps, ctx.rr_counter)?;
            return Ok(vec![PlacementDecision {
                ap_id: block.ap().unwrap_or(0),
                block,
                addr,
                target: MapTarget::Primary,
            }]);
        }

        let n = ctx.aps.len() as u32;
        let idx = ctx.rr_counter.fetch_add(1, Ordering::Relaxed) % n;
        let ap = &ctx.aps[idx as usize];
        let pool = &ctx.pools[ap.pool_id as usize];
        let (addr, block) = alloc_addr_from_ap(ap, pool, is_gc)?;
        Ok(vec![PlacementDecision {
            ap_id: ap.id,
            block,
            addr,
            target: MapTarget::Primary,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockGeometry;
    use crate::hint::{HintEntry, HintStore};
    use crate::map::{AddressMap, BlockTable};
    use crate::pool::Pool;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn geom() -> BlockGeometry {
        BlockGeometry {
            pages_per_block: 4,
            host_pages_per_flash_page: 1,
        }
    }

    #[test]
    fn hinted_swap_write_uses_the_fastest_path() {
        let pool = Arc::new(Pool::new(0, 2, geom()));
        let ap = Arc::new(crate::append_point::AppendPoint::new(0, 0, 25, 500, 1500));
        let block = pool.get_block(false).unwrap();
        ap.set_cur(block);
        let aps = vec![ap];
        let pools = vec![pool];
        let map = AddressMap::new(64, 4, false);
        let blocks = BlockTable::new(pools[0].blocks.clone());
        let hints = HintStore::new();
        hints
            .send_hint(
                &[HintEntry {
                    ino: 1,
                    start_lba: 5,
                    count: 1,
                    class: crate::hint::HintClass::Swap,
                }],
                HintFlags::SWAP,
                HintFlags::SWAP,
            )
            .unwrap();
        let counter = AtomicU32::new(0);

        let ctx = EngineContext {
            pools: &pools,
            aps: &aps,
            map: &map,
            blocks: &blocks,
            hints: &hints,
            rr_counter: &counter,
        };

        let engine = SwapEngine::new();
        let decision = engine.map_page(&ctx, 5, false).unwrap();
        assert_eq!(decision.len(), 1);
    }
}
