//! Default placement: round-robin across append points, one physical
//! page per write, no hints consulted (spec §4.4).

use std::sync::atomic::Ordering;

use crate::append_point::alloc_addr_from_ap;
use crate::map::MapTarget;

use super::{Engine, EngineContext, PlacementDecision};

pub struct RoundRobinEngine;

impl RoundRobinEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RoundRobinEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for RoundRobinEngine {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn map_page(&self, ctx: &EngineContext<'_>, _l: u64, is_gc: bool) -> crate::error::Result<Vec<PlacementDecision>> {
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
    use crate::hint::HintStore;
    use crate::map::AddressMap;
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
    fn round_robin_spreads_writes_across_aps() {
        let pool = Arc::new(Pool::new(0, 4, geom()));
        let aps: Vec<_> = (0..2)
            .map(|id| Arc::new(crate::append_point::AppendPoint::new(id, 0, 25, 500, 1500)))
            .collect();
        let pools = vec![pool];
        let map = AddressMap::new(64, 4, false);
        let blocks = crate::map::BlockTable::new(pools[0].blocks.clone());
        let hints = HintStore::new();
        let counter = AtomicU32::new(0);

        let ctx = EngineContext {
            pools: &pools,
            aps: &aps,
            map: &map,
            blocks: &blocks,
            hints: &hints,
            rr_counter: &counter,
        };

        let engine = RoundRobinEngine::new();
        let d0 = engine.map_page(&ctx, 0, false).unwrap();
        let d1 = engine.map_page(&ctx, 1, false).unwrap();
        assert_ne!(d0[0].ap_id, d1[0].ap_id);
    }
}
