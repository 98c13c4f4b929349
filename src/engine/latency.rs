//! Latency-aware placement: every write lands twice, once in a
//! primary pool and once in a shadow pool, so a read can be served
//! from whichever copy is not currently busy (spec §4.4).

use std::sync::atomic::Ordering;

use crate::append_point::alloc_addr_from_ap;
use crate::constants::HintFlags;
use crate::error::{FtlError, Result};
use crate::map::MapTarget;

use super::{Engine, EngineContext, PlacementDecision};

pub struct LatencyEngine;

impl LatencyEngine {
    pub fn new() -> Self {
        Self
    }

    fn write_one(ctx: &EngineContext<'_>, pool_id: u32, is_gc: bool, target: MapTarget) -> Result<PlacementDecision> {
        let candidates: Vec<_> = ctx.aps.iter().filter(|ap| ap.pool_id == pool_id).collect();
        if candidates.is_empty() {
            return Err(FtlError::Invariant(format!("no append points configured for pool {pool_id}")));
        }
        let idx = (ctx.rr_counter.fetch_add(1, Ordering::Relaxed) as usize) % candidates.len();
        let ap = candidates[idx];
        let pool = &ctx.pools[pool_id as usize];

        let (addr, block) = alloc_addr_from_ap(ap, pool, is_gc)?;
        Ok(PlacementDecision {
            ap_id: ap.id,
            block,
            addr,
            target,
        })
    }

    /// Identifies which map (primary or shadow) currently holds
    /// `old_addr` for `l`, so a GC relocation rewrites the same copy
    /// it is reclaiming instead of unconditionally touching both
    /// (spec §4.4: "MAP_PRIMARY, MAP_SHADOW, or MAP_SINGLE otherwise").
    fn target_for_relocation(ctx: &EngineContext<'_>, l: u64, old_addr: u64) -> MapTarget {
        if ctx.map.lookup_ltop_shadow(l).map(|e| e.addr as u64) == Some(old_addr) {
            MapTarget::Shadow
        } else {
            MapTarget::Primary
        }
    }
}

impl Default for LatencyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LatencyEngine {
    fn name(&self) -> &'static str {
        "latency"
    }

    fn map_page(&self, ctx: &EngineContext<'_>, l: u64, is_gc: bool) -> Result<Vec<PlacementDecision>> {
        if ctx.hints.find_hint(l, HintFlags::LATENCY).is_some() {
            let primary = Self::write_one(ctx, 0, is_gc, MapTarget::Primary)?;
            let shadow = Self::write_one(ctx, 1, is_gc, MapTarget::Shadow)?;
            return Ok(vec![primary, shadow]);
        }

        Ok(vec![Self::write_one(ctx, 0, is_gc, MapTarget::Primary)?])
    }

    fn relocate(&self, ctx: &EngineContext<'_>, l: u64, old_addr: u64) -> Result<Vec<PlacementDecision>> {
        let target = Self::target_for_relocation(ctx, l, old_addr);
        let pool_id = match target {
            MapTarget::Primary => 0,
            MapTarget::Shadow => 1,
        };
        Ok(vec![Self::write_one(ctx, pool_id, true, target)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockGeometry;
    use crate::hint::{HintClass, HintEntry, HintStore};
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

    fn harness() -> (Vec<Arc<Pool>>, Vec<Arc<crate::append_point::AppendPoint>>, AddressMap, BlockTable, HintStore) {
        let pools = vec![Arc::new(Pool::new(0, 2, geom())), Arc::new(Pool::new(1, 2, geom()))];
        let aps = vec![
            Arc::new(crate::append_point::AppendPoint::new(0, 0, 25, 500, 1500)),
            Arc::new(crate::append_point::AppendPoint::new(1, 1, 25, 500, 1500)),
        ];
        let map = AddressMap::new(64, 4, true);
        let mut all_blocks = pools[0].blocks.clone();
        all_blocks.extend(pools[1].blocks.clone());
        let blocks = BlockTable::new(all_blocks);
        let hints = HintStore::new();
        (pools, aps, map, blocks, hints)
    }

    #[test]
    fn hinted_write_dual_writes_across_two_pools() {
        let (pools, aps, map, blocks, hints) = harness();
        hints
            .send_hint(
                &[HintEntry { ino: 1, start_lba: 0, count: 1, class: HintClass::Unknown }],
                HintFlags::LATENCY,
                HintFlags::LATENCY,
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

        let engine = LatencyEngine::new();
        let decisions = engine.map_page(&ctx, 0, false).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].target, MapTarget::Primary);
        assert_eq!(decisions[1].target, MapTarget::Shadow);
        assert_ne!(decisions[0].block.pool_id, decisions[1].block.pool_id);
    }

    #[test]
    fn unhinted_write_lands_a_single_primary_mapping() {
        let (pools, aps, map, blocks, hints) = harness();
        let counter = AtomicU32::new(0);

        let ctx = EngineContext {
            pools: &pools,
            aps: &aps,
            map: &map,
            blocks: &blocks,
            hints: &hints,
            rr_counter: &counter,
        };

        let engine = LatencyEngine::new();
        let decisions = engine.map_page(&ctx, 0, false).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].target, MapTarget::Primary);
    }

    #[test]
    fn gc_relocation_rewrites_only_the_copy_it_reclaims() {
        let (pools, aps, map, blocks, hints) = harness();
        let counter = AtomicU32::new(0);
        let ctx = EngineContext {
            pools: &pools,
            aps: &aps,
            map: &map,
            blocks: &blocks,
            hints: &hints,
            rr_counter: &counter,
        };

        hints
            .send_hint(
                &[HintEntry { ino: 1, start_lba: 0, count: 1, class: HintClass::Unknown }],
                HintFlags::LATENCY,
                HintFlags::LATENCY,
            )
            .unwrap();
        let engine = LatencyEngine::new();
        let decisions = engine.map_page(&ctx, 0, false).unwrap();
        for d in &decisions {
            map.update_map(0, d.addr, d.block.id, d.target, &blocks).unwrap();
        }
        let shadow_addr = map.lookup_ltop_shadow(0).unwrap().addr as u64;

        let relocated = engine.relocate(&ctx, 0, shadow_addr).unwrap();
        assert_eq!(relocated.len(), 1);
        assert_eq!(relocated[0].target, MapTarget::Shadow);
    }
}
