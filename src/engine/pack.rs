//! Pack-aware placement: groups a single inode's pages onto the same
//! append point while hints keep arriving for it, so they end up in
//! the same block and GC later reclaims them together (spec §4.4,
//! §4.5).

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::append_point::alloc_addr_from_ap;
use crate::constants::{EngineCapabilities, HintFlags};
use crate::map::MapTarget;

use super::{Engine, EngineContext, PlacementDecision};

/// An inode/AP association older than this is treated as stale and a
/// fresh append point is chosen instead (spec §4.5).
const ASSOCIATION_TTL: Duration = Duration::from_secs(30);

pub struct PackEngine {
    ttl: Duration,
}

impl PackEngine {
    pub fn new() -> Self {
        Self { ttl: ASSOCIATION_TTL }
    }
}

impl Default for PackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for PackEngine {
    fn name(&self) -> &'static str {
        "pack"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::GC_PRIVATE
    }

    fn map_page(&self, ctx: &EngineContext<'_>, l: u64, is_gc: bool) -> crate::error::Result<Vec<PlacementDecision>> {
        let ino = ctx.hints.find_hint(l, HintFlags::PACK).and_then(|(_, ino, _)| ino);

        let chosen = ino.and_then(|ino| {
            ctx.aps.iter().find(|ap| {
                let g = ap.pack.lock();
                g.ino == Some(ino) && g.since.map(|t| t.elapsed() < self.ttl).unwrap_or(false)
            })
        });

        let ap = match chosen {
            Some(ap) => ap.clone(),
            None => {
                let idx = (ctx.rr_counter.fetch_add(1, Ordering::Relaxed) as usize) % ctx.aps.len();
                ctx.aps[idx].clone()
            }
        };

        if let Some(ino) = ino {
            let mut g = ap.pack.lock();
            g.ino = Some(ino);
            g.since = Some(Instant::now());
        }

        let pool = &ctx.pools[ap.pool_id as usize];
        let (addr, block) = alloc_addr_from_ap(&ap, pool, is_gc)?;
        Ok(vec![PlacementDecision {
            ap_id: ap.id,
            block,
            addr,
            target: MapTarget::Primary,
        }])
    }
}
