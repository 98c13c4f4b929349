//! Top-level wiring: constructs pools, append points, the address
//! map, the active engine, and the GC workers from a [`FtlConfig`],
//! and exposes the host-facing submit/ioctl surface (spec §3, §6).

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tracing::info;

use crate::append_point::AppendPoint;
use crate::config::FtlConfig;
use crate::constants::{EngineFlags, HintFlags, OPENSSD_IOCTL_ID_MAGIC};
use crate::device::{Device, HostRequest, HostResponse};
use crate::engine::{self, Engine};
use crate::error::Result;
use crate::gc::{GarbageCollector, GcShared};
use crate::hint::{HintEntry, HintStore};
use crate::map::{AddressMap, BlockTable};
use crate::pipeline::RequestPipeline;
use crate::pool::Pool;

/// Result of an ioctl call: the ID query returns the fixed magic
/// number, hint submissions return nothing on success, and anything
/// the core doesn't recognize is forwarded to the device as an opaque
/// passthrough (spec §6).
#[derive(Debug, Clone)]
pub enum IoctlCommand {
    Id,
    UserHint(Vec<HintEntry>),
    KernelHint(Vec<HintEntry>),
    Passthrough { cmd: u32, payload: Vec<u8> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub pool_id: u32,
    pub nr_blocks: u32,
    pub nr_free_blocks: u32,
}

pub struct Ftl {
    config: FtlConfig,
    pools: Vec<Arc<Pool>>,
    #[allow(dead_code)]
    aps: Vec<Arc<AppendPoint>>,
    map: Arc<AddressMap>,
    #[allow(dead_code)]
    blocks: Arc<BlockTable>,
    engine: Arc<dyn Engine>,
    device: Arc<dyn Device>,
    hints: Arc<HintStore>,
    gc: Arc<GarbageCollector>,
    pipeline: RequestPipeline,
}

impl Ftl {
    pub fn new(config: FtlConfig, device: Arc<dyn Device>) -> Result<Self> {
        let config = config.validate()?;
        let host_pages_per_block = config.host_pages_per_block() as u32;

        let pools: Vec<Arc<Pool>> = (0..config.nr_pools)
            .map(|id| {
                Arc::new(Pool::new(
                    id,
                    config.blocks_per_pool,
                    crate::block::BlockGeometry {
                        pages_per_block: config.pages_per_block,
                        host_pages_per_flash_page: crate::constants::host_pages_per_flash_page() as u32,
                    },
                ))
            })
            .collect();

        let mut aps = Vec::new();
        let mut next_ap_id = 0u32;
        for pool in &pools {
            for _ in 0..config.aps_per_pool {
                aps.push(Arc::new(AppendPoint::new(
                    next_ap_id,
                    pool.id,
                    config.t_read_us,
                    config.t_write_us,
                    config.t_erase_us,
                )));
                next_ap_id += 1;
            }
        }

        let mut all_blocks = Vec::new();
        for pool in &pools {
            all_blocks.extend(pool.blocks.clone());
        }
        let blocks = Arc::new(BlockTable::new(all_blocks));

        let nr_pages = blocks.len() as u64 * host_pages_per_block as u64;
        let has_shadow = config.flags.contains(EngineFlags::LATENCY);
        let map = Arc::new(AddressMap::new(nr_pages, host_pages_per_block, has_shadow));

        let engine: Arc<dyn Engine> = Arc::from(engine::build(config.engine));
        let hints = Arc::new(HintStore::new());
        let range_lock = Arc::new(crate::map::RangeLock::new());
        let rr_counter = Arc::new(AtomicU32::new(0));

        let gc_shared = Arc::new(GcShared {
            pools: pools.clone(),
            aps: aps.clone(),
            map: map.clone(),
            blocks: blocks.clone(),
            engine: engine.clone(),
            device: device.clone(),
            hints: hints.clone(),
            range_lock: range_lock.clone(),
            rr_counter: rr_counter.clone(),
        });
        let gc = Arc::new(GarbageCollector::new(gc_shared, config.gc_period));

        let pipeline = RequestPipeline {
            pools: pools.clone(),
            aps: aps.clone(),
            map: map.clone(),
            blocks: blocks.clone(),
            engine: engine.clone(),
            device: device.clone(),
            hints: hints.clone(),
            range_lock,
            rr_counter,
            pool_serialize: config.flags.contains(EngineFlags::POOL_SERIALIZE),
            gc: gc.clone(),
        };

        let ftl = Self {
            config,
            pools,
            aps,
            map,
            blocks,
            engine,
            device,
            hints,
            gc,
            pipeline,
        };

        ftl.device.identify()?;
        ftl.gc.start();
        info!(
            engine = ftl.engine.name(),
            nr_pools = ftl.config.nr_pools,
            blocks_per_pool = ftl.config.blocks_per_pool,
            "FTL initialized"
        );

        Ok(ftl)
    }

    pub fn submit(&self, request: HostRequest) -> Result<HostResponse> {
        self.pipeline.submit(&request)
    }

    pub fn ioctl(&self, command: IoctlCommand) -> Result<Vec<u8>> {
        match command {
            IoctlCommand::Id => Ok(OPENSSD_IOCTL_ID_MAGIC.to_le_bytes().to_vec()),
            IoctlCommand::UserHint(entries) => {
                let tag = self.active_hint_flags() | HintFlags::IOCTL;
                self.hints.send_hint(&entries, tag, tag)?;
                Ok(Vec::new())
            }
            IoctlCommand::KernelHint(entries) => {
                self.hints.send_hint(&entries, self.active_hint_flags(), self.active_hint_flags())?;
                Ok(Vec::new())
            }
            IoctlCommand::Passthrough { cmd, payload } => {
                self.device.submit(crate::device::DeviceRequest {
                    direction: crate::device::Direction::Write,
                    phys_page: cmd as u64,
                    payload,
                })
            }
        }
    }

    fn active_hint_flags(&self) -> HintFlags {
        let mut f = HintFlags::empty();
        if self.config.flags.contains(EngineFlags::SWAP) {
            f |= HintFlags::SWAP;
        }
        if self.config.flags.contains(EngineFlags::LATENCY) {
            f |= HintFlags::LATENCY;
        }
        if self.config.flags.contains(EngineFlags::PACK) {
            f |= HintFlags::PACK;
        }
        f
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|p| PoolStats {
                pool_id: p.id,
                nr_blocks: p.nr_blocks(),
                nr_free_blocks: p.nr_free_blocks(),
            })
            .collect()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Runs one synchronous GC round against every pool, without
    /// waiting for the background workers' timer. Exposed for tests
    /// and for a host that wants to force collection ahead of an
    /// anticipated burst of writes.
    pub fn force_gc(&self) -> u32 {
        self.pools.iter().map(|pool| self.gc.collect_now(pool)).sum()
    }

    /// Flushes waiting requests, stops the GC workers, and lets the
    /// engine release any resources it holds (spec §5 "Cancellation").
    pub fn exit(&self) {
        self.gc.stop();
        for pool in &self.pools {
            pool.flush_waiting();
        }
        let ctx = crate::engine::EngineContext {
            pools: &self.pools,
            aps: &self.aps,
            map: &self.map,
            blocks: &self.blocks,
            hints: &self.hints,
            rr_counter: &self.pipeline.rr_counter,
        };
        self.engine.exit(&ctx);
        info!("FTL torn down");
    }
}

impl Drop for Ftl {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;
    use crate::device::{ChannelDescriptor, DeviceRequest, Direction};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct MemDevice {
        pages: Mutex<Vec<Vec<u8>>>,
    }

    impl MemDevice {
        fn new(n: usize) -> Self {
            Self {
                pages: Mutex::new(vec![vec![0u8; crate::constants::EXPOSED_PAGE_SIZE]; n]),
            }
        }
    }

    impl Device for MemDevice {
        fn identify(&self) -> Result<()> {
            Ok(())
        }
        fn identify_channel(&self, _idx: u32) -> Result<ChannelDescriptor> {
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

    fn cfg() -> FtlConfig {
        FtlConfig {
            blocks_per_pool: 4,
            pages_per_block: 4,
            gc_period: Duration::from_secs(3600),
            ..FtlConfig::default()
        }
    }

    #[test]
    fn id_ioctl_returns_fixed_magic() {
        let device: Arc<dyn Device> = Arc::new(MemDevice::new(16));
        let ftl = Ftl::new(cfg(), device).unwrap();
        let bytes = ftl.ioctl(IoctlCommand::Id).unwrap();
        assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), OPENSSD_IOCTL_ID_MAGIC);
    }

    #[test]
    fn write_then_read_through_the_full_stack() {
        let device: Arc<dyn Device> = Arc::new(MemDevice::new(16));
        let ftl = Ftl::new(cfg(), device).unwrap();
        let payload = vec![0x7Eu8; crate::constants::EXPOSED_PAGE_SIZE];
        ftl.submit(HostRequest {
            sector: 0,
            len_sectors: 8,
            direction: Direction::Write,
            payload: payload.clone(),
        })
        .unwrap();

        let read = ftl
            .submit(HostRequest {
                sector: 0,
                len_sectors: 8,
                direction: Direction::Read,
                payload: Vec::new(),
            })
            .unwrap()
            .payload;
        assert_eq!(read, payload);
    }

    #[test]
    fn rejects_latency_engine_with_one_pool() {
        let device: Arc<dyn Device> = Arc::new(MemDevice::new(16));
        let bad = FtlConfig {
            engine: EngineKind::Latency,
            nr_pools: 1,
            ..cfg()
        };
        assert!(Ftl::new(bad, device).is_err());
    }
}
