// # ftl-hintctl
//
// Small command-line client exercising the hint/ioctl surface against
// a freshly constructed, in-memory FTL instance. Not a real ioctl(2)
// client -- there is no kernel driver here -- just a demonstration of
// the same three-command surface the core exposes.

use std::sync::Arc;
use std::time::Duration;

use openssd_ftl::config::EngineKind;
use openssd_ftl::device::SimDevice;
use openssd_ftl::hint::{HintClass, HintEntry};
use openssd_ftl::{Ftl, FtlConfig, IoctlCommand, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();

    println!("╔══════════════════════════════════════╗");
    println!("║  ftl-hintctl                          ║");
    println!("╚══════════════════════════════════════╝");
    println!();

    let config = FtlConfig {
        engine: EngineKind::Pack,
        nr_pools: 1,
        blocks_per_pool: 4,
        pages_per_block: 8,
        aps_per_pool: 2,
        gc_period: Duration::from_secs(3600),
        ..FtlConfig::default()
    };
    let host_pages_per_block = config.host_pages_per_block() as u64;
    let nr_phys_pages = config.nr_pools as u64 * config.blocks_per_pool as u64 * host_pages_per_block;
    let device: Arc<dyn openssd_ftl::device::Device> =
        Arc::new(SimDevice::new(nr_phys_pages, 4096, config.t_read_us, config.t_write_us, config.t_erase_us));
    let ftl = Ftl::new(config, device)?;

    let magic = ftl.ioctl(IoctlCommand::Id)?;
    println!("ID query -> 0x{:08X}", u32::from_le_bytes(magic.try_into().unwrap()));

    ftl.ioctl(IoctlCommand::UserHint(vec![HintEntry {
        ino: 4242,
        start_lba: 0,
        count: 4,
        class: HintClass::Video,
    }]))?;
    println!("submitted a user hint tagging logical pages 0..4 as inode 4242 (video)");

    ftl.ioctl(IoctlCommand::KernelHint(vec![HintEntry {
        ino: 4242,
        start_lba: 4,
        count: 2,
        class: HintClass::Video,
    }]))?;
    println!("submitted a kernel hint extending the same inode's range");

    ftl.exit();
    Ok(())
}
