// # ftl-sim
//
// Standalone demonstration binary: builds an in-memory flash device,
// brings up the FTL core over it, and drives a short write/read/GC
// workload while printing pool statistics.

use std::sync::Arc;
use std::time::Duration;

use openssd_ftl::config::EngineKind;
use openssd_ftl::device::{Direction, HostRequest, SimDevice};
use openssd_ftl::{Ftl, FtlConfig, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = FtlConfig {
        device_path: "sim://memory".to_string(),
        engine: EngineKind::None,
        nr_pools: 1,
        blocks_per_pool: 8,
        pages_per_block: 16,
        aps_per_pool: 1,
        gc_period: Duration::from_millis(200),
        ..FtlConfig::default()
    };

    let host_pages_per_block = config.host_pages_per_block() as u64;
    let nr_phys_pages = config.nr_pools as u64 * config.blocks_per_pool as u64 * host_pages_per_block;
    let device: Arc<dyn openssd_ftl::device::Device> =
        Arc::new(SimDevice::new(nr_phys_pages, 4096, config.t_read_us, config.t_write_us, config.t_erase_us));

    tracing::info!("bringing up FTL core over a {nr_phys_pages}-page simulated device");
    let ftl = Ftl::new(config, device)?;

    let sectors_per_page: u32 = 8;
    for i in 0..40u64 {
        let payload = vec![(i % 256) as u8; 4096];
        ftl.submit(HostRequest {
            sector: i * sectors_per_page as u64,
            len_sectors: sectors_per_page,
            direction: Direction::Write,
            payload,
        })?;
    }

    // Overwrite the first ten pages to generate invalid pages for the
    // GC worker to reclaim on its next sweep.
    for i in 0..10u64 {
        let payload = vec![0xFFu8; 4096];
        ftl.submit(HostRequest {
            sector: i * sectors_per_page as u64,
            len_sectors: sectors_per_page,
            direction: Direction::Write,
            payload,
        })?;
    }

    std::thread::sleep(Duration::from_millis(500));

    println!();
    println!("╭─────────────────────────────────────────────╮");
    println!("│  ftl-sim workload complete                   │");
    println!("│  engine: {:<37}│", ftl.engine_name());
    for stats in ftl.pool_stats() {
        println!(
            "│  pool {:<2} free {:>3}/{:<3}                     │",
            stats.pool_id, stats.nr_free_blocks, stats.nr_blocks
        );
    }
    println!("╰─────────────────────────────────────────────╯");

    ftl.exit();
    Ok(())
}

fn print_banner() {
    println!("╭─────────────────────────────────────────────╮");
    println!("│  openssd-ftl simulator                       │");
    println!("│  address mapping · GC · hinted placement     │");
    println!("╰─────────────────────────────────────────────╯");
}
