//! External interface contracts: the block-driver shim this FTL sits
//! on top of (spec §6). The core never assumes a concrete backing
//! device; it only relies on the [`Device`] trait.

use crate::error::{RequestOutcome, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Per-channel capability/geometry descriptor returned by
/// `identify_channel`.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDescriptor {
    pub laddr_begin: u64,
    pub laddr_end: u64,
    pub gran_erase: u32,
    pub gran_read: u32,
    pub gran_write: u32,
    pub t_r_us: u64,
    pub t_w_us: u64,
    pub t_e_us: u64,
}

/// A single physical-page I/O handed to the device.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    pub direction: Direction,
    /// Physical page index (dense across all channels/blocks).
    pub phys_page: u64,
    pub payload: Vec<u8>,
}

/// The block-driver shim. Implementations submit commands to hardware
/// and perform erases; everything above this trait is the FTL core.
pub trait Device: Send + Sync {
    fn identify(&self) -> Result<()>;
    fn identify_channel(&self, idx: u32) -> Result<ChannelDescriptor>;
    fn submit(&self, request: DeviceRequest) -> Result<Vec<u8>>;
    /// Optional: not all devices expose an explicit erase command.
    fn erase_block(&self, _block_id: u32) -> Result<()> {
        Ok(())
    }
}

/// A request arriving from the host block interface, before the FTL
/// rewrites its sector.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub sector: u64,
    pub len_sectors: u32,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

/// What `Ftl::submit` hands back to the host: the forward/retry status
/// plus any data a read produced (empty for writes and for `Busy`).
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub outcome: RequestOutcome,
    pub payload: Vec<u8>,
}

/// An in-memory [`Device`] backing store for the demo binary and for
/// integration tests, paralleling the original driver's reference
/// loopback device.
pub struct SimDevice {
    pages: parking_lot::Mutex<Vec<Vec<u8>>>,
    channel: ChannelDescriptor,
    /// Physical page to fail the next I/O against, for exercising the
    /// device-I/O-error path (spec §7).
    fail_page: std::sync::atomic::AtomicU64,
}

const NO_FAIL_PAGE: u64 = u64::MAX;

impl SimDevice {
    pub fn new(nr_phys_pages: u64, page_size: usize, t_r_us: u64, t_w_us: u64, t_e_us: u64) -> Self {
        Self {
            pages: parking_lot::Mutex::new(vec![vec![0u8; page_size]; nr_phys_pages as usize]),
            channel: ChannelDescriptor {
                laddr_begin: 0,
                laddr_end: nr_phys_pages,
                gran_erase: 1,
                gran_read: 1,
                gran_write: 1,
                t_r_us,
                t_w_us,
                t_e_us,
            },
            fail_page: std::sync::atomic::AtomicU64::new(NO_FAIL_PAGE),
        }
    }

    /// Makes the next I/O against `phys_page` fail with `DeviceIo`,
    /// then clears itself.
    pub fn inject_failure_at(&self, phys_page: u64) {
        self.fail_page.store(phys_page, std::sync::atomic::Ordering::Release);
    }
}

impl Device for SimDevice {
    fn identify(&self) -> Result<()> {
        Ok(())
    }

    fn identify_channel(&self, _idx: u32) -> Result<ChannelDescriptor> {
        Ok(self.channel)
    }

    fn submit(&self, request: DeviceRequest) -> Result<Vec<u8>> {
        if self
            .fail_page
            .compare_exchange(
                request.phys_page,
                NO_FAIL_PAGE,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Relaxed,
            )
            .is_ok()
        {
            return Err(crate::error::FtlError::DeviceIo(format!("injected failure at page {}", request.phys_page)));
        }

        let mut pages = self.pages.lock();
        let idx = request.phys_page as usize;
        if idx >= pages.len() {
            return Err(crate::error::FtlError::AddressOutOfRange(request.phys_page));
        }
        match request.direction {
            Direction::Read => Ok(pages[idx].clone()),
            Direction::Write => {
                pages[idx] = request.payload;
                Ok(Vec::new())
            }
        }
    }

    fn erase_block(&self, _block_id: u32) -> Result<()> {
        Ok(())
    }
}
