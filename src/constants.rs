//! Wire and sizing constants shared across the FTL core.

use bitflags::bitflags;

/// Page size exposed to the host block interface.
pub const EXPOSED_PAGE_SIZE: usize = 4096;
/// Physical flash page size.
pub const FLASH_PAGE_SIZE: usize = 4096;
/// Sentinel meaning "no physical mapping" in the forward map.
pub const LTOP_EMPTY: i64 = -1;

/// Number of host-exposed pages that pack into one flash page.
pub const fn host_pages_per_flash_page() -> usize {
    FLASH_PAGE_SIZE / EXPOSED_PAGE_SIZE
}

/// Upper bound on host-pages-per-block the invalid-page bitmap can
/// address (8 machine words, matching `MAX_INVALID_PAGES_STORAGE` in
/// the original header). Configurations whose `pages_per_block *
/// host_pages_per_flash_page()` exceeds this are rejected at init.
pub const MAX_INVALID_PAGES_STORAGE: usize = 8;
pub const BITS_PER_STORAGE_WORD: usize = u64::BITS as usize;
pub const MAX_HOST_PAGES_PER_BLOCK: usize = MAX_INVALID_PAGES_STORAGE * BITS_PER_STORAGE_WORD;

/// Maximum number of `{ino, start_lba, count, class}` entries carried
/// in a single hint payload.
pub const HINT_DATA_MAX_INOS: usize = 8;

/// Fixed magic number returned by the ID ioctl.
pub const OPENSSD_IOCTL_ID_MAGIC: u32 = 0x4F53_4644; // "OSFD"

bitflags! {
    /// Flags carried on the wire in a submitted hint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HintFlags: u32 {
        const SWAP    = 1 << 0;
        const IOCTL   = 1 << 1;
        const LATENCY = 1 << 2;
        const PACK    = 1 << 3;
    }
}

bitflags! {
    /// Engine/device capability and behavior flags negotiated at ctr time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EngineFlags: u32 {
        const SWAP             = 1 << 0;
        const LATENCY          = 1 << 1;
        const PACK             = 1 << 2;
        const POOL_SERIALIZE   = 1 << 15;
        const FAST_SLOW_PAGES  = 1 << 16;
        const NO_WAITS         = 1 << 17;
    }
}

bitflags! {
    /// Per-engine capability set, replacing nullable hook pointers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EngineCapabilities: u32 {
        const ALLOC_PHYS_HOOK = 1 << 0;
        const GC_PRIVATE      = 1 << 1;
    }
}
