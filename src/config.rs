//! Construction-time configuration for an FTL instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::EngineFlags;
use crate::error::{FtlError, Result};

/// Which placement engine to install. Only one engine is active per
/// device (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    None,
    Swap,
    Latency,
    Pack,
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::None
    }
}

/// Construction-time configuration, mirroring the `struct nvm_config`
/// plus the pool/block geometry the original driver hardcoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtlConfig {
    /// Backing device path (opaque to the core; forwarded to the
    /// device driver hook).
    pub device_path: String,
    pub engine: EngineKind,
    pub nr_pools: u32,
    pub blocks_per_pool: u32,
    pub pages_per_block: u32,
    /// Append points per pool. Defaults to 1.
    pub aps_per_pool: u32,
    pub flags: EngineFlags,
    /// GC sweep period. Defaults to 10s, clamped to >= 1s.
    #[serde(with = "duration_ms")]
    pub gc_period: Duration,
    pub t_read_us: u64,
    pub t_write_us: u64,
    pub t_erase_us: u64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            engine: EngineKind::None,
            nr_pools: 1,
            blocks_per_pool: 0,
            pages_per_block: 0,
            aps_per_pool: 1,
            flags: EngineFlags::empty(),
            gc_period: Duration::from_secs(10),
            t_read_us: 25,
            t_write_us: 500,
            t_erase_us: 1500,
        }
    }
}

impl FtlConfig {
    /// Validates the configuration and normalizes defaults, the way a
    /// constructor returns a config error synchronously (spec §7).
    pub fn validate(mut self) -> Result<Self> {
        if self.nr_pools == 0 {
            return Err(FtlError::Config("nr_pools must be > 0".into()));
        }
        if self.blocks_per_pool == 0 {
            return Err(FtlError::Config("blocks_per_pool must be > 0".into()));
        }
        if self.pages_per_block == 0 {
            return Err(FtlError::Config("pages_per_block must be > 0".into()));
        }
        if self.aps_per_pool == 0 {
            self.aps_per_pool = 1;
        }

        let host_pages_per_block =
            self.pages_per_block as usize * crate::constants::host_pages_per_flash_page();
        if host_pages_per_block > crate::constants::MAX_HOST_PAGES_PER_BLOCK {
            return Err(FtlError::Config(format!(
                "pages_per_block={} yields {} host pages per block, exceeds bitmap capacity {}",
                self.pages_per_block,
                host_pages_per_block,
                crate::constants::MAX_HOST_PAGES_PER_BLOCK
            )));
        }

        if self.gc_period < Duration::from_secs(1) {
            self.gc_period = Duration::from_secs(1);
        }

        match self.engine {
            EngineKind::Swap => self.flags |= EngineFlags::SWAP | EngineFlags::FAST_SLOW_PAGES,
            EngineKind::Latency => self.flags |= EngineFlags::LATENCY,
            EngineKind::Pack => self.flags |= EngineFlags::PACK,
            EngineKind::None => {}
        }

        if matches!(self.engine, EngineKind::Latency) && self.nr_pools < 2 {
            return Err(FtlError::Config(
                "latency engine requires at least two pools for primary/shadow placement".into(),
            ));
        }

        Ok(self)
    }

    pub fn host_pages_per_block(&self) -> usize {
        self.pages_per_block as usize * crate::constants::host_pages_per_flash_page()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_once_geometry_is_set() {
        let cfg = FtlConfig {
            blocks_per_pool: 4,
            pages_per_block: 4,
            ..FtlConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_geometry() {
        let cfg = FtlConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn clamps_short_gc_period() {
        let cfg = FtlConfig {
            blocks_per_pool: 4,
            pages_per_block: 4,
            gc_period: Duration::from_millis(10),
            ..FtlConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(cfg.gc_period, Duration::from_secs(1));
    }

    #[test]
    fn latency_engine_requires_two_pools() {
        let cfg = FtlConfig {
            blocks_per_pool: 4,
            pages_per_block: 4,
            engine: EngineKind::Latency,
            nr_pools: 1,
            ..FtlConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
