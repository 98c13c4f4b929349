//! Hint submission and lookup: user- or kernel-supplied placement
//! advice consumed by the swap, latency, and pack engines (spec §3,
//! §4.5).

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::constants::{HintFlags, HINT_DATA_MAX_INOS};
use crate::error::{FtlError, Result};

/// Best-effort file-content classification, used by the pack engine to
/// decide how aggressively to group an inode's pages (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintClass {
    Unknown,
    /// `ftyp` box signature: large, sequentially-written media file.
    Video,
    /// Two-byte signature used by common embedded database index
    /// formats: small, frequently-overwritten pages.
    DatabaseIndex,
    Metadata,
    Swap,
}

/// Classifies a buffer's leading bytes. Returns `Unknown` on anything
/// not recognized; never fails.
pub fn classify_bytes(buf: &[u8]) -> HintClass {
    if buf.len() >= 8 && &buf[4..8] == b"ftyp" {
        return HintClass::Video;
    }
    if buf.len() >= 2 && buf[0] == 0x0D && buf[1] == 0x00 {
        return HintClass::DatabaseIndex;
    }
    HintClass::Unknown
}

/// One `{ino, start_lba, count, class}` entry in a submitted hint
/// payload.
#[derive(Debug, Clone, Copy)]
pub struct HintEntry {
    pub ino: u64,
    pub start_lba: u64,
    pub count: u32,
    pub class: HintClass,
}

/// A range of logical addresses the active engine should treat
/// specially, together with how many matches it is still good for.
struct HintInfo {
    laddr_begin: u64,
    laddr_end: u64,
    flags: HintFlags,
    ino: Option<u64>,
    class: HintClass,
    matches: u32,
    processed: u32,
}

impl HintInfo {
    fn covers(&self, l: u64) -> bool {
        l >= self.laddr_begin && l < self.laddr_end
    }
}

/// Outstanding hints, consulted by an engine on every mapped write and
/// trimmed as they're consumed (spec §4.5).
pub struct HintStore {
    entries: Mutex<VecDeque<HintInfo>>,
}

impl HintStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Accepts a batch of hint entries for the engine whose flags are
    /// set in `active_flags`; entries for a different engine, or past
    /// the wire bound, are rejected.
    pub fn send_hint(&self, entries: &[HintEntry], flags: HintFlags, active_flags: HintFlags) -> Result<()> {
        if entries.is_empty() {
            return Err(FtlError::MalformedHint("empty hint payload".into()));
        }
        if entries.len() > HINT_DATA_MAX_INOS {
            return Err(FtlError::MalformedHint(format!(
                "{} entries exceeds HINT_DATA_MAX_INOS={}",
                entries.len(),
                HINT_DATA_MAX_INOS
            )));
        }
        if (flags & active_flags).is_empty() {
            warn!(?flags, ?active_flags, "dropping hint for an inactive engine");
            return Ok(());
        }

        let mut g = self.entries.lock();
        for e in entries {
            if e.count == 0 {
                return Err(FtlError::MalformedHint("zero-length hint range".into()));
            }
            g.push_back(HintInfo {
                laddr_begin: e.start_lba,
                laddr_end: e.start_lba + e.count as u64,
                flags,
                ino: Some(e.ino),
                class: e.class,
                matches: e.count,
                processed: 0,
            });
        }
        Ok(())
    }

    /// Looks up the hint covering logical address `l` that is relevant
    /// to the engine flags the caller holds. Consumes one match;
    /// entries are removed once fully processed.
    pub fn find_hint(&self, l: u64, engine_flags: HintFlags) -> Option<(HintFlags, Option<u64>, HintClass)> {
        let mut g = self.entries.lock();
        let idx = g.iter().position(|h| h.covers(l) && !(h.flags & engine_flags).is_empty())?;

        let info = &mut g[idx];
        let result = (info.flags, info.ino, info.class);
        info.processed += 1;
        if info.processed >= info.matches {
            g.remove(idx);
        }
        Some(result)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HintStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ino: u64, start: u64, count: u32) -> HintEntry {
        HintEntry {
            ino,
            start_lba: start,
            count,
            class: HintClass::Unknown,
        }
    }

    #[test]
    fn rejects_oversize_payload() {
        let store = HintStore::new();
        let entries: Vec<_> = (0..HINT_DATA_MAX_INOS + 1).map(|i| entry(i as u64, i as u64, 1)).collect();
        assert!(store.send_hint(&entries, HintFlags::PACK, HintFlags::PACK).is_err());
    }

    #[test]
    fn find_hint_consumes_and_expires_matches() {
        let store = HintStore::new();
        store.send_hint(&[entry(7, 10, 2)], HintFlags::PACK, HintFlags::PACK).unwrap();

        assert!(store.find_hint(10, HintFlags::PACK).is_some());
        assert!(store.find_hint(11, HintFlags::PACK).is_some());
        // Both of the two covered addresses have now been consumed once
        // each, reaching `matches`, so the entry should be gone.
        assert!(store.find_hint(10, HintFlags::PACK).is_none());
    }

    #[test]
    fn find_hint_ignores_entries_for_other_engines() {
        let store = HintStore::new();
        store.send_hint(&[entry(1, 0, 4)], HintFlags::SWAP, HintFlags::SWAP | HintFlags::PACK).unwrap();
        assert!(store.find_hint(0, HintFlags::PACK).is_none());
        assert!(store.find_hint(0, HintFlags::SWAP).is_some());
    }

    #[test]
    fn classify_bytes_recognizes_known_signatures() {
        let mut video = vec![0u8; 12];
        video[4..8].copy_from_slice(b"ftyp");
        assert_eq!(classify_bytes(&video), HintClass::Video);

        assert_eq!(classify_bytes(&[0x0D, 0x00, 0xAB]), HintClass::DatabaseIndex);
        assert_eq!(classify_bytes(&[1, 2, 3]), HintClass::Unknown);
    }
}
