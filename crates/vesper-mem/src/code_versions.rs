//! Per-page code generation counters.
//!
//! Every page that has (or ever had) an executable mapping gets a generation
//! number. Writes overlapping executable ranges bump the generations of the
//! touched pages *before* the write is performed, so by the time another
//! thread can observe the new bytes, any resident translation for those
//! pages is already detectably stale. The translation cache captures a
//! snapshot of the generations a block spans and re-checks it on every
//! lookup; the check is an integer compare per page, which keeps the hot
//! dispatch path free of locks on the write-rarely table.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Bound on how many page generations one snapshot may capture; a block
/// never spans anywhere near this many pages.
pub const MAX_SNAPSHOT_PAGES: usize = 64;

#[derive(Debug, Default)]
pub struct CodeVersions {
    pages: RwLock<HashMap<u64, u32>>,
}

impl CodeVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of the page containing `addr` (0 if never bumped).
    pub fn version(&self, page: u64) -> u32 {
        self.pages
            .read()
            .expect("code version table poisoned")
            .get(&page)
            .copied()
            .unwrap_or(0)
    }

    /// Bump the generation of every page overlapping `[addr, addr + len)`.
    pub fn bump_write(&self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = addr >> PAGE_SHIFT;
        let last = addr
            .checked_add(len - 1)
            .map_or(u64::MAX >> PAGE_SHIFT, |end| end >> PAGE_SHIFT);
        let mut pages = self.pages.write().expect("code version table poisoned");
        let mut page = first;
        loop {
            *pages.entry(page).or_insert(0) += 1;
            if page == last {
                break;
            }
            page += 1;
        }
    }

    /// Capture `(page, generation)` pairs for every page overlapping
    /// `[addr, addr + len)`, clamped to [`MAX_SNAPSHOT_PAGES`].
    pub fn snapshot(&self, addr: u64, len: u64) -> Vec<(u64, u32)> {
        let first = addr >> PAGE_SHIFT;
        let span = if len == 0 {
            1
        } else {
            ((addr & (PAGE_SIZE - 1)) + len).div_ceil(PAGE_SIZE)
        };
        let count = span.min(MAX_SNAPSHOT_PAGES as u64);
        let pages = self.pages.read().expect("code version table poisoned");
        (0..count)
            .map(|i| {
                let page = first.wrapping_add(i);
                (page, pages.get(&page).copied().unwrap_or(0))
            })
            .collect()
    }

    /// Whether every entry of a previously captured snapshot is still
    /// current.
    pub fn snapshot_is_current(&self, snapshot: &[(u64, u32)]) -> bool {
        let pages = self.pages.read().expect("code version table poisoned");
        snapshot
            .iter()
            .all(|&(page, gen)| pages.get(&page).copied().unwrap_or(0) == gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_invalidates_snapshot() {
        let versions = CodeVersions::new();
        let snap = versions.snapshot(0x1000, 8);
        assert!(versions.snapshot_is_current(&snap));
        versions.bump_write(0x1004, 4);
        assert!(!versions.snapshot_is_current(&snap));
    }

    #[test]
    fn bump_spans_pages() {
        let versions = CodeVersions::new();
        versions.bump_write(PAGE_SIZE - 1, 2);
        assert_eq!(versions.version(0), 1);
        assert_eq!(versions.version(1), 1);
        assert_eq!(versions.version(2), 0);
    }

    #[test]
    fn snapshot_is_bounded() {
        let versions = CodeVersions::new();
        let snap = versions.snapshot(0, u64::MAX);
        assert_eq!(snap.len(), MAX_SNAPSHOT_PAGES);
    }

    #[test]
    fn bump_near_end_of_address_space_does_not_panic() {
        let versions = CodeVersions::new();
        versions.bump_write(u64::MAX - 1, 2);
    }
}
