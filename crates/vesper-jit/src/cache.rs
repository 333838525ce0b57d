//! Translation cache.
//!
//! Maps (entry address, mode) to compiled blocks shared across guest
//! threads. Staleness is detected in two tiers:
//!
//! 1. a cheap check: the address-space mapping generation and a per-page
//!    code-version snapshot taken before the block's bytes were fetched;
//! 2. on snapshot failure, the block's source bytes are re-fetched and
//!    re-hashed. A matching hash means the pages were written but the code
//!    itself was not (same-page data writes are common when guests keep
//!    data next to code), so the block is republished with a fresh snapshot
//!    instead of being retranslated. A mismatch retires the block.
//!
//! Insertion is first-wins: when two threads translate the same block
//! concurrently, the loser adopts the winner's copy and drops its own.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use vesper_cpu_decoder::inst_len;
use vesper_mem::AddressSpace;
use vesper_types::{IsaMode, Width};

use crate::backend::NativeBlock;
use crate::ir::IrBlock;

/// One published translation.
pub struct CompiledBlock {
    pub ir: Arc<IrBlock>,
    /// Native code for the block, when the backend accepted it.
    pub native: Option<Arc<NativeBlock>>,
    versions: Vec<(u64, u32)>,
    mapping_gen: u64,
}

impl CompiledBlock {
    /// `versions` and `mapping_gen` must have been captured before the
    /// block's bytes were fetched, so a write racing the translation shows
    /// up as a stale snapshot rather than going unnoticed.
    pub fn new(
        ir: Arc<IrBlock>,
        native: Option<Arc<NativeBlock>>,
        versions: Vec<(u64, u32)>,
        mapping_gen: u64,
    ) -> Self {
        CompiledBlock {
            ir,
            native,
            versions,
            mapping_gen,
        }
    }

    fn is_current(&self, space: &AddressSpace) -> bool {
        self.mapping_gen == space.mapping_generation()
            && space.code_versions().snapshot_is_current(&self.versions)
    }
}

type Key = (u64, IsaMode);

#[derive(Default)]
pub struct TranslationCache {
    blocks: RwLock<HashMap<Key, Arc<CompiledBlock>>>,
    translations: AtomicU64,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a current translation for `(pc, mode)`.
    ///
    /// A stale hit is revalidated by hash and either refreshed in place or
    /// retired; retirement returns `None` and the caller retranslates.
    pub fn lookup(
        &self,
        space: &AddressSpace,
        pc: u64,
        mode: IsaMode,
    ) -> Option<Arc<CompiledBlock>> {
        let key = (pc, mode);
        let cached = self.blocks.read().ok()?.get(&key).cloned()?;
        if cached.is_current(space) {
            return Some(cached);
        }
        self.revalidate(space, key, cached)
    }

    fn revalidate(
        &self,
        space: &AddressSpace,
        key: Key,
        stale: Arc<CompiledBlock>,
    ) -> Option<Arc<CompiledBlock>> {
        // Snapshot before hashing: a write landing between the two shows up
        // as stale next lookup instead of being missed.
        let versions = space
            .code_versions()
            .snapshot(stale.ir.entry, stale.ir.byte_len);
        let mapping_gen = space.mapping_generation();
        let rehash = hash_code(space, stale.ir.entry, stale.ir.byte_len, stale.ir.mode);
        if rehash == Some(stale.ir.code_hash) {
            tracing::trace!(pc = key.0, "refreshed translation after same-page write");
            let refreshed = Arc::new(CompiledBlock::new(
                Arc::clone(&stale.ir),
                stale.native.clone(),
                versions,
                mapping_gen,
            ));
            if let Ok(mut blocks) = self.blocks.write() {
                if let Entry::Occupied(mut slot) = blocks.entry(key) {
                    if Arc::ptr_eq(slot.get(), &stale) {
                        slot.insert(Arc::clone(&refreshed));
                    }
                }
            }
            return Some(refreshed);
        }
        tracing::debug!(pc = key.0, "retired stale translation");
        if let Ok(mut blocks) = self.blocks.write() {
            if let Entry::Occupied(slot) = blocks.entry(key) {
                if Arc::ptr_eq(slot.get(), &stale) {
                    slot.remove();
                }
            }
        }
        None
    }

    /// Publish a freshly translated block. First insert wins; a racing
    /// thread's copy is dropped in favor of the published one.
    pub fn insert(
        &self,
        pc: u64,
        mode: IsaMode,
        block: Arc<CompiledBlock>,
    ) -> Arc<CompiledBlock> {
        self.translations.fetch_add(1, Ordering::Relaxed);
        let mut blocks = match self.blocks.write() {
            Ok(b) => b,
            Err(_) => return block,
        };
        match blocks.entry((pc, mode)) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&block));
                block
            }
        }
    }

    /// Number of translations performed (not cache size; refreshes and
    /// lookups do not count).
    pub fn translations(&self) -> u64 {
        self.translations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.clear();
        }
    }
}

/// Hash the current bytes of a translated range the same way translation
/// hashed the words it consumed. `None` when the range is no longer
/// fetchable.
fn hash_code(space: &AddressSpace, entry: u64, byte_len: u64, mode: IsaMode) -> Option<u64> {
    let ilen = inst_len(mode);
    let width = match mode {
        IsaMode::T16 => Width::W16,
        _ => Width::W32,
    };
    let mut hasher = DefaultHasher::new();
    let mut addr = entry;
    while addr < entry + byte_len {
        let word = space.fetch(addr, width).ok()?;
        hasher.write_u32(word as u32);
        addr += ilen;
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{translate_block, BlockLimits};
    use vesper_mem::Perm;

    fn translated(space: &AddressSpace, pc: u64) -> Arc<CompiledBlock> {
        let versions = space.code_versions().snapshot(pc, 64 * 4);
        let gen = space.mapping_generation();
        let ir = translate_block(space, pc, IsaMode::A64, &BlockLimits::default()).unwrap();
        Arc::new(CompiledBlock::new(Arc::new(ir), None, versions, gen))
    }

    fn code_space() -> AddressSpace {
        let space = AddressSpace::new();
        space.map(0x1000, 0x1000, Perm::RWX).unwrap();
        // ADD X0, X1, #42 ; B +8
        space.write(0x1000, Width::W32, 0x9100_a820).unwrap();
        space.write(0x1004, Width::W32, 0x1400_0002).unwrap();
        space
    }

    #[test]
    fn hit_returns_same_block() {
        let space = code_space();
        let cache = TranslationCache::new();
        let block = translated(&space, 0x1000);
        cache.insert(0x1000, IsaMode::A64, Arc::clone(&block));
        let hit = cache.lookup(&space, 0x1000, IsaMode::A64).unwrap();
        assert!(Arc::ptr_eq(&hit, &block));
        assert_eq!(cache.translations(), 1);
    }

    #[test]
    fn code_write_retires_translation() {
        let space = code_space();
        let cache = TranslationCache::new();
        let block = translated(&space, 0x1000);
        cache.insert(0x1000, IsaMode::A64, block);
        // Overwrite the first instruction.
        space.write(0x1000, Width::W32, 0x9100_0020).unwrap();
        assert!(cache.lookup(&space, 0x1000, IsaMode::A64).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn same_page_data_write_refreshes_without_retiring() {
        let space = code_space();
        let cache = TranslationCache::new();
        let block = translated(&space, 0x1000);
        cache.insert(0x1000, IsaMode::A64, block);
        // Data write elsewhere in the code page bumps the page version but
        // leaves the translated bytes intact.
        space.write(0x1800, Width::W64, 0x1234).unwrap();
        let hit = cache.lookup(&space, 0x1000, IsaMode::A64).unwrap();
        assert_eq!(hit.ir.entry, 0x1000);
        assert_eq!(cache.translations(), 1);
        // The refreshed snapshot makes the next lookup a fast hit.
        let again = cache.lookup(&space, 0x1000, IsaMode::A64).unwrap();
        assert!(Arc::ptr_eq(&hit, &again));
    }

    #[test]
    fn unmap_retires_translation() {
        let space = code_space();
        let cache = TranslationCache::new();
        let block = translated(&space, 0x1000);
        cache.insert(0x1000, IsaMode::A64, block);
        space.unmap(0x1000, 0x1000).unwrap();
        assert!(cache.lookup(&space, 0x1000, IsaMode::A64).is_none());
    }

    #[test]
    fn modes_are_distinct_keys() {
        let space = code_space();
        let cache = TranslationCache::new();
        let block = translated(&space, 0x1000);
        cache.insert(0x1000, IsaMode::A64, block);
        assert!(cache.lookup(&space, 0x1000, IsaMode::A32).is_none());
    }

    #[test]
    fn first_insert_wins() {
        let space = code_space();
        let cache = TranslationCache::new();
        let a = translated(&space, 0x1000);
        let b = translated(&space, 0x1000);
        let won = cache.insert(0x1000, IsaMode::A64, Arc::clone(&a));
        assert!(Arc::ptr_eq(&won, &a));
        let adopted = cache.insert(0x1000, IsaMode::A64, b);
        assert!(Arc::ptr_eq(&adopted, &a));
        assert_eq!(cache.translations(), 2);
    }
}
