//! The address-space range table and checked access paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};
use vesper_types::Width;

use crate::backing::Backing;
use crate::code_versions::CodeVersions;
use crate::{is_aligned, AccessKind, MapError, MemoryError, Perm, PAGE_MASK};

bitflags::bitflags! {
    /// Flags for [`AddressSpace::map_backed`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// Unmap anything overlapping the new range instead of failing.
        const REPLACE = 1 << 0;
    }
}

#[derive(Clone)]
struct Region {
    base: u64,
    len: u64,
    perm: Perm,
    backing: Arc<Backing>,
    /// Offset of this region's first byte within `backing`.
    backing_off: u64,
}

impl Region {
    #[inline]
    fn end(&self) -> u64 {
        self.base + self.len
    }

    #[inline]
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[inline]
    fn host_ptr(&self, addr: u64) -> *mut u8 {
        debug_assert!(self.contains(addr));
        // Safety bound: backing_off + len never exceeds the backing length;
        // checked at installation time.
        unsafe {
            self.backing
                .base_ptr()
                .add((self.backing_off + (addr - self.base)) as usize)
        }
    }
}

/// Summary of the mapped region covering an address, used by the JIT to set
/// up its fast-path window.
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo {
    pub base: u64,
    pub len: u64,
    pub perm: Perm,
    /// Host pointer to the first byte of the region. Valid only while the
    /// current mapping generation holds; callers must revalidate after any
    /// map/unmap/reprotect they did not perform themselves.
    pub host_base: *mut u8,
}

/// One guest process's virtual-memory view.
///
/// Shared by all threads of the process (behind an `Arc`); mutated rarely by
/// the OS-service layer, read on every guest memory access. The range table
/// sits behind an `RwLock` so readers share; every mutation bumps the
/// mapping generation, which is the staleness signal for raw host pointers
/// handed out by [`AddressSpace::translate`].
pub struct AddressSpace {
    regions: RwLock<BTreeMap<u64, Region>>,
    mapping_generation: AtomicU64,
    code_versions: CodeVersions,
    strict_align: AtomicBool,
    views: AtomicUsize,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            regions: RwLock::new(BTreeMap::new()),
            mapping_generation: AtomicU64::new(0),
            code_versions: CodeVersions::new(),
            strict_align: AtomicBool::new(false),
            views: AtomicUsize::new(0),
        }
    }

    /// The single documented unaligned-access switch: when enabled, data
    /// accesses that are not naturally aligned fault instead of succeeding.
    pub fn set_strict_align(&self, strict: bool) {
        self.strict_align.store(strict, Ordering::Release);
    }

    #[inline]
    pub fn strict_align(&self) -> bool {
        self.strict_align.load(Ordering::Acquire)
    }

    /// Monotonic counter bumped by every map/unmap/reprotect.
    #[inline]
    pub fn mapping_generation(&self) -> u64 {
        self.mapping_generation.load(Ordering::Acquire)
    }

    /// Per-page code generations shared with the translation cache.
    #[inline]
    pub fn code_versions(&self) -> &CodeVersions {
        &self.code_versions
    }

    // --- view reference counting -----------------------------------------

    /// Record one additional consumer holding a view of this address space.
    pub fn attach_view(&self) -> usize {
        self.views.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one view. Underflow is a host-side bookkeeping bug and aborts
    /// loudly rather than continuing with corrupted state.
    pub fn release_view(&self) -> usize {
        let prev = self.views.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "address-space view count underflow");
        prev - 1
    }

    #[inline]
    pub fn view_count(&self) -> usize {
        self.views.load(Ordering::Acquire)
    }

    // --- mapping mutations ------------------------------------------------

    /// Map a fresh zero-filled range.
    pub fn map(&self, base: u64, len: u64, perm: Perm) -> Result<(), MapError> {
        self.map_backed(base, Backing::zeroed(len as usize), perm, MapFlags::empty())
    }

    /// Install `backing` at `base`. The whole backing is mapped.
    pub fn map_backed(
        &self,
        base: u64,
        backing: Arc<Backing>,
        perm: Perm,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let len = backing.len() as u64;
        check_range(base, len)?;

        let mut regions = self.write_table();
        if overlapping(&regions, base, len).next().is_some() {
            if !flags.contains(MapFlags::REPLACE) {
                return Err(MapError::Overlap { base, len });
            }
            remove_range(&mut regions, base, len);
        }

        backing.attach();
        regions.insert(
            base,
            Region {
                base,
                len,
                perm,
                backing,
                backing_off: 0,
            },
        );
        self.bump_mapping_generation();
        debug!(base, len, ?perm, "mapped range");
        Ok(())
    }

    /// Remove every mapped byte in `[base, base + len)`. Partially covered
    /// regions are split; fails if nothing in the range was mapped.
    pub fn unmap(&self, base: u64, len: u64) -> Result<(), MapError> {
        check_range(base, len)?;
        let mut regions = self.write_table();
        if overlapping(&regions, base, len).next().is_none() {
            return Err(MapError::NotMapped { base, len });
        }
        remove_range(&mut regions, base, len);
        self.bump_mapping_generation();
        debug!(base, len, "unmapped range");
        Ok(())
    }

    /// Change permissions on an exact or sub-range of existing mappings.
    /// Every byte of the range must currently be mapped.
    pub fn reprotect(&self, base: u64, len: u64, perm: Perm) -> Result<(), MapError> {
        check_range(base, len)?;
        let mut regions = self.write_table();

        // Verify full coverage before mutating anything.
        let mut cursor = base;
        let end = base + len;
        while cursor < end {
            match region_at(&regions, cursor) {
                Some(r) => cursor = r.end(),
                None => return Err(MapError::NotMapped { base, len }),
            }
        }

        // Split boundary regions so the target range is region-exact, then
        // flip permission bits in place.
        split_at(&mut regions, base);
        split_at(&mut regions, end);
        for (_, region) in regions.range_mut(base..end) {
            region.perm = perm;
        }
        self.bump_mapping_generation();
        debug!(base, len, ?perm, "reprotected range");
        Ok(())
    }

    // --- checked access ---------------------------------------------------

    /// Scalar read of `width` bytes, little-endian.
    pub fn read(&self, addr: u64, width: Width) -> Result<u64, MemoryError> {
        self.check_align(addr, width, AccessKind::Read)?;
        let mut buf = [0u8; 8];
        self.access_bytes(addr, width.bytes(), AccessKind::Read, |chunk, off, len| {
            buf[off..off + len].copy_from_slice(chunk_slice(chunk, len));
        })?;
        Ok(u64::from_le_bytes(buf) & width.mask())
    }

    /// Scalar write of `width` bytes, little-endian.
    pub fn write(&self, addr: u64, width: Width, value: u64) -> Result<(), MemoryError> {
        self.check_align(addr, width, AccessKind::Write)?;
        let bytes = value.to_le_bytes();
        self.access_bytes(addr, width.bytes(), AccessKind::Write, |chunk, off, len| {
            chunk_slice_mut(chunk, len).copy_from_slice(&bytes[off..off + len]);
        })
    }

    /// 128-bit read (vector registers).
    pub fn read_u128(&self, addr: u64) -> Result<u128, MemoryError> {
        let mut buf = [0u8; 16];
        self.access_bytes(addr, 16, AccessKind::Read, |chunk, off, len| {
            buf[off..off + len].copy_from_slice(chunk_slice(chunk, len));
        })?;
        Ok(u128::from_le_bytes(buf))
    }

    /// 128-bit write (vector registers).
    pub fn write_u128(&self, addr: u64, value: u128) -> Result<(), MemoryError> {
        let bytes = value.to_le_bytes();
        self.access_bytes(addr, 16, AccessKind::Write, |chunk, off, len| {
            chunk_slice_mut(chunk, len).copy_from_slice(&bytes[off..off + len]);
        })
    }

    /// Bulk read for DMA-style transfers. May span regions.
    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.access_bytes(addr, dst.len() as u64, AccessKind::Read, |chunk, off, len| {
            dst[off..off + len].copy_from_slice(chunk_slice(chunk, len));
        })
    }

    /// Bulk write for DMA-style transfers. May span regions.
    pub fn write_bytes(&self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        self.access_bytes(addr, src.len() as u64, AccessKind::Write, |chunk, off, len| {
            chunk_slice_mut(chunk, len).copy_from_slice(&src[off..off + len]);
        })
    }

    /// Instruction fetch: requires execute permission on the whole word.
    pub fn fetch(&self, addr: u64, width: Width) -> Result<u64, MemoryError> {
        if !is_aligned(addr, width) {
            return Err(MemoryError::misaligned(addr, AccessKind::Execute));
        }
        let mut buf = [0u8; 8];
        self.access_bytes(
            addr,
            width.bytes(),
            AccessKind::Execute,
            |chunk, off, len| {
                buf[off..off + len].copy_from_slice(chunk_slice(chunk, len));
            },
        )?;
        Ok(u64::from_le_bytes(buf) & width.mask())
    }

    /// Translate a guest range to a raw host pointer.
    ///
    /// The pointer is valid for `len` bytes until the mapping generation
    /// changes; it never spans a region boundary. Permission for `access`
    /// is checked here — this is the slow half of the fast-path contract,
    /// the emitted guard only re-checks the window bounds.
    pub fn translate(
        &self,
        addr: u64,
        len: u64,
        access: AccessKind,
    ) -> Result<*mut u8, MemoryError> {
        let regions = self.read_table();
        let region = region_at(&regions, addr).ok_or_else(|| MemoryError::unmapped(addr))?;
        if !region.perm.contains(perm_for(access)) {
            return Err(MemoryError::permission(addr, access));
        }
        if addr + len > region.end() {
            // Crossing into the next region: force the caller onto the
            // chunked slow path.
            return Err(MemoryError::unmapped(region.end()));
        }
        Ok(region.host_ptr(addr))
    }

    /// Region metadata for the JIT's fast-path window. Returns `None` for
    /// unmapped addresses.
    pub fn region_info(&self, addr: u64) -> Option<RegionInfo> {
        let regions = self.read_table();
        let region = region_at(&regions, addr)?;
        Some(RegionInfo {
            base: region.base,
            len: region.len,
            perm: region.perm,
            host_base: region.host_ptr(region.base),
        })
    }

    /// Like [`AddressSpace::region_info`], but also hands back a keep-alive
    /// handle on the region's backing. A consumer holding the handle may keep
    /// dereferencing `host_base` after a concurrent unmap; it reads stale
    /// bytes rather than freed memory. Permission changes are only guaranteed
    /// to be observed once the consumer drops the handle and revalidates
    /// against the mapping generation.
    pub fn region_view(&self, addr: u64) -> Option<(RegionInfo, Arc<Backing>)> {
        let regions = self.read_table();
        let region = region_at(&regions, addr)?;
        let info = RegionInfo {
            base: region.base,
            len: region.len,
            perm: region.perm,
            host_base: region.host_ptr(region.base),
        };
        Some((info, Arc::clone(&region.backing)))
    }

    // --- internals ---------------------------------------------------------

    fn check_align(&self, addr: u64, width: Width, access: AccessKind) -> Result<(), MemoryError> {
        if self.strict_align() && !is_aligned(addr, width) {
            return Err(MemoryError::misaligned(addr, access));
        }
        Ok(())
    }

    /// Walk `[addr, addr + len)` region by region, invoking `f(host_ptr,
    /// dst_offset, chunk_len)` for each mapped chunk. Fails without partial
    /// effects for reads; writes that span a fault boundary stop at it (the
    /// fault address reported is the first unmapped/denied byte).
    fn access_bytes(
        &self,
        addr: u64,
        len: u64,
        access: AccessKind,
        mut f: impl FnMut(*mut u8, usize, usize),
    ) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        let needed = perm_for(access);
        let regions = self.read_table();

        // Validate the whole span first so scalar accesses are all-or-
        // nothing even when they straddle a region boundary.
        let mut cursor = addr;
        let end = addr.checked_add(len).ok_or_else(|| {
            MemoryError::unmapped(u64::MAX)
        })?;
        while cursor < end {
            let region = region_at(&regions, cursor).ok_or_else(|| MemoryError::unmapped(cursor))?;
            if !region.perm.contains(needed) {
                return Err(MemoryError::permission(cursor, access));
            }
            cursor = region.end();
        }

        // Self-modifying code ordering: stale translations must be
        // detectable before the new bytes are observable.
        if access == AccessKind::Write {
            let mut cursor = addr;
            while cursor < end {
                let region = region_at(&regions, cursor).expect("validated above");
                if region.perm.contains(Perm::X) {
                    let chunk_end = region.end().min(end);
                    self.code_versions.bump_write(cursor, chunk_end - cursor);
                    trace!(addr = cursor, len = chunk_end - cursor, "code write");
                }
                cursor = region.end();
            }
        }

        let mut cursor = addr;
        let mut off = 0usize;
        while cursor < end {
            let region = region_at(&regions, cursor).expect("validated above");
            let chunk_len = (region.end().min(end) - cursor) as usize;
            f(region.host_ptr(cursor), off, chunk_len);
            cursor += chunk_len as u64;
            off += chunk_len;
        }
        Ok(())
    }

    fn bump_mapping_generation(&self) {
        self.mapping_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, Region>> {
        self.regions.read().expect("address-space table poisoned")
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<u64, Region>> {
        self.regions.write().expect("address-space table poisoned")
    }
}

#[inline]
fn perm_for(access: AccessKind) -> Perm {
    match access {
        AccessKind::Read => Perm::R,
        AccessKind::Write => Perm::W,
        AccessKind::Execute => Perm::X,
    }
}

fn check_range(base: u64, len: u64) -> Result<(), MapError> {
    if len == 0 || base.checked_add(len).is_none() {
        return Err(MapError::Invalid { base, len });
    }
    if base & PAGE_MASK != 0 || len & PAGE_MASK != 0 {
        return Err(MapError::Unaligned { base, len });
    }
    Ok(())
}

fn region_at<'a>(regions: &'a BTreeMap<u64, Region>, addr: u64) -> Option<&'a Region> {
    let (_, region) = regions.range(..=addr).next_back()?;
    region.contains(addr).then_some(region)
}

fn overlapping<'a>(
    regions: &'a BTreeMap<u64, Region>,
    base: u64,
    len: u64,
) -> impl Iterator<Item = &'a Region> {
    let end = base + len;
    // A region starting before `base` can still overlap; step back one key.
    let scan_from = regions
        .range(..=base)
        .next_back()
        .map(|(k, _)| *k)
        .unwrap_or(base);
    regions
        .range(scan_from..end)
        .map(|(_, r)| r)
        .filter(move |r| r.end() > base && r.base < end)
}

/// Remove all mapped bytes in `[base, base + end)`, splitting partially
/// covered regions. Table invariant: regions never overlap — violation is a
/// host bug and panics.
fn remove_range(regions: &mut BTreeMap<u64, Region>, base: u64, len: u64) {
    let end = base + len;
    split_at(regions, base);
    split_at(regions, end);
    let doomed: Vec<u64> = regions
        .range(base..end)
        .map(|(k, r)| {
            assert!(
                r.base >= base && r.end() <= end,
                "region table corrupt: region {:#x}+{:#x} escapes split bounds",
                r.base,
                r.len
            );
            *k
        })
        .collect();
    for key in doomed {
        let region = regions.remove(&key).expect("key listed above");
        region.backing.release();
    }
}

/// Split the region containing `addr` (if any) so `addr` becomes a region
/// boundary.
fn split_at(regions: &mut BTreeMap<u64, Region>, addr: u64) {
    let Some(region) = region_at(regions, addr) else {
        return;
    };
    if region.base == addr {
        return;
    }
    let key = region.base;
    let region = regions.remove(&key).expect("present: just found");
    let head_len = addr - region.base;
    let tail = Region {
        base: addr,
        len: region.len - head_len,
        perm: region.perm,
        backing: Arc::clone(&region.backing),
        backing_off: region.backing_off + head_len,
    };
    // The tail is a new consumer of the shared backing.
    tail.backing.attach();
    let head = Region {
        len: head_len,
        ..region
    };
    regions.insert(head.base, head);
    regions.insert(tail.base, tail);
}

#[inline]
fn chunk_slice<'a>(ptr: *mut u8, len: usize) -> &'a [u8] {
    // Safety: `access_bytes` only produces pointers into live backings with
    // at least `len` bytes remaining; the table read lock is held across
    // the access so the mapping cannot be torn down concurrently.
    unsafe { std::slice::from_raw_parts(ptr, len) }
}

#[inline]
fn chunk_slice_mut<'a>(ptr: *mut u8, len: usize) -> &'a mut [u8] {
    // Safety: as above; guest-level write races are guest-visible data
    // races, not host UB sources we amplify (byte-wise copies only).
    unsafe { std::slice::from_raw_parts_mut(ptr, len) }
}
