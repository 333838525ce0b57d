//! Guest address-space management.
//!
//! An [`AddressSpace`] owns the backing storage for one guest process's
//! virtual memory view: page-granular mapped ranges with read/write/execute
//! permissions, reference-counted backings shared between views, and the
//! generation counters the JIT uses to detect stale translations cheaply.
//!
//! Two failure planes, deliberately kept apart:
//! - guest-level policy violations (unmapped address, permission violation,
//!   misaligned access under strict alignment) are *recoverable* and surface
//!   as typed [`MemoryError`] values for the dispatcher to turn into guest
//!   exceptions;
//! - internal bookkeeping violations (overlapping installed ranges, view
//!   refcount underflow) are host bugs and panic with diagnostic context,
//!   because continuing would risk silently wrong guest execution.
//!
//! Unaligned data access is permitted by default, matching the guest
//! architecture's behavior for normal memory. [`AddressSpace::set_strict_align`]
//! is the single switch that turns misaligned accesses into alignment
//! faults; instruction-fetch alignment is always enforced by the dispatcher
//! regardless of this switch.

mod backing;
mod code_versions;
mod space;

pub use backing::Backing;
pub use code_versions::CodeVersions;
pub use space::{AddressSpace, MapFlags, RegionInfo};

use bitflags::bitflags;
use thiserror::Error;
use vesper_types::Width;

bitflags! {
    /// Page permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

impl Perm {
    pub const RW: Perm = Perm::R.union(Perm::W);
    pub const RX: Perm = Perm::R.union(Perm::X);
    pub const RWX: Perm = Perm::R.union(Perm::W).union(Perm::X);
}

/// Page granularity of mappings and of JIT code-version tracking.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// What the guest was doing when an access faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Guest-visible memory fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// No mapping covers the address.
    Unmapped,
    /// A mapping covers the address but forbids this access kind.
    Permission(AccessKind),
    /// Misaligned access while strict alignment is enabled.
    Misaligned(AccessKind),
}

/// Typed, recoverable memory error. Whether a fault is fatal is a policy
/// decision made above this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory fault at {addr:#x}: {kind:?}")]
    Fault { addr: u64, kind: FaultKind },
}

impl MemoryError {
    #[inline]
    pub fn unmapped(addr: u64) -> Self {
        MemoryError::Fault {
            addr,
            kind: FaultKind::Unmapped,
        }
    }

    #[inline]
    pub fn permission(addr: u64, access: AccessKind) -> Self {
        MemoryError::Fault {
            addr,
            kind: FaultKind::Permission(access),
        }
    }

    #[inline]
    pub fn misaligned(addr: u64, access: AccessKind) -> Self {
        MemoryError::Fault {
            addr,
            kind: FaultKind::Misaligned(access),
        }
    }
}

/// Error installing or adjusting a mapping. These are caller mistakes on the
/// OS-service path, not guest faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("range {base:#x}+{len:#x} overlaps an existing mapping")]
    Overlap { base: u64, len: u64 },
    #[error("range {base:#x}+{len:#x} is not page-aligned")]
    Unaligned { base: u64, len: u64 },
    #[error("range {base:#x}+{len:#x} is empty or wraps the address space")]
    Invalid { base: u64, len: u64 },
    #[error("range {base:#x}+{len:#x} is not fully mapped")]
    NotMapped { base: u64, len: u64 },
}

#[inline]
pub(crate) fn is_aligned(addr: u64, width: Width) -> bool {
    addr & (width.bytes() - 1) == 0
}
