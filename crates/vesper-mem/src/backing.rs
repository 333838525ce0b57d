//! Reference-counted backing storage for mapped ranges.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One allocation of guest-backing bytes.
///
/// A `Backing` may be shared by several mapped ranges (and by several
/// address-space views); the `Arc` holding it guarantees the storage is
/// freed exactly once, while the explicit consumer count below tracks
/// attach/release pairing so imbalances are caught loudly instead of
/// leaking or double-releasing.
///
/// Guest stores go through [`Backing::base_ptr`] while other guest threads
/// may be reading: that is a guest-visible data race (two guest threads
/// racing on guest memory), not a host invariant violation, so the bytes
/// live in an `UnsafeCell` and accesses use raw-pointer reads/writes.
pub struct Backing {
    bytes: UnsafeCell<Box<[u8]>>,
    consumers: AtomicUsize,
}

// Concurrent guest access to guest bytes is permitted by design; the range
// table guarding which addresses are reachable is synchronized separately.
unsafe impl Sync for Backing {}
unsafe impl Send for Backing {}

impl Backing {
    /// Allocate a zero-filled backing of `len` bytes.
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Backing {
            bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            consumers: AtomicUsize::new(0),
        })
    }

    /// Allocate a backing initialized from `data`.
    pub fn from_bytes(data: &[u8]) -> Arc<Self> {
        Arc::new(Backing {
            bytes: UnsafeCell::new(data.to_vec().into_boxed_slice()),
            consumers: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        // Safety: the box itself (pointer + length) is immutable after
        // construction; only the pointed-to bytes are mutated.
        unsafe { (&(*self.bytes.get())).len() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw pointer to the first byte. Valid for `len()` bytes for as long as
    /// the caller holds an `Arc` to this backing.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        // Safety: see above; the box metadata is never mutated.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Record one additional consumer of this backing.
    pub fn attach(&self) -> usize {
        self.consumers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one consumer. Panics on underflow: a release without a matching
    /// attach is a host-side bookkeeping bug.
    pub fn release(&self) -> usize {
        let prev = self.consumers.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev != 0,
            "backing consumer count underflow: release without attach"
        );
        prev - 1
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backing")
            .field("len", &self.len())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}
