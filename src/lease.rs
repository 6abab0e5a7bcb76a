//! Lease receipts and semaphore instance identity.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Process-unique identity of one semaphore instance.
///
/// A [`Lease`](crate::Lease) is redeemable only against the instance that
/// issued it. Identity is allocated from a process-wide counter, so two
/// semaphores are never confused even when they coordinate over the same
/// distributed namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreId(u64);

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(1);

impl SemaphoreId {
    /// Allocate the next instance identity.
    pub(crate) fn next() -> Self {
        Self(NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw identity value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "semaphore#{}", self.0)
    }
}

/// A receipt for a reserved quantity of permits.
///
/// Created only by a semaphore's acquire path and redeemed exactly once by
/// passing it back to `release` on the same instance. `Lease` is deliberately
/// not `Clone`: release consumes the value, so a double release does not
/// compile rather than silently under-counting.
#[must_use = "permits stay reserved until the lease is released"]
#[derive(Debug)]
pub struct Lease {
    owner: SemaphoreId,
    id: String,
    permits: u32,
}

impl Lease {
    pub(crate) fn new(owner: SemaphoreId, id: String, permits: u32) -> Self {
        Self { owner, id, permits }
    }

    /// Identity of the issuing semaphore instance.
    pub fn owner(&self) -> SemaphoreId {
        self.owner
    }

    /// Opaque lease identifier. For the distributed engine this is the
    /// store key holding the reservation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of permits this lease reserves.
    pub fn permits(&self) -> u32 {
        self.permits
    }
}
