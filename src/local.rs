//! In-process counting semaphore.
//!
//! Admission control between tasks of one process: a mutex-guarded reserved
//! counter plus a broadcast wakeup. Every release wakes all waiters, because a
//! freed amount may satisfy a different-sized waiter than the one that happens
//! to wake first; each waiter re-validates its own request after waking.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use snafu::ensure;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::error::ForeignLeaseSnafu;
use crate::error::InvalidCapacitySnafu;
use crate::error::InvalidPermitCountSnafu;
use crate::error::SemaphoreError;
use crate::lease::Lease;
use crate::lease::SemaphoreId;

/// A single-process counting semaphore.
///
/// Permits are reserved in arbitrary positive quantities and returned by
/// redeeming the [`Lease`] handed out at acquisition.
pub struct LocalSemaphore {
    id: SemaphoreId,
    capacity: u32,
    reserved: Mutex<u32>,
    /// Broadcast on every release so all waiters re-check availability.
    available_changed: Notify,
    lease_seq: AtomicU64,
}

impl LocalSemaphore {
    /// Create a semaphore with the given capacity.
    ///
    /// Errors if `capacity` is zero.
    pub fn new(capacity: u32) -> Result<Self, SemaphoreError> {
        ensure!(capacity >= 1, InvalidCapacitySnafu { capacity });
        Ok(Self {
            id: SemaphoreId::next(),
            capacity,
            reserved: Mutex::new(0),
            available_changed: Notify::new(),
            lease_seq: AtomicU64::new(0),
        })
    }

    /// Identity of this instance.
    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Maximum permits.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Permits not currently reserved.
    pub fn available_permits(&self) -> u32 {
        let reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity - *reserved
    }

    /// Acquire `permits`, suspending until capacity frees up.
    ///
    /// There is no upper bound on the wait; use [`try_acquire`](Self::try_acquire)
    /// for a deadline. Errors if `permits` is zero or exceeds capacity.
    pub async fn acquire(&self, permits: u32) -> Result<Lease, SemaphoreError> {
        ensure!(
            (1..=self.capacity).contains(&permits),
            InvalidPermitCountSnafu {
                requested: permits,
                capacity: self.capacity,
            }
        );

        // Register interest before checking, so a release between the check
        // and the await is not lost.
        let mut notified = std::pin::pin!(self.available_changed.notified());
        loop {
            notified.as_mut().enable();
            if let Some(lease) = self.try_reserve(permits) {
                return Ok(lease);
            }
            trace!(semaphore = %self.id, permits, "waiting for permits");
            notified.as_mut().await;
            notified.set(self.available_changed.notified());
        }
    }

    /// Attempt to acquire `permits` without blocking, or within `timeout`.
    ///
    /// With no timeout this is a single non-blocking attempt. With a timeout
    /// the attempt is retried against a monotonic deadline, waiting for
    /// availability changes in between; `Ok(None)` once the deadline passes.
    /// Requesting more than capacity yields `Ok(None)` rather than an error.
    pub async fn try_acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>, SemaphoreError> {
        ensure!(
            permits >= 1,
            InvalidPermitCountSnafu {
                requested: permits,
                capacity: self.capacity,
            }
        );
        if permits > self.capacity {
            return Ok(None);
        }

        let Some(timeout) = timeout else {
            return Ok(self.try_reserve(permits));
        };

        let deadline = Instant::now() + timeout;
        let mut notified = std::pin::pin!(self.available_changed.notified());
        loop {
            notified.as_mut().enable();
            if let Some(lease) = self.try_reserve(permits) {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified.as_mut()).await.is_err() {
                // Deadline elapsed while waiting; one last attempt keeps the
                // contract exact when a release raced the timer.
                return Ok(self.try_reserve(permits));
            }
            notified.set(self.available_changed.notified());
        }
    }

    /// Return a lease's permits and wake all waiters.
    ///
    /// Errors if the lease was issued by a different semaphore instance.
    pub fn release(&self, lease: Lease) -> Result<(), SemaphoreError> {
        ensure!(
            lease.owner() == self.id,
            ForeignLeaseSnafu {
                lease_owner: lease.owner().to_string(),
                semaphore: self.id.to_string(),
            }
        );
        {
            let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
            debug_assert!(*reserved >= lease.permits());
            *reserved = reserved.saturating_sub(lease.permits());
        }
        debug!(semaphore = %self.id, permits = lease.permits(), "released permits");
        self.available_changed.notify_waiters();
        Ok(())
    }

    /// Atomically reserve every currently available permit.
    ///
    /// Returns a single lease for the drained amount, or `None` when nothing
    /// is available.
    pub fn drain_permits(&self) -> Option<Lease> {
        let available = {
            let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
            let available = self.capacity - *reserved;
            *reserved = self.capacity;
            available
        };
        if available == 0 {
            return None;
        }
        debug!(semaphore = %self.id, permits = available, "drained permits");
        Some(self.issue_lease(available))
    }

    /// Single check-and-reserve step, atomic under the mutex.
    fn try_reserve(&self, permits: u32) -> Option<Lease> {
        {
            let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
            if self.capacity - *reserved < permits {
                return None;
            }
            *reserved += permits;
        }
        debug!(semaphore = %self.id, permits, "acquired permits");
        Some(self.issue_lease(permits))
    }

    fn issue_lease(&self, permits: u32) -> Lease {
        let seq = self.lease_seq.fetch_add(1, Ordering::Relaxed);
        Lease::new(self.id, format!("{}:{}", self.id, seq), permits)
    }
}

impl std::fmt::Debug for LocalSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSemaphore")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("available", &self.available_permits())
            .finish()
    }
}
