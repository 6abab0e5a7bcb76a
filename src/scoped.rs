//! Scoped leasing over any semaphore implementation.
//!
//! [`with_lease`] guarantees that a lease obtained around a unit of work is
//! released exactly once on every exit path, including a panic inside the
//! work. It is built only on the acquire/release/capacity surface, so it
//! works identically over [`LocalSemaphore`](crate::LocalSemaphore) and
//! [`RedisSemaphore`](crate::RedisSemaphore).

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use snafu::ensure;
use tracing::warn;

use crate::distributed::RedisSemaphore;
use crate::error::InvalidPermitCountSnafu;
use crate::error::LeaseTimeoutSnafu;
use crate::error::SemaphoreError;
use crate::lease::Lease;
use crate::lease::SemaphoreId;
use crate::local::LocalSemaphore;
use crate::store::StoreClient;

/// Default deadline used by callers of [`with_lease`] that have no better
/// number.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// The lease-based acquisition contract shared by both semaphore engines.
#[async_trait]
pub trait Semaphore: Send + Sync {
    /// Identity of this instance.
    fn id(&self) -> SemaphoreId;

    /// Maximum permits.
    fn capacity(&self) -> u32;

    /// Permits currently available.
    async fn available_permits(&self) -> Result<u32, SemaphoreError>;

    /// Acquire permits, suspending until capacity frees up.
    async fn acquire(&self, permits: u32) -> Result<Lease, SemaphoreError>;

    /// One non-blocking attempt, or a deadline-bounded retry.
    async fn try_acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>, SemaphoreError>;

    /// Return a lease's permits.
    async fn release(&self, lease: Lease) -> Result<(), SemaphoreError>;

    /// Reserve everything currently available as one lease.
    async fn drain_permits(&self) -> Result<Option<Lease>, SemaphoreError>;
}

#[async_trait]
impl Semaphore for LocalSemaphore {
    fn id(&self) -> SemaphoreId {
        LocalSemaphore::id(self)
    }

    fn capacity(&self) -> u32 {
        LocalSemaphore::capacity(self)
    }

    async fn available_permits(&self) -> Result<u32, SemaphoreError> {
        Ok(LocalSemaphore::available_permits(self))
    }

    async fn acquire(&self, permits: u32) -> Result<Lease, SemaphoreError> {
        LocalSemaphore::acquire(self, permits).await
    }

    async fn try_acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>, SemaphoreError> {
        LocalSemaphore::try_acquire(self, permits, timeout).await
    }

    async fn release(&self, lease: Lease) -> Result<(), SemaphoreError> {
        LocalSemaphore::release(self, lease)
    }

    async fn drain_permits(&self) -> Result<Option<Lease>, SemaphoreError> {
        Ok(LocalSemaphore::drain_permits(self))
    }
}

#[async_trait]
impl<C: StoreClient + ?Sized + 'static> Semaphore for RedisSemaphore<C> {
    fn id(&self) -> SemaphoreId {
        RedisSemaphore::id(self)
    }

    fn capacity(&self) -> u32 {
        RedisSemaphore::capacity(self)
    }

    async fn available_permits(&self) -> Result<u32, SemaphoreError> {
        RedisSemaphore::available_permits(self).await
    }

    async fn acquire(&self, permits: u32) -> Result<Lease, SemaphoreError> {
        RedisSemaphore::acquire(self, permits).await
    }

    async fn try_acquire(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>, SemaphoreError> {
        RedisSemaphore::try_acquire(self, permits, timeout).await
    }

    async fn release(&self, lease: Lease) -> Result<(), SemaphoreError> {
        RedisSemaphore::release(self, lease).await
    }

    async fn drain_permits(&self) -> Result<Option<Lease>, SemaphoreError> {
        RedisSemaphore::drain_permits(self).await
    }
}

/// Run `work` holding `permits` from `semaphore`, releasing on every exit.
///
/// `permits == 0` is a deliberate escape hatch: `work` runs with no lease and
/// no reservation is made. Otherwise the lease is acquired within `timeout`
/// (failing with [`SemaphoreError::LeaseTimeout`] before `work` is ever
/// invoked) and released exactly once after `work` finishes — also when
/// `work` panics, in which case the panic resumes after the release.
pub async fn with_lease<S, F, T>(
    semaphore: &S,
    permits: u32,
    timeout: Duration,
    work: F,
) -> Result<T, SemaphoreError>
where
    S: Semaphore + ?Sized,
    F: AsyncFnOnce(Option<&Lease>) -> T,
{
    ensure!(
        permits <= semaphore.capacity(),
        InvalidPermitCountSnafu {
            requested: permits,
            capacity: semaphore.capacity(),
        }
    );
    if permits == 0 {
        return Ok(work(None).await);
    }

    let lease = semaphore
        .try_acquire(permits, Some(timeout))
        .await?
        .ok_or_else(|| {
            LeaseTimeoutSnafu {
                permits,
                timeout,
                semaphore: semaphore.id().to_string(),
            }
            .build()
        })?;

    let result = AssertUnwindSafe(work(Some(&lease))).catch_unwind().await;
    let released = semaphore.release(lease).await;

    match result {
        Ok(value) => {
            released?;
            Ok(value)
        }
        Err(panic) => {
            if let Err(e) = released {
                warn!(error = %e, "release failed while unwinding from work panic");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Permits currently held out on lease: `capacity − available`.
pub async fn currently_leased<S>(semaphore: &S) -> Result<u32, SemaphoreError>
where
    S: Semaphore + ?Sized,
{
    let available = semaphore.available_permits().await?;
    Ok(semaphore.capacity().saturating_sub(available))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn zero_permits_runs_work_without_reserving() {
        let sem = LocalSemaphore::new(5).unwrap();
        let result = with_lease(&sem, 0, DEFAULT_LEASE_TIMEOUT, async move |lease| {
            assert!(lease.is_none());
            "ran"
        })
        .await
        .unwrap();
        assert_eq!(result, "ran");
        assert_eq!(sem.available_permits(), 5);
    }

    #[tokio::test]
    async fn lease_is_released_after_work() {
        let sem = LocalSemaphore::new(5).unwrap();
        let result = with_lease(&sem, 3, DEFAULT_LEASE_TIMEOUT, async move |lease| {
            lease.unwrap().permits()
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(sem.available_permits(), 5);
        assert_eq!(currently_leased(&sem).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lease_is_released_when_work_panics() {
        let sem = Arc::new(LocalSemaphore::new(5).unwrap());

        let inner = Arc::clone(&sem);
        let task = tokio::spawn(async move {
            with_lease(&*inner, 2, DEFAULT_LEASE_TIMEOUT, async |_| {
                panic!("work blew up");
            })
            .await
        });
        assert!(task.await.is_err());
        assert_eq!(sem.available_permits(), 5);
    }

    #[tokio::test]
    async fn over_capacity_fails_before_any_attempt() {
        let sem = LocalSemaphore::new(2).unwrap();
        let result = with_lease(&sem, 3, DEFAULT_LEASE_TIMEOUT, async |_| {}).await;
        assert!(matches!(
            result,
            Err(SemaphoreError::InvalidPermitCount { requested: 3, capacity: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_as_lease_timeout_without_running_work() {
        let sem = LocalSemaphore::new(1).unwrap();
        let held = sem.acquire(1).await.unwrap();

        let result = with_lease(&sem, 1, Duration::from_millis(100), async |_| {
            unreachable!("work must not run on timeout");
        })
        .await;
        match result {
            Err(SemaphoreError::LeaseTimeout { permits, timeout, .. }) => {
                assert_eq!(permits, 1);
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected LeaseTimeout, got {other:?}"),
        }
        sem.release(held).unwrap();
    }

    #[tokio::test]
    async fn works_through_the_trait_object() {
        let sem = LocalSemaphore::new(4).unwrap();
        let dyn_sem: &dyn Semaphore = &sem;

        let lease = dyn_sem.acquire(2).await.unwrap();
        assert_eq!(currently_leased(dyn_sem).await.unwrap(), 2);
        dyn_sem.release(lease).await.unwrap();

        let value = with_lease(dyn_sem, 1, DEFAULT_LEASE_TIMEOUT, async |_| 42)
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn capacity_bound_invariant_holds_at_every_step() {
        let sem = LocalSemaphore::new(5).unwrap();
        let l1 = sem.acquire(2).await.unwrap();
        assert_eq!(
            sem.available_permits() + currently_leased(&sem).await.unwrap(),
            5
        );
        let l2 = sem.acquire(1).await.unwrap();
        assert_eq!(
            sem.available_permits() + currently_leased(&sem).await.unwrap(),
            5
        );
        sem.release(l1).unwrap();
        sem.release(l2).unwrap();
        assert_eq!(currently_leased(&sem).await.unwrap(), 0);
    }
}
