//! Counting semaphores for metered resources.
//!
//! A semaphore admits at most N units of concurrent work, where units are
//! arbitrary positive permit quantities rather than a binary lock. Two
//! engines share one lease-based contract:
//!
//! - [`LocalSemaphore`] - intra-process admission control over a mutex-guarded
//!   counter with broadcast wakeups
//! - [`RedisSemaphore`] - cross-process admission control through a shared
//!   scripting store, with atomic server-side check-and-reserve, per-lease
//!   TTLs for crash recovery, and a bounded signal queue for wakeups
//!
//! Acquisition returns a [`Lease`] which is redeemed exactly once via
//! `release` on the issuing instance. [`with_lease`] wraps the pair around a
//! unit of work with guaranteed release on every exit path.
//!
//! ## Local example
//!
//! ```ignore
//! use turnstile::LocalSemaphore;
//!
//! let sem = LocalSemaphore::new(20)?;
//! let lease = sem.acquire(3).await?;
//! // ... up to 3 of 20 concurrent API calls ...
//! sem.release(lease)?;
//! ```
//!
//! ## Distributed example
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnstile::{RedisSemaphore, with_lease, DEFAULT_LEASE_TIMEOUT};
//!
//! let client = redis::Client::open("redis://127.0.0.1/")?;
//! let manager = redis::aio::ConnectionManager::new(client).await?;
//! let sem = RedisSemaphore::new(Arc::new(manager), "api-quota", 20)?;
//!
//! with_lease(&sem, 3, DEFAULT_LEASE_TIMEOUT, async |_lease| {
//!     // ... runs while 3 permits are reserved cluster-wide ...
//! })
//! .await?;
//! ```
//!
//! Instances constructed with the same namespace against the same store
//! coordinate as one logical semaphore. No fairness ordering is guaranteed
//! among waiters; capacity held by a crashed process is reclaimed once its
//! lease TTL elapses.

mod distributed;
mod error;
mod lease;
mod local;
mod scoped;
pub mod scripts;
mod store;
pub mod test_support;

pub use distributed::DebugInfo;
pub use distributed::RedisSemaphore;
pub use distributed::RedisSemaphoreConfig;
pub use error::SemaphoreError;
pub use lease::Lease;
pub use lease::SemaphoreId;
pub use local::LocalSemaphore;
pub use scoped::DEFAULT_LEASE_TIMEOUT;
pub use scoped::Semaphore;
pub use scoped::currently_leased;
pub use scoped::with_lease;
pub use store::ScriptValue;
pub use store::StoreClient;
