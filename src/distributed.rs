//! Redis-coordinated counting semaphore.
//!
//! Independent processes coordinate through a shared store with no central
//! coordinator. Check-and-reserve runs server-side in an atomic script, each
//! lease key carries a TTL so a crashed holder's permits are reclaimed once
//! the TTL elapses, and a bounded signal list wakes waiters without tight
//! polling. Signals may be lost; the wait window is capped so waiters re-poll
//! at least once per TTL window regardless.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use snafu::ensure;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::ForeignLeaseSnafu;
use crate::error::InvalidCapacitySnafu;
use crate::error::InvalidPermitCountSnafu;
use crate::error::SemaphoreError;
use crate::lease::Lease;
use crate::lease::SemaphoreId;
use crate::scripts::ACQUIRE_SCRIPT;
use crate::scripts::HOLDERS_SCRIPT;
use crate::scripts::RELEASE_SCRIPT;
use crate::scripts::USAGE_SCRIPT;
use crate::store::ScriptValue;
use crate::store::StoreClient;

/// Slack added to the lease TTL when computing the signal wait window.
///
/// Bounds the blind spot: even with every signal lost, a waiter re-attempts
/// at least this often, so expired leases are picked up promptly.
const SIGNAL_WAIT_SLACK: Duration = Duration::from_secs(2);

/// Bound on advisory drain retries when racing other acquirers.
const DRAIN_MAX_ATTEMPTS: usize = 8;

/// Configuration for a [`RedisSemaphore`].
#[derive(Debug, Clone)]
pub struct RedisSemaphoreConfig {
    /// TTL attached to each lease key. A holder that dies without releasing
    /// has its permits reclaimed once this elapses.
    pub lease_expiration: Duration,
}

impl Default for RedisSemaphoreConfig {
    fn default() -> Self {
        Self {
            lease_expiration: Duration::from_secs(5),
        }
    }
}

/// Operational snapshot of a distributed semaphore's state.
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    /// Maximum permits.
    pub capacity: u32,
    /// Permits currently reserved across all processes.
    pub usage: u32,
    /// Permits available for acquisition.
    pub available: u32,
    /// Active lease keys with their permit counts.
    pub leases: Vec<(String, u32)>,
}

/// A distributed counting semaphore over a shared scripting store.
///
/// Any two instances constructed with the same namespace against the same
/// store coordinate as one logical semaphore. Leases remain bound to the
/// issuing instance: releasing through a different instance is rejected even
/// within the same namespace.
pub struct RedisSemaphore<C: StoreClient + ?Sized> {
    id: SemaphoreId,
    namespace: String,
    capacity: u32,
    config: RedisSemaphoreConfig,
    lease_set_key: String,
    signal_key: String,
    client: Arc<C>,
}

impl<C: StoreClient + ?Sized + 'static> RedisSemaphore<C> {
    /// Create a semaphore with the default lease expiration.
    ///
    /// Errors if `capacity` is zero.
    pub fn new(
        client: Arc<C>,
        namespace: impl Into<String>,
        capacity: u32,
    ) -> Result<Self, SemaphoreError> {
        Self::with_config(client, namespace, capacity, RedisSemaphoreConfig::default())
    }

    /// Create a semaphore with explicit configuration.
    pub fn with_config(
        client: Arc<C>,
        namespace: impl Into<String>,
        capacity: u32,
        config: RedisSemaphoreConfig,
    ) -> Result<Self, SemaphoreError> {
        ensure!(capacity >= 1, InvalidCapacitySnafu { capacity });
        let namespace = namespace.into();
        Ok(Self {
            id: SemaphoreId::next(),
            lease_set_key: format!("{namespace}:leases"),
            signal_key: format!("{namespace}:signals"),
            namespace,
            capacity,
            config,
            client,
        })
    }

    /// Identity of this instance.
    pub fn id(&self) -> SemaphoreId {
        self.id
    }

    /// Namespace shared by all cooperating instances.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Maximum permits.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Acquire `permits`, suspending until capacity frees up.
    ///
    /// No fairness ordering is provided: whichever waiter's re-attempt lands
    /// first wins. Errors if `permits` is zero or exceeds capacity.
    pub async fn acquire(&self, permits: u32) -> Result<Lease, SemaphoreError> {
        ensure!(
            (1..=self.capacity).contains(&permits),
            InvalidPermitCountSnafu {
                requested: permits,
                capacity: self.capacity,
            }
        );
        match self.acquire_loop(permits, None).await? {
            Some(lease) => Ok(lease),
            // Unreachable: without a deadline the loop only returns a lease
            // or an error.
            None => Err(SemaphoreError::LeaseTimeout {
                permits,
                timeout: Duration::ZERO,
                semaphore: self.label(),
            }),
        }
    }

    /// Attempt to acquire `permits` without waiting, or within `timeout`.
    ///
    /// With no timeout this is exactly one acquire-script round trip: the
    /// script itself is a non-blocking probe, so no signal wait is involved.
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
        match timeout {
            None => self.try_acquire_once(permits).await,
            Some(timeout) => self.acquire_loop(permits, Some(timeout)).await,
        }
    }

    /// Release a lease's permits and signal waiters.
    ///
    /// Errors if the lease was issued by a different semaphore instance.
    /// Releasing a lease whose key already expired is harmless: the script
    /// deletes nothing and the signal still prompts waiters to re-check.
    pub async fn release(&self, lease: Lease) -> Result<(), SemaphoreError> {
        ensure!(
            lease.owner() == self.id,
            ForeignLeaseSnafu {
                lease_owner: lease.owner().to_string(),
                semaphore: self.label(),
            }
        );
        let keys = [
            lease.id().to_string(),
            self.signal_key.clone(),
            self.lease_set_key.clone(),
        ];
        let args = [
            lease.permits().to_string(),
            (self.capacity as u64 * 2).to_string(),
        ];
        self.client.eval_script(&RELEASE_SCRIPT, &keys, &args).await?;
        debug!(
            namespace = %self.namespace,
            lease = lease.id(),
            permits = lease.permits(),
            "released permits"
        );
        Ok(())
    }

    /// Permits currently available across all processes.
    pub async fn available_permits(&self) -> Result<u32, SemaphoreError> {
        let usage = self.usage().await?;
        Ok(self.capacity.saturating_sub(usage))
    }

    /// Advisory drain: acquire everything that currently looks available.
    ///
    /// A concurrent acquirer elsewhere may win the race, so the returned
    /// lease may be smaller than the availability observed a moment earlier,
    /// or `None` when nothing could be taken.
    pub async fn drain_permits(&self) -> Result<Option<Lease>, SemaphoreError> {
        for _ in 0..DRAIN_MAX_ATTEMPTS {
            let available = self.available_permits().await?;
            if available == 0 {
                return Ok(None);
            }
            if let Some(lease) = self.try_acquire_once(available).await? {
                return Ok(Some(lease));
            }
            trace!(namespace = %self.namespace, available, "drain lost the race, retrying");
        }
        Ok(None)
    }

    /// Snapshot usage, availability and the active lease list.
    pub async fn debug_info(&self) -> Result<DebugInfo, SemaphoreError> {
        let keys = [self.lease_set_key.clone()];
        let reply = self.client.eval_script(&HOLDERS_SCRIPT, &keys, &[]).await?;

        let mut leases = Vec::with_capacity(reply.len() / 2);
        let mut usage: u32 = 0;
        for pair in reply.chunks(2) {
            let [key, permits] = pair else {
                return Err(self.malformed(&HOLDERS_SCRIPT, "odd-length holder listing"));
            };
            let (Some(key), Some(permits)) = (key.as_text(), permits.as_int()) else {
                return Err(self.malformed(&HOLDERS_SCRIPT, "non text/int holder pair"));
            };
            let permits = permits as u32;
            usage += permits;
            leases.push((key.to_string(), permits));
        }
        Ok(DebugInfo {
            capacity: self.capacity,
            usage,
            available: self.capacity.saturating_sub(usage),
            leases,
        })
    }

    /// Shared retry/wait loop behind `acquire` and bounded `try_acquire`.
    async fn acquire_loop(
        &self,
        permits: u32,
        timeout: Option<Duration>,
    ) -> Result<Option<Lease>, SemaphoreError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Ok(None);
            }

            if let Some(lease) = self.try_acquire_once(permits).await? {
                return Ok(Some(lease));
            }

            let slack_window = self.config.lease_expiration + SIGNAL_WAIT_SLACK;
            let wait = match deadline {
                Some(deadline) => slack_window.min(deadline.saturating_duration_since(Instant::now())),
                None => slack_window,
            };
            if wait.is_zero() {
                // The store treats a zero wait as "block forever"; the loop
                // top reports the elapsed deadline instead.
                continue;
            }
            trace!(
                namespace = %self.namespace,
                permits,
                wait_ms = wait.as_millis() as u64,
                "waiting on signal queue"
            );
            let _signal = self.client.blocking_pop(&self.signal_key, wait).await?;

            // Re-attempt immediately after waking: the signal may have fired
            // concurrently with another winner, and an expired lease may have
            // freed capacity without any signal at all.
            if let Some(lease) = self.try_acquire_once(permits).await? {
                return Ok(Some(lease));
            }
        }
    }

    /// One round trip through the atomic acquire script.
    async fn try_acquire_once(&self, permits: u32) -> Result<Option<Lease>, SemaphoreError> {
        let candidate = format!("{}:lease:{}", self.namespace, uuid::Uuid::new_v4());
        let keys = [self.lease_set_key.clone(), candidate];
        let args = [
            self.capacity.to_string(),
            permits.to_string(),
            self.ttl_seconds().to_string(),
        ];
        let reply = self.client.eval_script(&ACQUIRE_SCRIPT, &keys, &args).await?;

        let granted = reply
            .first()
            .and_then(ScriptValue::as_int)
            .ok_or_else(|| self.malformed(&ACQUIRE_SCRIPT, "missing status element"))?;
        if granted == 0 {
            return Ok(None);
        }
        let lease_key = reply
            .get(1)
            .and_then(ScriptValue::as_text)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| self.malformed(&ACQUIRE_SCRIPT, "missing lease key"))?;
        debug!(
            namespace = %self.namespace,
            lease = lease_key,
            permits,
            usage = reply.get(2).and_then(ScriptValue::as_int).unwrap_or(-1),
            "acquired permits"
        );
        Ok(Some(Lease::new(self.id, lease_key.to_string(), permits)))
    }

    /// Run the usage sweep and return summed valid usage.
    async fn usage(&self) -> Result<u32, SemaphoreError> {
        let keys = [self.lease_set_key.clone()];
        let args = [self.ttl_seconds().to_string()];
        let reply = self.client.eval_script(&USAGE_SCRIPT, &keys, &args).await?;
        let usage = reply
            .first()
            .and_then(ScriptValue::as_int)
            .ok_or_else(|| self.malformed(&USAGE_SCRIPT, "missing usage element"))?;
        if usage > self.capacity as i64 {
            warn!(
                namespace = %self.namespace,
                usage,
                capacity = self.capacity,
                "store reports usage above capacity"
            );
        }
        Ok(usage.max(0) as u32)
    }

    fn ttl_seconds(&self) -> u64 {
        self.config.lease_expiration.as_secs().max(1)
    }

    fn label(&self) -> String {
        format!("{} ({})", self.id, self.namespace)
    }

    fn malformed(&self, script: &crate::scripts::LuaScript, detail: &str) -> SemaphoreError {
        SemaphoreError::MalformedReply {
            script: script.name(),
            detail: detail.to_string(),
        }
    }
}

impl<C: StoreClient + ?Sized> std::fmt::Debug for RedisSemaphore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSemaphore")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
