//! Deterministic in-memory store for testing the distributed semaphore.
//!
//! Implements [`StoreClient`] without a running store: the four semaphore
//! scripts are dispatched by name and executed atomically under one mutex,
//! with key expiry driven by `tokio::time` so tests can run under a paused
//! clock. Blocking pops wake through a [`Notify`], mirroring the signal
//! behavior of the real store.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::SemaphoreError;
use crate::scripts::LuaScript;
use crate::store::ScriptValue;
use crate::store::StoreClient;

#[derive(Default)]
struct StoreState {
    /// String keys with optional expiry deadlines.
    strings: HashMap<String, (String, Option<Instant>)>,
    /// Set keys. Expiry of the set key itself is not modeled; the semaphore
    /// protocol never depends on it within a test's lifetime.
    sets: HashMap<String, BTreeSet<String>>,
    /// List keys, front = head.
    lists: HashMap<String, VecDeque<String>>,
}

impl StoreState {
    fn get_live(&self, key: &str, now: Instant) -> Option<&str> {
        match self.strings.get(key) {
            Some((value, deadline)) => {
                if deadline.is_some_and(|d| d <= now) {
                    None
                } else {
                    Some(value)
                }
            }
            None => None,
        }
    }

    /// Sweep a lease set exactly the way the scripts do: drop members whose
    /// key is gone, expired or non-numeric; return summed usage.
    fn sweep(&mut self, set_key: &str, now: Instant) -> u32 {
        let members: Vec<String> = self
            .sets
            .get(set_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut usage = 0u32;
        for member in members {
            let held = self.get_live(&member, now).and_then(|v| v.parse::<u32>().ok());
            match held {
                Some(held) => usage += held,
                None => {
                    self.strings.remove(&member);
                    if let Some(set) = self.sets.get_mut(set_key) {
                        set.remove(&member);
                    }
                }
            }
        }
        usage
    }
}

/// A deterministic in-memory [`StoreClient`].
///
/// Thread-safe and shareable; construct once and hand clones of the `Arc` to
/// every semaphore instance that should observe the same state.
pub struct DeterministicStoreClient {
    state: Mutex<StoreState>,
    signal: Notify,
}

impl Default for DeterministicStoreClient {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            signal: Notify::new(),
        }
    }
}

impl DeterministicStoreClient {
    /// Create a new store wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live string keys, for test assertions.
    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .strings
            .values()
            .filter(|(_, deadline)| !deadline.is_some_and(|d| d <= now))
            .count()
    }

    fn run_acquire(
        state: &mut StoreState,
        keys: &[String],
        args: &[String],
        now: Instant,
    ) -> Vec<ScriptValue> {
        let set_key = &keys[0];
        let lease_key = &keys[1];
        let capacity: u32 = args[0].parse().unwrap_or(0);
        let permits: u32 = args[1].parse().unwrap_or(0);
        let ttl = Duration::from_secs(args[2].parse().unwrap_or(1));

        let usage = state.sweep(set_key, now);
        if capacity.saturating_sub(usage) >= permits {
            state
                .strings
                .insert(lease_key.clone(), (permits.to_string(), Some(now + ttl)));
            state.sets.entry(set_key.clone()).or_default().insert(lease_key.clone());
            vec![
                ScriptValue::Int(1),
                ScriptValue::Text(lease_key.clone()),
                ScriptValue::Int((usage + permits) as i64),
            ]
        } else {
            vec![
                ScriptValue::Int(0),
                ScriptValue::Text(String::new()),
                ScriptValue::Int(usage as i64),
            ]
        }
    }

    fn run_release(
        state: &mut StoreState,
        keys: &[String],
        args: &[String],
        now: Instant,
    ) -> Vec<ScriptValue> {
        let lease_key = &keys[0];
        let signal_key = &keys[1];
        let set_key = &keys[2];

        let freed = state
            .get_live(lease_key, now)
            .and_then(|v| v.parse::<i64>().ok())
            .or_else(|| args.first().and_then(|a| a.parse().ok()))
            .unwrap_or(0);
        state.strings.remove(lease_key);
        if let Some(set) = state.sets.get_mut(set_key) {
            set.remove(lease_key);
        }

        let list = state.lists.entry(signal_key.clone()).or_default();
        list.push_front(freed.to_string());
        if let Some(bound) = args.get(1).and_then(|a| a.parse::<usize>().ok()) {
            list.truncate(bound);
        }
        vec![ScriptValue::Int(freed)]
    }

    fn run_usage(state: &mut StoreState, keys: &[String], now: Instant) -> Vec<ScriptValue> {
        let usage = state.sweep(&keys[0], now);
        vec![ScriptValue::Int(usage as i64)]
    }

    fn run_holders(state: &mut StoreState, keys: &[String], now: Instant) -> Vec<ScriptValue> {
        let members: Vec<String> = state
            .sets
            .get(&keys[0])
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for member in members {
            if let Some(value) = state.get_live(&member, now)
                && value.parse::<u32>().is_ok()
            {
                out.push(ScriptValue::Text(member.clone()));
                out.push(ScriptValue::Text(value.to_string()));
            }
        }
        out
    }
}

#[async_trait]
impl StoreClient for DeterministicStoreClient {
    async fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, SemaphoreError> {
        let now = Instant::now();
        let signal_after = script.name() == "semaphore_release";
        let reply = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match script.name() {
                "semaphore_acquire" => Self::run_acquire(&mut state, keys, args, now),
                "semaphore_release" => Self::run_release(&mut state, keys, args, now),
                "semaphore_usage" => Self::run_usage(&mut state, keys, now),
                "semaphore_holders" => Self::run_holders(&mut state, keys, now),
                other => {
                    return Err(SemaphoreError::MalformedReply {
                        script: script.name(),
                        detail: format!("deterministic store has no script '{other}'"),
                    });
                }
            }
        };
        if signal_after {
            self.signal.notify_waiters();
        }
        Ok(reply)
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SemaphoreError> {
        let deadline = Instant::now() + timeout;
        let mut notified = std::pin::pin!(self.signal.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(list) = state.lists.get_mut(key)
                    && let Some(entry) = list.pop_front()
                {
                    return Ok(Some(entry));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified.as_mut()).await.is_err() {
                return Ok(None);
            }
            notified.set(self.signal.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::ACQUIRE_SCRIPT;
    use crate::scripts::RELEASE_SCRIPT;
    use crate::scripts::USAGE_SCRIPT;

    fn keys(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn acquire_then_usage_roundtrip() {
        let store = DeterministicStoreClient::new();
        let reply = store
            .eval_script(
                &ACQUIRE_SCRIPT,
                &keys(&["ns:leases", "ns:lease:a"]),
                &keys(&["5", "2", "60"]),
            )
            .await
            .unwrap();
        assert_eq!(reply[0], ScriptValue::Int(1));

        let usage = store
            .eval_script(&USAGE_SCRIPT, &keys(&["ns:leases"]), &keys(&["60"]))
            .await
            .unwrap();
        assert_eq!(usage[0], ScriptValue::Int(2));
    }

    #[tokio::test]
    async fn acquire_rejects_when_over_capacity() {
        let store = DeterministicStoreClient::new();
        store
            .eval_script(
                &ACQUIRE_SCRIPT,
                &keys(&["ns:leases", "ns:lease:a"]),
                &keys(&["3", "3", "60"]),
            )
            .await
            .unwrap();
        let reply = store
            .eval_script(
                &ACQUIRE_SCRIPT,
                &keys(&["ns:leases", "ns:lease:b"]),
                &keys(&["3", "1", "60"]),
            )
            .await
            .unwrap();
        assert_eq!(reply[0], ScriptValue::Int(0));
        assert_eq!(reply[2], ScriptValue::Int(3));
    }

    #[tokio::test]
    async fn release_pushes_a_bounded_signal() {
        let store = DeterministicStoreClient::new();
        store
            .eval_script(
                &ACQUIRE_SCRIPT,
                &keys(&["ns:leases", "ns:lease:a"]),
                &keys(&["5", "2", "60"]),
            )
            .await
            .unwrap();
        let reply = store
            .eval_script(
                &RELEASE_SCRIPT,
                &keys(&["ns:lease:a", "ns:signals", "ns:leases"]),
                &keys(&["2", "10"]),
            )
            .await
            .unwrap();
        assert_eq!(reply[0], ScriptValue::Int(2));

        let signal = store
            .blocking_pop("ns:signals", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(signal.as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept() {
        let store = DeterministicStoreClient::new();
        store
            .eval_script(
                &ACQUIRE_SCRIPT,
                &keys(&["ns:leases", "ns:lease:a"]),
                &keys(&["5", "4", "1"]),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let usage = store
            .eval_script(&USAGE_SCRIPT, &keys(&["ns:leases"]), &keys(&["1"]))
            .await
            .unwrap();
        assert_eq!(usage[0], ScriptValue::Int(0));
        assert_eq!(store.live_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_pop_honors_timeout() {
        let store = DeterministicStoreClient::new();
        let started = Instant::now();
        let result = store
            .blocking_pop("ns:signals", Duration::from_millis(250))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
