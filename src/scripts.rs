//! Server-side scripts for the distributed semaphore.
//!
//! All mutation of distributed reservation state goes through one of these
//! scripts, so no client ever runs a read-modify-write sequence against the
//! store. Each script sweeps stale lease-set members as it goes: a member
//! whose key has expired or holds a non-numeric value is dropped, which is
//! the crash-recovery path for holders that died without releasing.

use std::sync::LazyLock;

/// A named server-side script with its body hash precomputed.
///
/// The hash is computed once here rather than per call; executors evaluate by
/// hash first and fall back to the body when the store has not cached it yet.
pub struct LuaScript {
    name: &'static str,
    body: &'static str,
    sha: String,
}

impl LuaScript {
    fn new(name: &'static str, body: &'static str) -> Self {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(body.as_bytes());
        Self {
            name,
            body,
            sha: hasher.digest().to_string(),
        }
    }

    /// Script name, used by in-memory test stores to dispatch.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Full script body.
    pub fn body(&self) -> &'static str {
        self.body
    }

    /// Hex SHA-1 of the body, as used by `EVALSHA`.
    pub fn sha(&self) -> &str {
        &self.sha
    }
}

/// KEYS: lease set, candidate lease key.
/// ARGV: capacity, requested permits, lease TTL seconds.
///
/// Returns `{1, lease_key, usage_after}` on success, `{0, '', usage}` when
/// capacity is insufficient. The lease set's own TTL is refreshed to four
/// lease lifetimes so the set cannot vanish while leases are live.
static ACQUIRE_BODY: &str = r#"
local lease_set = KEYS[1]
local lease_key = KEYS[2]
local capacity = tonumber(ARGV[1])
local permits = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local usage = 0
for _, member in ipairs(redis.call('SMEMBERS', lease_set)) do
  local held = tonumber(redis.call('GET', member))
  if held == nil then
    redis.call('SREM', lease_set, member)
  else
    usage = usage + held
  end
end

if capacity - usage >= permits then
  redis.call('SET', lease_key, permits, 'EX', ttl)
  redis.call('SADD', lease_set, lease_key)
  redis.call('EXPIRE', lease_set, ttl * 4)
  return {1, lease_key, usage + permits}
end
return {0, '', usage}
"#;

/// KEYS: lease key, signal list, lease set.
/// ARGV: permit count recorded on the lease, signal list bound.
///
/// Deletes the lease, pushes the freed amount onto the signal list as a
/// wakeup, and trims the list so it stays bounded. Succeeds whether or not
/// the lease key still existed.
static RELEASE_BODY: &str = r#"
local lease_key = KEYS[1]
local signal_list = KEYS[2]
local lease_set = KEYS[3]

local freed = tonumber(redis.call('GET', lease_key)) or tonumber(ARGV[1]) or 0
redis.call('DEL', lease_key)
redis.call('SREM', lease_set, lease_key)
redis.call('LPUSH', signal_list, freed)
redis.call('LTRIM', signal_list, 0, tonumber(ARGV[2]) - 1)
return freed
"#;

/// KEYS: lease set. ARGV: lease TTL seconds.
///
/// Returns summed usage over still-valid leases, refreshing the set's TTL
/// when any remain.
static USAGE_BODY: &str = r#"
local lease_set = KEYS[1]
local ttl = tonumber(ARGV[1])

local usage = 0
local valid = 0
for _, member in ipairs(redis.call('SMEMBERS', lease_set)) do
  local held = tonumber(redis.call('GET', member))
  if held == nil then
    redis.call('SREM', lease_set, member)
  else
    usage = usage + held
    valid = valid + 1
  end
end

if valid > 0 then
  redis.call('EXPIRE', lease_set, ttl * 4)
end
return usage
"#;

/// KEYS: lease set.
///
/// Read-only companion to the usage sweep: returns a flat list of
/// `lease_key, permits` pairs for still-valid leases.
static HOLDERS_BODY: &str = r#"
local out = {}
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local held = redis.call('GET', member)
  if held and tonumber(held) ~= nil then
    table.insert(out, member)
    table.insert(out, held)
  end
end
return out
"#;

/// Atomic check-and-reserve.
pub static ACQUIRE_SCRIPT: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new("semaphore_acquire", ACQUIRE_BODY));

/// Atomic release plus waiter signal.
pub static RELEASE_SCRIPT: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new("semaphore_release", RELEASE_BODY));

/// Usage sweep.
pub static USAGE_SCRIPT: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new("semaphore_usage", USAGE_BODY));

/// Active holder listing.
pub static HOLDERS_SCRIPT: LazyLock<LuaScript> =
    LazyLock::new(|| LuaScript::new("semaphore_holders", HOLDERS_BODY));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_distinct() {
        let shas = [
            ACQUIRE_SCRIPT.sha(),
            RELEASE_SCRIPT.sha(),
            USAGE_SCRIPT.sha(),
            HOLDERS_SCRIPT.sha(),
        ];
        for sha in shas {
            assert_eq!(sha.len(), 40);
            assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
        }
        for (i, a) in shas.iter().enumerate() {
            for b in &shas[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn sha_matches_body() {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(ACQUIRE_SCRIPT.body().as_bytes());
        assert_eq!(ACQUIRE_SCRIPT.sha(), hasher.digest().to_string());
    }
}
