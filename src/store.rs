//! Store client capability for the distributed semaphore.
//!
//! The semaphore needs exactly two things from its store: atomic execution of
//! a server-side script, and a blocking pop against a named list. Anything
//! providing those, directly or through a connection pool, can back a
//! [`RedisSemaphore`](crate::RedisSemaphore).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionLike;

use crate::error::SemaphoreError;
use crate::scripts::LuaScript;

/// One element of a script reply, normalized across stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    /// An integer reply.
    Int(i64),
    /// A bulk string reply.
    Text(String),
    /// A nil reply.
    Nil,
}

impl ScriptValue {
    /// Integer value, if this element is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(v) => Some(*v),
            ScriptValue::Text(s) => s.parse().ok(),
            ScriptValue::Nil => None,
        }
    }

    /// Text value, if this element is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScriptValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Capability the distributed semaphore requires of its store.
///
/// Implemented for a direct client ([`redis::aio::ConnectionManager`]), for a
/// connection pool ([`deadpool_redis::Pool`], borrowing one connection per
/// call), and for the in-memory deterministic store used in tests.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Execute a server-side script atomically.
    ///
    /// Implementations evaluate by hash and fall back to the body when the
    /// store has not cached the script; a script-cache miss never surfaces to
    /// the caller.
    async fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, SemaphoreError>;

    /// Block up to `timeout` popping one entry from the named list.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing to pop.
    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SemaphoreError>;
}

#[async_trait]
impl<T: StoreClient + ?Sized> StoreClient for Arc<T> {
    async fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, SemaphoreError> {
        (**self).eval_script(script, keys, args).await
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SemaphoreError> {
        (**self).blocking_pop(key, timeout).await
    }
}

#[async_trait]
impl StoreClient for redis::aio::ConnectionManager {
    async fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, SemaphoreError> {
        let mut conn = self.clone();
        eval_on(&mut conn, script, keys, args).await
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SemaphoreError> {
        let mut conn = self.clone();
        blocking_pop_on(&mut conn, key, timeout).await
    }
}

#[async_trait]
impl StoreClient for deadpool_redis::Pool {
    async fn eval_script(
        &self,
        script: &LuaScript,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, SemaphoreError> {
        let mut conn = self
            .get()
            .await
            .map_err(|e| SemaphoreError::StoreUnavailable { reason: e.to_string() })?;
        eval_on(&mut conn, script, keys, args).await
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SemaphoreError> {
        let mut conn = self
            .get()
            .await
            .map_err(|e| SemaphoreError::StoreUnavailable { reason: e.to_string() })?;
        blocking_pop_on(&mut conn, key, timeout).await
    }
}

/// Evaluate by hash, falling back to the body on a script-cache miss.
async fn eval_on<C>(
    conn: &mut C,
    script: &LuaScript,
    keys: &[String],
    args: &[String],
) -> Result<Vec<ScriptValue>, SemaphoreError>
where
    C: ConnectionLike + Send,
{
    let mut by_hash = redis::cmd("EVALSHA");
    by_hash.arg(script.sha()).arg(keys.len()).arg(keys).arg(args);

    let value: redis::Value = match by_hash.query_async(conn).await {
        Ok(value) => value,
        Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
            let mut by_body = redis::cmd("EVAL");
            by_body.arg(script.body()).arg(keys.len()).arg(keys).arg(args);
            by_body.query_async(conn).await?
        }
        Err(e) => return Err(e.into()),
    };

    normalize_reply(script, value)
}

async fn blocking_pop_on<C>(
    conn: &mut C,
    key: &str,
    timeout: Duration,
) -> Result<Option<String>, SemaphoreError>
where
    C: ConnectionLike + Send,
{
    let reply: Option<(String, String)> = redis::cmd("BLPOP")
        .arg(key)
        .arg(timeout.as_secs_f64())
        .query_async(conn)
        .await?;
    Ok(reply.map(|(_, value)| value))
}

/// Flatten a raw reply into the `Vec<ScriptValue>` protocol shape.
fn normalize_reply(
    script: &LuaScript,
    value: redis::Value,
) -> Result<Vec<ScriptValue>, SemaphoreError> {
    match value {
        redis::Value::Array(items) => items
            .into_iter()
            .map(|item| normalize_element(script, item))
            .collect(),
        other => Ok(vec![normalize_element(script, other)?]),
    }
}

fn normalize_element(
    script: &LuaScript,
    value: redis::Value,
) -> Result<ScriptValue, SemaphoreError> {
    match value {
        redis::Value::Nil => Ok(ScriptValue::Nil),
        redis::Value::Int(v) => Ok(ScriptValue::Int(v)),
        redis::Value::BulkString(bytes) => {
            Ok(ScriptValue::Text(String::from_utf8_lossy(&bytes).into_owned()))
        }
        redis::Value::SimpleString(s) => Ok(ScriptValue::Text(s)),
        other => Err(SemaphoreError::MalformedReply {
            script: script.name(),
            detail: format!("unexpected reply element {other:?}"),
        }),
    }
}
