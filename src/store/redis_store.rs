//! Redis-backed datastore for cross-process limiters
//!
//! All limiters sharing an ID and a Redis enforce one global limit. The
//! admission check runs as a single server-side Lua script, so the gate
//! is atomic without any client-side locking. Keys live under the
//! `gothrottle:` namespace so limiters written against the same wire
//! contract can share state.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::error::ThrottleError;

use super::{Admission, Datastore, Limits};

/// Namespace prefix for all limiter hashes
const KEY_PREFIX: &str = "gothrottle:";

/// The admission gate. Evaluates both constraints and, on grant, counts
/// the weight, records the start time, and refreshes the key expiry in
/// one atomic step. Returns `{granted, wait_ms}` with `wait_ms = -1` for
/// a concurrency denial. The 30 s expiry bounds staleness when a limiter
/// process disappears; it must exceed the longest expected job runtime.
const ADMISSION_SCRIPT: &str = r#"
local key = KEYS[1]
local max_concurrent = tonumber(ARGV[1])
local min_time_ms = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now_ms = tonumber(ARGV[4])

local running = tonumber(redis.call("HGET", key, "running") or "0")
local last_start = tonumber(redis.call("HGET", key, "last_start") or "0")

if max_concurrent > 0 and running + weight > max_concurrent then
    return {0, -1}
end

if min_time_ms > 0 then
    local elapsed = now_ms - last_start
    if elapsed < min_time_ms then
        return {0, min_time_ms - elapsed}
    end
end

redis.call("HINCRBY", key, "running", weight)
redis.call("HSET", key, "last_start", now_ms)
redis.call("PEXPIRE", key, 30000)

return {1, 0}
"#;

/// Datastore sharing admission state through Redis
pub struct RedisStore {
    conn: Mutex<Option<MultiplexedConnection>>,
    script_sha: String,
}

impl RedisStore {
    /// Connect and load the admission script, caching its SHA
    pub async fn connect(client: redis::Client) -> Result<Self, ThrottleError> {
        let mut conn = client.get_multiplexed_async_connection().await?;
        let script_sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(ADMISSION_SCRIPT)
            .query_async(&mut conn)
            .await?;
        debug!(%script_sha, "RedisStore::connect: admission script loaded");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            script_sha,
        })
    }

    /// Clone the multiplexed connection, or fail if disconnected
    fn connection(&self) -> Result<MultiplexedConnection, ThrottleError> {
        self.conn
            .lock()
            .as_ref()
            .cloned()
            .ok_or(ThrottleError::StoreClosed)
    }

    fn key(limiter_id: &str) -> String {
        format!("{KEY_PREFIX}{limiter_id}")
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn eval_admission(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        weight: u32,
        limits: &Limits,
        now_ms: i64,
    ) -> redis::RedisResult<(i64, i64)> {
        redis::cmd("EVALSHA")
            .arg(&self.script_sha)
            .arg(1)
            .arg(key)
            .arg(i64::from(limits.max_concurrent))
            .arg(limits.min_time.as_millis() as i64)
            .arg(i64::from(weight))
            .arg(now_ms)
            .query_async(conn)
            .await
    }
}

#[async_trait]
impl Datastore for RedisStore {
    async fn request(
        &self,
        limiter_id: &str,
        weight: u32,
        limits: &Limits,
    ) -> Result<Admission, ThrottleError> {
        let mut conn = self.connection()?;
        let key = Self::key(limiter_id);
        let now_ms = Self::now_ms();

        let reply = match self.eval_admission(&mut conn, &key, weight, limits, now_ms).await {
            // The script cache was flushed (e.g. server restart): reload
            // and retry once.
            Err(err) if err.kind() == redis::ErrorKind::NoScriptError => {
                warn!(limiter_id, "RedisStore::request: script missing, reloading");
                let _: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(ADMISSION_SCRIPT)
                    .query_async(&mut conn)
                    .await?;
                self.eval_admission(&mut conn, &key, weight, limits, now_ms).await?
            }
            other => other?,
        };

        let (granted, wait_ms) = reply;
        if granted == 1 {
            debug!(limiter_id, weight, "RedisStore::request: granted");
            return Ok(Admission::Granted);
        }

        // wait_ms = -1 encodes a concurrency denial, which has no useful
        // wait to suggest.
        let retry_after = (wait_ms > 0).then(|| Duration::from_millis(wait_ms as u64));
        debug!(limiter_id, wait_ms, "RedisStore::request: denied");
        Ok(Admission::Denied { retry_after })
    }

    async fn register_done(&self, limiter_id: &str, weight: u32) -> Result<(), ThrottleError> {
        let mut conn = self.connection()?;
        let key = Self::key(limiter_id);

        // A plain atomic decrement: completion accounting cannot deny, so
        // it stays outside the script. Staleness self-heals via the key
        // expiry refreshed on every grant.
        let running: i64 = redis::cmd("HINCRBY")
            .arg(&key)
            .arg("running")
            .arg(-i64::from(weight))
            .query_async(&mut conn)
            .await?;
        debug!(limiter_id, weight, running, "RedisStore::register_done: released");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ThrottleError> {
        self.conn.lock().take();
        debug!("RedisStore::disconnect: closed");
        Ok(())
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("script_sha", &self.script_sha)
            .field("connected", &self.conn.lock().is_some())
            .finish()
    }
}
