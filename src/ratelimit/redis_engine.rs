//! Redis-backed shared counter engine.
//!
//! Every process instance pointing at the same Redis sees the same
//! counters. The increment and the window expiry are applied in one Lua
//! script so concurrent callers observe a consistent count per key.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{RedisError, RedisResult, Script};
use tracing::{info, warn};

use super::engine::CounterEngine;
use super::rate::{Rate, RateDecision};
use crate::error::Result;

/// Default namespace prepended to every counter key.
pub const DEFAULT_PREFIX: &str = "tollgate";
/// Default number of retries on transport failures.
pub const DEFAULT_MAX_RETRY: u32 = 3;
/// Default backoff step between retries.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Fixed-window increment. Returns `{count, pttl}`.
const CONSUME_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Counter engine backed by a Redis server.
pub struct RedisEngine {
    conn: ConnectionManager,
    script: Script,
    prefix: String,
    max_retry: u32,
    retry_backoff: Duration,
}

impl RedisEngine {
    /// Connect to the Redis server at `url`.
    ///
    /// Fails if the URL is invalid or the server cannot be reached, so a
    /// misconfigured store aborts setup.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis counter store");
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(CONSUME_SCRIPT),
            prefix: DEFAULT_PREFIX.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn invoke(&self, counter_key: &str, window_ms: u64) -> RedisResult<(u64, i64)> {
        let mut conn = self.conn.clone();
        self.script
            .key(counter_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
    }
}

#[async_trait]
impl CounterEngine for RedisEngine {
    async fn consume(&self, key: &str, rate: &Rate) -> Result<RateDecision> {
        let counter_key = namespaced_key(&self.prefix, key);
        let window_ms = window_millis(rate.window);

        let mut attempt = 0;
        loop {
            match self.invoke(&counter_key, window_ms).await {
                Ok((count, ttl_ms)) => {
                    let reset_at = Utc::now() + chrono::Duration::milliseconds(ttl_ms.max(0));
                    return Ok(RateDecision::from_count(rate, count, reset_at));
                }
                Err(e) if attempt < self.max_retry && is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt;
                    warn!(
                        key = %counter_key,
                        attempt = attempt,
                        max_retry = self.max_retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis counter update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Prepend the store namespace, if any.
fn namespaced_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Redis rejects a zero PEXPIRE, so windows are at least one millisecond.
fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn is_retryable(e: &RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
}
