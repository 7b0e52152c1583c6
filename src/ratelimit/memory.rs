//! In-process fixed-window counter engine.
//!
//! Counters live in this process only, so limits are not shared across
//! instances. Useful for single-node deployments and tests.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::engine::CounterEngine;
use super::rate::{Rate, RateDecision};
use crate::error::Result;

/// A fixed-window counter for a single key.
///
/// The window starts on the first increment and lasts for the rate's
/// window, mirroring an INCR + EXPIRE pair in a shared store.
struct WindowCounter {
    state: Mutex<WindowState>,
}

struct WindowState {
    count: u64,
    expires_at: Instant,
}

impl WindowCounter {
    fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(WindowState {
                count: 0,
                expires_at: Instant::now() + window,
            }),
        }
    }

    /// Increment the counter, resetting it first if its window has elapsed.
    ///
    /// Returns the post-increment count and the time left in the window.
    fn increment(&self, window: Duration) -> (u64, Duration) {
        let mut state = self.state.lock();
        let now = Instant::now();

        if now >= state.expires_at {
            state.count = 0;
            state.expires_at = now + window;
        }

        state.count += 1;
        (state.count, state.expires_at.saturating_duration_since(now))
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.state.lock().expires_at
    }
}

/// Counter engine keeping fixed-window counters in a concurrent map.
#[derive(Default)]
pub struct MemoryEngine {
    counters: DashMap<String, Arc<WindowCounter>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counters, expired ones included until purged.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop counters whose window has elapsed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired counters");
        }
        purged
    }

    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Purge expired counters every `every` until the engine is dropped.
    ///
    /// Without this, or periodic calls to [`purge_expired`](Self::purge_expired),
    /// the map keeps one entry per distinct key ever seen.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Memory engine dropped, stopping counter purge");
                    return;
                };
                engine.purge_expired();
            }
        })
    }
}

#[async_trait]
impl CounterEngine for MemoryEngine {
    async fn consume(&self, key: &str, rate: &Rate) -> Result<RateDecision> {
        // Clone the Arc so the shard lock is released before the counter lock.
        let counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(WindowCounter::new(rate.window)))
            .clone();

        let (count, until_reset) = counter.increment(rate.window);
        let reset_at = Utc::now()
            + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(RateDecision::from_count(rate, count, reset_at))
    }
}
