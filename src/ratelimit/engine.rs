//! Counter engine abstraction.
//!
//! The engine owns the counting algorithm and its persistence. This layer
//! only forwards one consumption attempt per check and makes sure the
//! caller's cancellation and deadline reach every round trip.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::rate::{Rate, RateDecision};
use crate::error::{Result, TollgateError};

/// Trait for shared counter stores.
///
/// Implementations must atomically increment the counter for `key` under
/// `rate.window` and report the post-increment state. Retry, if any, is
/// the implementation's business.
#[async_trait]
pub trait CounterEngine: Send + Sync {
    /// Consume one unit for `key` under `rate`.
    async fn consume(&self, key: &str, rate: &Rate) -> Result<RateDecision>;
}

/// Cancellation and deadline of the request being evaluated.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie this context to an existing cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the deadline, if any, has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// A possibly-absent engine.
///
/// An unbound handle is the explicit disabled mode: every check returns
/// the zero decision and never errors.
#[derive(Clone, Default)]
pub struct EngineHandle {
    engine: Option<Arc<dyn CounterEngine>>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn CounterEngine>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_some()
    }

    /// Run exactly one consumption attempt against the engine.
    pub async fn check(&self, ctx: &CallContext, key: &str, rate: &Rate) -> Result<RateDecision> {
        let Some(engine) = &self.engine else {
            return Ok(RateDecision::default());
        };

        // A cancelled request must not consume a slot.
        if ctx.is_cancelled() {
            return Err(TollgateError::Cancelled);
        }
        if ctx.is_expired() {
            return Err(TollgateError::DeadlineExceeded);
        }

        trace!(key = %key, limit = rate.limit, window = ?rate.window, "Checking counter");

        let consume = engine.consume(key, rate);
        match ctx.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(TollgateError::Cancelled),
                    result = tokio::time::timeout_at(deadline, consume) => {
                        result.map_err(|_| TollgateError::DeadlineExceeded)?
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(TollgateError::Cancelled),
                    result = consume => result,
                }
            }
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
