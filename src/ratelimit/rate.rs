//! Rates, per-check decisions and the tier labels attached to them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A quota: at most `limit` units per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rate {
    /// Maximum units allowed in one window
    pub limit: u64,
    /// Length of the window
    pub window: Duration,
}

impl Rate {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn per_second(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    pub fn per_minute(limit: u64) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

/// Post-increment state of one counter check.
///
/// The default value is the zero decision: nothing consumed, nothing
/// reached, no reset time. It is what disabled engines and skipped
/// requests produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub limit: u64,
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: Option<DateTime<Utc>>,
    /// True when this check alone denies the request
    pub reached: bool,
}

impl RateDecision {
    /// Build a decision from the counter value observed after incrementing.
    pub fn from_count(rate: &Rate, count: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            limit: rate.limit,
            remaining: rate.limit.saturating_sub(count),
            reset_at: Some(reset_at),
            reached: count > rate.limit,
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.reached
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Which tier of the evaluation chain produced a decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "suffix", rename_all = "lowercase")]
pub enum Tier {
    /// A registered pluggable tier, identified by its key suffix
    Pluggable(String),
    /// The anonymous-traffic ceiling
    Global,
    /// The per-request key combination
    Request,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Pluggable(suffix) => write!(f, "pluggable:{}", suffix),
            Tier::Global => write!(f, "global"),
            Tier::Request => write!(f, "request"),
        }
    }
}

/// Outcome of evaluating a whole request.
///
/// `tier` is `None` when the request was skipped because the caller could
/// not be identified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(flatten)]
    pub rate: RateDecision,
    pub tier: Option<Tier>,
}

impl Decision {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn from_tier(tier: Tier, rate: RateDecision) -> Self {
        Self {
            rate,
            tier: Some(tier),
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.rate.reached
    }

    pub fn is_skipped(&self) -> bool {
        self.tier.is_none()
    }
}
