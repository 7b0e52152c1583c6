//! Tollgate - Tiered HTTP Admission Control
//!
//! This crate decides, per HTTP request, whether to admit or reject it based
//! on several independently configured rate tiers. Counters live in a shared
//! store (Redis) so every process instance enforces the same limits.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TollgateError};
pub use ratelimit::{CallContext, Decision, Limiter};
