//! Tiered rate limiting: key derivation, tier evaluation and counter engines.

pub mod engine;
pub mod extract;
pub mod ip;
pub mod keys;
pub mod limiter;
pub mod memory;
pub mod pluggable;
pub mod rate;
pub mod redis_engine;
pub mod request;

pub use engine::{CallContext, CounterEngine, EngineHandle};
pub use extract::{ContextExtractor, ExtractError, HeaderExtractor, IdentityExtractor};
pub use ip::{remote_ip, IpLookup};
pub use keys::{join_key, RequestKey, RequestKeySet, KEY_DELIMITER};
pub use limiter::{
    Limiter, DEFAULT_GLOBAL_LIMIT, DEFAULT_GLOBAL_WINDOW, DEFAULT_REQUEST_LIMIT,
    DEFAULT_REQUEST_WINDOW, RATE_LIMIT_MESSAGE,
};
pub use memory::MemoryEngine;
pub use pluggable::{PluggableRegistry, PluggableTier, PluggableTierConfig};
pub use rate::{Decision, Rate, RateDecision, Tier};
pub use redis_engine::RedisEngine;
pub use request::{InboundRequest, RemoteAddr};
