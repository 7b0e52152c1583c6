//! Configuration management for Tollgate.
//!
//! Settings are read from a YAML file and may be overridden through
//! `TOLLGATE__*` environment variables (e.g. `TOLLGATE__STORE__REDIS_URL`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::ip::{IpLookup, DEFAULT_FORWARDED_FOR_HOPS};
use crate::ratelimit::redis_engine::{DEFAULT_MAX_RETRY, DEFAULT_PREFIX};
use crate::ratelimit::{
    EngineHandle, HeaderExtractor, Limiter, MemoryEngine, PluggableTierConfig, RedisEngine,
    DEFAULT_GLOBAL_LIMIT, DEFAULT_REQUEST_LIMIT,
};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterSettings,
}

impl TollgateConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml).required(true))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        let config: TollgateConfig = config
            .try_deserialize()
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.limiter.validate()
    }

    /// Connect to the configured store and build the limiter.
    pub async fn build_limiter(&self) -> Result<Limiter> {
        let engine = self.store.connect().await?;
        self.limiter.build(engine)
    }
}

/// Which counter engine backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// No enforcement; every check returns the zero decision
    Disabled,
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace prepended to every counter key
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Retries on transport failures
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Backoff step between retries in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Per-check deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// How often the memory backend drops expired counters; 0 disables
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            prefix: default_prefix(),
            max_retry: default_max_retry(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_ms: None,
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_purge_interval_secs() -> u64 {
    60
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Redis
            && self.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(TollgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Build the engine handle. Connection failures abort setup.
    pub async fn connect(&self) -> Result<EngineHandle> {
        self.validate()?;

        match self.backend {
            StoreBackend::Disabled => {
                info!("Counter store disabled, rate limits will not be enforced");
                Ok(EngineHandle::disabled())
            }
            StoreBackend::Memory => {
                info!(
                    purge_interval_secs = self.purge_interval_secs,
                    "Using in-memory counter store"
                );
                let engine = Arc::new(MemoryEngine::new());
                if self.purge_interval_secs > 0 {
                    engine.spawn_purger(Duration::from_secs(self.purge_interval_secs));
                }
                Ok(EngineHandle::new(engine))
            }
            StoreBackend::Redis => {
                let url = self.redis_url.as_deref().unwrap_or_default();
                let engine = RedisEngine::connect(url)
                    .await?
                    .with_prefix(self.prefix.clone())
                    .with_max_retry(self.max_retry)
                    .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms));
                Ok(EngineHandle::new(Arc::new(engine)))
            }
        }
    }
}

/// A rate as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSettings {
    pub limit: u64,
    pub window_secs: u64,
}

impl RateSettings {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_secs == 0 {
            return Err(TollgateError::Config(format!(
                "{}.window_secs must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

/// A pluggable tier as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluggableSettings {
    pub limit: u64,
    pub window_secs: u64,
    pub suffix: String,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_request_rate")]
    pub request_rate: RateSettings,

    #[serde(default = "default_global_rate")]
    pub global_rate: RateSettings,

    /// Address sources in lookup order
    #[serde(default = "default_ip_lookups")]
    pub ip_lookups: Vec<String>,

    /// Trusted proxies appending to X-Forwarded-For
    #[serde(default = "default_forwarded_for_hops")]
    pub forwarded_for_hops: usize,

    /// Methods to key on; empty tracks all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Defaults to whether an identity header is configured
    #[serde(default)]
    pub include_identity: Option<bool>,

    /// Header carrying the authenticated identity
    #[serde(default)]
    pub identity_header: Option<String>,

    /// Headers folded into the request key as extra context
    #[serde(default)]
    pub context_headers: Vec<String>,

    #[serde(default)]
    pub ignore_url: bool,

    /// Message shown on denial
    #[serde(default)]
    pub message: Option<String>,

    /// Extra tiers evaluated ahead of the global tier, in order
    #[serde(default)]
    pub pluggable: Vec<PluggableSettings>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            request_rate: default_request_rate(),
            global_rate: default_global_rate(),
            ip_lookups: default_ip_lookups(),
            forwarded_for_hops: default_forwarded_for_hops(),
            methods: Vec::new(),
            include_identity: None,
            identity_header: None,
            context_headers: Vec::new(),
            ignore_url: false,
            message: None,
            pluggable: Vec::new(),
        }
    }
}

fn default_request_rate() -> RateSettings {
    RateSettings {
        limit: DEFAULT_REQUEST_LIMIT,
        window_secs: 60,
    }
}

fn default_global_rate() -> RateSettings {
    RateSettings {
        limit: DEFAULT_GLOBAL_LIMIT,
        window_secs: 60,
    }
}

fn default_ip_lookups() -> Vec<String> {
    crate::ratelimit::ip::default_ip_lookups()
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_forwarded_for_hops() -> usize {
    DEFAULT_FORWARDED_FOR_HOPS
}

impl LimiterSettings {
    pub fn validate(&self) -> Result<()> {
        self.request_rate.validate("limiter.request_rate")?;
        self.global_rate.validate("limiter.global_rate")?;
        self.parse_ip_lookups()?;

        for (i, tier) in self.pluggable.iter().enumerate() {
            if tier.window_secs == 0 {
                return Err(TollgateError::Config(format!(
                    "limiter.pluggable[{}].window_secs must be greater than zero",
                    i
                )));
            }
        }

        if self.include_identity == Some(true) && self.identity_header.is_none() {
            return Err(TollgateError::Config(
                "limiter.include_identity requires limiter.identity_header".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parse_ip_lookups(&self) -> Result<Vec<IpLookup>> {
        self.ip_lookups.iter().map(|name| name.parse()).collect()
    }

    /// Build a limiter bound to `engine`.
    pub fn build(&self, engine: EngineHandle) -> Result<Limiter> {
        self.validate()?;

        let mut limiter = Limiter::new(
            engine,
            self.request_rate.limit,
            self.request_rate.window(),
        )
        .with_request_limit(self.request_rate.limit)
        .with_global_limit(self.global_rate.limit)
        .with_global_window(self.global_rate.window())
        .with_ip_lookups(self.parse_ip_lookups()?)
        .with_forwarded_for_hops(self.forwarded_for_hops)
        .with_methods(&self.methods)
        .with_ignore_url(self.ignore_url);

        if let Some(header) = &self.identity_header {
            let extractor = HeaderExtractor::new(header.clone());
            limiter = limiter.with_identity_extractor(Arc::new(extractor));
        }
        if let Some(include) = self.include_identity {
            limiter = limiter.with_include_identity(include);
        }
        if let Some(first) = self.context_headers.first() {
            limiter = limiter
                .with_context_extractor(Arc::new(HeaderExtractor::new(first.clone())))
                .with_context_params(self.context_headers.clone());
        }
        if let Some(message) = &self.message {
            limiter = limiter.with_message(message.clone());
        }

        let tiers = self
            .pluggable
            .iter()
            .map(|tier| {
                PluggableTierConfig::new(
                    tier.limit,
                    Duration::from_secs(tier.window_secs),
                    tier.suffix.clone(),
                )
            })
            .collect();

        info!(
            request_limit = self.request_rate.limit,
            global_limit = self.global_rate.limit,
            pluggable = self.pluggable.len(),
            enabled = limiter.is_enabled(),
            "Limiter built"
        );

        Ok(limiter.with_pluggable_tiers(tiers))
    }
}
