//! Pluggable limiter registry.
//!
//! Extra tiers layered ahead of the global tier, each with its own rate and
//! a suffix that namespaces its counter key. Tiers are bound to the engine
//! once, at registration, and evaluated in registration order.

use std::time::Duration;

use super::engine::EngineHandle;
use super::keys::KEY_DELIMITER;
use super::rate::Rate;

/// Configuration for one pluggable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluggableTierConfig {
    pub rate: Rate,
    /// Namespaces the tier's counter key; an empty suffix makes the tier inert
    pub suffix: String,
}

impl PluggableTierConfig {
    pub fn new(limit: u64, window: Duration, suffix: impl Into<String>) -> Self {
        Self {
            rate: Rate::new(limit, window),
            suffix: suffix.into(),
        }
    }
}

/// A registered tier bound to its engine handle.
#[derive(Debug, Clone)]
pub struct PluggableTier {
    config: PluggableTierConfig,
    engine: EngineHandle,
}

impl PluggableTier {
    pub fn rate(&self) -> &Rate {
        &self.config.rate
    }

    pub fn suffix(&self) -> &str {
        &self.config.suffix
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// A tier participates only with a suffix and a bound engine.
    pub fn is_valid(&self) -> bool {
        !self.config.suffix.is_empty() && self.engine.is_enabled()
    }

    /// Counter key of this tier for the given base key.
    pub fn key_for(&self, base: &str) -> String {
        format!("{}{}{}", base, KEY_DELIMITER, self.config.suffix)
    }
}

/// Ordered set of pluggable tiers.
#[derive(Debug, Clone, Default)]
pub struct PluggableRegistry {
    tiers: Vec<PluggableTier>,
}

impl PluggableRegistry {
    /// Bind every configuration to `engine`, preserving order.
    ///
    /// Tiers built against a disabled engine stay inert for good.
    pub fn new(engine: &EngineHandle, configs: Vec<PluggableTierConfig>) -> Self {
        let tiers = configs
            .into_iter()
            .map(|config| PluggableTier {
                config,
                engine: engine.clone(),
            })
            .collect();
        Self { tiers }
    }

    pub fn tiers(&self) -> &[PluggableTier] {
        &self.tiers
    }

    /// Tiers that take part in evaluation, in registration order.
    pub fn valid_tiers(&self) -> impl Iterator<Item = &PluggableTier> {
        self.tiers.iter().filter(|tier| tier.is_valid())
    }

    /// True when at least one tier participates.
    pub fn is_valid(&self) -> bool {
        self.tiers.iter().any(PluggableTier::is_valid)
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
