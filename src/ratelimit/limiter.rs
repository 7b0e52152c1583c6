//! The limiter: configuration, key building and tier evaluation.
//!
//! A request is reduced to a [`RequestKeySet`] and then checked against up
//! to three kinds of tiers, in this order:
//!
//! 1. every valid pluggable tier (anonymous requests only),
//! 2. the global tier (anonymous requests only),
//! 3. the request tier.
//!
//! Evaluation stops at the first tier that reports the limit reached or at
//! the first engine error. Requests with neither an address nor an identity
//! are not checked at all.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::engine::{CallContext, EngineHandle};
use super::extract::{ContextExtractor, IdentityExtractor};
use super::ip::{default_ip_lookups, remote_ip, IpLookup, DEFAULT_FORWARDED_FOR_HOPS};
use super::keys::{join_key, RequestKeySet};
use super::pluggable::{PluggableRegistry, PluggableTierConfig};
use super::rate::{Decision, Rate, RateDecision, Tier};
use super::request::InboundRequest;
use crate::error::Result;

/// Default request-tier limit.
pub const DEFAULT_REQUEST_LIMIT: u64 = 5;
/// Default request-tier window.
pub const DEFAULT_REQUEST_WINDOW: Duration = Duration::from_secs(60);
/// Default global-tier limit.
pub const DEFAULT_GLOBAL_LIMIT: u64 = 12;
/// Default global-tier window.
pub const DEFAULT_GLOBAL_WINDOW: Duration = Duration::from_secs(60);

/// Message callers may show when a request is denied.
pub const RATE_LIMIT_MESSAGE: &str = "You have reached maximum request limit.";

/// One step of the evaluation chain.
struct CheckableTier<'a> {
    tier: Tier,
    key: String,
    rate: &'a Rate,
    engine: &'a EngineHandle,
}

/// Tiered admission control for HTTP requests.
///
/// Holds no per-key state; all counters live in the engine, so a single
/// limiter can be shared across tasks.
pub struct Limiter {
    engine: EngineHandle,
    request_rate: Rate,
    global_rate: Rate,
    ip_lookups: Vec<IpLookup>,
    forwarded_for_hops: usize,
    /// Upper-cased; empty means every method is tracked
    methods: HashSet<String>,
    include_identity: bool,
    identity_extractor: Option<Arc<dyn IdentityExtractor>>,
    context_extractor: Option<Arc<dyn ContextExtractor>>,
    context_params: Vec<String>,
    ignore_url: bool,
    message: String,
    pluggable: PluggableRegistry,
}

impl Limiter {
    /// Create a limiter allowing `limit` requests per `window` per request key.
    ///
    /// A zero limit or window falls back to the defaults.
    pub fn new(engine: EngineHandle, limit: u64, window: Duration) -> Self {
        let limit = if limit == 0 { DEFAULT_REQUEST_LIMIT } else { limit };
        let window = if window.is_zero() {
            DEFAULT_REQUEST_WINDOW
        } else {
            window
        };

        Self {
            engine,
            request_rate: Rate::new(limit, window),
            global_rate: Rate::new(DEFAULT_GLOBAL_LIMIT, DEFAULT_GLOBAL_WINDOW),
            ip_lookups: default_ip_lookups(),
            forwarded_for_hops: DEFAULT_FORWARDED_FOR_HOPS,
            methods: HashSet::new(),
            include_identity: false,
            identity_extractor: None,
            context_extractor: None,
            context_params: Vec::new(),
            ignore_url: false,
            message: RATE_LIMIT_MESSAGE.to_string(),
            pluggable: PluggableRegistry::default(),
        }
    }

    /// A limiter that never enforces anything.
    pub fn disabled() -> Self {
        Self::new(EngineHandle::disabled(), 0, Duration::ZERO)
    }

    pub fn with_request_limit(mut self, limit: u64) -> Self {
        self.request_rate.limit = limit;
        self
    }

    pub fn with_request_window(mut self, window: Duration) -> Self {
        self.request_rate.window = window;
        self
    }

    pub fn with_global_limit(mut self, limit: u64) -> Self {
        self.global_rate.limit = limit;
        self
    }

    pub fn with_global_window(mut self, window: Duration) -> Self {
        self.global_rate.window = window;
        self
    }

    pub fn with_ip_lookups(mut self, lookups: Vec<IpLookup>) -> Self {
        self.ip_lookups = lookups;
        self
    }

    /// How many trusted proxies append to `X-Forwarded-For`.
    pub fn with_forwarded_for_hops(mut self, hops: usize) -> Self {
        self.forwarded_for_hops = hops;
        self
    }

    /// Only key on these methods; others get an empty method component.
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.methods
            .extend(methods.into_iter().map(|m| m.as_ref().to_ascii_uppercase()));
        self
    }

    pub fn with_include_identity(mut self, include: bool) -> Self {
        self.include_identity = include;
        self
    }

    /// Install an identity extractor and turn identity tracking on.
    pub fn with_identity_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.identity_extractor = Some(extractor);
        self.include_identity = true;
        self
    }

    pub fn with_context_extractor(mut self, extractor: Arc<dyn ContextExtractor>) -> Self {
        self.context_extractor = Some(extractor);
        self
    }

    /// Parameters handed to the context extractor on every request.
    pub fn with_context_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ignore_url(mut self, ignore: bool) -> Self {
        self.ignore_url = ignore;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Register pluggable tiers against the limiter's current engine.
    ///
    /// Replaces any previously registered tiers.
    pub fn with_pluggable_tiers(mut self, configs: Vec<PluggableTierConfig>) -> Self {
        self.pluggable = PluggableRegistry::new(&self.engine, configs);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled()
    }

    pub fn request_rate(&self) -> &Rate {
        &self.request_rate
    }

    pub fn global_rate(&self) -> &Rate {
        &self.global_rate
    }

    pub fn ip_lookups(&self) -> &[IpLookup] {
        &self.ip_lookups
    }

    pub fn forwarded_for_hops(&self) -> usize {
        self.forwarded_for_hops
    }

    pub fn methods(&self) -> &HashSet<String> {
        &self.methods
    }

    pub fn include_identity(&self) -> bool {
        self.include_identity
    }

    pub fn context_params(&self) -> &[String] {
        &self.context_params
    }

    pub fn ignore_url(&self) -> bool {
        self.ignore_url
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn pluggable(&self) -> &PluggableRegistry {
        &self.pluggable
    }

    /// Resolve the caller's address from the configured sources.
    pub fn remote_ip<R: InboundRequest + ?Sized>(&self, req: &R) -> String {
        remote_ip(&self.ip_lookups, self.forwarded_for_hops, req)
    }

    /// Method component of the request key.
    pub fn method_component<R: InboundRequest + ?Sized>(&self, req: &R) -> String {
        let method = req.method();
        if self.methods.is_empty() || self.methods.contains(&method.to_ascii_uppercase()) {
            method.to_string()
        } else {
            String::new()
        }
    }

    /// Resolve the caller's identity. Failures count as anonymous.
    pub async fn resolve_identity(&self, req: &dyn InboundRequest) -> String {
        if !self.include_identity {
            return String::new();
        }
        let Some(extractor) = &self.identity_extractor else {
            return String::new();
        };

        match extractor.identity(req).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Identity extraction failed, treating request as anonymous");
                String::new()
            }
        }
    }

    /// Resolve extra key context. Failures yield an empty component.
    pub async fn resolve_context(&self, req: &dyn InboundRequest) -> String {
        let Some(extractor) = &self.context_extractor else {
            return String::new();
        };

        match extractor.context(req, &self.context_params).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Context extraction failed, using empty context");
                String::new()
            }
        }
    }

    /// Build the counter keys for a request.
    ///
    /// Invokes the caller's extractors but never fails.
    pub async fn build_keys(&self, req: &dyn InboundRequest) -> RequestKeySet {
        let ip = self.remote_ip(req);
        let identity = self.resolve_identity(req).await;
        self.assemble_keys(req, ip, identity).await
    }

    async fn assemble_keys(
        &self,
        req: &dyn InboundRequest,
        ip: String,
        identity: String,
    ) -> RequestKeySet {
        let path = if self.ignore_url {
            String::new()
        } else {
            req.path().to_string()
        };
        let method = self.method_component(req);
        let context = self.resolve_context(req).await;

        RequestKeySet::assemble(ip, path, method, identity, context)
    }

    /// True when the caller has neither an address nor an identity.
    pub async fn should_skip(&self, req: &dyn InboundRequest) -> bool {
        self.remote_ip(req).is_empty() && self.resolve_identity(req).await.is_empty()
    }

    /// Decide whether a request is admitted.
    ///
    /// Unidentifiable callers get a skipped decision without any counter
    /// being consumed. Engine errors are returned as-is.
    pub async fn limit_by_request(
        &self,
        ctx: &CallContext,
        req: &dyn InboundRequest,
    ) -> Result<Decision> {
        let ip = self.remote_ip(req);
        let identity = self.resolve_identity(req).await;

        if ip.is_empty() && identity.is_empty() {
            debug!(
                method = %req.method(),
                path = %req.path(),
                "Caller unidentifiable, skipping rate limit"
            );
            return Ok(Decision::skipped());
        }

        let keys = self.assemble_keys(req, ip, identity).await;
        self.evaluate(ctx, &keys).await
    }

    /// Run the tier chain over an already-built key set.
    pub async fn evaluate(&self, ctx: &CallContext, keys: &RequestKeySet) -> Result<Decision> {
        let mut decision = Decision::skipped();

        for step in self.plan(keys) {
            let rate = step.engine.check(ctx, &step.key, step.rate).await?;
            decision = Decision::from_tier(step.tier, rate);

            if decision.limit_reached() {
                debug!(
                    key = %step.key,
                    tier = %decision.tier.as_ref().map(ToString::to_string).unwrap_or_default(),
                    limit = rate.limit,
                    "Rate limit reached"
                );
                return Ok(decision);
            }
        }

        Ok(decision)
    }

    /// Check the request rate against an arbitrary list of key components.
    pub async fn limit_by_keys<S: AsRef<str>>(
        &self,
        ctx: &CallContext,
        components: &[S],
    ) -> Result<RateDecision> {
        self.engine
            .check(ctx, &join_key(components), &self.request_rate)
            .await
    }

    /// Ordered tier checks for a key set.
    fn plan<'a>(&'a self, keys: &RequestKeySet) -> Vec<CheckableTier<'a>> {
        let mut steps = Vec::with_capacity(self.pluggable.len() + 2);

        if keys.is_global_valid() {
            let global_key = keys.global_key();

            steps.extend(self.pluggable.valid_tiers().map(|tier| CheckableTier {
                tier: Tier::Pluggable(tier.suffix().to_string()),
                key: tier.key_for(&global_key),
                rate: tier.rate(),
                engine: tier.engine(),
            }));

            steps.push(CheckableTier {
                tier: Tier::Global,
                key: global_key,
                rate: &self.global_rate,
                engine: &self.engine,
            });
        }

        steps.push(CheckableTier {
            tier: Tier::Request,
            key: keys.request_key(),
            rate: &self.request_rate,
            engine: &self.engine,
        });

        steps
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("engine", &self.engine)
            .field("request_rate", &self.request_rate)
            .field("global_rate", &self.global_rate)
            .field("ip_lookups", &self.ip_lookups)
            .field("forwarded_for_hops", &self.forwarded_for_hops)
            .field("methods", &self.methods)
            .field("include_identity", &self.include_identity)
            .field("context_params", &self.context_params)
            .field("ignore_url", &self.ignore_url)
            .field("pluggable", &self.pluggable.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;
    use crate::ratelimit::engine::CounterEngine;
    use crate::ratelimit::extract::ExtractError;
    use crate::ratelimit::memory::MemoryEngine;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const IPV6: &str = "2001:0db8:85a3:0000:0000:8a2e:0370:7334";

    /// Memory engine that records every key it is asked about.
    #[derive(Default)]
    struct CountingEngine {
        inner: MemoryEngine,
        calls: Mutex<Vec<String>>,
    }

    impl CountingEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn calls_for(&self, key: &str) -> usize {
            self.calls.lock().iter().filter(|k| k.as_str() == key).count()
        }
    }

    #[async_trait]
    impl CounterEngine for CountingEngine {
        async fn consume(&self, key: &str, rate: &Rate) -> Result<RateDecision> {
            self.calls.lock().push(key.to_string());
            self.inner.consume(key, rate).await
        }
    }

    /// Engine failing on every key containing `fail_on`.
    struct FailingEngine {
        fail_on: &'static str,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CounterEngine for FailingEngine {
        async fn consume(&self, key: &str, rate: &Rate) -> Result<RateDecision> {
            self.calls.lock().push(key.to_string());
            if key.contains(self.fail_on) {
                return Err(TollgateError::Engine("store unavailable".to_string()));
            }
            Ok(RateDecision::from_count(rate, 1, chrono::Utc::now()))
        }
    }

    struct StaticIdentity(&'static str);

    #[async_trait]
    impl IdentityExtractor for StaticIdentity {
        async fn identity(
            &self,
            _req: &dyn InboundRequest,
        ) -> std::result::Result<String, ExtractError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingIdentity;

    #[async_trait]
    impl IdentityExtractor for FailingIdentity {
        async fn identity(
            &self,
            _req: &dyn InboundRequest,
        ) -> std::result::Result<String, ExtractError> {
            Err("session store unavailable".into())
        }
    }

    struct StaticContext(&'static str);

    #[async_trait]
    impl ContextExtractor for StaticContext {
        async fn context(
            &self,
            _req: &dyn InboundRequest,
            params: &[String],
        ) -> std::result::Result<String, ExtractError> {
            Ok(format!("{}:{}", self.0, params.join("+")))
        }
    }

    struct FailingContext;

    #[async_trait]
    impl ContextExtractor for FailingContext {
        async fn context(
            &self,
            _req: &dyn InboundRequest,
            _params: &[String],
        ) -> std::result::Result<String, ExtractError> {
            Err("lookup failed".into())
        }
    }

    fn counting() -> (Arc<CountingEngine>, EngineHandle) {
        let engine = Arc::new(CountingEngine::default());
        (engine.clone(), EngineHandle::new(engine))
    }

    fn request(method: &str, path: &str, ip: Option<&str>) -> http::Request<()> {
        let mut builder = http::Request::builder().method(method).uri(path);
        if let Some(ip) = ip {
            builder = builder.header("CF-Connecting-IP", ip);
        }
        builder.body(()).unwrap()
    }

    fn scenario_limiter(engine: EngineHandle) -> Limiter {
        Limiter::new(engine, 2, Duration::from_secs(300))
            .with_global_limit(1)
            .with_global_window(Duration::from_secs(5))
    }

    #[test]
    fn test_defaults() {
        let limiter = Limiter::disabled();

        assert!(!limiter.is_enabled());
        assert_eq!(limiter.request_rate(), &Rate::new(5, Duration::from_secs(60)));
        assert_eq!(limiter.global_rate(), &Rate::new(12, Duration::from_secs(60)));
        assert_eq!(limiter.ip_lookups(), default_ip_lookups().as_slice());
        assert_eq!(limiter.forwarded_for_hops(), DEFAULT_FORWARDED_FOR_HOPS);
        assert_eq!(limiter.message(), RATE_LIMIT_MESSAGE);
        assert!(!limiter.include_identity());
        assert!(!limiter.ignore_url());
        assert!(limiter.pluggable().is_empty());
    }

    #[test]
    fn test_setters() {
        let limiter = Limiter::new(EngineHandle::disabled(), 10, Duration::from_secs(1))
            .with_methods(["get", "Post"])
            .with_ignore_url(true)
            .with_message("slow down")
            .with_context_params(["tenant"])
            .with_identity_extractor(Arc::new(StaticIdentity("u")));

        assert_eq!(limiter.request_rate(), &Rate::per_second(10));
        assert!(limiter.methods().contains("GET"));
        assert!(limiter.methods().contains("POST"));
        assert!(limiter.ignore_url());
        assert_eq!(limiter.message(), "slow down");
        assert_eq!(limiter.context_params(), ["tenant".to_string()]);
        assert!(limiter.include_identity());

        let limiter = limiter.with_include_identity(false);
        assert!(!limiter.include_identity());
    }

    #[tokio::test]
    async fn test_build_keys_anonymous() {
        let limiter = scenario_limiter(EngineHandle::disabled());
        let keys = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;

        assert_eq!(keys.global, vec![IPV6.to_string()]);
        assert_eq!(keys.request.components(), [IPV6, "/", "GET", "", ""]);
    }

    #[tokio::test]
    async fn test_build_keys_identified() {
        let limiter = scenario_limiter(EngineHandle::disabled())
            .with_identity_extractor(Arc::new(StaticIdentity("user-42")));
        let keys = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;

        assert!(keys.global.is_empty());
        assert_eq!(keys.request.components(), [IPV6, "/", "GET", "user-42", ""]);
    }

    #[tokio::test]
    async fn test_build_keys_identity_disabled_ignores_extractor() {
        let limiter = scenario_limiter(EngineHandle::disabled())
            .with_identity_extractor(Arc::new(StaticIdentity("user-42")))
            .with_include_identity(false);
        let keys = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;

        assert_eq!(keys.global, vec![IPV6.to_string()]);
        assert_eq!(keys.request.identity, "");
    }

    #[tokio::test]
    async fn test_build_keys_swallows_extractor_failures() {
        let limiter = scenario_limiter(EngineHandle::disabled())
            .with_identity_extractor(Arc::new(FailingIdentity))
            .with_context_extractor(Arc::new(FailingContext));
        let keys = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;

        assert_eq!(keys.global, vec![IPV6.to_string()]);
        assert_eq!(keys.request.components(), [IPV6, "/", "GET", "", ""]);
    }

    #[tokio::test]
    async fn test_build_keys_context_receives_params() {
        let limiter = scenario_limiter(EngineHandle::disabled())
            .with_context_extractor(Arc::new(StaticContext("ctx")))
            .with_context_params(["a", "b"]);
        let keys = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;

        assert_eq!(keys.request.context, "ctx:a+b");
    }

    #[tokio::test]
    async fn test_build_keys_ignore_url_keeps_position() {
        let limiter = scenario_limiter(EngineHandle::disabled()).with_ignore_url(true);
        let keys = limiter.build_keys(&request("GET", "/items/7", Some(IPV6))).await;

        assert_eq!(keys.request.components(), [IPV6, "", "GET", "", ""]);
    }

    #[tokio::test]
    async fn test_build_keys_untracked_method_is_blank() {
        let limiter = scenario_limiter(EngineHandle::disabled()).with_methods(["post"]);

        let get = limiter.build_keys(&request("GET", "/", Some(IPV6))).await;
        let post = limiter.build_keys(&request("POST", "/", Some(IPV6))).await;

        assert_eq!(get.request.method, "");
        assert_eq!(post.request.method, "POST");
    }

    #[tokio::test]
    async fn test_unidentifiable_caller_is_skipped() {
        let (engine, handle) = counting();
        let limiter = scenario_limiter(handle).with_context_extractor(Arc::new(StaticContext("x")));
        let req = request("GET", "/", None);

        assert!(limiter.should_skip(&req).await);

        let decision = limiter.limit_by_request(&CallContext::new(), &req).await.unwrap();
        assert!(decision.is_skipped());
        assert!(decision.rate.is_zero());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_identity_only_caller_is_checked() {
        let (engine, handle) = counting();
        let limiter = scenario_limiter(handle)
            .with_identity_extractor(Arc::new(StaticIdentity("user-42")));
        let req = request("GET", "/", None);

        assert!(!limiter.should_skip(&req).await);

        let decision = limiter.limit_by_request(&CallContext::new(), &req).await.unwrap();
        assert_eq!(decision.tier, Some(Tier::Request));
        assert_eq!(engine.calls(), vec!["|/|GET|user-42|".to_string()]);
    }

    #[tokio::test]
    async fn test_anonymous_scenario_denied_by_global_tier() {
        let (engine, handle) = counting();
        let limiter = scenario_limiter(handle);
        let ctx = CallContext::new();

        let first = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();
        assert!(!first.limit_reached());
        assert_eq!(first.tier, Some(Tier::Request));
        assert_eq!(first.rate.limit, 2);
        assert_eq!(first.rate.remaining, 1);

        // The global tier allows a single request per window and is
        // checked before the request tier.
        let second = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();
        assert!(second.limit_reached());
        assert_eq!(second.tier, Some(Tier::Global));
        assert_eq!(second.rate.limit, 1);
        assert_eq!(second.rate.remaining, 0);

        let request_key = format!("{}|/|GET||", IPV6);
        assert_eq!(engine.calls_for(IPV6), 2);
        assert_eq!(engine.calls_for(&request_key), 1);
    }

    #[tokio::test]
    async fn test_anonymous_scenario_request_tier_drains_first() {
        let (_engine, handle) = counting();
        let limiter = scenario_limiter(handle).with_global_limit(60);
        let ctx = CallContext::new();

        let mut decisions = Vec::new();
        for _ in 0..3 {
            decisions.push(
                limiter
                    .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(decisions[0].rate.remaining, 1);
        assert_eq!(decisions[1].rate.remaining, 0);
        assert!(!decisions[1].limit_reached());
        assert!(decisions[2].limit_reached());
        assert_eq!(decisions[2].tier, Some(Tier::Request));
    }

    #[tokio::test]
    async fn test_identified_scenario_denied_by_request_tier() {
        let (engine, handle) = counting();
        let limiter = scenario_limiter(handle)
            .with_identity_extractor(Arc::new(StaticIdentity("user-42")));
        let ctx = CallContext::new();

        let mut decisions = Vec::new();
        for _ in 0..3 {
            let req = request("GET", "/", Some(IPV6));
            assert!(limiter.build_keys(&req).await.global.is_empty());
            decisions.push(limiter.limit_by_request(&ctx, &req).await.unwrap());
        }

        assert_eq!(decisions[0].rate.remaining, 1);
        assert_eq!(decisions[1].rate.remaining, 0);
        assert!(!decisions[1].limit_reached());
        assert!(decisions[2].limit_reached());
        assert_eq!(decisions[2].tier, Some(Tier::Request));
        assert_eq!(decisions[2].rate.limit, 2);

        // The global counter is never touched for identified callers.
        assert_eq!(engine.calls_for(IPV6), 0);
    }

    #[tokio::test]
    async fn test_pluggable_tier_denies_before_global() {
        let (engine, handle) = counting();
        let limiter = Limiter::new(handle, 100, Duration::from_secs(1))
            .with_global_limit(60)
            .with_global_window(Duration::from_secs(1))
            .with_pluggable_tiers(vec![PluggableTierConfig::new(
                1,
                Duration::from_secs(1),
                "burst",
            )]);
        let ctx = CallContext::new();

        let first = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();
        assert!(!first.limit_reached());

        let second = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();
        assert!(second.limit_reached());
        assert_eq!(second.tier, Some(Tier::Pluggable("burst".to_string())));
        assert_eq!(second.rate.limit, 1);

        let burst_key = format!("{}|burst", IPV6);
        assert_eq!(engine.calls_for(&burst_key), 2);
        assert_eq!(engine.calls_for(IPV6), 1);
    }

    #[tokio::test]
    async fn test_pluggable_tiers_evaluated_in_order_and_short_circuit() {
        let (engine, handle) = counting();
        let limiter = Limiter::new(handle, 100, Duration::from_secs(60))
            .with_global_limit(100)
            .with_pluggable_tiers(vec![
                PluggableTierConfig::new(1, Duration::from_secs(60), "first"),
                PluggableTierConfig::new(100, Duration::from_secs(60), ""),
                PluggableTierConfig::new(100, Duration::from_secs(60), "second"),
            ]);
        let ctx = CallContext::new();

        limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();

        let request_key = format!("{}|/|GET||", IPV6);
        assert_eq!(
            engine.calls(),
            vec![
                format!("{}|first", IPV6),
                format!("{}|second", IPV6),
                IPV6.to_string(),
                request_key.clone(),
            ]
        );

        let denied = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await
            .unwrap();
        assert_eq!(denied.tier, Some(Tier::Pluggable("first".to_string())));

        // Later tiers observe no additional calls.
        assert_eq!(engine.calls_for(&format!("{}|second", IPV6)), 1);
        assert_eq!(engine.calls_for(IPV6), 1);
        assert_eq!(engine.calls_for(&request_key), 1);
        // The inert tier never consumes a counter.
        assert_eq!(engine.calls_for(&format!("{}|", IPV6)), 0);
    }

    #[tokio::test]
    async fn test_pluggable_tiers_skipped_for_identified_callers() {
        let (engine, handle) = counting();
        let limiter = Limiter::new(handle, 100, Duration::from_secs(60))
            .with_identity_extractor(Arc::new(StaticIdentity("user-42")))
            .with_pluggable_tiers(vec![PluggableTierConfig::new(
                1,
                Duration::from_secs(60),
                "burst",
            )]);

        for _ in 0..3 {
            let decision = limiter
                .limit_by_request(&CallContext::new(), &request("GET", "/", Some(IPV6)))
                .await
                .unwrap();
            assert!(!decision.limit_reached());
        }

        assert!(engine.calls().iter().all(|k| !k.ends_with("|burst")));
    }

    #[tokio::test]
    async fn test_engine_error_aborts_evaluation() {
        let engine = Arc::new(FailingEngine {
            fail_on: "burst",
            calls: Mutex::new(Vec::new()),
        });
        let limiter = Limiter::new(EngineHandle::new(engine.clone()), 5, Duration::from_secs(60))
            .with_pluggable_tiers(vec![PluggableTierConfig::new(
                5,
                Duration::from_secs(60),
                "burst",
            )]);

        let result = limiter
            .limit_by_request(&CallContext::new(), &request("GET", "/", Some(IPV6)))
            .await;

        assert!(matches!(result, Err(TollgateError::Engine(_))));
        assert_eq!(engine.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_global_error_skips_request_tier() {
        let engine = Arc::new(FailingEngine {
            fail_on: "198.51.100.1",
            calls: Mutex::new(Vec::new()),
        });
        let limiter = Limiter::new(EngineHandle::new(engine.clone()), 5, Duration::from_secs(60));

        let result = limiter
            .limit_by_request(&CallContext::new(), &request("GET", "/", Some("198.51.100.1")))
            .await;

        assert!(result.is_err());
        assert_eq!(engine.calls.lock().clone(), vec!["198.51.100.1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_request_consumes_nothing() {
        let (engine, handle) = counting();
        let limiter = scenario_limiter(handle);
        let ctx = CallContext::new();
        ctx.cancellation_token().cancel();

        let result = limiter
            .limit_by_request(&ctx, &request("GET", "/", Some(IPV6)))
            .await;

        assert!(matches!(result, Err(TollgateError::Cancelled)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_mode_never_errors() {
        let limiter = scenario_limiter(EngineHandle::disabled()).with_pluggable_tiers(vec![
            PluggableTierConfig::new(1, Duration::from_secs(1), "burst"),
        ]);

        for i in 0..25 {
            let req = request("GET", "/", Some(IPV6));
            let decision = limiter.limit_by_request(&CallContext::new(), &req).await.unwrap();
            assert!(decision.rate.is_zero(), "request {} should get a zero decision", i);
        }
        assert!(!limiter.pluggable().is_valid());
    }

    #[test]
    fn test_pluggable_tiers_bind_current_engine() {
        // Registered before an engine exists: stays inert.
        let limiter = Limiter::disabled().with_pluggable_tiers(vec![PluggableTierConfig::new(
            1,
            Duration::from_secs(1),
            "burst",
        )]);
        assert!(!limiter.pluggable().is_valid());
    }

    #[tokio::test]
    async fn test_limit_by_keys() {
        let (engine, handle) = counting();
        let limiter = Limiter::new(handle, 1, Duration::from_secs(60));
        let ctx = CallContext::new();

        assert!(!limiter.limit_by_keys(&ctx, &["a", "b"]).await.unwrap().reached);
        assert!(limiter.limit_by_keys(&ctx, &["a", "b"]).await.unwrap().reached);
        assert_eq!(engine.calls_for("a|b"), 2);
    }

    #[test]
    fn test_limit_by_request_blocking() {
        let engine = EngineHandle::new(Arc::new(MemoryEngine::new()));
        let limiter = Limiter::new(engine, 1, Duration::from_secs(60)).with_global_limit(10);
        let req = request("GET", "/", Some(IPV6));

        let decision =
            tokio_test::block_on(limiter.limit_by_request(&CallContext::new(), &req)).unwrap();
        assert_eq!(decision.tier, Some(Tier::Request));
        assert_eq!(decision.rate.remaining, 0);
    }
}
