//! Per-client rate limiting stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BoxHandler, Handler, Request, Response, Stage};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    default_cleanup_interval, default_idle_threshold, token_bucket_factory, ClientRegistry,
    Janitor, LimiterFactory, MAX_CLEANUP_INTERVAL,
};

/// Derives the client identity used to bucket a request.
pub type IdentityFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Default identity: the directly connected peer's socket address.
///
/// Requests without a known peer all share the empty identity.
pub fn peer_address_identity(request: &Request) -> String {
    request
        .peer_addr
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

/// Builder for [`RateLimiterStage`].
pub struct RateLimiterBuilder {
    qps: f64,
    identity_fn: Option<IdentityFn>,
    limiter_factory: Option<LimiterFactory>,
    cleanup_interval: Option<Duration>,
    idle_threshold: Option<Duration>,
}

impl RateLimiterBuilder {
    /// Start a builder for `qps` requests per second per client.
    pub fn new(qps: f64) -> Self {
        Self {
            qps,
            identity_fn: None,
            limiter_factory: None,
            cleanup_interval: None,
            idle_threshold: None,
        }
    }

    /// Use a custom client identity function.
    pub fn identity_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        let identity_fn: IdentityFn = Arc::new(f);
        self.identity_fn = Some(identity_fn);
        self
    }

    /// Use a custom limiter factory instead of the qps-derived token bucket.
    pub fn limiter_factory(mut self, factory: LimiterFactory) -> Self {
        self.limiter_factory = Some(factory);
        self
    }

    /// Override how often idle clients are swept.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Override how long a client may stay idle before eviction.
    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = Some(threshold);
        self
    }

    /// Build the stage and its shutdown handle.
    ///
    /// Fails when `qps` is not a finite positive number, a duration is zero,
    /// or the cleanup interval is longer than [`MAX_CLEANUP_INTERVAL`].
    pub fn build(self) -> Result<(RateLimiterStage, ShutdownHandle)> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "qps must be a positive number, got {}",
                self.qps
            )));
        }

        let factory = match self.limiter_factory {
            Some(factory) => factory,
            None => token_bucket_factory(self.qps)?,
        };

        let cleanup_interval = self
            .cleanup_interval
            .unwrap_or_else(|| default_cleanup_interval(self.qps));
        let idle_threshold = self
            .idle_threshold
            .unwrap_or_else(|| default_idle_threshold(cleanup_interval));

        if cleanup_interval.is_zero() {
            return Err(TurnstileError::Config(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        if cleanup_interval > MAX_CLEANUP_INTERVAL {
            return Err(TurnstileError::Config(format!(
                "cleanup interval must be at most {}s, got {:?}",
                MAX_CLEANUP_INTERVAL.as_secs(),
                cleanup_interval
            )));
        }
        if idle_threshold.is_zero() {
            return Err(TurnstileError::Config(
                "idle threshold must be greater than zero".to_string(),
            ));
        }

        let registry = Arc::new(ClientRegistry::new(factory));
        let janitor = Arc::new(Janitor::new(registry.clone(), cleanup_interval, idle_threshold));

        debug!(
            qps = self.qps,
            cleanup_interval_ms = cleanup_interval.as_millis() as u64,
            idle_threshold_ms = idle_threshold.as_millis() as u64,
            "Rate limiter stage created"
        );

        let stage = RateLimiterStage {
            inner: Arc::new(RateLimiterInner {
                qps: self.qps,
                registry,
                identity_fn: self
                    .identity_fn
                    .unwrap_or_else(|| Arc::new(peer_address_identity) as IdentityFn),
                janitor: janitor.clone(),
            }),
        };

        Ok((stage, ShutdownHandle { janitor }))
    }
}

/// Admission control stage that gives every client its own token bucket.
///
/// The idle-client janitor starts with the first request that passes
/// through any handler wrapped by this stage.
#[derive(Clone)]
pub struct RateLimiterStage {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    qps: f64,
    registry: Arc<ClientRegistry>,
    identity_fn: IdentityFn,
    janitor: Arc<Janitor>,
}

impl RateLimiterStage {
    /// Start building a stage for `qps` requests per second per client.
    pub fn builder(qps: f64) -> RateLimiterBuilder {
        RateLimiterBuilder::new(qps)
    }

    /// Build a stage with all defaults derived from `qps`.
    pub fn new(qps: f64) -> Result<(Self, ShutdownHandle)> {
        RateLimiterBuilder::new(qps).build()
    }

    /// Admission check for one unit of work from `identity`.
    pub fn admit(&self, identity: &str) -> bool {
        self.inner.janitor.start();
        self.inner.registry.get_or_create(identity).allow()
    }

    /// Get the configured rate.
    pub fn qps(&self) -> f64 {
        self.inner.qps
    }

    /// Get the client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.inner.registry
    }

    /// Get the idle-client janitor.
    pub fn janitor(&self) -> &Arc<Janitor> {
        &self.inner.janitor
    }
}

impl Stage for RateLimiterStage {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(RateLimited {
            stage: self.clone(),
            next,
        })
    }
}

impl std::fmt::Debug for RateLimiterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterStage")
            .field("qps", &self.inner.qps)
            .field("registry", &self.inner.registry)
            .field("janitor", &self.inner.janitor)
            .finish()
    }
}

struct RateLimited {
    stage: RateLimiterStage,
    next: BoxHandler,
}

#[async_trait]
impl Handler for RateLimited {
    async fn call(&self, request: Request) -> Result<Response> {
        debug!(request_id = ?request.id, "Start rate limiter stage");

        let identity = (self.stage.inner.identity_fn)(&request);
        if !self.stage.admit(&identity) {
            warn!(client = %identity, "Too many requests");
            return Err(TurnstileError::RateExceeded);
        }

        self.next.call(request).await
    }
}

/// Teardown handle for a [`RateLimiterStage`].
#[derive(Debug)]
pub struct ShutdownHandle {
    janitor: Arc<Janitor>,
}

impl ShutdownHandle {
    /// Stop the janitor and wait until it has exited.
    pub async fn shutdown(self) {
        self.janitor.shutdown().await;
    }
}
