//! Per-client limiter registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::bucket::{BucketParams, Limiter};
use crate::error::Result;

/// Produces a fresh limiter for every newly observed client.
pub type LimiterFactory = Arc<dyn Fn() -> Box<dyn Limiter> + Send + Sync>;

/// Build the default factory for a rate: `rate = qps`, `burst = max(qps / 2, 1)`.
///
/// Fails when `qps` is not a finite positive number.
pub fn token_bucket_factory(qps: f64) -> Result<LimiterFactory> {
    let params = BucketParams::from_qps(qps)?;
    Ok(Arc::new(move || -> Box<dyn Limiter> { Box::new(params.build()) }))
}

/// A client's limiter together with the last time the client was seen.
pub struct ClientRecord {
    limiter: Box<dyn Limiter>,
    last_seen: Mutex<Instant>,
}

impl ClientRecord {
    fn new(limiter: Box<dyn Limiter>, now: Instant) -> Self {
        Self {
            limiter,
            last_seen: Mutex::new(now),
        }
    }

    /// Ask the client's limiter for one permit.
    pub fn allow(&self) -> bool {
        self.limiter.allow()
    }

    /// The most recent instant this client was observed.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Record activity at `now`. Never moves `last_seen` backwards.
    pub fn touch(&self, now: Instant) {
        let mut last_seen = self.last_seen.lock();
        if now > *last_seen {
            *last_seen = now;
        }
    }

    fn idle_longer_than(&self, threshold: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen()) > threshold
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("last_seen", &self.last_seen())
            .finish_non_exhaustive()
    }
}

/// Concurrency-safe mapping from client identity to [`ClientRecord`].
///
/// Lookups of known clients take the shared lock. Inserts and sweeps
/// take the exclusive lock.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientRecord>>>,
    factory: LimiterFactory,
}

impl ClientRegistry {
    /// Create an empty registry using `factory` for new clients.
    pub fn new(factory: LimiterFactory) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Get the record for `identity`, creating it if needed.
    pub fn get_or_create(&self, identity: &str) -> Arc<ClientRecord> {
        self.get_or_create_at(identity, Instant::now())
    }

    /// Same as [`get_or_create`](Self::get_or_create) with an injected instant.
    ///
    /// Concurrent calls for one identity always resolve to the same record.
    pub fn get_or_create_at(&self, identity: &str, now: Instant) -> Arc<ClientRecord> {
        if let Some(record) = self.clients.read().get(identity) {
            record.touch(now);
            return record.clone();
        }

        // Built outside the write lock. If another caller inserts first this
        // candidate is dropped and the existing record wins.
        let candidate = ClientRecord::new((self.factory)(), now);

        let mut clients = self.clients.write();
        let record = clients
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(client = %identity, "Creating new client limiter");
                Arc::new(candidate)
            })
            .clone();
        drop(clients);

        record.touch(now);
        record
    }

    /// Remove every client idle for longer than `threshold` as of `now`.
    ///
    /// Returns the number of evicted clients.
    pub fn evict_idle_since(&self, threshold: Duration, now: Instant) -> usize {
        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|_, record| !record.idle_longer_than(threshold, now));
        before - clients.len()
    }

    /// Whether a record exists for `identity`.
    pub fn contains(&self, identity: &str) -> bool {
        self.clients.read().contains_key(identity)
    }

    /// Get the number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish()
    }
}
