//! Background eviction of idle clients.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::ClientRegistry;

/// Reference window the default cleanup interval is derived from.
const CLEANUP_WINDOW: Duration = Duration::from_secs(60);
/// Lower bound for the default cleanup interval.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound for any cleanup interval.
pub const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Idle threshold as a multiple of the cleanup interval.
const IDLE_INTERVALS: u32 = 3;

/// Default sweep interval for a rate: `max(60s / qps, 1s)`, capped at
/// [`MAX_CLEANUP_INTERVAL`].
///
/// Non-positive or non-finite rates fall back to the 60s window.
pub fn default_cleanup_interval(qps: f64) -> Duration {
    if !qps.is_finite() || qps <= 0.0 {
        return CLEANUP_WINDOW;
    }
    Duration::try_from_secs_f64(CLEANUP_WINDOW.as_secs_f64() / qps)
        .unwrap_or(MAX_CLEANUP_INTERVAL)
        .clamp(MIN_CLEANUP_INTERVAL, MAX_CLEANUP_INTERVAL)
}

/// Default idle threshold: three cleanup intervals.
pub fn default_idle_threshold(cleanup_interval: Duration) -> Duration {
    cleanup_interval.saturating_mul(IDLE_INTERVALS)
}

/// Lifecycle of a [`Janitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JanitorState {
    /// Not started yet
    Idle,
    /// Sweeping on every interval tick
    Running,
    /// Exited its loop; terminal
    Stopped,
}

impl JanitorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JanitorState::Idle,
            1 => JanitorState::Running,
            _ => JanitorState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            JanitorState::Idle => 0,
            JanitorState::Running => 1,
            JanitorState::Stopped => 2,
        }
    }
}

/// State shared between the janitor handle and its background task.
struct JanitorStatus {
    state: AtomicU8,
    sweeps: AtomicU64,
}

impl JanitorStatus {
    fn set(&self, state: JanitorState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn get(&self) -> JanitorState {
        JanitorState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Periodically evicts clients that have been idle past a threshold.
///
/// The background task is spawned at most once. Shutdown cancels it and
/// waits for the loop to exit. Intervals above [`MAX_CLEANUP_INTERVAL`]
/// are clamped to it.
pub struct Janitor {
    registry: Arc<ClientRegistry>,
    interval: Duration,
    idle_threshold: Duration,
    shutdown_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    status: Arc<JanitorStatus>,
}

impl Janitor {
    /// Create an idle janitor for `registry`.
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration, idle_threshold: Duration) -> Self {
        if interval > MAX_CLEANUP_INTERVAL {
            warn!(
                interval_ms = interval.as_millis() as u64,
                "Janitor interval clamped to one day"
            );
        }

        Self {
            registry,
            interval: interval.min(MAX_CLEANUP_INTERVAL),
            idle_threshold,
            shutdown_token: CancellationToken::new(),
            task: Mutex::new(None),
            status: Arc::new(JanitorStatus {
                state: AtomicU8::new(JanitorState::Idle.as_u8()),
                sweeps: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the sweep loop. Only the first successful call has any effect.
    ///
    /// Outside a tokio runtime this does nothing, and a later call from
    /// inside one still starts the loop. Calling after
    /// [`shutdown`](Self::shutdown) does nothing.
    pub fn start(&self) {
        if self.status.get() != JanitorState::Idle {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "No tokio runtime, janitor not started");
                return;
            }
        };

        // Held while spawning so shutdown either sees the handle or
        // prevents the spawn.
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown_token.is_cancelled() {
            return;
        }

        let sweeper = Sweeper {
            registry: self.registry.clone(),
            interval: self.interval,
            idle_threshold: self.idle_threshold,
            shutdown_token: self.shutdown_token.clone(),
            status: self.status.clone(),
        };

        self.status.set(JanitorState::Running);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            idle_threshold_ms = self.idle_threshold.as_millis() as u64,
            "Rate limiter janitor started"
        );
        *task = Some(runtime.spawn(sweeper.run()));
    }

    /// Evict idle clients once, right now. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        sweep_registry(&self.registry, self.idle_threshold, &self.status)
    }

    /// Stop the sweep loop and wait for it to exit.
    ///
    /// After this returns no further sweeps happen.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Rate limiter janitor task failed");
            }
        }

        self.status.set(JanitorState::Stopped);
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> JanitorState {
        self.status.get()
    }

    /// Get the number of sweeps performed so far.
    pub fn sweep_count(&self) -> u64 {
        self.status.sweeps.load(Ordering::SeqCst)
    }

    /// Get the sweep interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Get the idle threshold.
    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

impl std::fmt::Debug for Janitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Janitor")
            .field("interval", &self.interval)
            .field("idle_threshold", &self.idle_threshold)
            .field("state", &self.state())
            .finish()
    }
}

/// The part of the janitor owned by the background task.
struct Sweeper {
    registry: Arc<ClientRegistry>,
    interval: Duration,
    idle_threshold: Duration,
    shutdown_token: CancellationToken,
    status: Arc<JanitorStatus>,
}

impl Sweeper {
    async fn run(self) {
        let now = Instant::now();
        let first_tick = now.checked_add(self.interval).unwrap_or(now);
        let mut interval = tokio::time::interval_at(first_tick, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    info!("Rate limiter janitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    sweep_registry(&self.registry, self.idle_threshold, &self.status);
                }
            }
        }

        self.status.set(JanitorState::Stopped);
    }
}

fn sweep_registry(registry: &ClientRegistry, idle_threshold: Duration, status: &JanitorStatus) -> usize {
    let evicted = registry.evict_idle_since(idle_threshold, Instant::now());
    status.sweeps.fetch_add(1, Ordering::SeqCst);

    debug!(
        evicted = evicted,
        remaining = registry.len(),
        "Swept idle clients"
    );
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::registry::token_bucket_factory;

    fn test_registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(token_bucket_factory(10.0).unwrap()))
    }

    #[test]
    fn test_default_cleanup_interval() {
        assert_eq!(default_cleanup_interval(2.0), Duration::from_secs(30));
        assert_eq!(default_cleanup_interval(60.0), Duration::from_secs(1));
        assert_eq!(default_cleanup_interval(1000.0), Duration::from_secs(1));
        assert_eq!(default_cleanup_interval(0.5), Duration::from_secs(120));
        assert_eq!(default_cleanup_interval(0.0), Duration::from_secs(60));
    }

    #[test]
    fn test_tiny_qps_interval_is_capped() {
        assert_eq!(default_cleanup_interval(1e-19), MAX_CLEANUP_INTERVAL);
        assert_eq!(default_cleanup_interval(f64::MIN_POSITIVE), MAX_CLEANUP_INTERVAL);
        assert_eq!(default_cleanup_interval(1e-4), MAX_CLEANUP_INTERVAL);
    }

    #[test]
    fn test_huge_interval_is_clamped() {
        let janitor = Janitor::new(test_registry(), Duration::MAX, Duration::MAX);
        assert_eq!(janitor.interval(), MAX_CLEANUP_INTERVAL);
        assert_eq!(janitor.idle_threshold(), Duration::MAX);
    }

    #[test]
    fn test_start_outside_runtime_can_start_later() {
        let janitor = Janitor::new(test_registry(), Duration::from_secs(1), Duration::from_secs(3));

        janitor.start();
        assert_eq!(janitor.state(), JanitorState::Idle);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            janitor.start();
            assert_eq!(janitor.state(), JanitorState::Running);
            janitor.shutdown().await;
        });
        assert_eq!(janitor.state(), JanitorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamped_janitor_keeps_running() {
        let janitor = Janitor::new(test_registry(), Duration::MAX, Duration::from_secs(3));
        janitor.start();

        tokio::time::sleep(Duration::from_secs(2 * 24 * 60 * 60 + 1)).await;
        assert_eq!(janitor.state(), JanitorState::Running);
        assert_eq!(janitor.sweep_count(), 2);

        janitor.shutdown().await;
    }

    #[test]
    fn test_default_idle_threshold() {
        assert_eq!(default_idle_threshold(Duration::from_secs(1)), Duration::from_secs(3));
        assert_eq!(default_idle_threshold(Duration::from_secs(30)), Duration::from_secs(90));
    }

    #[test]
    fn test_start_without_runtime_stays_idle() {
        let janitor = Janitor::new(test_registry(), Duration::from_secs(1), Duration::from_secs(3));
        janitor.start();
        assert_eq!(janitor.state(), JanitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_evict_idle_clients() {
        let registry = test_registry();
        let janitor = Janitor::new(registry.clone(), Duration::from_secs(1), Duration::from_secs(3));

        registry.get_or_create("idle");
        janitor.start();
        assert_eq!(janitor.state(), JanitorState::Running);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        registry.get_or_create("active");

        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert!(!registry.contains("idle"));
        assert!(registry.contains("active"));
        assert!(janitor.sweep_count() >= 4);

        janitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let janitor = Janitor::new(test_registry(), Duration::from_secs(1), Duration::from_secs(3));

        janitor.start();
        janitor.start();
        janitor.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        // One loop ticking at 1s, 2s and 3s.
        assert_eq!(janitor.sweep_count(), 3);

        janitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let registry = test_registry();
        let janitor = Janitor::new(registry.clone(), Duration::from_secs(1), Duration::from_secs(3));
        janitor.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        janitor.shutdown().await;
        assert_eq!(janitor.state(), JanitorState::Stopped);

        let sweeps = janitor.sweep_count();
        registry.get_or_create("late");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(janitor.sweep_count(), sweeps);
        assert!(registry.contains("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_shutdown_does_nothing() {
        let janitor = Janitor::new(test_registry(), Duration::from_secs(1), Duration::from_secs(3));

        janitor.shutdown().await;
        janitor.start();
        assert_eq!(janitor.state(), JanitorState::Stopped);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(janitor.sweep_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep() {
        let registry = test_registry();
        let janitor = Janitor::new(registry.clone(), Duration::from_secs(60), Duration::from_secs(3));

        registry.get_or_create("a");
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(janitor.sweep(), 1);
        assert!(registry.is_empty());
        assert_eq!(janitor.sweep_count(), 1);
    }
}
