//! Cross-process invalidation: cheap version signal checks ahead of dispatch

use crate::cache::LocalRegistryCache;
use crate::store::RuleStore;
use crate::SignalError;
use async_trait::async_trait;
use endpoint_api::RegistryVersion;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Source of the process-wide "rule set changed" counter.
///
/// `Ok(None)` means the signal has never been written; it counts as version zero.
#[async_trait]
pub trait VersionSignal: Send + Sync {
    async fn read(&self) -> Result<Option<RegistryVersion>, SignalError>;
}

/// Signal backed by the store's own version counter
pub struct StoreVersionSignal {
    store: Arc<dyn RuleStore>,
}

impl StoreVersionSignal {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VersionSignal for StoreVersionSignal {
    async fn read(&self) -> Result<Option<RegistryVersion>, SignalError> {
        Ok(Some(self.store.current_version().await?))
    }
}

/// Invalidation monitor configuration
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Minimum time between two signal reads on the request path
    pub min_check_interval: Duration,
    /// Consecutive signal failures tolerated with a forced reload each time
    pub max_stale_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_check_interval: Duration::ZERO,
            max_stale_failures: 3,
        }
    }
}

/// Outcome of a freshness check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Signal read, cache already current
    Current,
    /// Signal reported a newer version, cache reloaded
    Reloaded(RegistryVersion),
    /// Signal unreachable, cache reloaded on the assumption it was stale
    StaleReload(RegistryVersion),
    /// Check throttled by `min_check_interval`
    Skipped,
    /// Nothing could be refreshed; the last good snapshot keeps serving
    Degraded,
}

impl Freshness {
    pub fn reloaded(&self) -> bool {
        matches!(self, Freshness::Reloaded(_) | Freshness::StaleReload(_))
    }

    pub fn signal_failed(&self) -> bool {
        matches!(self, Freshness::StaleReload(_) | Freshness::Degraded)
    }
}

/// Watches a [`VersionSignal`] on behalf of one [`LocalRegistryCache`]
pub struct InvalidationMonitor {
    cache: Arc<LocalRegistryCache>,
    signal: Arc<dyn VersionSignal>,
    config: MonitorConfig,
    last_known: AtomicU64,
    failures: AtomicU32,
    last_check: Mutex<Option<Instant>>,
}

impl InvalidationMonitor {
    pub fn new(cache: Arc<LocalRegistryCache>, signal: Arc<dyn VersionSignal>, config: MonitorConfig) -> Self {
        Self {
            cache,
            signal,
            config,
            last_known: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            last_check: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<LocalRegistryCache> {
        &self.cache
    }

    /// Highest version this process has seen from the signal
    pub fn last_known_version(&self) -> RegistryVersion {
        RegistryVersion::new(self.last_known.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Request-path check, throttled by `min_check_interval`.
    ///
    /// An invalidated cache is never throttled.
    pub async fn check(&self) -> Freshness {
        if self.throttled() && !self.cache.is_invalidated() {
            return Freshness::Skipped;
        }
        self.force_check().await
    }

    /// Read the signal and refresh the cache if needed. Never fails: errors
    /// degrade to serving the last good snapshot.
    pub async fn force_check(&self) -> Freshness {
        if let Ok(mut last) = self.last_check.lock() {
            *last = Some(Instant::now());
        }

        match self.signal.read().await {
            Ok(observed) => {
                self.failures.store(0, Ordering::Release);
                let observed = observed.unwrap_or(RegistryVersion::ZERO);
                let previous = self.last_known.swap(observed.get(), Ordering::AcqRel);
                if observed.get() < previous {
                    // signal restarted; a lower counter tells nothing about our snapshot
                    info!(cache = %self.cache.name(), previous, %observed, "Version signal went backwards");
                    self.cache.invalidate();
                }

                match self.cache.refresh_to(observed).await {
                    Ok(Some(version)) => Freshness::Reloaded(version),
                    Ok(None) => Freshness::Current,
                    Err(e) => {
                        warn!(cache = %self.cache.name(), error = %e, "Registry reload failed, serving last snapshot");
                        Freshness::Degraded
                    }
                }
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures > self.config.max_stale_failures {
                    warn!(
                        cache = %self.cache.name(),
                        failures,
                        error = %e,
                        "Version signal still unreachable, serving last snapshot"
                    );
                    return Freshness::Degraded;
                }

                warn!(cache = %self.cache.name(), failures, error = %e, "Version signal unreachable, assuming stale");
                match self.cache.reload().await {
                    Ok(version) => Freshness::StaleReload(version),
                    Err(e) => {
                        warn!(cache = %self.cache.name(), error = %e, "Registry reload failed, serving last snapshot");
                        Freshness::Degraded
                    }
                }
            }
        }
    }

    fn throttled(&self) -> bool {
        if self.config.min_check_interval.is_zero() {
            return false;
        }
        match self.last_check.lock() {
            Ok(last) => last.is_some_and(|at| at.elapsed() < self.config.min_check_interval),
            Err(_) => false,
        }
    }
}

/// Poll the signal in the background so idle processes converge too
pub fn spawn_poller<F>(monitor: Arc<InvalidationMonitor>, every: Duration, on_check: F) -> JoinHandle<()>
where
    F: Fn(Freshness) + Send + Sync + 'static,
{
    debug!(cache = %monitor.cache.name(), "Version poller started with interval: {:?}", every);
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            on_check(monitor.force_check().await);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRuleStore;
    use endpoint_api::{content_hash, HandlerDescriptor, Rule, RoutingMetadata};
    use std::sync::atomic::AtomicBool;

    /// Signal whose value and reachability the test controls
    #[derive(Default)]
    struct ManualSignal {
        value: AtomicU64,
        set: AtomicBool,
        down: AtomicBool,
    }

    impl ManualSignal {
        fn publish(&self, version: RegistryVersion) {
            self.value.store(version.get(), Ordering::SeqCst);
            self.set.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VersionSignal for ManualSignal {
        async fn read(&self) -> Result<Option<RegistryVersion>, SignalError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(SignalError::Unreachable("connection refused".to_string()));
            }
            if !self.set.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(RegistryVersion::new(self.value.load(Ordering::SeqCst))))
        }
    }

    fn rule(key: &str, route: &str) -> Rule {
        Rule::new(
            key,
            route,
            HandlerDescriptor::new("tests.Ctrl", "run"),
            RoutingMetadata::default(),
            content_hash([route]),
        )
    }

    async fn setup(config: MonitorConfig) -> (Arc<InMemoryRuleStore>, Arc<ManualSignal>, InvalidationMonitor) {
        let store = Arc::new(InMemoryRuleStore::new());
        let signal = Arc::new(ManualSignal::default());
        let cache = Arc::new(LocalRegistryCache::new("test", store.clone()));
        let monitor = InvalidationMonitor::new(cache, signal.clone(), config);
        assert!(monitor.force_check().await.reloaded());
        (store, signal, monitor)
    }

    #[tokio::test]
    async fn test_store_signal_follows_store() {
        let store = Arc::new(InMemoryRuleStore::new());
        let signal = StoreVersionSignal::new(store.clone());
        let version = store.create(vec![rule("a", "/a")]).await.unwrap();
        assert_eq!(signal.read().await.unwrap(), Some(version));
    }

    #[tokio::test]
    async fn test_reload_on_newer_signal() {
        let (store, signal, monitor) = setup(MonitorConfig::default()).await;
        assert_eq!(monitor.check().await, Freshness::Current);

        let version = store.create(vec![rule("a", "/a")]).await.unwrap();
        // signal not propagated yet
        assert_eq!(monitor.check().await, Freshness::Current);
        assert!(monitor.cache().snapshot().get("a").is_none());

        signal.publish(version);
        assert_eq!(monitor.check().await, Freshness::Reloaded(version));
        assert!(monitor.cache().snapshot().get("a").is_some());
        assert_eq!(monitor.last_known_version(), version);
    }

    #[tokio::test]
    async fn test_signal_restart_triggers_reload() {
        let (store, signal, monitor) = setup(MonitorConfig::default()).await;
        store.create(vec![rule("a", "/a")]).await.unwrap();
        let version = store.create(vec![rule("b", "/b")]).await.unwrap();
        signal.publish(version);
        assert!(monitor.check().await.reloaded());

        store.delete(&["a".to_string()]).await.unwrap();
        signal.publish(RegistryVersion::new(1));
        assert!(monitor.check().await.reloaded());
        assert!(monitor.cache().snapshot().get("a").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_signal_assumes_stale_then_degrades() {
        let config = MonitorConfig {
            max_stale_failures: 2,
            ..Default::default()
        };
        let (store, signal, monitor) = setup(config).await;
        signal.down.store(true, Ordering::SeqCst);

        let version = store.create(vec![rule("a", "/a")]).await.unwrap();
        assert_eq!(monitor.check().await, Freshness::StaleReload(version));
        assert!(monitor.cache().snapshot().get("a").is_some());
        assert!(monitor.check().await.reloaded());

        store.create(vec![rule("b", "/b")]).await.unwrap();
        assert_eq!(monitor.check().await, Freshness::Degraded);
        assert!(monitor.cache().snapshot().get("a").is_some());
        assert!(monitor.cache().snapshot().get("b").is_none());
        assert_eq!(monitor.consecutive_failures(), 3);

        // recovery resets the failure count
        signal.down.store(false, Ordering::SeqCst);
        signal.publish(store.current_version().await.unwrap());
        assert!(monitor.check().await.reloaded());
        assert_eq!(monitor.consecutive_failures(), 0);
        assert!(monitor.cache().snapshot().get("b").is_some());
    }

    #[tokio::test]
    async fn test_check_is_throttled() {
        let config = MonitorConfig {
            min_check_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (store, signal, monitor) = setup(config).await;

        signal.publish(store.create(vec![rule("a", "/a")]).await.unwrap());
        assert_eq!(monitor.check().await, Freshness::Skipped);
        assert!(monitor.force_check().await.reloaded());

        monitor.cache().invalidate();
        assert!(monitor.check().await.reloaded());
    }

    #[tokio::test]
    async fn test_poller_converges() {
        let store = Arc::new(InMemoryRuleStore::new());
        let cache = Arc::new(LocalRegistryCache::new("poller", store.clone()));
        let signal = Arc::new(StoreVersionSignal::new(store.clone()));
        let monitor = Arc::new(InvalidationMonitor::new(cache.clone(), signal, MonitorConfig::default()));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_poller(monitor, Duration::from_millis(10), move |freshness| {
            let _ = tx.send(freshness);
        });

        store.create(vec![rule("a", "/a")]).await.unwrap();
        while cache.snapshot().get("a").is_none() {
            rx.recv().await.unwrap();
        }
        handle.abort();
    }

    #[tokio::test]
    async fn test_poller_callback_shares_state() {
        let store = Arc::new(InMemoryRuleStore::new());
        let cache = Arc::new(LocalRegistryCache::new("shared", store.clone()));
        let signal = Arc::new(StoreVersionSignal::new(store.clone()));
        let monitor = Arc::new(InvalidationMonitor::new(cache.clone(), signal, MonitorConfig::default()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let handle = spawn_poller(monitor, Duration::from_millis(5), move |freshness| {
            if let Ok(mut seen) = recorder.lock() {
                seen.push(freshness);
            }
        });

        store.create(vec![rule("b", "/b")]).await.unwrap();
        while !seen.lock().unwrap().iter().any(Freshness::reloaded) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert!(cache.snapshot().get("b").is_some());
    }
}
