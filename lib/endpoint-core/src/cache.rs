//! Per-process mirror of the rule store
//!
//! Readers pin an immutable [`RegistrySnapshot`]; a reload builds a fresh
//! snapshot from the store and publishes it with a single atomic swap, so an
//! in-flight request never sees a half rebuilt table.

use crate::resolver::RouteTable;
use crate::store::RuleStore;
use crate::StoreResult;
use arc_swap::ArcSwap;
use endpoint_api::{RegistryVersion, Rule};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Immutable view of the rule set at one registry version
pub struct RegistrySnapshot {
    version: RegistryVersion,
    rules: BTreeMap<String, Rule>,
    routes: OnceLock<RouteTable>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self::new(RegistryVersion::ZERO, Vec::new())
    }

    pub fn new(version: RegistryVersion, rules: Vec<Rule>) -> Self {
        Self {
            version,
            rules: rules.into_iter().map(|r| (r.key.clone(), r)).collect(),
            routes: OnceLock::new(),
        }
    }

    pub fn version(&self) -> RegistryVersion {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<&Rule> {
        self.rules.get(key)
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Route matcher for this snapshot, built on first use
    pub fn route_table(&self) -> &RouteTable {
        self.routes.get_or_init(|| RouteTable::build(self.rules.values()))
    }
}

pub struct LocalRegistryCache {
    name: String,
    store: Arc<dyn RuleStore>,
    current: ArcSwap<RegistrySnapshot>,
    dirty: AtomicBool,
    reload_lock: Mutex<()>,
}

impl LocalRegistryCache {
    /// Create an empty cache; the first freshness check loads it
    pub fn new(name: impl Into<String>, store: Arc<dyn RuleStore>) -> Self {
        Self {
            name: name.into(),
            store,
            current: ArcSwap::from_pointee(RegistrySnapshot::empty()),
            dirty: AtomicBool::new(true),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// Pin the currently published snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn cached_version(&self) -> RegistryVersion {
        self.current.load().version()
    }

    /// Force the next freshness check to reload
    pub fn invalidate(&self) {
        debug!(cache = %self.name, "registry cache invalidated");
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether a signal reporting `observed` calls for a reload.
    ///
    /// Only a newer version counts: a lagging signal never triggers churn.
    pub fn is_behind(&self, observed: RegistryVersion) -> bool {
        self.is_invalidated() || observed > self.cached_version()
    }

    /// Compare against the store and reload when it moved.
    ///
    /// The store is authoritative here, so any difference (including a
    /// version that went backwards after a store reset) triggers a reload.
    /// Returns the newly published version, if a reload happened.
    pub async fn ensure_fresh(&self) -> StoreResult<Option<RegistryVersion>> {
        let version = self.store.current_version().await?;
        if !self.is_invalidated() && version == self.cached_version() {
            return Ok(None);
        }

        let _guard = self.reload_lock.lock().await;
        // another task may have reloaded while we waited
        if !self.is_invalidated() && version == self.cached_version() {
            return Ok(None);
        }
        self.load().await.map(Some)
    }

    /// Reload if `observed` is ahead of the cached version
    pub async fn refresh_to(&self, observed: RegistryVersion) -> StoreResult<Option<RegistryVersion>> {
        if !self.is_behind(observed) {
            return Ok(None);
        }

        let _guard = self.reload_lock.lock().await;
        if !self.is_behind(observed) {
            return Ok(None);
        }
        self.load().await.map(Some)
    }

    /// Unconditional full reload
    pub async fn reload(&self) -> StoreResult<RegistryVersion> {
        let _guard = self.reload_lock.lock().await;
        self.load().await
    }

    async fn load(&self) -> StoreResult<RegistryVersion> {
        let (version, rules) = self.store.snapshot().await?;
        let snapshot = RegistrySnapshot::new(version, rules);
        let count = snapshot.len();
        self.dirty.store(false, Ordering::Release);
        self.current.store(Arc::new(snapshot));
        info!(cache = %self.name, %version, rules = count, "registry cache reloaded");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRuleStore;
    use endpoint_api::{content_hash, HandlerDescriptor, RoutingMetadata};

    fn rule(key: &str, route: &str) -> Rule {
        Rule::new(
            key,
            route,
            HandlerDescriptor::new("tests.Ctrl", "run"),
            RoutingMetadata::default(),
            content_hash([route]),
        )
    }

    #[tokio::test]
    async fn test_first_check_loads() {
        let store = Arc::new(InMemoryRuleStore::new());
        store.create(vec![rule("a", "/a")]).await.unwrap();

        let cache = LocalRegistryCache::new("test", store.clone());
        assert!(cache.snapshot().is_empty());
        let reloaded = cache.ensure_fresh().await.unwrap();
        assert_eq!(reloaded, Some(store.current_version().await.unwrap()));
        assert!(cache.snapshot().get("a").is_some());
        assert_eq!(cache.ensure_fresh().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_converges_after_mutation() {
        let store = Arc::new(InMemoryRuleStore::new());
        let cache = LocalRegistryCache::new("test", store.clone());
        cache.ensure_fresh().await.unwrap();

        store.create(vec![rule("a", "/a")]).await.unwrap();
        // stale until checked
        assert!(cache.snapshot().get("a").is_none());
        cache.ensure_fresh().await.unwrap();
        assert!(cache.snapshot().get("a").is_some());

        store.delete(&["a".to_string()]).await.unwrap();
        cache.ensure_fresh().await.unwrap();
        assert!(cache.snapshot().get("a").is_none());
        assert_eq!(cache.cached_version(), store.current_version().await.unwrap());
    }

    #[tokio::test]
    async fn test_pinned_snapshot_survives_reload() {
        let store = Arc::new(InMemoryRuleStore::new());
        store.create(vec![rule("a", "/a")]).await.unwrap();
        let cache = LocalRegistryCache::new("test", store.clone());
        cache.ensure_fresh().await.unwrap();

        let pinned = cache.snapshot();
        store.delete(&["a".to_string()]).await.unwrap();
        cache.ensure_fresh().await.unwrap();

        assert!(pinned.get("a").is_some());
        assert!(cache.snapshot().get("a").is_none());
        assert!(pinned.version() < cache.cached_version());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let store = Arc::new(InMemoryRuleStore::new());
        let cache = LocalRegistryCache::new("test", store.clone());
        cache.ensure_fresh().await.unwrap();
        assert!(!cache.is_invalidated());

        cache.invalidate();
        assert!(cache.ensure_fresh().await.unwrap().is_some());
        assert!(!cache.is_invalidated());
    }

    #[tokio::test]
    async fn test_refresh_to_ignores_lagging_signal() {
        let store = Arc::new(InMemoryRuleStore::new());
        store.create(vec![rule("a", "/a")]).await.unwrap();
        let cache = LocalRegistryCache::new("test", store.clone());
        cache.ensure_fresh().await.unwrap();

        assert_eq!(cache.refresh_to(RegistryVersion::ZERO).await.unwrap(), None);
        store.create(vec![rule("b", "/b")]).await.unwrap();
        let observed = store.current_version().await.unwrap();
        assert_eq!(cache.refresh_to(observed).await.unwrap(), Some(observed));
    }

    #[tokio::test]
    async fn test_reload_after_store_reset() {
        let old_store = InMemoryRuleStore::new();
        old_store.create(vec![rule("a", "/a")]).await.unwrap();
        old_store.create(vec![rule("b", "/b")]).await.unwrap();
        let (version, rules) = old_store.snapshot().await.unwrap();

        // a cache that saw a newer version than the (reset) store now reports
        let store = Arc::new(InMemoryRuleStore::new());
        let cache = LocalRegistryCache::new("test", store.clone());
        cache.current.store(Arc::new(RegistrySnapshot::new(version, rules)));
        cache.dirty.store(false, Ordering::Release);

        assert_eq!(cache.ensure_fresh().await.unwrap(), Some(RegistryVersion::ZERO));
        assert!(cache.snapshot().is_empty());
    }
}
