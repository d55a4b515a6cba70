//! Rule store: the single source of truth for route rules and the registry version

use crate::pattern::route_shape;
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use endpoint_api::{RegistryVersion, Rule};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

/// Durable, transactional CRUD over rules plus the version counter.
///
/// Every mutation bumps the version atomically with the row change: a reader
/// never observes one without the other.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert new rules. Fails on an existing key, fingerprint or route.
    async fn create(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion>;

    /// Replace existing rules, locking their rows first.
    async fn update(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion>;

    /// Create missing rules and update existing ones in one atomic write.
    async fn upsert(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion>;

    /// Remove rules by key. Absent keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<RegistryVersion>;

    async fn get(&self, key: &str) -> StoreResult<Option<Rule>>;

    /// List rules, optionally restricted to one group
    async fn list(&self, group: Option<&str>) -> StoreResult<Vec<Rule>>;

    async fn current_version(&self) -> StoreResult<RegistryVersion>;

    /// Consistent read of the version together with every rule
    async fn snapshot(&self) -> StoreResult<(RegistryVersion, Vec<Rule>)>;

    /// Drop every rule
    async fn wipe(&self) -> StoreResult<RegistryVersion>;
}

/// A rule as persisted: handler and routing are kept serialized
#[derive(Clone, Debug)]
struct RuleRow {
    key: String,
    route: String,
    handler: String,
    routing: String,
    content_hash: String,
    group: Option<String>,
    updated_at: DateTime<Utc>,
    // (shape, route) for every route the rule serves
    shapes: Vec<(String, String)>,
}

impl RuleRow {
    fn from_rule(rule: &Rule, now: DateTime<Utc>) -> StoreResult<Self> {
        Ok(Self {
            key: rule.key.clone(),
            route: rule.route.clone(),
            handler: serde_json::to_string(&rule.handler)?,
            routing: serde_json::to_string(&rule.routing)?,
            content_hash: rule.content_hash.clone(),
            group: rule.group.clone(),
            updated_at: now,
            shapes: shapes_of(rule),
        })
    }

    fn to_rule(&self) -> StoreResult<Rule> {
        Ok(Rule {
            key: self.key.clone(),
            route: self.route.clone(),
            handler: serde_json::from_str(&self.handler)?,
            routing: serde_json::from_str(&self.routing)?,
            content_hash: self.content_hash.clone(),
            group: self.group.clone(),
            updated_at: Some(self.updated_at),
        })
    }
}

/// Route shapes served by a rule: its own route and every routing alias
fn shapes_of(rule: &Rule) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    std::iter::once(&rule.route)
        .chain(&rule.routing.routes)
        .filter_map(|route| {
            let shape = route_shape(route);
            seen.insert(shape.clone()).then(|| (shape, route.clone()))
        })
        .collect()
}

#[derive(Default)]
struct RuleTable {
    rows: BTreeMap<String, RuleRow>,
    // unique indexes: value -> owning key; routes are indexed by shape
    by_route: HashMap<String, String>,
    by_hash: HashMap<String, String>,
    version: RegistryVersion,
}

impl RuleTable {
    /// Check that writing `rows` keeps keys, fingerprints and routes unique.
    ///
    /// Rows being replaced by the batch release their old route and fingerprint.
    fn check_unique(&self, rows: &[RuleRow]) -> StoreResult<()> {
        let replaced: HashSet<&str> = rows
            .iter()
            .map(|r| r.key.as_str())
            .filter(|k| self.rows.contains_key(*k))
            .collect();

        let mut keys = HashSet::new();
        let mut hashes: HashMap<&str, &str> = HashMap::new();
        let mut routes: HashMap<&str, &str> = HashMap::new();

        for row in rows {
            if !keys.insert(row.key.as_str()) {
                return Err(StoreError::DuplicateKey(row.key.clone()));
            }

            let stored_hash_owner = self
                .by_hash
                .get(&row.content_hash)
                .map(String::as_str)
                .filter(|owner| *owner != row.key && !replaced.contains(owner));
            if let Some(owner) = stored_hash_owner.or_else(|| hashes.get(row.content_hash.as_str()).copied()) {
                return Err(StoreError::DuplicateFingerprint {
                    content_hash: row.content_hash.clone(),
                    owner: owner.to_string(),
                });
            }
            hashes.insert(&row.content_hash, &row.key);

            for (shape, route) in &row.shapes {
                let stored_route_owner = self
                    .by_route
                    .get(shape)
                    .map(String::as_str)
                    .filter(|owner| *owner != row.key && !replaced.contains(owner));
                if let Some(owner) = stored_route_owner.or_else(|| routes.get(shape.as_str()).copied()) {
                    return Err(StoreError::DuplicateRoute {
                        route: route.clone(),
                        owner: owner.to_string(),
                    });
                }
            }
            for (shape, _) in &row.shapes {
                routes.insert(shape, &row.key);
            }
        }

        Ok(())
    }

    fn put(&mut self, row: RuleRow) {
        self.remove(&row.key);
        for (shape, _) in &row.shapes {
            self.by_route.insert(shape.clone(), row.key.clone());
        }
        self.by_hash.insert(row.content_hash.clone(), row.key.clone());
        self.rows.insert(row.key.clone(), row);
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(row) = self.rows.remove(key) else {
            return false;
        };
        // another row of the same batch may already own the old values
        for (shape, _) in &row.shapes {
            if self.by_route.get(shape).map(String::as_str) == Some(key) {
                self.by_route.remove(shape);
            }
        }
        if self.by_hash.get(&row.content_hash).map(String::as_str) == Some(key) {
            self.by_hash.remove(&row.content_hash);
        }
        true
    }

    fn bump(&mut self) -> RegistryVersion {
        self.version = self.version.next();
        self.version
    }
}

/// Exclusive locks on a set of rule rows, released on drop
pub struct RowGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

#[derive(Default)]
struct RowLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RowLocks {
    async fn lock<'a, I>(&self, keys: I) -> RowGuard
    where
        I: IntoIterator<Item = &'a str>,
    {
        // sorted acquisition order keeps concurrent writers deadlock free
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let handles: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            keys.iter()
                .map(|key| locks.entry(key.to_string()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        RowGuard { _guards: guards }
    }
}

#[derive(Default)]
struct StoreInner {
    table: RwLock<RuleTable>,
    row_locks: RowLocks,
}

/// Rule store shared by every cache and coordinator attached to it.
///
/// Writers lock the rows they touch before applying a batch, so two writers on
/// the same key serialize while writers on disjoint keys only share the short
/// table critical section. Readers never wait on row locks.
#[derive(Clone, Default)]
pub struct InMemoryRuleStore {
    inner: Arc<StoreInner>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock rule rows by key, as `SELECT ... FOR UPDATE` would
    pub async fn lock_rows(&self, keys: &[String]) -> RowGuard {
        self.inner.row_locks.lock(keys.iter().map(String::as_str)).await
    }

    fn to_rows(rules: &[Rule]) -> StoreResult<Vec<RuleRow>> {
        let now = Utc::now();
        rules.iter().map(|rule| RuleRow::from_rule(rule, now)).collect()
    }

    async fn write_rows(&self, rows: Vec<RuleRow>, mode: WriteMode) -> StoreResult<RegistryVersion> {
        let _rows = self
            .inner
            .row_locks
            .lock(rows.iter().map(|r| r.key.as_str()))
            .await;
        let mut table = self.inner.table.write().await;

        for row in &rows {
            let exists = table.rows.contains_key(&row.key);
            match mode {
                WriteMode::Create if exists => return Err(StoreError::DuplicateKey(row.key.clone())),
                WriteMode::Update if !exists => return Err(StoreError::UnknownKey(row.key.clone())),
                _ => {}
            }
        }
        table.check_unique(&rows)?;

        let count = rows.len();
        for row in rows {
            table.put(row);
        }
        let version = table.bump();
        debug!(count, %version, ?mode, "rules written");
        Ok(version)
    }
}

#[derive(Clone, Copy, Debug)]
enum WriteMode {
    Create,
    Update,
    Upsert,
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn create(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion> {
        let rows = Self::to_rows(&rules)?;
        self.write_rows(rows, WriteMode::Create).await
    }

    async fn update(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion> {
        let rows = Self::to_rows(&rules)?;
        self.write_rows(rows, WriteMode::Update).await
    }

    async fn upsert(&self, rules: Vec<Rule>) -> StoreResult<RegistryVersion> {
        let rows = Self::to_rows(&rules)?;
        self.write_rows(rows, WriteMode::Upsert).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<RegistryVersion> {
        let _rows = self.lock_rows(keys).await;
        let mut table = self.inner.table.write().await;
        let removed = keys.iter().filter(|key| table.remove(key)).count();
        let version = table.bump();
        debug!(requested = keys.len(), removed, %version, "rules deleted");
        Ok(version)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Rule>> {
        let table = self.inner.table.read().await;
        table.rows.get(key).map(RuleRow::to_rule).transpose()
    }

    async fn list(&self, group: Option<&str>) -> StoreResult<Vec<Rule>> {
        let table = self.inner.table.read().await;
        table
            .rows
            .values()
            .filter(|row| group.is_none() || row.group.as_deref() == group)
            .map(RuleRow::to_rule)
            .collect()
    }

    async fn current_version(&self) -> StoreResult<RegistryVersion> {
        Ok(self.inner.table.read().await.version)
    }

    async fn snapshot(&self) -> StoreResult<(RegistryVersion, Vec<Rule>)> {
        let table = self.inner.table.read().await;
        let rules = table
            .rows
            .values()
            .map(RuleRow::to_rule)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok((table.version, rules))
    }

    async fn wipe(&self) -> StoreResult<RegistryVersion> {
        let mut table = self.inner.table.write().await;
        table.rows.clear();
        table.by_route.clear();
        table.by_hash.clear();
        let version = table.bump();
        debug!(%version, "rule store wiped");
        Ok(version)
    }
}
