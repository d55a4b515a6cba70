//! Bridges owning-entity lifecycles to rule store mutations
//!
//! Writes touching routing fields or `active` put an entity out of sync.
//! Flipping it back in sync schedules a registry push that runs only after
//! the enclosing [`Transaction`] commits. Deleting an entity drops its rules
//! right away.

use crate::consumers::RouteConsumers;
use crate::entity::{EntityPatch, RoutableEntity};
use crate::repository::EntityRepository;
use crate::store::RuleStore;
use crate::tx::Transaction;
use crate::{CoreError, Result, ValidationError};
use endpoint_api::RegistryVersion;
use std::sync::Arc;
use tracing::{debug, error, info};

/// What a registry push did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Rule keys created or updated
    pub registered: Vec<String>,
    /// Rule keys removed
    pub unregistered: Vec<String>,
    /// Store version after the last mutation, if any
    pub version: Option<RegistryVersion>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.unregistered.is_empty()
    }
}

pub struct SyncCoordinator<E: RoutableEntity> {
    repo: Arc<dyn EntityRepository<E>>,
    store: Arc<dyn RuleStore>,
    consumers: Arc<RouteConsumers>,
    route_prefix: Option<String>,
}

impl<E: RoutableEntity> Clone for SyncCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            store: self.store.clone(),
            consumers: self.consumers.clone(),
            route_prefix: self.route_prefix.clone(),
        }
    }
}

impl<E: RoutableEntity> SyncCoordinator<E> {
    pub fn new(
        repo: Arc<dyn EntityRepository<E>>,
        store: Arc<dyn RuleStore>,
        consumers: Arc<RouteConsumers>,
    ) -> Self {
        Self {
            repo,
            store,
            consumers,
            route_prefix: None,
        }
    }

    /// Prefix forced onto every route of this kind
    pub fn with_route_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.route_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn repository(&self) -> &Arc<dyn EntityRepository<E>> {
        &self.repo
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// Stage a new entity. It starts out of sync; nothing is registered.
    pub async fn create(&self, tx: &mut Transaction, mut entity: E) -> Result<E> {
        self.prepare(&mut entity, None).await?;
        entity.set_id(self.repo.reserve_id().await);
        entity.set_in_sync(false);

        debug!(tx = %tx.id(), kind = E::KIND, id = entity.id(), "Staging entity creation");
        let repo = self.repo.clone();
        let staged = entity.clone();
        tx.stage(move || async move { repo.put(staged).await });
        Ok(entity)
    }

    /// Stage a partial update.
    ///
    /// Touching a routing-impacting field or `active` marks the entity out
    /// of sync, overriding a sync request in the same patch. Otherwise a sync
    /// request marks it in sync and defers the registry push to commit time.
    pub async fn write(&self, tx: &mut Transaction, id: u64, patch: E::Patch) -> Result<E> {
        let mut entity = self.fetch(id).await?;
        patch.apply(&mut entity);

        let touched = patch.touched_fields();
        self.prepare(&mut entity, Some(id)).await?;

        if E::impacts_routing(&touched) {
            entity.set_in_sync(false);
        } else if patch.requested_sync() {
            entity.set_in_sync(true);
            let this = self.clone();
            tx.on_commit(move || async move { this.sync_after_commit(vec![id]).await });
        }

        debug!(tx = %tx.id(), kind = E::KIND, id, fields = ?touched, "Staging entity write");
        let repo = self.repo.clone();
        let staged = entity.clone();
        tx.stage(move || async move { repo.put(staged).await });
        Ok(entity)
    }

    /// Flip an entity in sync
    pub async fn request_sync(&self, tx: &mut Transaction, id: u64) -> Result<E> {
        self.write(tx, id, E::Patch::default().with_sync()).await
    }

    /// Drop the entity's rules now and stage its removal
    pub async fn unlink(&self, tx: &mut Transaction, id: u64) -> Result<()> {
        let entity = self.fetch(id).await?;
        let keys = entity.rule_keys();
        self.store.delete(&keys).await?;
        info!(kind = E::KIND, id, keys = ?keys, "Unregistered rules of deleted entity");

        let repo = self.repo.clone();
        tx.stage(move || async move {
            repo.remove(id).await;
            Ok(())
        });
        Ok(())
    }

    /// Push the current state of `ids` to the store: active entities are
    /// registered, inactive ones unregistered. Missing ids are skipped.
    pub async fn sync_records(&self, ids: &[u64]) -> Result<SyncReport> {
        let entities = self.repo.get_many(ids).await;
        info!(kind = E::KIND, ids = ?ids, "Sync registry");

        let mut rules = Vec::new();
        let mut stale = Vec::new();
        for entity in &entities {
            if entity.active() {
                rules.extend(entity.prepare_rules());
            } else {
                stale.extend(entity.rule_keys());
            }
        }

        let mut report = SyncReport::default();
        if !rules.is_empty() {
            report.registered = rules.iter().map(|r| r.key.clone()).collect();
            let routes: Vec<String> = rules.iter().map(|r| r.route.clone()).collect();
            report.version = Some(self.store.upsert(rules).await?);
            debug!(kind = E::KIND, routes = %routes.join(", "), "Registered controllers");
        }
        if !stale.is_empty() {
            report.version = Some(self.store.delete(&stale).await?);
            report.unregistered = stale;
        }
        Ok(report)
    }

    /// Re-push every entity currently marked in sync, e.g. at boot
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let ids: Vec<u64> = self
            .repo
            .all()
            .await
            .into_iter()
            .filter(|e| e.in_sync())
            .map(|e| e.id())
            .collect();
        self.sync_records(&ids).await
    }

    /// Register entities that are not stored in the repository.
    ///
    /// Entities without an id get a fresh one.
    pub async fn register_now(&self, entities: Vec<E>) -> Result<SyncReport> {
        let mut rules = Vec::new();
        for mut entity in entities {
            self.prepare(&mut entity, None).await?;
            if entity.id() == 0 {
                entity.set_id(self.repo.reserve_id().await);
            }
            rules.extend(entity.prepare_rules());
        }

        let mut report = SyncReport {
            registered: rules.iter().map(|r| r.key.clone()).collect(),
            ..Default::default()
        };
        if !rules.is_empty() {
            report.version = Some(self.store.upsert(rules).await?);
        }
        debug!(kind = E::KIND, keys = ?report.registered, "Registered controllers without entity rows");
        Ok(report)
    }

    async fn sync_after_commit(&self, ids: Vec<u64>) {
        if let Err(e) = self.sync_records(&ids).await {
            error!(kind = E::KIND, ids = ?ids, error = %e, "Post-commit registry sync failed");
            self.mark_out_of_sync(&ids).await;
        }
    }

    async fn mark_out_of_sync(&self, ids: &[u64]) {
        for mut entity in self.repo.get_many(ids).await {
            entity.set_in_sync(false);
            let id = entity.id();
            if let Err(e) = self.repo.put(entity).await {
                error!(kind = E::KIND, id, error = %e, "Could not mark entity out of sync");
            }
        }
    }

    async fn fetch(&self, id: u64) -> Result<E> {
        self.repo
            .get(id)
            .await
            .ok_or_else(|| CoreError::EntityNotFound(format!("{}:{}", E::KIND, id)))
    }

    /// Normalize and validate, then check routes are free in this kind and
    /// every other registered kind
    async fn prepare(&self, entity: &mut E, existing: Option<u64>) -> Result<()> {
        entity.normalize(self.route_prefix.as_deref());
        entity.validate()?;

        let routes = entity.routes();
        if self.repo.count_routes(&routes, existing).await > 0 {
            return Err(ValidationError::RouteTaken {
                route: routes.join(", "),
            }
            .into());
        }
        self.consumers.check_unique(E::KIND, &routes).await?;
        Ok(())
    }
}
