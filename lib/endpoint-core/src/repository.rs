//! Persistence of owning entities

use crate::entity::RoutableEntity;
use crate::pattern::route_shape;
use crate::{CoreError, Result, ValidationError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Storage for one entity kind
#[async_trait]
pub trait EntityRepository<E: RoutableEntity>: Send + Sync {
    /// Allocate an id for a new entity
    async fn reserve_id(&self) -> u64;

    /// Insert or replace by id; routes are unique within the kind
    async fn put(&self, entity: E) -> Result<()>;

    async fn get(&self, id: u64) -> Option<E>;

    /// Entities for the ids that exist, in id order
    async fn get_many(&self, ids: &[u64]) -> Vec<E>;

    async fn all(&self) -> Vec<E>;

    async fn remove(&self, id: u64) -> Option<E>;

    /// Number of entities, other than `exclude`, owning a route with the same
    /// shape as any of `routes`
    async fn count_routes(&self, routes: &[String], exclude: Option<u64>) -> usize;
}

/// Process-local entity repository
pub struct InMemoryEntityRepository<E> {
    entities: RwLock<BTreeMap<u64, E>>,
    next_id: AtomicU64,
}

impl<E: RoutableEntity> Default for InMemoryEntityRepository<E> {
    fn default() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: RoutableEntity> InMemoryEntityRepository<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl<E: RoutableEntity> EntityRepository<E> for InMemoryEntityRepository<E> {
    async fn reserve_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    async fn put(&self, entity: E) -> Result<()> {
        if entity.id() == 0 {
            return Err(CoreError::Internal(format!("{} without id", E::KIND)));
        }

        let mut entities = self.entities.write().await;
        let shapes = shapes_of(&entity.routes());
        let taken = entities
            .values()
            .filter(|other| other.id() != entity.id())
            .flat_map(|other| other.routes())
            .find(|route| shapes.contains(&route_shape(route)));
        if let Some(route) = taken {
            return Err(ValidationError::RouteTaken { route }.into());
        }

        debug!(kind = E::KIND, id = entity.id(), "entity stored");
        // keep ids ahead of explicitly numbered entities
        self.next_id.fetch_max(entity.id() + 1, Ordering::AcqRel);
        entities.insert(entity.id(), entity);
        Ok(())
    }

    async fn get(&self, id: u64) -> Option<E> {
        self.entities.read().await.get(&id).cloned()
    }

    async fn get_many(&self, ids: &[u64]) -> Vec<E> {
        let entities = self.entities.read().await;
        let mut found: Vec<E> = ids.iter().filter_map(|id| entities.get(id).cloned()).collect();
        found.sort_by_key(|e| e.id());
        found.dedup_by_key(|e| e.id());
        found
    }

    async fn all(&self) -> Vec<E> {
        self.entities.read().await.values().cloned().collect()
    }

    async fn remove(&self, id: u64) -> Option<E> {
        self.entities.write().await.remove(&id)
    }

    async fn count_routes(&self, routes: &[String], exclude: Option<u64>) -> usize {
        let shapes = shapes_of(routes);
        self.entities
            .read()
            .await
            .values()
            .filter(|e| Some(e.id()) != exclude)
            .filter(|e| e.routes().iter().any(|r| shapes.contains(&route_shape(r))))
            .count()
    }
}

fn shapes_of(routes: &[String]) -> HashSet<String> {
    routes.iter().map(|r| route_shape(r)).collect()
}
