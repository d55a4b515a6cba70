//! Dynamic endpoint route registry
//!
//! This library provides:
//! - Rule store with row-level locking and a monotonic registry version
//! - Per-process registry cache publishing immutable snapshots
//! - Route resolution with typed path parameters
//! - Cross-process invalidation through a cheap version signal
//! - Entity lifecycle synchronization gated on transaction commit
//! - API-key checks and cached responses for endpoints that opt in

pub mod auth;
pub mod builtin;
pub mod cache;
pub mod consumers;
pub mod entity;
pub mod error;
pub mod handler;
pub mod pattern;
pub mod repository;
pub mod resolver;
pub mod response_cache;
pub mod router;
pub mod signal;
pub mod store;
pub mod sync;
pub mod tx;

pub use auth::{ApiKeyError, ApiKeyRegistry, API_KEY_HEADER};
pub use cache::{LocalRegistryCache, RegistrySnapshot};
pub use consumers::{RepositoryConsumer, RouteConsumer, RouteConsumers};
pub use entity::{EndpointPatch, EndpointRoute, EntityPatch, RoutableEntity};
pub use error::{
    CoreError, HandlerResolutionError, Result, SignalError, StoreError, StoreResult, ValidationError,
};
pub use handler::{EndpointHandler, EndpointRequest, EndpointResponse, HandlerCall, HandlerError, HandlerRegistry};
pub use repository::{EntityRepository, InMemoryEntityRepository};
pub use resolver::{BoundHandler, Resolution, RuleResolver};
pub use response_cache::{cache_name, CacheEntry, CacheError, CachedHandler, ResponseCache};
pub use router::{EndpointRouter, Routed};
pub use signal::{Freshness, InvalidationMonitor, MonitorConfig, StoreVersionSignal, VersionSignal};
pub use store::{InMemoryRuleStore, RuleStore};
pub use sync::{SyncCoordinator, SyncReport};
pub use tx::Transaction;
