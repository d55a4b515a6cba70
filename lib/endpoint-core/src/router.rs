//! Request-path entry point: freshness check, then resolution

use crate::cache::LocalRegistryCache;
use crate::resolver::{Resolution, RuleResolver};
use crate::signal::{Freshness, InvalidationMonitor};
use crate::HandlerResolutionError;
use endpoint_api::RegistryVersion;
use std::sync::Arc;
use tracing::{debug, error};

/// Result of routing one request
#[derive(Debug)]
pub struct Routed {
    pub freshness: Freshness,
    /// Version of the snapshot the request was resolved against
    pub version: RegistryVersion,
    pub resolution: Result<Resolution, HandlerResolutionError>,
}

/// Dispatch front for one process: owns the cache monitor and the resolver
pub struct EndpointRouter {
    monitor: Arc<InvalidationMonitor>,
    resolver: RuleResolver,
}

impl EndpointRouter {
    pub fn new(monitor: Arc<InvalidationMonitor>, resolver: RuleResolver) -> Self {
        Self { monitor, resolver }
    }

    pub fn cache(&self) -> &Arc<LocalRegistryCache> {
        self.monitor.cache()
    }

    pub fn monitor(&self) -> &Arc<InvalidationMonitor> {
        &self.monitor
    }

    pub fn resolver(&self) -> &RuleResolver {
        &self.resolver
    }

    /// Check freshness, then resolve against the pinned snapshot
    pub async fn route(&self, path: &str, method: &str) -> Routed {
        let freshness = self.monitor.check().await;
        let snapshot = self.cache().snapshot();
        let resolution = self.resolver.resolve(&snapshot, path, method);

        match &resolution {
            Ok(Resolution::Matched(bound)) => debug!(key = bound.key(), path, method, "Route resolved"),
            Ok(Resolution::NotFound) => debug!(path, method, "No route"),
            Ok(Resolution::MethodNotAllowed { allowed }) => {
                debug!(path, method, allowed = ?allowed, "Method not allowed")
            }
            Err(e) => error!(path, method, error = %e, "Handler resolution failed"),
        }

        Routed {
            freshness,
            version: snapshot.version(),
            resolution,
        }
    }
}
