//! Cached responses for endpoints with a cache policy
//!
//! Entries are kept per owning rule and named `endpoint_cache.<owner>[.suffix][.ext]`.
//! A lookup returns the newest entry created inside the current policy window;
//! entries older than [`GC_MAX_AGE_DAYS`] are dropped by [`ResponseCache::gc`].

use crate::handler::{EndpointHandler, EndpointResponse, HandlerCall, HandlerError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use endpoint_api::CachePolicy;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

pub const CACHE_NAME_PREFIX: &str = "endpoint_cache";
pub const GC_MAX_AGE_DAYS: i64 = 30;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache name must start with 'endpoint_cache': {0}")]
    InvalidName(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn response(&self) -> EndpointResponse {
        EndpointResponse {
            status: 200,
            content_type: self.content_type.clone(),
            body: self.body.clone(),
        }
    }
}

fn slug(text: &str) -> String {
    let mapped: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    mapped.trim_matches('_').to_string()
}

/// Cache entry name for `owner`, e.g. `endpoint_cache.demo_endpoint.page_1.json`
pub fn cache_name(owner: &str, suffix: Option<&str>, ext: Option<&str>) -> String {
    let mut name = format!("{}.{}", CACHE_NAME_PREFIX, slug(owner));
    for part in [suffix.map(slug), ext.map(slug)].into_iter().flatten() {
        if !part.is_empty() {
            name.push('.');
            name.push_str(&part);
        }
    }
    name
}

/// In-process store of cached endpoint responses
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, Vec<CacheEntry>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(
        &self,
        owner: &str,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), CacheError> {
        self.store_at(owner, name, content_type, body, Utc::now())
    }

    pub fn store_at(
        &self,
        owner: &str,
        name: &str,
        content_type: &str,
        body: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if !name.starts_with(CACHE_NAME_PREFIX) {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        let entry = CacheEntry {
            name: name.to_string(),
            content_type: content_type.to_string(),
            body,
            created_at: now,
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(owner.to_string()).or_default().push(entry);
        Ok(())
    }

    pub fn get(&self, owner: &str, name: &str, policy: CachePolicy) -> Option<CacheEntry> {
        self.get_at(owner, name, policy, Utc::now())
    }

    /// Newest entry called `name` created within the policy window around `now`
    pub fn get_at(
        &self,
        owner: &str,
        name: &str,
        policy: CachePolicy,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(owner)?
            .iter()
            .filter(|e| e.name == name && policy.contains(e.created_at, now))
            .max_by_key(|e| e.created_at)
            .cloned()
    }

    /// Every entry held for `owner`, oldest first
    pub fn entries(&self, owner: &str) -> Vec<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut found = entries.get(owner).cloned().unwrap_or_default();
        found.sort_by_key(|e| e.created_at);
        found
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gc(&self) -> usize {
        self.gc_at(Utc::now())
    }

    /// Drop entries created [`GC_MAX_AGE_DAYS`] or more before `now`
    pub fn gc_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(GC_MAX_AGE_DAYS);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.created_at > cutoff);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }
}

/// Serves GET requests from the cache, filling it from the wrapped handler
pub struct CachedHandler {
    inner: Arc<dyn EndpointHandler>,
    cache: Arc<ResponseCache>,
    owner: String,
    policy: CachePolicy,
}

impl CachedHandler {
    pub fn new(
        inner: Arc<dyn EndpointHandler>,
        cache: Arc<ResponseCache>,
        owner: impl Into<String>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            inner,
            cache,
            owner: owner.into(),
            policy,
        }
    }
}

#[async_trait]
impl EndpointHandler for CachedHandler {
    async fn call(&self, call: HandlerCall) -> Result<EndpointResponse, HandlerError> {
        if !call.request.method.eq_ignore_ascii_case("GET") {
            return self.inner.call(call).await;
        }

        let request = &call.request;
        let suffix = match &request.query {
            Some(query) => format!("{}?{}", request.path, query),
            None => request.path.clone(),
        };
        let name = cache_name(&self.owner, Some(&suffix), None);
        if let Some(entry) = self.cache.get(&self.owner, &name, self.policy) {
            debug!("Cache hit {}", name);
            return Ok(entry.response());
        }

        let response = self.inner.call(call).await?;
        if response.status == 200 {
            self.cache
                .store(&self.owner, &name, &response.content_type, response.body.clone())
                .map_err(|e| HandlerError::Internal(e.to_string()))?;
        }
        Ok(response)
    }
}
