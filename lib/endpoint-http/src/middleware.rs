//! Middleware framework for request/response processing around dispatch

use anyhow::Result;
use hyper::Request;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, span, Instrument, Level};

/// Context passed through middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    /// Request path
    pub path: String,
    /// Request method
    pub method: String,
    /// Request headers, names lowercased
    pub request_headers: HashMap<String, String>,
    /// When the request entered the chain
    pub started: Instant,
    /// Custom metadata for middleware
    pub metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl MiddlewareContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            request_headers: HashMap::new(),
            started: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new middleware context from a request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut context = Self::new(req.method().as_str(), req.uri().path());
        for (k, v) in req.headers() {
            if let Ok(v_str) = v.to_str() {
                context.request_headers.insert(k.as_str().to_string(), v_str.to_string());
            }
        }
        context
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().ok().and_then(|m| m.get(key).cloned())
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.into(), value.into());
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before the request is dispatched
    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Called once the response status is known
    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }

    /// Called on error
    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Process request through all middleware
    pub async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            async {
                debug!("Processing on_request");
                mw.on_request(context).await
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            async {
                debug!("Processing on_response");
                mw.on_response(context, status).await
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Process error through all middleware
    pub async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            async {
                debug!("Processing on_error");
                mw.on_error(context, error).await
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }
}

/// Logging middleware that logs request and response info
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            "Request: {} {} (headers: {})",
            context.method,
            context.path,
            context.request_headers.len()
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        debug!(
            "Response: {} {} -> {} (duration: {}ms)",
            context.method,
            context.path,
            status,
            context.started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!("Error: {} {} - {}", context.method, context.path, error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_context_from_request() {
        let req = Request::builder()
            .method("POST")
            .uri("/demo/1?x=y")
            .header("Content-Type", "application/json")
            .body(())
            .unwrap();
        let context = MiddlewareContext::from_request(&req);
        assert_eq!(context.path, "/demo/1");
        assert_eq!(context.method, "POST");
        assert_eq!(context.header("content-type"), Some("application/json"));
        assert_eq!(context.header("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_middleware_context_metadata() {
        let context = MiddlewareContext::new("GET", "/test");
        context.set_metadata("key1", "value1");
        assert_eq!(context.get_metadata("key1"), Some("value1".to_string()));
        assert_eq!(context.get_metadata("key2"), None);
    }

    struct Recording {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Middleware for Recording {
        async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_response(&self, _context: &MiddlewareContext, status: u16) -> Result<()> {
            anyhow::ensure!(status < 500, "server error {}", status);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_middleware_chain() {
        let seen = Arc::new(AtomicUsize::new(0));
        let chain = MiddlewareChain::new()
            .add(LoggingMiddleware)
            .add(Recording { seen: seen.clone() });
        assert_eq!(chain.len(), 2);

        let context = MiddlewareContext::new("GET", "/test");
        chain.on_request(&context).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(chain.on_response(&context, 200).await.is_ok());
        assert!(chain.on_response(&context, 503).await.is_err());
        assert!(chain.on_error(&context, "boom").await.is_ok());
    }
}
