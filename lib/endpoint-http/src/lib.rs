//! HTTP front door for the endpoint registry
pub mod dispatch;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod trace;

pub use dispatch::{endpoint_request, Dispatched, Dispatcher};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext};
pub use trace::RequestTracingMiddleware;
