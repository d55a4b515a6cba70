//! Endpoint route API types
//!
//! This library defines the data shared by every part of the endpoint registry:
//! - Rule: a stored routing directive binding a URL pattern to a handler
//! - HandlerDescriptor: which controller method serves a rule
//! - RoutingMetadata: what the HTTP layer needs to know to serve a rule
//! - RegistryVersion: monotonic counter signaling "the rule set changed"

pub mod routing;
pub mod rule;
pub mod version;

pub use routing::{normalize_route, AuthMode, CachePolicy, ParseMethodError, RequestMethod, RouteType, RoutingMetadata};
pub use rule::{content_hash, HandlerDescriptor, Rule};
pub use version::RegistryVersion;
