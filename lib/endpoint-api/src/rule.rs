//! Stored routing directives

use crate::RoutingMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Reference to the code serving a rule.
///
/// `controller` is a dotted path: everything before the last `.` names the
/// module, the last component names the controller. `method` names the
/// controller method. Default arguments are prepended to every call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub controller: String,

    pub method: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_args: Vec<Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_kwargs: Map<String, Value>,
}

impl HandlerDescriptor {
    pub fn new(controller: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            method: method.into(),
            default_args: Vec::new(),
            default_kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.default_args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_kwargs.insert(name.into(), value.into());
        self
    }

    /// Split `controller` into its module path and controller name
    pub fn module_and_controller(&self) -> Option<(&str, &str)> {
        self.controller
            .rsplit_once('.')
            .filter(|(module, name)| !module.is_empty() && !name.is_empty())
    }
}

/// A routing directive owned by exactly one entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier of the owning entity
    pub key: String,

    /// Normalized URL pattern, always starting with `/`
    pub route: String,

    pub handler: HandlerDescriptor,

    pub routing: RoutingMetadata,

    /// Fingerprint over the routing-impacting fields
    pub content_hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Assigned by the store on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn new(
        key: impl Into<String>,
        route: impl Into<String>,
        handler: HandlerDescriptor,
        routing: RoutingMetadata,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            route: route.into(),
            handler,
            routing,
            content_hash: content_hash.into(),
            group: None,
            updated_at: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Length of a content hash in hex characters
pub const CONTENT_HASH_LEN: usize = 32;

/// Compute the fingerprint of a set of routing-impacting values.
///
/// Values are length-prefixed before hashing so that `("ab", "c")` and
/// `("a", "bc")` produce different fingerprints.
pub fn content_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CONTENT_HASH_LEN);
    digest
}
