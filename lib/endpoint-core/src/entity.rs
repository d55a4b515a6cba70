//! Owning entities whose lifecycle drives rule registration

use crate::builtin::fallback_handler;
use crate::pattern::RoutePattern;
use crate::ValidationError;
use endpoint_api::{
    content_hash, normalize_route, AuthMode, CachePolicy, HandlerDescriptor, RequestMethod, RouteType, Rule,
    RoutingMetadata,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Routes that no entity may claim
pub const BLACKLISTED_ROUTES: &[&str] = &["/", "/web"];

/// Field name that toggles registration alongside the routing fields
pub const ACTIVE_FIELD: &str = "active";

/// Registry key of the rule owned by entity `id` of `kind`
pub fn rule_key(kind: &str, id: u64) -> String {
    format!("{}:{}", kind, id)
}

/// A partial update of an entity
pub trait EntityPatch<E>: Clone + Default + Send + Sync + 'static {
    /// Names of the fields this patch writes
    fn touched_fields(&self) -> Vec<&'static str>;

    /// Whether the patch asks for the entity to be brought in sync
    fn requested_sync(&self) -> bool;

    /// Mark the patch as a sync request
    fn with_sync(self) -> Self;

    fn apply(&self, entity: &mut E);
}

/// An entity that owns routing rules
pub trait RoutableEntity: Clone + Send + Sync + 'static {
    /// Kind name, used in rule keys and uniqueness errors
    const KIND: &'static str;

    type Patch: EntityPatch<Self>;

    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    fn name(&self) -> &str;

    fn active(&self) -> bool;

    fn in_sync(&self) -> bool;

    fn set_in_sync(&mut self, in_sync: bool);

    /// Fields whose change invalidates the registered rules
    fn routing_impacting_fields() -> &'static [&'static str];

    fn routes(&self) -> Vec<String>;

    fn normalize(&mut self, prefix: Option<&str>);

    fn validate(&self) -> Result<(), ValidationError>;

    fn prepare_rules(&self) -> Vec<Rule>;

    fn rule_keys(&self) -> Vec<String> {
        vec![rule_key(Self::KIND, self.id())]
    }

    /// Whether a patch touching `fields` puts the entity out of sync
    fn impacts_routing(fields: &[&'static str]) -> bool {
        fields
            .iter()
            .any(|f| *f == ACTIVE_FIELD || Self::routing_impacting_fields().contains(f))
    }
}

fn default_true() -> bool {
    true
}

/// Endpoint definition: one route served by one handler
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointRoute {
    #[serde(default)]
    pub id: u64,

    pub name: String,

    pub route: String,

    /// Classifies routes together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_group: Option<String>,

    #[serde(default)]
    pub route_type: RouteType,

    #[serde(default)]
    pub auth_type: AuthMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_content_type: Option<String>,

    pub request_method: RequestMethod,

    #[serde(default)]
    pub csrf: bool,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(skip)]
    pub in_sync: bool,

    /// Key names accepted when `auth_type` is `api_key`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_policy: Option<CachePolicy>,

    /// Handler to bind, the not-found handler when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<HandlerDescriptor>,
}

impl EndpointRoute {
    pub fn new(name: impl Into<String>, route: impl Into<String>, request_method: RequestMethod) -> Self {
        Self {
            id: 0,
            name: name.into(),
            route: route.into(),
            route_group: None,
            route_type: RouteType::default(),
            auth_type: AuthMode::default(),
            request_content_type: None,
            request_method,
            csrf: false,
            active: true,
            in_sync: false,
            api_keys: Vec::new(),
            cache_policy: None,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: HandlerDescriptor) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth_type = auth;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.request_content_type = Some(content_type.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.route_group = Some(group.into());
        self
    }

    /// Require one of the named API keys
    pub fn with_api_keys<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.auth_type = AuthMode::ApiKey;
        self.api_keys = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    /// Digest over route, auth and method
    pub fn endpoint_hash(&self) -> String {
        content_hash([
            self.route.as_str(),
            self.auth_type.as_str(),
            self.request_method.as_str(),
        ])
    }

    pub fn routing(&self) -> RoutingMetadata {
        RoutingMetadata {
            route_type: self.route_type,
            auth: self.auth_type,
            methods: vec![self.request_method],
            routes: vec![self.route.clone()],
            csrf: self.csrf,
            content_type: self.request_content_type.clone(),
            api_keys: self.api_keys.clone(),
            cache_policy: self.cache_policy,
        }
    }

    fn handler_or_fallback(&self) -> HandlerDescriptor {
        match &self.handler {
            Some(handler) => handler.clone(),
            None => {
                warn!(
                    kind = Self::KIND,
                    name = %self.name,
                    "No specific endpoint handler defined, falling back to default"
                );
                fallback_handler(&self.route)
            }
        }
    }
}

impl RoutableEntity for EndpointRoute {
    const KIND: &'static str = "endpoint.route";

    type Patch = EndpointPatch;

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn active(&self) -> bool {
        self.active
    }

    fn in_sync(&self) -> bool {
        self.in_sync
    }

    fn set_in_sync(&mut self, in_sync: bool) {
        self.in_sync = in_sync;
    }

    fn routing_impacting_fields() -> &'static [&'static str] {
        &["route", "auth_type", "request_method", "api_keys", "cache_policy"]
    }

    fn routes(&self) -> Vec<String> {
        vec![self.route.clone()]
    }

    fn normalize(&mut self, prefix: Option<&str>) {
        self.route = normalize_route(&self.route, prefix);
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.route.trim().is_empty() {
            return Err(ValidationError::MissingField("route"));
        }
        if BLACKLISTED_ROUTES.contains(&self.route.as_str()) {
            return Err(ValidationError::BlacklistedRoute {
                name: self.name.clone(),
                route: self.route.clone(),
            });
        }
        if self.request_method.carries_body()
            && self.request_content_type.as_deref().map_or(true, str::is_empty)
        {
            return Err(ValidationError::ContentTypeRequired {
                method: self.request_method.to_string(),
            });
        }
        RoutePattern::parse(&self.route).map_err(|e| ValidationError::InvalidPattern {
            route: self.route.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn prepare_rules(&self) -> Vec<Rule> {
        let rule = Rule::new(
            rule_key(Self::KIND, self.id),
            self.route.clone(),
            self.handler_or_fallback(),
            self.routing(),
            self.endpoint_hash(),
        );
        let rule = match &self.route_group {
            Some(group) => rule.with_group(group.clone()),
            None => rule,
        };
        vec![rule]
    }
}

/// Partial update of an [`EndpointRoute`]; `None` leaves a field untouched
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointPatch {
    pub name: Option<String>,
    pub route: Option<String>,
    pub route_group: Option<Option<String>>,
    pub route_type: Option<RouteType>,
    pub auth_type: Option<AuthMode>,
    pub request_content_type: Option<Option<String>>,
    pub request_method: Option<RequestMethod>,
    pub csrf: Option<bool>,
    pub active: Option<bool>,
    pub api_keys: Option<Vec<String>>,
    pub cache_policy: Option<Option<CachePolicy>>,
    pub handler: Option<Option<HandlerDescriptor>>,
    pub sync: bool,
}

impl EndpointPatch {
    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn method(mut self, method: RequestMethod) -> Self {
        self.request_method = Some(method);
        self
    }

    pub fn auth(mut self, auth: AuthMode) -> Self {
        self.auth_type = Some(auth);
        self
    }

    pub fn content_type(mut self, content_type: Option<String>) -> Self {
        self.request_content_type = Some(content_type);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn handler(mut self, handler: Option<HandlerDescriptor>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn api_keys(mut self, names: Vec<String>) -> Self {
        self.api_keys = Some(names);
        self
    }

    pub fn cache_policy(mut self, policy: Option<CachePolicy>) -> Self {
        self.cache_policy = Some(policy);
        self
    }
}

impl EntityPatch<EndpointRoute> for EndpointPatch {
    fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let mut touch = |set: bool, name: &'static str| {
            if set {
                fields.push(name);
            }
        };
        touch(self.name.is_some(), "name");
        touch(self.route.is_some(), "route");
        touch(self.route_group.is_some(), "route_group");
        touch(self.route_type.is_some(), "route_type");
        touch(self.auth_type.is_some(), "auth_type");
        touch(self.request_content_type.is_some(), "request_content_type");
        touch(self.request_method.is_some(), "request_method");
        touch(self.csrf.is_some(), "csrf");
        touch(self.active.is_some(), ACTIVE_FIELD);
        touch(self.api_keys.is_some(), "api_keys");
        touch(self.cache_policy.is_some(), "cache_policy");
        touch(self.handler.is_some(), "handler");
        fields
    }

    fn requested_sync(&self) -> bool {
        self.sync
    }

    fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    fn apply(&self, entity: &mut EndpointRoute) {
        if let Some(name) = &self.name {
            entity.name = name.clone();
        }
        if let Some(route) = &self.route {
            entity.route = route.clone();
        }
        if let Some(group) = &self.route_group {
            entity.route_group = group.clone();
        }
        if let Some(route_type) = self.route_type {
            entity.route_type = route_type;
        }
        if let Some(auth) = self.auth_type {
            entity.auth_type = auth;
        }
        if let Some(content_type) = &self.request_content_type {
            entity.request_content_type = content_type.clone();
        }
        if let Some(method) = self.request_method {
            entity.request_method = method;
        }
        if let Some(csrf) = self.csrf {
            entity.csrf = csrf;
        }
        if let Some(active) = self.active {
            entity.active = active;
        }
        if let Some(names) = &self.api_keys {
            entity.api_keys = names.clone();
        }
        if let Some(policy) = self.cache_policy {
            entity.cache_policy = policy;
        }
        if let Some(handler) = &self.handler {
            entity.handler = handler.clone();
        }
    }
}
