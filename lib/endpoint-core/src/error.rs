use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    HandlerResolution(#[from] HandlerResolutionError),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a rule store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate rule key: {0}")]
    DuplicateKey(String),

    #[error("Route {route} is already registered by {owner}")]
    DuplicateRoute { route: String, owner: String },

    #[error("Fingerprint {content_hash} is already registered by {owner}")]
    DuplicateFingerprint { content_hash: String, owner: String },

    #[error("Unknown rule key: {0}")]
    UnknownKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Rule store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Rejections raised while validating an owning entity
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field `{0}`")]
    MissingField(&'static str),

    #[error("`{name}` uses a blacklisted route `{route}`")]
    BlacklistedRoute { name: String, route: String },

    #[error("Request content type is required for {method}")]
    ContentTypeRequired { method: String },

    #[error("Invalid route pattern `{route}`: {reason}")]
    InvalidPattern { route: String, reason: String },

    #[error("You can register an endpoint route only once: {route}")]
    RouteTaken { route: String },

    #[error("Non unique route(s): {routes}. Found in kind(s): {kinds}")]
    NonUniqueRoute { routes: String, kinds: String },
}

/// A handler descriptor that does not resolve to a registered handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerResolutionError {
    #[error("Invalid controller path `{0}`")]
    InvalidDescriptor(String),

    #[error("Module `{0}` not found")]
    ModuleNotFound(String),

    #[error("Class `{0}` not found")]
    ClassNotFound(String),

    #[error("Method name `{0}` not found")]
    MethodNotFound(String),
}

/// Failure to read the cross-process version signal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Version signal unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
