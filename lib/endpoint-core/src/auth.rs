//! API keys for `api_key` routes

use std::collections::HashMap;
use thiserror::Error;

/// Request header carrying the key, lowercase as received from the HTTP layer
pub const API_KEY_HEADER: &str = "api-key";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyError {
    #[error("Missing API key")]
    Missing,

    #[error("Unknown API key")]
    Unknown,

    #[error("API key `{0}` is not allowed on this route")]
    NotAllowed(String),
}

/// Known API keys, filled at startup and read-only afterwards
#[derive(Clone, Default)]
pub struct ApiKeyRegistry {
    // secret -> key name
    keys: HashMap<String, String>,
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.register(name, key);
        self
    }

    /// Register a key under `name`; a secret registered twice keeps the last name
    pub fn register(&mut self, name: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(key.into(), name.into());
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Name of the presented key when it is known and, if `allowed` is not
    /// empty, listed there
    pub fn authorize(&self, presented: Option<&str>, allowed: &[String]) -> Result<&str, ApiKeyError> {
        let presented = presented.map(str::trim).filter(|k| !k.is_empty()).ok_or(ApiKeyError::Missing)?;
        let name = self.keys.get(presented).ok_or(ApiKeyError::Unknown)?;
        if !allowed.is_empty() && !allowed.contains(name) {
            return Err(ApiKeyError::NotAllowed(name.clone()));
        }
        Ok(name)
    }
}

impl std::fmt::Debug for ApiKeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.keys.values().collect();
        names.sort();
        f.debug_struct("ApiKeyRegistry").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ApiKeyRegistry {
        ApiKeyRegistry::new()
            .with_key("demo", "secret-1")
            .with_key("demo2", "secret-2")
    }

    #[test]
    fn test_authorize() {
        let keys = registry();
        let allowed = vec!["demo".to_string()];

        assert_eq!(keys.authorize(Some("secret-1"), &allowed), Ok("demo"));
        assert_eq!(keys.authorize(None, &allowed), Err(ApiKeyError::Missing));
        assert_eq!(keys.authorize(Some("  "), &allowed), Err(ApiKeyError::Missing));
        assert_eq!(keys.authorize(Some("nope"), &allowed), Err(ApiKeyError::Unknown));
        assert_eq!(
            keys.authorize(Some("secret-2"), &allowed),
            Err(ApiKeyError::NotAllowed("demo2".to_string()))
        );
        // no restriction: any known key
        assert_eq!(keys.authorize(Some("secret-2"), &[]), Ok("demo2"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let shown = format!("{:?}", registry());
        assert!(shown.contains("demo2"));
        assert!(!shown.contains("secret"));
    }
}
