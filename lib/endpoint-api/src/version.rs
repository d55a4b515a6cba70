use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of the whole rule set.
///
/// Every create/update/delete against the rule store produces a strictly
/// greater version. `ZERO` means nothing was ever registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryVersion(u64);

impl RegistryVersion {
    pub const ZERO: RegistryVersion = RegistryVersion(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version following this one
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RegistryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for RegistryVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
